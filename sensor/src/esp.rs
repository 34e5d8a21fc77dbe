use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use aht20_driver::{AHT20, SENSOR_ADDRESS};
use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyOutputPin, Gpio1, Gpio11, Gpio12, Gpio2, Output, OutputPin, PinDriver},
    i2c::{I2cConfig, I2cDriver, I2C0},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use edgecam_common::{
    config::{NetworkConfig, TelemetryConfig},
    Actuator, ActuatorCommand, ActuatorState, ConnectivityError, FixedDelay, LatestReadings, Link,
    Reconnector, RuntimeConfig, SharedReadings, Sleeper, TelemetryPayload, TOPIC_COMMANDS,
    TOPIC_DEVICE_STATUS, TOPIC_SENSOR_DATA,
};

const NVS_NAMESPACE: &str = "edgecam";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const COMMAND_POLL_MS: u64 = 250;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// LED on GPIO48, pump on GPIO18, fan on GPIO10.
struct ActuatorOutputs {
    led: PinDriver<'static, AnyOutputPin, Output>,
    pump: PinDriver<'static, AnyOutputPin, Output>,
    fan: PinDriver<'static, AnyOutputPin, Output>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals {
        modem,
        pins,
        i2c0,
        adc1,
        ..
    } = Peripherals::take()?;

    let mut outputs = ActuatorOutputs::new(
        pins.gpio48.downgrade_output(),
        pins.gpio18.downgrade_output(),
        pins.gpio10.downgrade_output(),
    )
    .context("failed to initialize actuator outputs")?;
    let mut actuators = ActuatorState {
        led: true,
        ..ActuatorState::default()
    };
    outputs.write(Actuator::Led, true);

    let readings = Arc::new(SharedReadings::new());
    spawn_sampling_loop(
        readings.clone(),
        SamplingPins {
            i2c: i2c0,
            sda: pins.gpio11,
            scl: pins.gpio12,
            adc: adc1,
            light: pins.gpio1,
            moisture: pins.gpio2,
        },
        runtime.telemetry.clone(),
    )?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = WifiLink {
        wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
    };
    configure_station(&mut wifi.wifi, &runtime.network).context("wifi startup failed")?;

    let wifi_reconnector = Reconnector::with_limit(
        FixedDelay(runtime.network.wifi_retry_delay_ms),
        runtime.network.max_attempts(),
    );

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;
    let mut sleeper = WatchdogSleeper;
    reconnect_or_restart(&wifi_reconnector, &mut wifi, &mut sleeper);

    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network, &runtime.telemetry)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let (command_tx, command_rx) = mpsc::channel::<ActuatorCommand>();
    spawn_mqtt_receiver(
        mqtt_conn,
        mqtt_client.clone(),
        mqtt_connected.clone(),
        command_tx,
    )?;

    info!(
        "sensor node started: telemetry every {}ms",
        runtime.telemetry.publish_interval_ms
    );

    let publish_interval_ms = runtime.telemetry.publish_interval_ms;
    let mut last_publish_ms: Option<u64> = None;

    loop {
        feed_watchdog();

        if !wifi.is_connected() {
            reconnect_or_restart(&wifi_reconnector, &mut wifi, &mut sleeper);
        }

        match command_rx.recv_timeout(Duration::from_millis(COMMAND_POLL_MS)) {
            Ok(command) => {
                for (actuator, on) in actuators.apply(&command) {
                    outputs.write(actuator, on);
                }
                publish_actuator_state(&mqtt_client, &actuators, &command);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("mqtt receiver thread exited"));
            }
        }

        let now_ms = monotonic_ms();
        let due = last_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= publish_interval_ms)
            .unwrap_or(true);
        if due && mqtt_connected.load(Ordering::Relaxed) {
            if publish_telemetry(&mqtt_client, &readings, now_ms) {
                last_publish_ms = Some(now_ms);
            }
        }
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn configure_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started for `{}`", network.wifi_ssid);
    Ok(())
}

fn reconnect_or_restart(
    reconnector: &Reconnector<FixedDelay>,
    wifi: &mut WifiLink,
    sleeper: &mut WatchdogSleeper,
) {
    if let Err(err) = reconnector.ensure_connected(wifi, sleeper) {
        warn!("{err}; restarting device for recovery");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl Link for WifiLink {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn try_connect(&mut self) -> Result<(), ConnectivityError> {
        let result = self
            .wifi
            .connect()
            .and_then(|()| self.wifi.wait_netif_up());
        result.map_err(|err| {
            let _ = self.wifi.disconnect();
            ConnectivityError::Unreachable {
                link: "wifi",
                reason: format!("{err:#}"),
            }
        })
    }
}

struct WatchdogSleeper;

impl Sleeper for WatchdogSleeper {
    fn sleep_ms(&mut self, ms: u64) {
        let mut remaining = ms;
        while remaining > 0 {
            feed_watchdog();
            let slice = remaining.min(1_000);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
        feed_watchdog();
    }
}

impl ActuatorOutputs {
    fn new(led: AnyOutputPin, pump: AnyOutputPin, fan: AnyOutputPin) -> anyhow::Result<Self> {
        let mut outputs = Self {
            led: PinDriver::output(led)?,
            pump: PinDriver::output(pump)?,
            fan: PinDriver::output(fan)?,
        };
        for actuator in [Actuator::Led, Actuator::Pump, Actuator::Fan] {
            outputs.write(actuator, false);
        }
        Ok(outputs)
    }

    fn write(&mut self, actuator: Actuator, on: bool) {
        let pin = match actuator {
            Actuator::Led => &mut self.led,
            Actuator::Pump => &mut self.pump,
            Actuator::Fan => &mut self.fan,
        };
        let result = if on { pin.set_high() } else { pin.set_low() };

        match result {
            Ok(()) => info!("{} -> {}", actuator.as_str(), if on { "ON" } else { "OFF" }),
            Err(err) => warn!("failed to drive {} output: {err}", actuator.as_str()),
        }
    }
}

struct SamplingPins {
    i2c: I2C0,
    sda: Gpio11,
    scl: Gpio12,
    adc: ADC1,
    light: Gpio1,
    moisture: Gpio2,
}

fn spawn_sampling_loop(
    readings: Arc<SharedReadings>,
    pins: SamplingPins,
    telemetry: TelemetryConfig,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("sampling".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            if let Err(err) = run_sampling_loop(&readings, pins, &telemetry) {
                warn!("sampling loop stopped: {err:#}");
            }
        })
        .context("failed to spawn sampling thread")?;
    Ok(())
}

fn run_sampling_loop(
    readings: &SharedReadings,
    pins: SamplingPins,
    telemetry: &TelemetryConfig,
) -> anyhow::Result<()> {
    let i2c_config = I2cConfig::new().baudrate(100.kHz().into());
    let i2c = I2cDriver::new(pins.i2c, pins.sda, pins.scl, &i2c_config)?;

    let adc = AdcDriver::new(pins.adc)?;
    let channel_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut light = AdcChannelDriver::new(&adc, pins.light, &channel_config)?;
    let mut moisture = AdcChannelDriver::new(&adc, pins.moisture, &channel_config)?;
    info!("light on GPIO1, moisture on GPIO2");

    let period = Duration::from_millis(telemetry.read_interval_ms);
    let report_moisture = telemetry.report_moisture;
    let mut latest = LatestReadings::default();

    // Analog channels are sampled every pass whatever the climate sensor does.
    let mut finish_pass = |climate: Option<(f32, f32)>| {
        if let Some((temperature_c, humidity_pct)) = climate {
            latest.record_climate(temperature_c, humidity_pct);
        }
        match light.read() {
            Ok(value) => latest.record_light(f32::from(value)),
            Err(err) => warn!("light adc read failed: {err}"),
        }
        if report_moisture {
            match moisture.read() {
                Ok(value) => latest.record_moisture(f32::from(value)),
                Err(err) => warn!("moisture adc read failed: {err}"),
            }
        }
        if let Some(current) = latest.current(report_moisture) {
            readings.publish(current);
        }
        thread::sleep(period);
    };

    let mut delay = Ets;
    let mut aht20 = AHT20::new(i2c, SENSOR_ADDRESS);
    loop {
        match aht20.init(&mut delay) {
            Ok(mut sensor) => {
                info!("DHT20 ready on I2C0 (SDA 11, SCL 12)");
                loop {
                    match sensor.measure(&mut delay) {
                        Ok(measurement) => {
                            finish_pass(Some((measurement.temperature, measurement.humidity)));
                        }
                        Err(err) => {
                            // Re-run init before the next climate read.
                            warn!("DHT20 read failed: {err:?}");
                            finish_pass(None);
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!("DHT20 init failed: {err:?}");
                finish_pass(None);
            }
        }
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
    telemetry: &TelemetryConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(telemetry.device_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        reconnect_timeout: Some(Duration::from_millis(network.mqtt_retry_delay_ms)),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    connected: Arc<AtomicBool>,
    commands: mpsc::Sender<ActuatorCommand>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                        if let Err(err) = mqtt
                            .lock()
                            .unwrap()
                            .subscribe(TOPIC_COMMANDS, QoS::AtMostOnce)
                        {
                            warn!("failed to subscribe to {TOPIC_COMMANDS}: {err:?}");
                        }
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if topic != TOPIC_COMMANDS
                            || !matches!(details, Details::Complete)
                            || data.len() > MAX_MQTT_PAYLOAD_BYTES
                        {
                            continue;
                        }
                        let Ok(message) = core::str::from_utf8(data) else {
                            continue;
                        };
                        match ActuatorCommand::parse(message) {
                            Ok(command) => {
                                if commands.send(command).is_err() {
                                    return;
                                }
                            }
                            Err(err) => debug!("ignoring non-actuator command {message:?}: {err}"),
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn publish_telemetry(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    readings: &SharedReadings,
    now_ms: u64,
) -> bool {
    let Some(payload) = TelemetryPayload::from_snapshot(readings.snapshot(), now_ms) else {
        debug!("no sensor reading yet; skipping telemetry");
        return false;
    };

    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to encode telemetry: {err}");
            return false;
        }
    };
    match mqtt
        .lock()
        .unwrap()
        .publish(TOPIC_SENSOR_DATA, QoS::AtLeastOnce, false, &body)
    {
        Ok(_) => true,
        Err(err) => {
            warn!("failed to publish telemetry: {err:?}");
            false
        }
    }
}

fn publish_actuator_state(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    actuators: &ActuatorState,
    command: &ActuatorCommand,
) {
    let mut messages = vec![serde_json::to_vec(actuators)];
    if let Some(reply) = command.rpc_reply(actuators) {
        messages.push(serde_json::to_vec(&reply));
    }

    let mut client = mqtt.lock().unwrap();
    for message in messages {
        let result = message
            .map_err(|err| anyhow!(err))
            .and_then(|body| {
                client
                    .publish(TOPIC_DEVICE_STATUS, QoS::AtLeastOnce, false, &body)
                    .map_err(|err| anyhow!("{err:?}"))
            });
        if let Err(err) = result {
            warn!("failed to publish actuator state: {err:#}");
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
