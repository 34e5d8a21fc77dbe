use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    io::EspIOError,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use edgecam_common::{
    config::NetworkConfig, AlertPayload, AlertPublisher, ConnectivityError, DetectionDriver,
    DetectionFlags, DetectionPipeline, DetectionSummary, DetectorCommand, DriverAction,
    DriverStatus, DriverTiming, FixedDelay, InferenceTransport, Link, LinkStatus,
    PipelineSettings, PublishError, Reconnector, RuntimeConfig, Sleeper, TransportError,
    TOPIC_COMMANDS, TOPIC_DETECTIONS,
};

use crate::camera::Esp32Camera;

const NVS_NAMESPACE: &str = "edgecam";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_RESPONSE_BYTES: usize = 16 * 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;

#[derive(Clone)]
struct SharedState {
    flags: Arc<DetectionFlags>,
    status: Arc<Mutex<DriverStatus>>,
    wifi_connected: Arc<AtomicBool>,
    mqtt_connected: Arc<AtomicBool>,
    device_id: Arc<String>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "wifiConnected")]
    wifi_connected: bool,
    #[serde(rename = "brokerConnected")]
    broker_connected: bool,
    #[serde(flatten)]
    driver: DriverStatus,
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

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, server=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.detection.server_url,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let camera = Esp32Camera::init().context("camera startup failed")?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    configure_station(&mut wifi, &runtime.network).context("wifi startup failed")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let flags = Arc::new(DetectionFlags::new(runtime.detection.enabled_at_boot));
    let driver = DetectionDriver::new(DriverTiming::from(&runtime.detection), flags.clone());
    let shared_state = SharedState {
        flags,
        status: Arc::new(Mutex::new(driver.status(monotonic_ms()))),
        wifi_connected: Arc::new(AtomicBool::new(false)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        device_id: Arc::new(runtime.detection.device_id.clone()),
    };

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone())?;

    let wifi_link = WifiLink {
        wifi,
        connected: shared_state.wifi_connected.clone(),
    };
    spawn_detection_loop(
        shared_state.clone(),
        runtime,
        driver,
        camera,
        wifi_link,
        mqtt_client,
    )?;

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
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
    disable_wifi_power_save();
    info!("wifi started for `{}`", network.wifi_ssid);
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 8 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/detection", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(value) = query_param(&uri, "value") else {
                return write_error(req, 400, "Missing 'value' parameter");
            };

            let command = match value.as_str() {
                "enable" => DetectorCommand::EnableDetection,
                "disable" => DetectorCommand::DisableDetection,
                "capture" => DetectorCommand::CaptureNow,
                _ => return write_error(req, 400, "Invalid detection command"),
            };

            info!("api command: {}", command.as_str());
            state.flags.apply(command);
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    Ok(server)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.to_string())
    })
}

fn build_status(state: &SharedState) -> StatusView {
    StatusView {
        device_id: state.device_id.as_ref().clone(),
        wifi_connected: state.wifi_connected.load(Ordering::Relaxed),
        broker_connected: state.mqtt_connected.load(Ordering::Relaxed),
        driver: state.status.lock().unwrap().clone(),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
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
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Err(err) = mqtt.lock().unwrap().subscribe(TOPIC_COMMANDS, QoS::AtMostOnce) {
                            warn!("failed to subscribe to {TOPIC_COMMANDS}: {err:?}");
                        }
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // We only process full MQTT payloads.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        handle_mqtt_message(&state, topic, data);
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, data: &[u8]) {
    if topic != TOPIC_COMMANDS {
        return;
    }
    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {topic} ({} bytes)",
            data.len()
        );
        return;
    }

    let Ok(message) = core::str::from_utf8(data) else {
        return;
    };
    match DetectorCommand::parse(message) {
        Some(command) => {
            info!("command received: {}", command.as_str());
            state.flags.apply(command);
        }
        None => warn!("ignoring unknown command {message:?}"),
    }
}

fn spawn_detection_loop(
    state: SharedState,
    runtime: RuntimeConfig,
    driver: DetectionDriver,
    camera: Esp32Camera,
    wifi: WifiLink,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("detection".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = run_detection_loop(state, runtime, driver, camera, wifi, mqtt) {
                warn!("detection loop stopped: {err:#}");
            }
        })
        .context("failed to spawn detection thread")?;
    Ok(())
}

fn run_detection_loop(
    state: SharedState,
    runtime: RuntimeConfig,
    mut driver: DetectionDriver,
    camera: Esp32Camera,
    mut wifi: WifiLink,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    add_current_task_to_watchdog()?;

    let detection = &runtime.detection;
    let network = &runtime.network;
    let transport = EspHttpTransport {
        url: detection.server_url.clone(),
        timeout: Duration::from_millis(detection.http_timeout_ms),
    };
    let mut pipeline =
        DetectionPipeline::new(camera, transport, PipelineSettings::from(detection));
    let mut publisher = MqttAlertPublisher { client: mqtt };
    let mut broker = BrokerLink {
        up: state.mqtt_connected.clone(),
    };

    let wifi_reconnector = Reconnector::with_limit(
        FixedDelay(network.wifi_retry_delay_ms),
        network.max_attempts(),
    );
    let mqtt_reconnector = Reconnector::with_limit(
        FixedDelay(network.mqtt_retry_delay_ms),
        network.max_attempts(),
    );
    let mut sleeper = WatchdogSleeper;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();
        let link = LinkStatus {
            wifi_up: wifi.is_connected(),
            broker_up: broker.is_connected(),
        };

        match driver.tick(now_ms, link) {
            DriverAction::ConnectWifi => {
                if let Err(err) = wifi_reconnector.ensure_connected(&mut wifi, &mut sleeper) {
                    warn!("{err}; restarting device for recovery");
                    thread::sleep(Duration::from_millis(100));
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }
            }
            DriverAction::ConnectBroker => {
                if let Err(err) = mqtt_reconnector.ensure_connected(&mut broker, &mut sleeper) {
                    warn!("{err}");
                }
            }
            DriverAction::RunCycle => {
                driver.run_cycle(&mut pipeline, &mut publisher, now_ms);
            }
            DriverAction::Wait => sleeper.sleep_ms(detection.poll_delay_ms),
        }

        *state.status.lock().unwrap() = driver.status(monotonic_ms());
    }
}

struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    connected: Arc<AtomicBool>,
}

impl Link for WifiLink {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn is_connected(&mut self) -> bool {
        let up = self.wifi.is_connected().unwrap_or(false) && is_wifi_station_connected();
        self.connected.store(up, Ordering::Relaxed);
        up
    }

    fn try_connect(&mut self) -> Result<(), ConnectivityError> {
        let result = self
            .wifi
            .connect()
            .and_then(|()| self.wifi.wait_netif_up());
        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                let _ = self.wifi.disconnect();
                Err(ConnectivityError::Unreachable {
                    link: "wifi",
                    reason: format!("{err:#}"),
                })
            }
        }
    }
}

/// esp-mqtt reconnects on its own; the link only observes its events.
struct BrokerLink {
    up: Arc<AtomicBool>,
}

impl Link for BrokerLink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_connected(&mut self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    fn try_connect(&mut self) -> Result<(), ConnectivityError> {
        if self.is_connected() {
            return Ok(());
        }
        Err(ConnectivityError::Unreachable {
            link: "mqtt",
            reason: "waiting for broker session".to_string(),
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

struct MqttAlertPublisher {
    client: Arc<Mutex<EspMqttClient<'static>>>,
}

impl MqttAlertPublisher {
    fn publish_json(&mut self, body: &[u8]) -> Result<(), PublishError> {
        self.client
            .lock()
            .unwrap()
            .publish(TOPIC_DETECTIONS, QoS::AtLeastOnce, false, body)
            .map(|_| ())
            .map_err(|err| PublishError::Broker(format!("{err:?}")))
    }
}

impl AlertPublisher for MqttAlertPublisher {
    fn publish_alert(&mut self, alert: &AlertPayload) -> Result<(), PublishError> {
        self.publish_json(&serde_json::to_vec(alert)?)
    }

    fn publish_summary(&mut self, summary: &DetectionSummary) -> Result<(), PublishError> {
        self.publish_json(&serde_json::to_vec(summary)?)
    }
}

struct EspHttpTransport {
    url: String,
    timeout: Duration,
}

impl EspHttpTransport {
    fn classify(&self, started: Instant, err: EspIOError) -> TransportError {
        let code = err.0.code();
        if code == esp_idf_svc::sys::ESP_ERR_TIMEOUT as esp_idf_svc::sys::esp_err_t
            || code == esp_idf_svc::sys::ESP_ERR_HTTP_EAGAIN as esp_idf_svc::sys::esp_err_t
            || started.elapsed() >= self.timeout
        {
            TransportError::Timeout
        } else {
            TransportError::Connection(format!("{err:?}"))
        }
    }
}

impl InferenceTransport for EspHttpTransport {
    fn post_json(&mut self, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let started = Instant::now();
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            ..Default::default()
        };
        let connection =
            EspHttpConnection::new(&http_conf).map_err(|err| self.classify(started, err.into()))?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .request(Method::Post, &self.url, &headers)
            .map_err(|err| self.classify(started, err))?;
        request
            .write_all(body)
            .map_err(|err| self.classify(started, err))?;
        let mut response = request.submit().map_err(|err| self.classify(started, err))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(TransportError::Status(status));
        }

        let mut reply = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| self.classify(started, err))?;
            if read == 0 {
                break;
            }
            if reply.len() + read > MAX_RESPONSE_BYTES {
                return Err(TransportError::Connection(format!(
                    "response exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            reply.extend_from_slice(&chunk[..read]);
        }
        Ok(reply)
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

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
