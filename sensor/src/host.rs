use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use edgecam_common::{
    ActuatorCommand, ActuatorState, Backoff, ExponentialBackoff, RuntimeConfig, SensorReadings,
    SharedReadings, TelemetryPayload, TOPIC_COMMANDS, TOPIC_DEVICE_STATUS, TOPIC_SENSOR_DATA,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("EDGECAM_DATA_DIR").ok();
    let runtime_path = RuntimeConfig::file_path(data_dir.as_deref());
    let mut runtime = RuntimeConfig::load_file(&runtime_path).unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.apply_env_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();
    let telemetry = runtime.telemetry.clone();

    let mut mqtt_options = MqttOptions::new(
        telemetry.device_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let (command_tx, mut command_rx) = mpsc::channel::<ActuatorCommand>(8);
    let reconnect_backoff = ExponentialBackoff {
        base_ms: runtime.network.mqtt_retry_delay_ms,
        max_ms: runtime.network.mqtt_retry_delay_ms.saturating_mul(8),
    };
    spawn_mqtt_loop(mqtt.clone(), eventloop, command_tx, reconnect_backoff);

    let readings = Arc::new(SharedReadings::new());
    spawn_sampling_loop(
        readings.clone(),
        Duration::from_millis(telemetry.read_interval_ms),
        telemetry.report_moisture,
    );

    info!(
        "sensor publisher started: {} every {}ms",
        TOPIC_SENSOR_DATA, telemetry.publish_interval_ms
    );

    let mut actuators = ActuatorState {
        led: true,
        ..ActuatorState::default()
    };
    let mut publish_interval =
        tokio::time::interval(Duration::from_millis(telemetry.publish_interval_ms));

    loop {
        tokio::select! {
            _ = publish_interval.tick() => publish_telemetry(&mqtt, &readings).await,
            Some(command) = command_rx.recv() => {
                apply_actuator_command(&mqtt, &mut actuators, &command).await;
            }
        }
    }
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    commands: mpsc::Sender<ActuatorCommand>,
    backoff: ExponentialBackoff,
) {
    tokio::spawn(async move {
        let mut failures = 0_u32;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Some(command) = parse_command(&message.topic, &message.payload) {
                        if commands.try_send(command).is_err() {
                            warn!("actuator command queue full; dropping command");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    failures = 0;
                    if let Err(err) = mqtt.try_subscribe(TOPIC_COMMANDS, QoS::AtMostOnce) {
                        warn!("failed to subscribe to {TOPIC_COMMANDS}: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay_ms = backoff.delay_ms(failures);
                    warn!("sensor mqtt poll error: {err}; retrying in {delay_ms}ms");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    });
}

fn parse_command(topic: &str, payload: &[u8]) -> Option<ActuatorCommand> {
    if topic != TOPIC_COMMANDS || payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        return None;
    }
    let message = std::str::from_utf8(payload).ok()?;
    match ActuatorCommand::parse(message) {
        Ok(command) => Some(command),
        Err(err) => {
            // The command topic is shared with the camera node's plain-text commands.
            debug!("ignoring non-actuator command {message:?}: {err}");
            None
        }
    }
}

fn spawn_sampling_loop(readings: Arc<SharedReadings>, period: Duration, report_moisture: bool) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);
            readings.publish(simulated_readings(tick, report_moisture));
        }
    });
}

// Hardware integration point: the ESP build reads a DHT20 and two ADC channels.
fn simulated_readings(tick: u64, report_moisture: bool) -> SensorReadings {
    SensorReadings {
        temperature_c: 24.0 + (tick % 8) as f32 * 0.25,
        humidity_pct: 55.0 + (tick % 6) as f32 * 0.5,
        light: 1_800.0 + (tick % 10) as f32 * 20.0,
        moisture: report_moisture.then(|| 2_100.0 - (tick % 5) as f32 * 15.0),
    }
}

async fn publish_telemetry(mqtt: &AsyncClient, readings: &SharedReadings) {
    let Some(payload) = TelemetryPayload::from_snapshot(readings.snapshot(), monotonic_ms()) else {
        debug!("no sensor reading yet; skipping telemetry");
        return;
    };

    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to encode telemetry: {err}");
            return;
        }
    };
    if let Err(err) = mqtt
        .publish(TOPIC_SENSOR_DATA, QoS::AtLeastOnce, false, body)
        .await
    {
        warn!("failed to publish telemetry: {err}");
    }
}

async fn apply_actuator_command(
    mqtt: &AsyncClient,
    actuators: &mut ActuatorState,
    command: &ActuatorCommand,
) {
    for (actuator, on) in actuators.apply(command) {
        info!(
            "simulated {} output -> {}",
            actuator.as_str(),
            if on { "ON" } else { "OFF" }
        );
    }

    let mut messages = Vec::with_capacity(2);
    messages.push(serde_json::to_vec(&*actuators));
    if let Some(reply) = command.rpc_reply(actuators) {
        messages.push(serde_json::to_vec(&reply));
    }

    for message in messages {
        match message {
            Ok(body) => {
                if let Err(err) = mqtt
                    .publish(TOPIC_DEVICE_STATUS, QoS::AtLeastOnce, false, body)
                    .await
                {
                    warn!("failed to publish actuator state: {err}");
                }
            }
            Err(err) => warn!("failed to encode actuator state: {err}"),
        }
    }
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
