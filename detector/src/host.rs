use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use reqwest::header::CONTENT_TYPE;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{error, info, warn};

use edgecam_common::{
    AlertPayload, AlertPublisher, Backoff, ConnectivityError, DetectionDriver, DetectionFlags,
    DetectionPipeline, DetectionSummary, DetectorCommand, DriverAction, DriverStatus, DriverTiming,
    ExponentialBackoff, FixedDelay, FrameSource, InferenceTransport, Link, LinkStatus,
    PipelineError, PipelineSettings, PublishError, Reconnector, RuntimeConfig, ThreadSleeper,
    TransportError, TOPIC_COMMANDS, TOPIC_DETECTIONS,
};

#[derive(Clone)]
struct AppState {
    flags: Arc<DetectionFlags>,
    status: Arc<Mutex<DriverStatus>>,
    broker_up: Arc<AtomicBool>,
    device_id: Arc<String>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "brokerConnected")]
    broker_connected: bool,
    #[serde(flatten)]
    driver: DriverStatus,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.apply_env_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();

    let network = &runtime.network;
    let mut mqtt_options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let flags = Arc::new(DetectionFlags::new(runtime.detection.enabled_at_boot));
    let driver = DetectionDriver::new(DriverTiming::from(&runtime.detection), flags.clone());

    let app_state = AppState {
        flags,
        status: Arc::new(Mutex::new(driver.status(monotonic_ms()))),
        broker_up: Arc::new(AtomicBool::new(false)),
        device_id: Arc::new(runtime.detection.device_id.clone()),
    };

    let reconnect_backoff = ExponentialBackoff {
        base_ms: runtime.network.mqtt_retry_delay_ms,
        max_ms: runtime.network.mqtt_retry_delay_ms.saturating_mul(8),
    };
    spawn_mqtt_loop(app_state.clone(), mqtt.clone(), eventloop, reconnect_backoff);
    spawn_detection_loop(app_state.clone(), runtime, driver, mqtt);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/detection", post(handle_detection_command))
        .with_state(app_state);

    let port = std::env::var("DETECTOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind detector server at {addr}"))?;

    info!("detector listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    backoff: ExponentialBackoff,
) {
    tokio::spawn(async move {
        let mut failures = 0_u32;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    failures = 0;
                    app_state.broker_up.store(true, Ordering::Relaxed);
                    if let Err(err) = mqtt.try_subscribe(TOPIC_COMMANDS, QoS::AtMostOnce) {
                        warn!("failed to subscribe to {TOPIC_COMMANDS}: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.broker_up.store(false, Ordering::Relaxed);
                    failures = failures.saturating_add(1);
                    let delay_ms = backoff.delay_ms(failures);
                    warn!("mqtt poll error: {err}; retrying in {delay_ms}ms");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    });
}

fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if topic != TOPIC_COMMANDS {
        return;
    }
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {topic} ({} bytes)",
            payload.len()
        );
        return;
    }

    let Ok(message) = std::str::from_utf8(payload) else {
        warn!("ignoring non utf8 command payload");
        return;
    };
    match DetectorCommand::parse(message) {
        Some(command) => {
            info!("command received: {}", command.as_str());
            app_state.flags.apply(command);
        }
        None => warn!("ignoring unknown command {message:?}"),
    }
}

fn spawn_detection_loop(
    app_state: AppState,
    runtime: RuntimeConfig,
    driver: DetectionDriver,
    mqtt: AsyncClient,
) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = run_detection_loop(app_state, runtime, driver, mqtt) {
            error!("detection loop stopped: {err:#}");
        }
    });
}

fn run_detection_loop(
    app_state: AppState,
    runtime: RuntimeConfig,
    mut driver: DetectionDriver,
    mqtt: AsyncClient,
) -> anyhow::Result<()> {
    let detection = &runtime.detection;
    let transport = HttpTransport::new(
        &detection.server_url,
        Duration::from_millis(detection.http_timeout_ms),
    )?;
    let frames_dir = std::env::var_os("EDGECAM_FRAMES_DIR").map(PathBuf::from);
    let source = HostFrameSource::open(frames_dir)?;
    let mut pipeline =
        DetectionPipeline::new(source, transport, PipelineSettings::from(detection));

    let mut publisher = MqttAlertPublisher { client: mqtt };
    let mut broker = BrokerLink {
        up: app_state.broker_up.clone(),
    };
    let reconnector = Reconnector::with_limit(
        FixedDelay(runtime.network.mqtt_retry_delay_ms),
        runtime.network.max_attempts(),
    );
    let poll_delay = Duration::from_millis(detection.poll_delay_ms);

    info!(
        "detection loop started: {} every {}ms",
        detection.server_url, detection.capture_interval_ms
    );

    loop {
        let now_ms = monotonic_ms();
        let link = LinkStatus {
            wifi_up: true,
            broker_up: broker.is_connected(),
        };

        match driver.tick(now_ms, link) {
            DriverAction::ConnectWifi | DriverAction::ConnectBroker => {
                if let Err(err) = reconnector.ensure_connected(&mut broker, &mut ThreadSleeper) {
                    warn!("{err}");
                    std::thread::sleep(poll_delay);
                }
            }
            DriverAction::RunCycle => {
                driver.run_cycle(&mut pipeline, &mut publisher, now_ms);
            }
            DriverAction::Wait => std::thread::sleep(poll_delay),
        }

        *app_state.status.blocking_lock() = driver.status(monotonic_ms());
    }
}

/// The event loop task owns the real connection; this only reports on it.
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
            reason: "waiting for CONNACK".to_string(),
        })
    }
}

struct MqttAlertPublisher {
    client: AsyncClient,
}

impl MqttAlertPublisher {
    fn publish_json(&mut self, body: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .try_publish(TOPIC_DETECTIONS, QoS::AtLeastOnce, false, body)
            .map_err(|err| PublishError::Broker(err.to_string()))
    }
}

impl AlertPublisher for MqttAlertPublisher {
    fn publish_alert(&mut self, alert: &AlertPayload) -> Result<(), PublishError> {
        self.publish_json(serde_json::to_vec(alert)?)
    }

    fn publish_summary(&mut self, summary: &DetectionSummary) -> Result<(), PublishError> {
        self.publish_json(serde_json::to_vec(summary)?)
    }
}

struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpTransport {
    fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build inference http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl InferenceTransport for HttpTransport {
    fn post_json(&mut self, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// Replays JPEG files from a directory in name order, or produces small
/// placeholder frames when no directory is configured.
struct HostFrameSource {
    frames: Vec<PathBuf>,
    next: usize,
    synthetic_count: u32,
}

impl HostFrameSource {
    fn open(dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut frames = Vec::new();
        if let Some(dir) = dir {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("failed to read frames dir {}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                let is_jpeg = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
                if is_jpeg {
                    frames.push(path);
                }
            }
            frames.sort();
            if frames.is_empty() {
                warn!("no jpeg frames in {}; using placeholder frames", dir.display());
            }
        }

        Ok(Self {
            frames,
            next: 0,
            synthetic_count: 0,
        })
    }
}

impl FrameSource for HostFrameSource {
    type Frame<'a> = Vec<u8>;

    fn capture(&mut self) -> Result<Self::Frame<'_>, PipelineError> {
        if self.frames.is_empty() {
            self.synthetic_count = self.synthetic_count.wrapping_add(1);
            return Ok(placeholder_frame(self.synthetic_count));
        }

        let path = &self.frames[self.next % self.frames.len()];
        self.next = self.next.wrapping_add(1);
        std::fs::read(path)
            .map_err(|err| PipelineError::Capture(format!("{}: {err}", path.display())))
    }
}

fn placeholder_frame(sequence: u32) -> Vec<u8> {
    let mut frame = vec![0xFF, 0xD8, 0xFF, 0xE0];
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let driver = state.status.lock().await.clone();
    Json(StatusView {
        device_id: state.device_id.as_ref().clone(),
        broker_connected: state.broker_up.load(Ordering::Relaxed),
        driver,
    })
}

async fn handle_detection_command(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let command = match value.as_str() {
        "enable" => DetectorCommand::EnableDetection,
        "disable" => DetectorCommand::DisableDetection,
        "capture" => DetectorCommand::CaptureNow,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid detection command"),
    };

    info!("api command: {}", command.as_str());
    state.flags.apply(command);
    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("EDGECAM_DATA_DIR").ok();
        Self {
            runtime_path: Arc::new(RuntimeConfig::file_path(data_dir.as_deref())),
        }
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        Ok(RuntimeConfig::load_file(&self.runtime_path)?)
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_inference_stub(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api/detect")
    }

    fn test_state() -> AppState {
        AppState {
            flags: Arc::new(DetectionFlags::default()),
            status: Arc::new(Mutex::new(
                DetectionDriver::new(
                    DriverTiming {
                        capture_interval_ms: 5_000,
                        failure_backoff_max_ms: 0,
                    },
                    Arc::new(DetectionFlags::default()),
                )
                .status(0),
            )),
            broker_up: Arc::new(AtomicBool::new(false)),
            device_id: Arc::new("ESP32CAM_001".to_string()),
        }
    }

    #[tokio::test]
    async fn slow_server_maps_to_timeout() {
        let url = spawn_inference_stub(Router::new().route(
            "/api/detect",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(800)).await;
                r#"{"detections": []}"#
            }),
        ))
        .await;

        let result = tokio::task::spawn_blocking(move || {
            let mut transport = HttpTransport::new(&url, Duration::from_millis(100)).unwrap();
            transport.post_json(b"{}")
        })
        .await
        .unwrap();

        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn server_error_maps_to_status() {
        let url = spawn_inference_stub(Router::new().route(
            "/api/detect",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;

        let result = tokio::task::spawn_blocking(move || {
            let mut transport = HttpTransport::new(&url, Duration::from_secs(2)).unwrap();
            transport.post_json(b"{}")
        })
        .await
        .unwrap();

        assert_eq!(result, Err(TransportError::Status(500)));
    }

    #[tokio::test]
    async fn pipeline_round_trip_against_local_server() {
        let url = spawn_inference_stub(Router::new().route(
            "/api/detect",
            post(|Json(body): Json<serde_json::Value>| async move {
                let ok = body["model"] == "fire_detection_best"
                    && body["image"].as_str().is_some_and(|image| image.starts_with("/9j/"));
                let class = if ok { "fire" } else { "bad_request" };
                Json(serde_json::json!({
                    "detections": [{"class": class, "confidence": 0.9}],
                    "processing_time_ms": 41.7
                }))
            }),
        ))
        .await;

        let response = tokio::task::spawn_blocking(move || {
            let transport = HttpTransport::new(&url, Duration::from_secs(2)).unwrap();
            let source = HostFrameSource::open(None).unwrap();
            let settings = PipelineSettings::from(&RuntimeConfig::default().detection);
            DetectionPipeline::new(source, transport, settings).run_cycle(1_000)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.detections[0].class_name, "fire");
        assert_eq!(response.processing_time_ms, Some(42));
    }

    #[test]
    fn command_topic_updates_flags() {
        let state = test_state();

        handle_mqtt_message(&state, TOPIC_COMMANDS, b"disable_detection");
        assert!(!state.flags.is_enabled());

        handle_mqtt_message(&state, TOPIC_COMMANDS, b"capture_now");
        assert!(state.flags.is_capture_requested());

        handle_mqtt_message(&state, TOPIC_COMMANDS, b"Enable_Detection");
        assert!(!state.flags.is_enabled());

        handle_mqtt_message(&state, TOPIC_DETECTIONS, b"enable_detection");
        assert!(!state.flags.is_enabled());
    }

    #[test]
    fn placeholder_frames_look_like_jpeg() {
        let mut source = HostFrameSource::open(None).unwrap();

        let first = source.capture().unwrap();
        let second = source.capture().unwrap();

        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        assert_eq!(&first[first.len() - 2..], &[0xFF, 0xD9]);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn api_command_rejects_unknown_value() {
        let state = test_state();
        let params = HashMap::from([("value".to_string(), "reboot".to_string())]);

        let response = handle_detection_command(State(state.clone()), Query(params))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.flags.is_enabled());
    }
}
