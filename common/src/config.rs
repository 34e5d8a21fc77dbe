use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_DATA_DIR: &str = "./.edgecam";
pub const RUNTIME_FILE_NAME: &str = "runtime.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub wifi_retry_delay_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
    pub mqtt_retry_delay_ms: u64,
    /// Zero keeps retrying forever.
    #[serde(default)]
    pub max_connect_attempts: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            wifi_retry_delay_ms: 500,
            mqtt_host: "app.coreiot.io".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "ESP32CAM_Hybrid_AI".to_string(),
            mqtt_retry_delay_ms: 5_000,
            max_connect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub server_url: String,
    pub model: String,
    pub device_id: String,
    pub confidence_threshold: f32,
    pub max_image_bytes: usize,
    pub http_timeout_ms: u64,
    pub capture_interval_ms: u64,
    pub poll_delay_ms: u64,
    /// Upper bound for the stretched interval after consecutive failed
    /// cycles. At or below `capture_interval_ms` the interval never stretches.
    #[serde(default)]
    pub failure_backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub enabled_at_boot: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://192.168.15.4:5001/api/detect".to_string(),
            model: "fire_detection_best".to_string(),
            device_id: "ESP32CAM_001".to_string(),
            confidence_threshold: 0.7,
            max_image_bytes: 100_000,
            http_timeout_ms: 10_000,
            capture_interval_ms: 5_000,
            poll_delay_ms: 1_000,
            failure_backoff_max_ms: 0,
            enabled_at_boot: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub device_id: String,
    pub read_interval_ms: u64,
    pub publish_interval_ms: u64,
    pub report_moisture: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: "ESP32_Client".to_string(),
            read_interval_ms: 1_000,
            publish_interval_ms: 10_000,
            report_moisture: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_true() -> bool {
    true
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.wifi_retry_delay_ms == 0 {
            self.wifi_retry_delay_ms = defaults.wifi_retry_delay_ms;
        }
        if self.mqtt_retry_delay_ms == 0 {
            self.mqtt_retry_delay_ms = defaults.mqtt_retry_delay_ms;
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = defaults.mqtt_port;
        }
        if self.mqtt_client_id.trim().is_empty() {
            self.mqtt_client_id = defaults.mqtt_client_id;
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_connect_attempts > 0).then_some(self.max_connect_attempts)
    }
}

impl DetectionConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        self.confidence_threshold = if self.confidence_threshold.is_finite() {
            self.confidence_threshold.clamp(0.0, 1.0)
        } else {
            defaults.confidence_threshold
        };
        if self.max_image_bytes == 0 {
            self.max_image_bytes = defaults.max_image_bytes;
        }
        if self.http_timeout_ms == 0 {
            self.http_timeout_ms = defaults.http_timeout_ms;
        }
        if self.capture_interval_ms == 0 {
            self.capture_interval_ms = defaults.capture_interval_ms;
        }
        self.poll_delay_ms = self.poll_delay_ms.clamp(10, 10_000);
    }
}

impl TelemetryConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.read_interval_ms == 0 {
            self.read_interval_ms = defaults.read_interval_ms;
        }
        if self.publish_interval_ms == 0 {
            self.publish_interval_ms = defaults.publish_interval_ms;
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.detection.sanitize();
        self.telemetry.sanitize();
    }

    /// `runtime.json` inside `data_dir`, falling back to `./.edgecam`.
    pub fn file_path(data_dir: Option<&str>) -> PathBuf {
        Path::new(data_dir.unwrap_or(DEFAULT_DATA_DIR)).join(RUNTIME_FILE_NAME)
    }

    /// Reads a stored config. A missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Host deployments override the stored file from the environment.
    /// Unparseable numbers leave the stored value in place.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.network.mqtt_host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.network.mqtt_port = port;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.network.mqtt_user = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.network.mqtt_pass = pass;
        }
        if let Some(url) = lookup("INFERENCE_URL") {
            self.detection.server_url = url;
        }
        if let Some(device_id) = lookup("DEVICE_ID") {
            self.detection.device_id = device_id.clone();
            self.telemetry.device_id = device_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edgecam-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn runtime_file_defaults_to_local_data_dir() {
        assert_eq!(
            RuntimeConfig::file_path(None),
            Path::new("./.edgecam").join("runtime.json")
        );
        assert_eq!(
            RuntimeConfig::file_path(Some("/var/lib/edgecam")),
            Path::new("/var/lib/edgecam/runtime.json")
        );
    }

    #[test]
    fn missing_runtime_file_loads_defaults() {
        let dir = scratch_dir("missing");
        let config = RuntimeConfig::load_file(&dir.join(RUNTIME_FILE_NAME)).unwrap();

        assert_eq!(config.telemetry.publish_interval_ms, 10_000);
        assert_eq!(config.network.mqtt_host, "app.coreiot.io");
    }

    #[test]
    fn stored_runtime_file_is_read_and_bad_json_rejected() {
        let dir = scratch_dir("stored");
        let path = dir.join(RUNTIME_FILE_NAME);

        let mut stored = RuntimeConfig::default();
        stored.network.mqtt_host = "broker.lan".to_string();
        stored.telemetry.report_moisture = false;
        std::fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();
        let config = RuntimeConfig::load_file(&path).unwrap();
        assert_eq!(config.network.mqtt_host, "broker.lan");
        assert!(!config.telemetry.report_moisture);

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            RuntimeConfig::load_file(&path),
            Err(ConfigError::Parse(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn sanitize_clamps_threshold_and_restores_zero_intervals() {
        let mut detection = DetectionConfig {
            confidence_threshold: 1.4,
            capture_interval_ms: 0,
            http_timeout_ms: 0,
            poll_delay_ms: 0,
            ..DetectionConfig::default()
        };
        detection.sanitize();

        assert_eq!(detection.confidence_threshold, 1.0);
        assert_eq!(detection.capture_interval_ms, 5_000);
        assert_eq!(detection.http_timeout_ms, 10_000);
        assert_eq!(detection.poll_delay_ms, 10);

        detection.confidence_threshold = f32::NAN;
        detection.sanitize();
        assert_eq!(detection.confidence_threshold, 0.7);
    }

    #[test]
    fn env_overrides_replace_stored_values() {
        let mut runtime = RuntimeConfig::default();
        let env = [
            ("MQTT_HOST", "broker.lan"),
            ("MQTT_PORT", "not-a-port"),
            ("INFERENCE_URL", "http://10.0.0.5:5001/api/detect"),
            ("DEVICE_ID", "CAM_KITCHEN"),
        ];

        runtime.apply_env_overrides(|key| {
            env.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        });

        assert_eq!(runtime.network.mqtt_host, "broker.lan");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.network.mqtt_user, "");
        assert_eq!(runtime.detection.server_url, "http://10.0.0.5:5001/api/detect");
        assert_eq!(runtime.detection.device_id, "CAM_KITCHEN");
        assert_eq!(runtime.telemetry.device_id, "CAM_KITCHEN");
    }

    #[test]
    fn partial_json_falls_back_to_section_defaults() {
        let raw = r#"{"network": {
            "wifi_ssid": "lab", "wifi_pass": "secret", "wifi_retry_delay_ms": 500,
            "mqtt_host": "broker.local", "mqtt_port": 1883, "mqtt_user": "",
            "mqtt_pass": "", "mqtt_client_id": "cam-1", "mqtt_retry_delay_ms": 5000
        }}"#;

        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(runtime.network.mqtt_host, "broker.local");
        assert_eq!(runtime.network.max_attempts(), None);
        assert_eq!(runtime.detection.max_image_bytes, 100_000);
        assert!(runtime.detection.enabled_at_boot);
        assert_eq!(runtime.telemetry.publish_interval_ms, 10_000);
    }
}
