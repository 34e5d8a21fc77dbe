pub const TOPIC_DETECTIONS: &str = "coreiot/device123/ai_detections";
pub const TOPIC_SENSOR_DATA: &str = "coreiot/device123/sensor_data";
pub const TOPIC_COMMANDS: &str = "coreiot/device123/commands";
pub const TOPIC_DEVICE_STATUS: &str = "coreiot/device123/status";
