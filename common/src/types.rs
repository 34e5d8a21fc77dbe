use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PipelineError;

pub const METHOD_SERVER_PROCESSING: &str = "server_processing";
pub const FIRE_CLASS: &str = "fire";
pub const FIRE_ALERT_TYPE: &str = "FIRE_DETECTED";
pub const FIRE_RECOMMENDED_ACTION: &str = "Immediate evacuation and fire suppression";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Body of the `POST` sent to the inference server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRequest {
    /// Standard base64 of the captured frame.
    pub image: String,
    pub model: String,
    pub threshold: f32,
    pub device_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
    /// Passed through untouched; alerting never reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<serde_json::Value>,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            class_id: None,
            bbox: None,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.class_name.is_empty()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }

    pub fn is_alert_worthy(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
    pub processing_time_ms: Option<u64>,
    pub model_version: Option<String>,
    /// Entries dropped because they did not decode, had an empty class, or a
    /// confidence outside [0, 1].
    pub discarded: usize,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detections: Option<Vec<serde_json::Value>>,
    #[serde(default, deserialize_with = "deserialize_millis")]
    processing_time_ms: Option<u64>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    model_used: Option<String>,
}

impl DetectionResponse {
    pub fn from_json(body: &[u8]) -> Result<Self, PipelineError> {
        let wire: WireResponse =
            serde_json::from_slice(body).map_err(|err| PipelineError::Decode(err.to_string()))?;

        if let Some(message) = wire.error {
            return Err(PipelineError::Remote { message });
        }

        let raw = wire.detections.unwrap_or_default();
        let total = raw.len();
        // Entries decode one at a time so a single bad one cannot hide the rest.
        let detections: Vec<Detection> = raw
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Detection>(entry).ok())
            .filter(Detection::is_well_formed)
            .collect();

        Ok(Self {
            discarded: total - detections.len(),
            detections,
            processing_time_ms: wire.processing_time_ms,
            model_version: wire.model_version.or(wire.model_used),
        })
    }
}

// The server reports latency as a float with two decimals.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms.round() as u64))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertDetection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub method: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEscalation {
    #[serde(rename = "type")]
    pub alert_type: &'static str,
    pub severity: Severity,
    pub action_required: bool,
    pub recommended_action: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingInfo {
    pub server_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub device_id: String,
    pub timestamp: u64,
    pub detection: AlertDetection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertEscalation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_server_reply_with_bbox_and_float_latency() {
        let body = br#"{
            "detections": [{
                "class": "fire", "class_id": 0, "confidence": 0.912,
                "bbox": {"x1": 10, "y1": 20, "x2": 110, "y2": 220, "width": 100,
                         "height": 200, "center_x": 60, "center_y": 120}
            }],
            "processing_time_ms": 119.62,
            "model_used": "fire_detection_best",
            "detection_count": 1
        }"#;

        let response = DetectionResponse::from_json(body).unwrap();

        assert_eq!(response.detections.len(), 1);
        assert_eq!(response.detections[0].class_name, "fire");
        assert_eq!(response.detections[0].class_id, Some(0));
        assert_eq!(response.detections[0].bbox.as_ref().unwrap()["center_y"], 120);
        assert_eq!(response.processing_time_ms, Some(120));
        assert_eq!(response.model_version.as_deref(), Some("fire_detection_best"));
        assert_eq!(response.discarded, 0);
    }

    #[test]
    fn error_field_becomes_remote_error() {
        let err = DetectionResponse::from_json(br#"{"error": "Model 'x' not found"}"#)
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::Remote {
                message: "Model 'x' not found".to_string()
            }
        );
    }

    #[test]
    fn missing_detections_decode_as_empty() {
        let response = DetectionResponse::from_json(br#"{"model_version": "v8"}"#).unwrap();
        assert!(response.detections.is_empty());
        assert_eq!(response.processing_time_ms, None);
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let err = DetectionResponse::from_json(b"<html>502</html>").unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn drops_out_of_range_and_unlabelled_detections() {
        let body = br#"{"detections": [
            {"class": "fire", "confidence": 1.7},
            {"class": "", "confidence": 0.9},
            {"class": "smoke", "confidence": -0.1},
            {"class": "person", "confidence": 0.8}
        ]}"#;

        let response = DetectionResponse::from_json(body).unwrap();

        assert_eq!(response.detections, vec![Detection::new("person", 0.8)]);
        assert_eq!(response.discarded, 3);
    }

    #[test]
    fn fractional_bbox_keeps_fire_detection() {
        let body = br#"{
            "detections": [{"class": "fire", "confidence": 0.91,
                            "bbox": {"x1": 10.5, "y1": 20.25, "x2": 110.0, "y2": 220.75}}],
            "processing_time_ms": 120
        }"#;

        let response = DetectionResponse::from_json(body).unwrap();

        assert_eq!(response.detections.len(), 1);
        assert_eq!(response.detections[0].class_name, "fire");
        assert_eq!(response.detections[0].bbox.as_ref().unwrap()["x1"], 10.5);
        assert_eq!(response.discarded, 0);
    }

    #[test]
    fn undecodable_entries_are_counted_not_fatal() {
        let body = br#"{"detections": [
            {"class": "fire", "confidence": 0.9},
            {"class": null, "confidence": 0.8},
            {"class": "smoke"},
            {"class": "person", "confidence": "high"},
            {"class": "cat", "confidence": 0.4, "bbox": [1, 2, 3, 4]}
        ]}"#;

        let response = DetectionResponse::from_json(body).unwrap();

        let classes: Vec<&str> = response
            .detections
            .iter()
            .map(|detection| detection.class_name.as_str())
            .collect();
        assert_eq!(classes, vec!["fire", "cat"]);
        assert_eq!(response.discarded, 3);
    }

    #[test]
    fn request_serializes_wire_field_names() {
        let request = DetectionRequest {
            image: "AAEC".to_string(),
            model: "fire_detection_best".to_string(),
            threshold: 0.7,
            device_id: "ESP32CAM_001".to_string(),
            timestamp: 42,
        };

        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "image": "AAEC",
                "model": "fire_detection_best",
                "threshold": 0.7_f32,
                "device_id": "ESP32CAM_001",
                "timestamp": 42
            })
        );
    }
}
