use crate::{
    error::PublishError,
    local::DetectionSummary,
    types::{
        AlertDetection, AlertEscalation, AlertPayload, Detection, DetectionResponse,
        ProcessingInfo, Severity, FIRE_ALERT_TYPE, FIRE_CLASS, FIRE_RECOMMENDED_ACTION,
        METHOD_SERVER_PROCESSING,
    },
};

/// Sink for what a cycle produces. One call is one MQTT message.
pub trait AlertPublisher {
    fn publish_alert(&mut self, alert: &AlertPayload) -> Result<(), PublishError>;

    fn publish_summary(&mut self, summary: &DetectionSummary) -> Result<(), PublishError>;
}

/// Maps a decoded response to the alerts worth publishing, in server order.
pub fn derive_alerts(
    response: &DetectionResponse,
    threshold: f32,
    device_id: &str,
    timestamp: u64,
) -> Vec<AlertPayload> {
    response
        .detections
        .iter()
        .filter(|detection| detection.is_alert_worthy(threshold))
        .map(|detection| build_alert(detection, response.processing_time_ms, device_id, timestamp))
        .collect()
}

pub fn build_alert(
    detection: &Detection,
    server_time_ms: Option<u64>,
    device_id: &str,
    timestamp: u64,
) -> AlertPayload {
    AlertPayload {
        device_id: device_id.to_string(),
        timestamp,
        detection: AlertDetection {
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            method: METHOD_SERVER_PROCESSING,
        },
        alert: escalation_for(&detection.class_name),
        processing: server_time_ms.map(|server_time_ms| ProcessingInfo { server_time_ms }),
    }
}

fn escalation_for(class_name: &str) -> Option<AlertEscalation> {
    // Case-sensitive on purpose: the server labels are lowercase.
    (class_name == FIRE_CLASS).then_some(AlertEscalation {
        alert_type: FIRE_ALERT_TYPE,
        severity: Severity::Critical,
        action_required: true,
        recommended_action: FIRE_RECOMMENDED_ACTION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn response(detections: Vec<Detection>, processing_time_ms: Option<u64>) -> DetectionResponse {
        DetectionResponse {
            detections,
            processing_time_ms,
            ..DetectionResponse::default()
        }
    }

    #[test]
    fn fire_above_threshold_escalates_with_server_time() {
        let response = DetectionResponse::from_json(
            br#"{"detections":[{"class":"fire","confidence":0.91}], "processing_time_ms":120}"#,
        )
        .unwrap();

        let alerts = derive_alerts(&response, 0.7, "ESP32CAM_001", 5_000);

        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.alert.as_ref().unwrap().severity, Severity::Critical);
        assert_eq!(alert.processing, Some(ProcessingInfo { server_time_ms: 120 }));
        assert_eq!(
            serde_json::to_value(alert).unwrap(),
            serde_json::json!({
                "device_id": "ESP32CAM_001",
                "timestamp": 5000,
                "detection": {"class": "fire", "confidence": 0.91_f32, "method": "server_processing"},
                "alert": {
                    "type": "FIRE_DETECTED",
                    "severity": "CRITICAL",
                    "action_required": true,
                    "recommended_action": "Immediate evacuation and fire suppression"
                },
                "processing": {"server_time_ms": 120}
            })
        );
    }

    #[test]
    fn below_threshold_emits_nothing() {
        let response = response(vec![Detection::new("cat", 0.5)], None);
        assert!(derive_alerts(&response, 0.7, "dev", 0).is_empty());
    }

    #[test]
    fn threshold_is_inclusive_and_order_is_preserved() {
        let response = response(
            vec![
                Detection::new("person", 0.7),
                Detection::new("cat", 0.69),
                Detection::new("smoke", 0.95),
                Detection::new("fire", 0.71),
            ],
            None,
        );

        let classes: Vec<String> = derive_alerts(&response, 0.7, "dev", 0)
            .into_iter()
            .map(|alert| alert.detection.class_name)
            .collect();

        assert_eq!(classes, vec!["person", "smoke", "fire"]);
    }

    #[test]
    fn only_exact_fire_label_escalates() {
        let response = response(
            vec![
                Detection::new("Fire", 0.9),
                Detection::new("fire ", 0.9),
                Detection::new("smoke", 0.9),
            ],
            None,
        );

        let alerts = derive_alerts(&response, 0.5, "dev", 0);

        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|alert| alert.alert.is_none()));
    }

    #[test]
    fn absent_server_time_omits_processing_block() {
        let response = response(vec![Detection::new("person", 0.8)], None);
        let alerts = derive_alerts(&response, 0.5, "dev", 7);

        let value = serde_json::to_value(&alerts[0]).unwrap();
        assert!(value.get("processing").is_none());
        assert!(value.get("alert").is_none());
    }

    #[test]
    fn derivation_is_repeatable() {
        let response = response(
            vec![Detection::new("fire", 0.8), Detection::new("person", 0.75)],
            Some(88),
        );

        let first = derive_alerts(&response, 0.7, "dev", 11);
        let second = derive_alerts(&response, 0.7, "dev", 11);

        assert_eq!(first, second);
    }
}
