//! On-device detection with a small object model (FOMO style). The camera
//! runs the model itself and publishes one summary per cycle instead of one
//! alert per object.

use log::debug;
use serde::Serialize;

use crate::{
    error::PipelineError,
    pipeline::FrameSource,
    types::{Severity, FIRE_ALERT_TYPE, FIRE_CLASS},
};

pub const LOCAL_CAPTURE_INTERVAL_MS: u64 = 2_000;
pub const LOCAL_POLL_DELAY_MS: u64 = 100;
pub const LOCAL_DEVICE_ID: &str = "ESP32CAM_AI_001";

/// One object reported by the model, in model input pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject {
    pub label: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub proba: f32,
}

impl LocalObject {
    pub fn new(label: impl Into<String>, proba: f32) -> Self {
        Self {
            label: label.into(),
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            proba,
        }
    }
}

/// Model runtime seam. Objects come back most confident first.
pub trait ObjectDetector {
    fn detect(&mut self, frame: &[u8]) -> Result<Vec<LocalObject>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub device_id: String,
    pub threshold: f32,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            device_id: LOCAL_DEVICE_ID.to_string(),
            threshold: 0.7,
        }
    }
}

pub struct LocalPipeline<S, D> {
    source: S,
    detector: D,
    settings: LocalSettings,
}

impl<S: FrameSource, D: ObjectDetector> LocalPipeline<S, D> {
    pub fn new(source: S, detector: D, settings: LocalSettings) -> Self {
        Self {
            source,
            detector,
            settings,
        }
    }

    pub fn settings(&self) -> &LocalSettings {
        &self.settings
    }

    /// Capture one frame and run the model over it. The frame is released
    /// before return.
    pub fn detect(&mut self) -> Result<Vec<LocalObject>, PipelineError> {
        let frame = self.source.capture()?;
        let bytes = frame.as_ref();
        if bytes.is_empty() {
            return Err(PipelineError::Capture("camera returned an empty frame".into()));
        }

        let objects = self.detector.detect(bytes)?;
        for (index, object) in objects.iter().enumerate() {
            debug!(
                "#{} {} at ({}, {}) [{}x{}] confidence {:.2}",
                index + 1,
                object.label,
                object.x,
                object.y,
                object.width,
                object.height,
                object.proba
            );
        }
        Ok(objects)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryDetection {
    pub objects_detected: usize,
    pub primary_object: String,
    pub confidence: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryAlert {
    #[serde(rename = "type")]
    pub alert_type: &'static str,
    pub severity: Severity,
    pub action_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub device_id: String,
    pub timestamp: u64,
    pub detection: SummaryDetection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<SummaryAlert>,
}

/// Summary for the primary (first) object, or `None` when nothing was found
/// or the primary object is below the threshold.
pub fn summarize(
    objects: &[LocalObject],
    settings: &LocalSettings,
    timestamp: u64,
) -> Option<DetectionSummary> {
    let primary = objects.first()?;
    if primary.proba < settings.threshold {
        return None;
    }

    // Publishing is inclusive but escalation needs a strictly higher score.
    let alert = (primary.label == FIRE_CLASS && primary.proba > settings.threshold).then_some(
        SummaryAlert {
            alert_type: FIRE_ALERT_TYPE,
            severity: Severity::High,
            action_required: true,
        },
    );

    Some(DetectionSummary {
        device_id: settings.device_id.clone(),
        timestamp,
        detection: SummaryDetection {
            objects_detected: objects.len(),
            primary_object: primary.label.clone(),
            confidence: primary.proba,
            threshold: settings.threshold,
        },
        alert,
    })
}
