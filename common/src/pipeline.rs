use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;

use crate::{
    config::DetectionConfig,
    error::{PipelineError, TransportError},
    types::{DetectionRequest, DetectionResponse},
};

/// Camera seam. A frame is released back to the driver when it is dropped.
pub trait FrameSource {
    type Frame<'a>: AsRef<[u8]>
    where
        Self: 'a;

    fn capture(&mut self) -> Result<Self::Frame<'_>, PipelineError>;
}

/// Synchronous JSON POST to the inference endpoint. Implementations own the
/// URL and the timeout and return the body of a 2xx reply.
pub trait InferenceTransport {
    fn post_json(&mut self, body: &[u8]) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model: String,
    pub device_id: String,
    pub threshold: f32,
    pub max_image_bytes: usize,
}

impl From<&DetectionConfig> for PipelineSettings {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            model: config.model.clone(),
            device_id: config.device_id.clone(),
            threshold: config.confidence_threshold,
            max_image_bytes: config.max_image_bytes,
        }
    }
}

pub struct DetectionPipeline<S, T> {
    source: S,
    transport: T,
    settings: PipelineSettings,
}

impl<S: FrameSource, T: InferenceTransport> DetectionPipeline<S, T> {
    pub fn new(source: S, transport: T, settings: PipelineSettings) -> Self {
        Self {
            source,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn run_cycle(&mut self, now_ms: u64) -> Result<DetectionResponse, PipelineError> {
        let request = self.prepare_request(now_ms)?;
        self.submit(&request)
    }

    /// Capture, size gate, and encode. The frame is released before return.
    pub fn prepare_request(&mut self, now_ms: u64) -> Result<DetectionRequest, PipelineError> {
        let max = self.settings.max_image_bytes;
        let image = {
            let frame = self.source.capture()?;
            let bytes = frame.as_ref();
            if bytes.is_empty() {
                return Err(PipelineError::Capture("camera returned an empty frame".into()));
            }
            if bytes.len() > max {
                return Err(PipelineError::FrameTooLarge {
                    size: bytes.len(),
                    max,
                });
            }
            debug!("captured {} byte frame", bytes.len());
            STANDARD.encode(bytes)
        };

        Ok(DetectionRequest {
            image,
            model: self.settings.model.clone(),
            threshold: self.settings.threshold,
            device_id: self.settings.device_id.clone(),
            timestamp: now_ms,
        })
    }

    pub fn submit(&mut self, request: &DetectionRequest) -> Result<DetectionResponse, PipelineError> {
        let body = serde_json::to_vec(request)
            .map_err(|err| PipelineError::Encode(err.to_string()))?;
        debug!("posting {} byte inference request", body.len());

        let reply = self.transport.post_json(&body)?;
        DetectionResponse::from_json(&reply)
    }
}
