use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("inference server answered HTTP {0}")]
    Status(u16),
    #[error("inference request timed out")]
    Timeout,
    #[error("inference request failed: {0}")]
    Connection(String),
}

/// Reasons a single detection cycle is abandoned. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("camera capture failed: {0}")]
    Capture(String),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("on-device inference failed: {0}")]
    Inference(String),
    #[error("failed to encode inference request: {0}")]
    Encode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed inference response: {0}")]
    Decode(String),
    #[error("inference server reported: {message}")]
    Remote { message: String },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Inference(_) => "inference",
            Self::Encode(_) => "encode",
            Self::Transport(TransportError::Timeout) => "timeout",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Remote { .. } => "remote",
        }
    }

    /// Whether the failed cycle used up its slot in the capture schedule.
    /// Cycles that never got a usable frame out are retried on the next poll.
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(
            self,
            Self::Capture(_) | Self::FrameTooLarge { .. } | Self::Inference(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("{link} unreachable: {reason}")]
    Unreachable { link: &'static str, reason: String },
    #[error("{link} still down after {attempts} attempts")]
    Exhausted { link: &'static str, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker rejected publish: {0}")]
    Broker(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid runtime config: {0}")]
    Parse(#[from] serde_json::Error),
}
