pub mod alerts;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod driver;
pub mod error;
pub mod local;
pub mod pipeline;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use alerts::{build_alert, derive_alerts, AlertPublisher};
pub use command::{
    Actuator, ActuatorCommand, ActuatorCommandError, ActuatorState, DetectionFlags, DetectorCommand,
    RpcReply,
};
pub use config::{DetectionConfig, NetworkConfig, RuntimeConfig, TelemetryConfig};
pub use connectivity::{
    Backoff, ExponentialBackoff, FixedDelay, Link, Reconnector, Sleeper, ThreadSleeper,
};
pub use driver::{
    CycleReport, DetectionDriver, DriverAction, DriverState, DriverStatus, DriverTiming, LinkStatus,
};
pub use error::{ConfigError, ConnectivityError, PipelineError, PublishError, TransportError};
pub use local::{
    summarize, DetectionSummary, LocalObject, LocalPipeline, LocalSettings, ObjectDetector,
};
pub use pipeline::{DetectionPipeline, FrameSource, InferenceTransport, PipelineSettings};
pub use telemetry::{LatestReadings, SensorReadings, SharedReadings, TelemetryPayload};
pub use topics::*;
pub use types::{AlertPayload, Detection, DetectionRequest, DetectionResponse, Severity};
