use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::{
    alerts::{derive_alerts, AlertPublisher},
    command::DetectionFlags,
    config::DetectionConfig,
    error::PipelineError,
    local::{summarize, LocalPipeline, ObjectDetector, LOCAL_CAPTURE_INTERVAL_MS},
    pipeline::{DetectionPipeline, FrameSource, InferenceTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Disconnected,
    ConnectingWifi,
    ConnectingBroker,
    Idle,
    Capturing,
    AwaitingResponse,
    Publishing,
}

impl DriverState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::ConnectingWifi => "CONNECTING_WIFI",
            Self::ConnectingBroker => "CONNECTING_BROKER",
            Self::Idle => "IDLE",
            Self::Capturing => "CAPTURING",
            Self::AwaitingResponse => "AWAITING_RESPONSE",
            Self::Publishing => "PUBLISHING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub wifi_up: bool,
    pub broker_up: bool,
}

impl LinkStatus {
    pub const ONLINE: Self = Self {
        wifi_up: true,
        broker_up: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverAction {
    ConnectWifi,
    ConnectBroker,
    RunCycle,
    Wait,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_ms: u64,
    pub detections: usize,
    pub alerts_published: usize,
    pub publish_failures: usize,
    pub outcome: Result<(), PipelineError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub state: &'static str,
    #[serde(rename = "detectionEnabled")]
    pub detection_enabled: bool,
    #[serde(rename = "cyclesRun")]
    pub cycles_run: u64,
    #[serde(rename = "cyclesFailed")]
    pub cycles_failed: u64,
    #[serde(rename = "alertsPublished")]
    pub alerts_published: u64,
    #[serde(rename = "lastCycleMs")]
    pub last_cycle_ms: Option<u64>,
    #[serde(rename = "nextCycleInMs")]
    pub next_cycle_in_ms: Option<u64>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DriverTiming {
    pub capture_interval_ms: u64,
    pub failure_backoff_max_ms: u64,
}

impl DriverTiming {
    /// Timing for on-device inference, which runs faster than the server path.
    pub fn local() -> Self {
        Self {
            capture_interval_ms: LOCAL_CAPTURE_INTERVAL_MS,
            failure_backoff_max_ms: 0,
        }
    }
}

impl From<&DetectionConfig> for DriverTiming {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            capture_interval_ms: config.capture_interval_ms,
            failure_backoff_max_ms: config.failure_backoff_max_ms,
        }
    }
}

/// Sequences connectivity checks, detection cycles and alert publishing for
/// one device. All methods take the caller's monotonic clock so the schedule
/// can be driven without real time passing.
pub struct DetectionDriver {
    timing: DriverTiming,
    flags: Arc<DetectionFlags>,
    state: DriverState,
    last_cycle_ms: Option<u64>,
    failure_streak: u32,
    cycles_run: u64,
    cycles_failed: u64,
    alerts_published: u64,
    last_error: Option<String>,
}

impl DetectionDriver {
    pub fn new(timing: DriverTiming, flags: Arc<DetectionFlags>) -> Self {
        Self {
            timing,
            flags,
            state: DriverState::Disconnected,
            last_cycle_ms: None,
            failure_streak: 0,
            cycles_run: 0,
            cycles_failed: 0,
            alerts_published: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn flags(&self) -> &Arc<DetectionFlags> {
        &self.flags
    }

    pub fn tick(&mut self, now_ms: u64, link: LinkStatus) -> DriverAction {
        if !link.wifi_up {
            self.lose_link(DriverState::ConnectingWifi);
            return DriverAction::ConnectWifi;
        }
        if !link.broker_up {
            self.lose_link(DriverState::ConnectingBroker);
            return DriverAction::ConnectBroker;
        }
        if self.state != DriverState::Idle {
            info!("links up; detection driver idle");
            self.state = DriverState::Idle;
        }

        if !self.flags.is_enabled() {
            return DriverAction::Wait;
        }
        if self.flags.take_capture_request() {
            info!("capture requested out of schedule");
            return DriverAction::RunCycle;
        }
        if self.is_due(now_ms) {
            DriverAction::RunCycle
        } else {
            DriverAction::Wait
        }
    }

    pub fn run_cycle<S, T, P>(
        &mut self,
        pipeline: &mut DetectionPipeline<S, T>,
        publisher: &mut P,
        now_ms: u64,
    ) -> CycleReport
    where
        S: FrameSource,
        T: InferenceTransport,
        P: AlertPublisher + ?Sized,
    {
        self.cycles_run = self.cycles_run.saturating_add(1);

        self.state = DriverState::Capturing;
        let request = match pipeline.prepare_request(now_ms) {
            Ok(request) => request,
            Err(err) => return self.fail_cycle(now_ms, err),
        };

        self.state = DriverState::AwaitingResponse;
        let response = match pipeline.submit(&request) {
            Ok(response) => response,
            Err(err) => return self.fail_cycle(now_ms, err),
        };

        if response.discarded > 0 {
            warn!(
                "ignored {} malformed detection(s) in inference reply",
                response.discarded
            );
        }

        self.state = DriverState::Publishing;
        let settings = pipeline.settings();
        let alerts = derive_alerts(&response, settings.threshold, &settings.device_id, now_ms);

        let mut published = 0;
        let mut publish_failures = 0;
        for alert in &alerts {
            match publisher.publish_alert(alert) {
                Ok(()) => published += 1,
                Err(err) => {
                    publish_failures += 1;
                    warn!(
                        "failed to publish {} alert: {err}",
                        alert.detection.class_name
                    );
                }
            }
        }

        info!(
            "cycle done: {} detection(s) from model {}, {published} alert(s) published",
            response.detections.len(),
            response.model_version.as_deref().unwrap_or("unknown")
        );

        self.finish_cycle(now_ms, response.detections.len(), published, publish_failures)
    }

    /// Same schedule as [`Self::run_cycle`] for a camera that runs the model
    /// itself. At most one summary is published per cycle.
    pub fn run_local_cycle<S, D, P>(
        &mut self,
        pipeline: &mut LocalPipeline<S, D>,
        publisher: &mut P,
        now_ms: u64,
    ) -> CycleReport
    where
        S: FrameSource,
        D: ObjectDetector,
        P: AlertPublisher + ?Sized,
    {
        self.cycles_run = self.cycles_run.saturating_add(1);

        self.state = DriverState::Capturing;
        let objects = match pipeline.detect() {
            Ok(objects) => objects,
            Err(err) => return self.fail_cycle(now_ms, err),
        };

        self.state = DriverState::Publishing;
        let mut published = 0;
        let mut publish_failures = 0;
        if let Some(summary) = summarize(&objects, pipeline.settings(), now_ms) {
            match publisher.publish_summary(&summary) {
                Ok(()) => published = 1,
                Err(err) => {
                    publish_failures = 1;
                    warn!(
                        "failed to publish {} summary: {err}",
                        summary.detection.primary_object
                    );
                }
            }
        }

        info!("local cycle done: {} object(s)", objects.len());
        self.finish_cycle(now_ms, objects.len(), published, publish_failures)
    }

    /// Interval currently in force, stretched after consecutive failures when
    /// a backoff cap above the base interval is configured.
    pub fn effective_interval_ms(&self) -> u64 {
        let base = self.timing.capture_interval_ms;
        let cap = self.timing.failure_backoff_max_ms;
        if cap <= base || self.failure_streak == 0 {
            return base;
        }
        let shift = self.failure_streak.min(16);
        base.saturating_mul(1_u64 << shift).min(cap)
    }

    pub fn status(&self, now_ms: u64) -> DriverStatus {
        let next_cycle_in_ms = self.flags.is_enabled().then(|| {
            let due_at = self
                .last_cycle_ms
                .map(|last| last.saturating_add(self.effective_interval_ms()))
                .unwrap_or(self.timing.capture_interval_ms);
            due_at.saturating_sub(now_ms)
        });

        DriverStatus {
            state: self.state.as_str(),
            detection_enabled: self.flags.is_enabled(),
            cycles_run: self.cycles_run,
            cycles_failed: self.cycles_failed,
            alerts_published: self.alerts_published,
            last_cycle_ms: self.last_cycle_ms,
            next_cycle_in_ms,
            last_error: self.last_error.clone(),
        }
    }

    fn is_due(&self, now_ms: u64) -> bool {
        match self.last_cycle_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.effective_interval_ms(),
            None => now_ms >= self.timing.capture_interval_ms,
        }
    }

    fn lose_link(&mut self, next: DriverState) {
        if matches!(
            self.state,
            DriverState::Idle
                | DriverState::Capturing
                | DriverState::AwaitingResponse
                | DriverState::Publishing
        ) {
            warn!("connectivity lost while {}", self.state.as_str());
            self.state = DriverState::Disconnected;
        }
        if self.state != next {
            info!("{} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    fn finish_cycle(
        &mut self,
        now_ms: u64,
        detections: usize,
        alerts_published: usize,
        publish_failures: usize,
    ) -> CycleReport {
        self.last_cycle_ms = Some(now_ms);
        self.alerts_published = self
            .alerts_published
            .saturating_add(alerts_published as u64);
        self.failure_streak = 0;
        self.last_error = None;
        self.state = DriverState::Idle;

        CycleReport {
            started_ms: now_ms,
            detections,
            alerts_published,
            publish_failures,
            outcome: Ok(()),
        }
    }

    fn fail_cycle(&mut self, now_ms: u64, err: PipelineError) -> CycleReport {
        warn!("detection cycle aborted ({}): {err}", err.kind());
        self.cycles_failed = self.cycles_failed.saturating_add(1);
        // Without a frame the schedule stays put and the next poll retries.
        if err.counts_as_attempt() {
            self.last_cycle_ms = Some(now_ms);
            self.failure_streak = self.failure_streak.saturating_add(1);
        }
        self.last_error = Some(err.to_string());
        self.state = DriverState::Idle;

        CycleReport {
            started_ms: now_ms,
            detections: 0,
            alerts_published: 0,
            publish_failures: 0,
            outcome: Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::DetectorCommand,
        error::{PublishError, TransportError},
        local::{testing::ScriptedModel, DetectionSummary, LocalObject, LocalSettings},
        pipeline::testing::{settings, ScriptedCamera, ScriptedServer},
        types::AlertPayload,
    };

    #[derive(Default)]
    struct CollectingPublisher {
        sent: Vec<AlertPayload>,
        summaries: Vec<DetectionSummary>,
        reject: bool,
    }

    impl AlertPublisher for CollectingPublisher {
        fn publish_alert(&mut self, alert: &AlertPayload) -> Result<(), PublishError> {
            if self.reject {
                return Err(PublishError::Broker("not connected".into()));
            }
            self.sent.push(alert.clone());
            Ok(())
        }

        fn publish_summary(&mut self, summary: &DetectionSummary) -> Result<(), PublishError> {
            if self.reject {
                return Err(PublishError::Broker("not connected".into()));
            }
            self.summaries.push(summary.clone());
            Ok(())
        }
    }

    fn driver(flags: Arc<DetectionFlags>) -> DetectionDriver {
        DetectionDriver::new(
            DriverTiming {
                capture_interval_ms: 5_000,
                failure_backoff_max_ms: 0,
            },
            flags,
        )
    }

    fn pipeline(
        frames: Vec<Option<Vec<u8>>>,
        replies: Vec<Result<&str, TransportError>>,
    ) -> DetectionPipeline<ScriptedCamera, ScriptedServer> {
        DetectionPipeline::new(
            ScriptedCamera::with_frames(frames),
            ScriptedServer::replying(replies),
            settings(),
        )
    }

    #[test]
    fn walks_connection_states_before_idle() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        assert_eq!(driver.state(), DriverState::Disconnected);

        let action = driver.tick(0, LinkStatus { wifi_up: false, broker_up: false });
        assert_eq!(action, DriverAction::ConnectWifi);
        assert_eq!(driver.state(), DriverState::ConnectingWifi);

        let action = driver.tick(10, LinkStatus { wifi_up: true, broker_up: false });
        assert_eq!(action, DriverAction::ConnectBroker);
        assert_eq!(driver.state(), DriverState::ConnectingBroker);

        assert_eq!(driver.tick(20, LinkStatus::ONLINE), DriverAction::Wait);
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn runs_on_interval_only() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));

        assert_eq!(driver.tick(4_999, LinkStatus::ONLINE), DriverAction::Wait);
        assert_eq!(driver.tick(5_000, LinkStatus::ONLINE), DriverAction::RunCycle);

        let mut pipeline = pipeline(vec![Some(vec![1])], vec![Ok(r#"{"detections": []}"#)]);
        let mut publisher = CollectingPublisher::default();
        driver.run_cycle(&mut pipeline, &mut publisher, 5_000);

        assert_eq!(driver.tick(9_999, LinkStatus::ONLINE), DriverAction::Wait);
        assert_eq!(driver.tick(10_000, LinkStatus::ONLINE), DriverAction::RunCycle);
    }

    #[test]
    fn disabled_detection_never_runs_and_capture_now_forces_once() {
        let flags = Arc::new(DetectionFlags::default());
        let mut driver = driver(flags.clone());

        flags.apply(DetectorCommand::DisableDetection);
        assert_eq!(driver.tick(60_000, LinkStatus::ONLINE), DriverAction::Wait);

        flags.apply(DetectorCommand::EnableDetection);
        let mut pipeline = pipeline(vec![Some(vec![1])], vec![Ok(r#"{"detections": []}"#)]);
        let mut publisher = CollectingPublisher::default();
        driver.run_cycle(&mut pipeline, &mut publisher, 60_000);

        flags.apply(DetectorCommand::CaptureNow);
        assert_eq!(driver.tick(60_100, LinkStatus::ONLINE), DriverAction::RunCycle);
        assert_eq!(driver.tick(60_200, LinkStatus::ONLINE), DriverAction::Wait);
    }

    #[test]
    fn publishes_one_message_per_alert_worthy_detection() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        let mut pipeline = pipeline(
            vec![Some(vec![9; 32])],
            vec![Ok(
                r#"{"detections":[{"class":"fire","confidence":0.91},{"class":"cat","confidence":0.5}],"processing_time_ms":120}"#,
            )],
        );
        let mut publisher = CollectingPublisher::default();

        let report = driver.run_cycle(&mut pipeline, &mut publisher, 5_000);

        assert_eq!(report.outcome, Ok(()));
        assert_eq!(report.detections, 2);
        assert_eq!(report.alerts_published, 1);
        assert_eq!(publisher.sent.len(), 1);
        assert_eq!(publisher.sent[0].detection.class_name, "fire");
        assert_eq!(publisher.sent[0].timestamp, 5_000);
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn timeout_aborts_cleanly_without_alerts() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        let mut pipeline = pipeline(vec![Some(vec![1])], vec![Err(TransportError::Timeout)]);
        let mut publisher = CollectingPublisher::default();

        let report = driver.run_cycle(&mut pipeline, &mut publisher, 5_000);

        assert_eq!(
            report.outcome,
            Err(PipelineError::Transport(TransportError::Timeout))
        );
        assert_eq!(report.alerts_published, 0);
        assert!(publisher.sent.is_empty());
        assert_eq!(driver.state(), DriverState::Idle);

        let status = driver.status(5_000);
        assert_eq!(status.cycles_failed, 1);
        assert_eq!(status.last_error.as_deref(), Some("inference request timed out"));
        // A frame went out, so the failed cycle still holds its slot.
        assert_eq!(driver.tick(9_000, LinkStatus::ONLINE), DriverAction::Wait);
        assert_eq!(driver.tick(10_000, LinkStatus::ONLINE), DriverAction::RunCycle);
    }

    #[test]
    fn failed_capture_retries_on_next_poll() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        let mut publisher = CollectingPublisher::default();

        let mut ok = pipeline(vec![Some(vec![1])], vec![Ok(r#"{"detections": []}"#)]);
        driver.run_cycle(&mut ok, &mut publisher, 5_000);

        let mut no_frame = pipeline(vec![None], vec![]);
        let report = driver.run_cycle(&mut no_frame, &mut publisher, 10_000);

        assert_eq!(report.outcome.unwrap_err().kind(), "capture");
        assert_eq!(driver.status(10_000).last_cycle_ms, Some(5_000));
        assert_eq!(driver.effective_interval_ms(), 5_000);
        assert_eq!(driver.tick(11_000, LinkStatus::ONLINE), DriverAction::RunCycle);
    }

    #[test]
    fn oversized_frame_does_not_consume_the_slot() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        let mut pipeline = pipeline(vec![Some(vec![0_u8; 150_000])], vec![]);
        let mut publisher = CollectingPublisher::default();

        let report = driver.run_cycle(&mut pipeline, &mut publisher, 5_000);

        assert_eq!(report.outcome.unwrap_err().kind(), "frame_too_large");
        assert_eq!(driver.status(5_000).last_cycle_ms, None);
        assert_eq!(driver.status(5_000).cycles_failed, 1);
        assert_eq!(driver.tick(6_000, LinkStatus::ONLINE), DriverAction::RunCycle);
    }

    #[test]
    fn publish_failures_are_counted_not_fatal() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        let mut pipeline = pipeline(
            vec![Some(vec![1])],
            vec![Ok(r#"{"detections":[{"class":"fire","confidence":0.99}]}"#)],
        );
        let mut publisher = CollectingPublisher {
            reject: true,
            ..CollectingPublisher::default()
        };

        let report = driver.run_cycle(&mut pipeline, &mut publisher, 5_000);

        assert_eq!(report.outcome, Ok(()));
        assert_eq!(report.publish_failures, 1);
        assert_eq!(report.alerts_published, 0);
    }

    #[test]
    fn failure_backoff_stretches_interval_until_success() {
        let mut driver = DetectionDriver::new(
            DriverTiming {
                capture_interval_ms: 5_000,
                failure_backoff_max_ms: 30_000,
            },
            Arc::new(DetectionFlags::default()),
        );
        let mut pipeline = pipeline(
            vec![Some(vec![1]), Some(vec![2]), Some(vec![3]), Some(vec![4])],
            vec![
                Err(TransportError::Timeout),
                Err(TransportError::Status(503)),
                Ok("not json"),
                Ok(r#"{"detections": []}"#),
            ],
        );
        let mut publisher = CollectingPublisher::default();

        driver.run_cycle(&mut pipeline, &mut publisher, 0);
        assert_eq!(driver.effective_interval_ms(), 10_000);
        driver.run_cycle(&mut pipeline, &mut publisher, 10_000);
        assert_eq!(driver.effective_interval_ms(), 20_000);
        driver.run_cycle(&mut pipeline, &mut publisher, 30_000);
        assert_eq!(driver.effective_interval_ms(), 30_000);

        driver.run_cycle(&mut pipeline, &mut publisher, 60_000);
        assert_eq!(driver.effective_interval_ms(), 5_000);
    }

    #[test]
    fn local_cycle_publishes_one_summary() {
        let mut driver =
            DetectionDriver::new(DriverTiming::local(), Arc::new(DetectionFlags::default()));
        let mut pipeline = LocalPipeline::new(
            ScriptedCamera::with_frames(vec![Some(vec![0x40; 96 * 96])]),
            ScriptedModel::returning(vec![Ok(vec![
                LocalObject::new("fire", 0.9),
                LocalObject::new("fire", 0.8),
            ])]),
            LocalSettings::default(),
        );
        let mut publisher = CollectingPublisher::default();

        assert_eq!(driver.tick(2_000, LinkStatus::ONLINE), DriverAction::RunCycle);
        let report = driver.run_local_cycle(&mut pipeline, &mut publisher, 2_000);

        assert_eq!(report.outcome, Ok(()));
        assert_eq!(report.detections, 2);
        assert_eq!(publisher.summaries.len(), 1);
        assert_eq!(publisher.summaries[0].detection.objects_detected, 2);
        assert!(publisher.sent.is_empty());
        assert_eq!(driver.tick(3_999, LinkStatus::ONLINE), DriverAction::Wait);
        assert_eq!(driver.tick(4_000, LinkStatus::ONLINE), DriverAction::RunCycle);
    }

    #[test]
    fn local_inference_failure_retries_on_next_poll() {
        let mut driver =
            DetectionDriver::new(DriverTiming::local(), Arc::new(DetectionFlags::default()));
        let mut pipeline = LocalPipeline::new(
            ScriptedCamera::with_frames(vec![Some(vec![1]), Some(vec![2])]),
            ScriptedModel::returning(vec![
                Err(PipelineError::Inference("tensor arena exhausted".into())),
                Ok(vec![LocalObject::new("person", 0.3)]),
            ]),
            LocalSettings::default(),
        );
        let mut publisher = CollectingPublisher::default();

        let failed = driver.run_local_cycle(&mut pipeline, &mut publisher, 2_000);
        assert_eq!(failed.outcome.unwrap_err().kind(), "inference");
        assert_eq!(driver.tick(2_100, LinkStatus::ONLINE), DriverAction::RunCycle);

        let quiet = driver.run_local_cycle(&mut pipeline, &mut publisher, 2_100);
        assert_eq!(quiet.outcome, Ok(()));
        assert_eq!(quiet.alerts_published, 0);
        assert!(publisher.summaries.is_empty());
        assert_eq!(driver.tick(2_200, LinkStatus::ONLINE), DriverAction::Wait);
    }

    #[test]
    fn link_loss_while_idle_passes_through_disconnected() {
        let mut driver = driver(Arc::new(DetectionFlags::default()));
        driver.tick(0, LinkStatus::ONLINE);
        assert_eq!(driver.state(), DriverState::Idle);

        let action = driver.tick(100, LinkStatus { wifi_up: true, broker_up: false });

        assert_eq!(action, DriverAction::ConnectBroker);
        assert_eq!(driver.state(), DriverState::ConnectingBroker);
    }
}
