use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorCommand {
    EnableDetection,
    DisableDetection,
    CaptureNow,
}

impl DetectorCommand {
    /// Payloads are matched byte for byte; surrounding whitespace or a
    /// different case is not a command.
    pub fn parse(message: &str) -> Option<Self> {
        match message {
            "enable_detection" => Some(Self::EnableDetection),
            "disable_detection" => Some(Self::DisableDetection),
            "capture_now" => Some(Self::CaptureNow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnableDetection => "enable_detection",
            Self::DisableDetection => "disable_detection",
            Self::CaptureNow => "capture_now",
        }
    }
}

/// Flags written from the command listener and read by the detection loop.
#[derive(Debug)]
pub struct DetectionFlags {
    enabled: AtomicBool,
    capture_requested: AtomicBool,
}

impl DetectionFlags {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            capture_requested: AtomicBool::new(false),
        }
    }

    pub fn apply(&self, command: DetectorCommand) {
        match command {
            DetectorCommand::EnableDetection => self.enabled.store(true, Ordering::Relaxed),
            DetectorCommand::DisableDetection => self.enabled.store(false, Ordering::Relaxed),
            DetectorCommand::CaptureNow => self.capture_requested.store(true, Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_capture_requested(&self) -> bool {
        self.capture_requested.load(Ordering::Relaxed)
    }

    /// Clears the request so one `capture_now` forces exactly one cycle.
    pub fn take_capture_request(&self) -> bool {
        self.capture_requested.swap(false, Ordering::Relaxed)
    }
}

impl Default for DetectionFlags {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuator {
    Led,
    Pump,
    Fan,
}

impl Actuator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Led => "LED",
            Self::Pump => "PUMP",
            Self::Fan => "FAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub changes: Vec<(Actuator, bool)>,
    /// Set for RPC-style requests, which expect the new value echoed back.
    pub rpc_method: Option<String>,
}

#[derive(Debug, Error)]
pub enum ActuatorCommandError {
    #[error("invalid actuator command: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported rpc method `{0}`")]
    UnknownMethod(String),
}

#[derive(Debug, Deserialize)]
struct WireActuatorCommand {
    #[serde(default)]
    switch: Option<bool>,
    #[serde(default)]
    pump: Option<bool>,
    #[serde(default)]
    fan: Option<bool>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<bool>,
}

impl ActuatorCommand {
    pub fn parse(message: &str) -> Result<Self, ActuatorCommandError> {
        let wire: WireActuatorCommand = serde_json::from_str(message.trim())?;

        if let Some(method) = wire.method {
            if method != "setValue" {
                return Err(ActuatorCommandError::UnknownMethod(method));
            }
            return Ok(Self {
                changes: wire.params.map(|on| vec![(Actuator::Led, on)]).unwrap_or_default(),
                rpc_method: Some(method),
            });
        }

        let changes = [
            (Actuator::Led, wire.switch),
            (Actuator::Pump, wire.pump),
            (Actuator::Fan, wire.fan),
        ]
        .into_iter()
        .filter_map(|(actuator, value)| value.map(|on| (actuator, on)))
        .collect();

        Ok(Self {
            changes,
            rpc_method: None,
        })
    }
}

/// Last commanded level of each output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub led: bool,
    pub pump: bool,
    pub fan: bool,
}

impl ActuatorState {
    pub fn get(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Led => self.led,
            Actuator::Pump => self.pump,
            Actuator::Fan => self.fan,
        }
    }

    pub fn set(&mut self, actuator: Actuator, on: bool) {
        match actuator {
            Actuator::Led => self.led = on,
            Actuator::Pump => self.pump = on,
            Actuator::Fan => self.fan = on,
        }
    }

    /// Returns only the outputs whose level actually changed.
    pub fn apply(&mut self, command: &ActuatorCommand) -> Vec<(Actuator, bool)> {
        let mut changed = Vec::new();
        for &(actuator, on) in &command.changes {
            if self.get(actuator) != on {
                self.set(actuator, on);
                changed.push((actuator, on));
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcReply {
    pub method: String,
    pub params: bool,
}

impl ActuatorCommand {
    /// Echo for RPC-style requests, carrying the LED level after the command.
    pub fn rpc_reply(&self, state: &ActuatorState) -> Option<RpcReply> {
        self.rpc_method.as_ref().map(|method| RpcReply {
            method: method.clone(),
            params: state.led,
        })
    }
}
