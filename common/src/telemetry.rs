use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReadings {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light: f32,
    pub moisture: Option<f32>,
}

/// Latest readings, written by the sampling task and read by the publisher.
/// Floats are stored as their bit patterns.
#[derive(Debug, Default)]
pub struct SharedReadings {
    temperature_bits: AtomicU32,
    humidity_bits: AtomicU32,
    light_bits: AtomicU32,
    moisture_bits: AtomicU32,
    has_moisture: AtomicBool,
    valid: AtomicBool,
}

impl SharedReadings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, readings: SensorReadings) {
        self.temperature_bits
            .store(readings.temperature_c.to_bits(), Ordering::Relaxed);
        self.humidity_bits
            .store(readings.humidity_pct.to_bits(), Ordering::Relaxed);
        self.light_bits.store(readings.light.to_bits(), Ordering::Relaxed);
        match readings.moisture {
            Some(moisture) => {
                self.moisture_bits.store(moisture.to_bits(), Ordering::Relaxed);
                self.has_moisture.store(true, Ordering::Relaxed);
            }
            None => self.has_moisture.store(false, Ordering::Relaxed),
        }
        self.valid.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Option<SensorReadings> {
        if !self.valid.load(Ordering::Acquire) {
            return None;
        }
        let moisture = self
            .has_moisture
            .load(Ordering::Relaxed)
            .then(|| f32::from_bits(self.moisture_bits.load(Ordering::Relaxed)));

        Some(SensorReadings {
            temperature_c: f32::from_bits(self.temperature_bits.load(Ordering::Relaxed)),
            humidity_pct: f32::from_bits(self.humidity_bits.load(Ordering::Relaxed)),
            light: f32::from_bits(self.light_bits.load(Ordering::Relaxed)),
            moisture,
        })
    }
}

/// Per-channel sampling state. A failed read on one channel keeps that
/// channel's last value instead of holding back the others.
#[derive(Debug, Clone, Default)]
pub struct LatestReadings {
    climate: Option<(f32, f32)>,
    light: Option<f32>,
    moisture: Option<f32>,
}

impl LatestReadings {
    pub fn record_climate(&mut self, temperature_c: f32, humidity_pct: f32) {
        self.climate = Some((temperature_c, humidity_pct));
    }

    pub fn record_light(&mut self, light: f32) {
        self.light = Some(light);
    }

    pub fn record_moisture(&mut self, moisture: f32) {
        self.moisture = Some(moisture);
    }

    /// `None` until every required channel has been read at least once.
    pub fn current(&self, report_moisture: bool) -> Option<SensorReadings> {
        let (temperature_c, humidity_pct) = self.climate?;
        let moisture = if report_moisture {
            Some(self.moisture?)
        } else {
            None
        };

        Some(SensorReadings {
            temperature_c,
            humidity_pct,
            light: self.light?,
            moisture,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload {
    pub temperature: f32,
    pub humidity: f32,
    pub light: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moisture: Option<f32>,
    pub timestamp: u64,
}

impl TelemetryPayload {
    pub fn from_snapshot(snapshot: Option<SensorReadings>, now_ms: u64) -> Option<Self> {
        let readings = snapshot?;
        Some(Self {
            temperature: readings.temperature_c,
            humidity: readings.humidity_pct,
            light: readings.light,
            moisture: readings.moisture,
            timestamp: now_ms,
        })
    }
}
