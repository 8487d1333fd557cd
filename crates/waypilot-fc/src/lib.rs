pub mod controller;
pub mod doctor;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod planner;
pub mod safety;
pub mod sim;

pub use controller::FlightController;
pub use driver::VehicleDriver;
pub use envelope::{EnvelopeTable, FlightEnvelope};
pub use error::FlightError;

use serde::Deserialize;
use std::time::Duration;
use waypilot_proto::FlightMode;

/// Pauses after each motion command so the vehicle finishes moving before
/// the next telemetry read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    pub takeoff_ms: u64,
    pub rotate_ms: u64,
    pub move_ms: u64,
    pub land_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self { takeoff_ms: 5000, rotate_ms: 2000, move_ms: 3000, land_ms: 5000 }
    }
}

impl SettleConfig {
    /// No pauses at all (simulation, tests).
    pub fn immediate() -> Self {
        Self { takeoff_ms: 0, rotate_ms: 0, move_ms: 0, land_ms: 0 }
    }

    pub fn takeoff(&self) -> Duration {
        Duration::from_millis(self.takeoff_ms)
    }

    pub fn rotation(&self) -> Duration {
        Duration::from_millis(self.rotate_ms)
    }

    pub fn movement(&self) -> Duration {
        Duration::from_millis(self.move_ms)
    }

    pub fn landing(&self) -> Duration {
        Duration::from_millis(self.land_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub max_temperature_c: i32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_ms: 1000, max_temperature_c: 60 }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Verification thresholds, all in centimeters (speed in cm/s).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Minimum height that counts as a successful takeoff.
    pub min_takeoff_height_cm: i32,
    /// Allowed gap between achieved and commanded height after a waypoint.
    pub waypoint_tolerance_cm: i32,
    /// Above this, landing starts with a controlled descent.
    pub high_altitude_cm: i32,
    pub safe_altitude_cm: i32,
    pub descent_speed_cm_s: u32,
    /// Height at or below which a landing counts as confirmed.
    pub ground_tolerance_cm: i32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_takeoff_height_cm: 11,
            waypoint_tolerance_cm: 50,
            high_altitude_cm: 120,
            safe_altitude_cm: 80,
            descent_speed_cm_s: 30,
            ground_tolerance_cm: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub name: String,
    pub initial_mode: FlightMode,
    pub settle: SettleConfig,
    pub monitor: MonitorConfig,
    pub limits: LimitsConfig,
    pub envelopes: EnvelopeTable,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "vehicle".into(),
            initial_mode: FlightMode::Normal,
            settle: SettleConfig::default(),
            monitor: MonitorConfig::default(),
            limits: LimitsConfig::default(),
            envelopes: EnvelopeTable::default(),
        }
    }
}
