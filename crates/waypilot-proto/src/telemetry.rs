use serde::{Deserialize, Serialize};

/// Telemetry snapshot as read from the vehicle. Units: percent, degrees
/// Celsius, centimeters, seconds, cm/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroneState {
    pub ts_unix_ms: i64,
    pub battery_pct: i32,
    pub temperature_c: i32,
    pub height_cm: i32,
    pub flight_time_s: i32,
    pub vx: i32,
    pub vy: i32,
    pub vz: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightPhase {
    Disconnected,
    Connected,
    Airborne,
    Navigating,
    Landed,
}

impl FlightPhase {
    pub fn is_connected(self) -> bool {
        self != FlightPhase::Disconnected
    }

    pub fn is_airborne(self) -> bool {
        matches!(self, FlightPhase::Airborne | FlightPhase::Navigating)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Status,
    Violation,
    Abort,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightEvent {
    pub ts_unix_ms: i64,
    pub kind: EventKind,
    pub msg: String,
}

impl FlightEvent {
    pub fn now(kind: EventKind, msg: impl Into<String>) -> Self {
        Self { ts_unix_ms: now_unix_ms(), kind, msg: msg.into() }
    }
}

pub fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_predicates() {
        assert!(!FlightPhase::Disconnected.is_connected());
        assert!(FlightPhase::Landed.is_connected());
        assert!(FlightPhase::Navigating.is_airborne());
        assert!(!FlightPhase::Landed.is_airborne());
    }

    #[test]
    fn state_serializes_flat() {
        let st = DroneState { battery_pct: 87, height_cm: 42, ..Default::default() };
        let v = serde_json::to_value(st).unwrap();
        assert_eq!(v["battery_pct"], 87);
        assert_eq!(v["height_cm"], 42);
        assert_eq!(v["vz"], 0);
    }

    #[test]
    fn event_timestamp_is_recent() {
        let ev = FlightEvent::now(EventKind::Abort, "stop");
        // 2020-01-01 in unix ms
        assert!(ev.ts_unix_ms > 1_577_836_800_000);
        assert_eq!(ev.msg, "stop");
    }
}
