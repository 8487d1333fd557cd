use thiserror::Error;

use crate::planner::MissionRejection;

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("connection failure: {0:#}")]
    ConnectionFailure(anyhow::Error),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("not airborne")]
    NotAirborne,

    #[error("insufficient battery: {battery_pct}% < {min_battery}%")]
    InsufficientBattery { battery_pct: i32, min_battery: u32 },

    #[error("invalid mission: {0}")]
    InvalidMission(MissionRejection),

    #[error("takeoff verification failed: height {height_cm}cm < {min_height_cm}cm")]
    TakeoffVerificationFailed { height_cm: i32, min_height_cm: i32 },

    #[error("waypoint {} unreachable: height {achieved_cm}cm, expected {expected_cm}cm +/- {tolerance_cm}cm", .index + 1)]
    WaypointUnreachable { index: usize, achieved_cm: i32, expected_cm: i32, tolerance_cm: i32 },

    #[error("landing verification failed: height {}", .height_cm.map_or_else(|| "unknown".to_string(), |h| format!("{h}cm")))]
    LandingVerificationFailed { height_cm: Option<i32> },

    #[error("mission aborted after {completed} of {total} waypoints")]
    MissionAborted { completed: usize, total: usize },

    #[error("flight mode cannot change while a mission is executing")]
    MissionInProgress,

    /// A safety violation during the command forced a landing.
    #[error("safety landing during {during}")]
    SafetyLanding { during: &'static str },

    #[error("driver failure during {op}: {cause:#}")]
    DriverFailure { op: &'static str, cause: anyhow::Error },
}

impl FlightError {
    pub(crate) fn driver(op: &'static str) -> impl FnOnce(anyhow::Error) -> FlightError {
        move |cause| FlightError::DriverFailure { op, cause }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MissionRule;

    #[test]
    fn messages_name_the_cause() {
        let e = FlightError::InvalidMission(MissionRejection { rule: MissionRule::AltitudeExceeded, leg: Some(1) });
        assert_eq!(e.to_string(), "invalid mission: altitude exceeded");

        let e = FlightError::driver("takeoff")(anyhow::anyhow!("radio timeout"));
        assert_eq!(e.to_string(), "driver failure during takeoff: radio timeout");

        let e = FlightError::WaypointUnreachable { index: 0, achieved_cm: 10, expected_cm: 80, tolerance_cm: 50 };
        assert!(e.to_string().starts_with("waypoint 1 unreachable"));

        let e = FlightError::SafetyLanding { during: "takeoff" };
        assert_eq!(e.to_string(), "safety landing during takeoff");

        let e = FlightError::LandingVerificationFailed { height_cm: None };
        assert_eq!(e.to_string(), "landing verification failed: height unknown");
    }
}
