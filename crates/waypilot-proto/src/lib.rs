pub mod mission;
pub mod telemetry;

pub use mission::{FlightMode, MissionPlan, Waypoint};
pub use telemetry::{DroneState, EventKind, FlightEvent, FlightPhase};
