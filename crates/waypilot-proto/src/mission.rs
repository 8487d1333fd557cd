use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offset in centimeters relative to the pose at the start of the segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Waypoint {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Squared horizontal distance, exact for the whole i32 range.
    pub fn horizontal_sq(&self) -> u64 {
        let (x, y) = (u64::from(self.x.unsigned_abs()), u64::from(self.y.unsigned_abs()));
        x * x + y * y
    }
}

impl fmt::Display for Waypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlightMode {
    #[default]
    Normal,
    Safe,
    Sport,
}

impl FlightMode {
    pub const ALL: [FlightMode; 3] = [FlightMode::Normal, FlightMode::Safe, FlightMode::Sport];

    pub fn as_str(self) -> &'static str {
        match self {
            FlightMode::Normal => "normal",
            FlightMode::Safe => "safe",
            FlightMode::Sport => "sport",
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlightMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(FlightMode::Normal),
            "safe" => Ok(FlightMode::Safe),
            "sport" => Ok(FlightMode::Sport),
            other => Err(format!("unknown flight mode: {other} (expected normal|safe|sport)")),
        }
    }
}

/// Mission as submitted by an outer layer. Missing `speeds`/`rotations`
/// mean "unspecified" and are filled with envelope defaults before
/// validation; present lists must match the waypoint count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speeds: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotations: Option<Vec<i32>>,
    pub waypoints: Vec<Waypoint>,
}

impl MissionPlan {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints, speeds: None, rotations: None }
    }

    pub fn with_speeds(mut self, speeds: Vec<u32>) -> Self {
        self.speeds = Some(speeds);
        self
    }

    pub fn with_rotations(mut self, rotations: Vec<i32>) -> Self {
        self.rotations = Some(rotations);
        self
    }
}
