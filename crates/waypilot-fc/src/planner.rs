use std::fmt;

use waypilot_proto::{MissionPlan, Waypoint};

use crate::envelope::FlightEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionRule {
    LengthMismatch,
    DistanceExceeded,
    SpeedExceeded,
    AltitudeExceeded,
}

impl MissionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            MissionRule::LengthMismatch => "length mismatch",
            MissionRule::DistanceExceeded => "distance exceeded",
            MissionRule::SpeedExceeded => "speed exceeded",
            MissionRule::AltitudeExceeded => "altitude exceeded",
        }
    }
}

/// First rule a mission broke, with the offending leg where there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionRejection {
    pub rule: MissionRule,
    pub leg: Option<usize>,
}

impl MissionRejection {
    fn at(rule: MissionRule, leg: usize) -> Self {
        Self { rule, leg: Some(leg) }
    }
}

impl fmt::Display for MissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub waypoint: Waypoint,
    pub speed: u32,
    pub rotation: i32,
}

/// A mission that passed validation against a specific envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mission {
    legs: Vec<Leg>,
}

impl Mission {
    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}

/// Checks the triples against the envelope. Each rule is applied to the whole
/// mission before the next one, so the reported rule is the first in
/// length, distance, speed, altitude order.
pub fn validate(
    waypoints: &[Waypoint],
    speeds: &[u32],
    rotations: &[i32],
    env: &FlightEnvelope,
) -> Result<(), MissionRejection> {
    if waypoints.len() != speeds.len() || waypoints.len() != rotations.len() {
        return Err(MissionRejection { rule: MissionRule::LengthMismatch, leg: None });
    }

    let max_d = u64::from(env.max_distance);
    if let Some(i) = waypoints.iter().position(|wp| wp.horizontal_sq() > max_d * max_d) {
        return Err(MissionRejection::at(MissionRule::DistanceExceeded, i));
    }
    if let Some(i) = speeds.iter().position(|&s| s > env.max_speed) {
        return Err(MissionRejection::at(MissionRule::SpeedExceeded, i));
    }
    if let Some(i) = waypoints.iter().position(|wp| i64::from(wp.z) > i64::from(env.max_altitude)) {
        return Err(MissionRejection::at(MissionRule::AltitudeExceeded, i));
    }
    Ok(())
}

/// Fills unspecified speeds/rotations (`max_speed` / 0), validates and
/// returns the executable legs.
pub fn plan(plan: &MissionPlan, env: &FlightEnvelope) -> Result<Mission, MissionRejection> {
    let n = plan.waypoints.len();
    let speeds = plan.speeds.clone().unwrap_or_else(|| vec![env.max_speed; n]);
    let rotations = plan.rotations.clone().unwrap_or_else(|| vec![0; n]);

    validate(&plan.waypoints, &speeds, &rotations, env)?;

    let legs = plan
        .waypoints
        .iter()
        .zip(speeds)
        .zip(rotations)
        .map(|((&waypoint, speed), rotation)| Leg { waypoint, speed, rotation })
        .collect();
    Ok(Mission { legs })
}
