use serde::Deserialize;
use waypilot_proto::FlightMode;

/// Operating limits for one flight mode. Speeds in cm/s, distances in cm,
/// battery in percent, rotation in deg/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightEnvelope {
    pub max_speed: u32,
    pub max_altitude: u32,
    pub max_distance: u32,
    pub min_battery: u32,
    pub rotation_speed: u32,
}

impl FlightEnvelope {
    pub const NORMAL: Self = Self::new(100, 30, 50, 20, 60);
    pub const SAFE: Self = Self::new(50, 15, 30, 30, 45);
    pub const SPORT: Self = Self::new(150, 50, 100, 25, 90);

    pub const fn new(max_speed: u32, max_altitude: u32, max_distance: u32, min_battery: u32, rotation_speed: u32) -> Self {
        Self { max_speed, max_altitude, max_distance, min_battery, rotation_speed }
    }

    fn patched(self, p: &EnvelopePatch) -> Self {
        Self {
            max_speed: p.max_speed.unwrap_or(self.max_speed),
            max_altitude: p.max_altitude.unwrap_or(self.max_altitude),
            max_distance: p.max_distance.unwrap_or(self.max_distance),
            min_battery: p.min_battery.unwrap_or(self.min_battery),
            rotation_speed: p.rotation_speed.unwrap_or(self.rotation_speed),
        }
    }
}

/// One envelope per mode. Built once (defaults plus config overrides) and
/// read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "EnvelopeOverrides")]
pub struct EnvelopeTable {
    normal: FlightEnvelope,
    safe: FlightEnvelope,
    sport: FlightEnvelope,
}

impl Default for EnvelopeTable {
    fn default() -> Self {
        Self { normal: FlightEnvelope::NORMAL, safe: FlightEnvelope::SAFE, sport: FlightEnvelope::SPORT }
    }
}

impl EnvelopeTable {
    pub fn new(normal: FlightEnvelope, safe: FlightEnvelope, sport: FlightEnvelope) -> Self {
        Self { normal, safe, sport }
    }

    pub fn get(&self, mode: FlightMode) -> FlightEnvelope {
        match mode {
            FlightMode::Normal => self.normal,
            FlightMode::Safe => self.safe,
            FlightMode::Sport => self.sport,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlightMode, FlightEnvelope)> + '_ {
        FlightMode::ALL.into_iter().map(|m| (m, self.get(m)))
    }
}

/// Config form: `[envelopes.<mode>]` sections, any field may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeOverrides {
    pub normal: Option<EnvelopePatch>,
    pub safe: Option<EnvelopePatch>,
    pub sport: Option<EnvelopePatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopePatch {
    pub max_speed: Option<u32>,
    pub max_altitude: Option<u32>,
    pub max_distance: Option<u32>,
    pub min_battery: Option<u32>,
    pub rotation_speed: Option<u32>,
}

impl From<EnvelopeOverrides> for EnvelopeTable {
    fn from(o: EnvelopeOverrides) -> Self {
        let base = EnvelopeTable::default();
        let pick = |env: FlightEnvelope, p: &Option<EnvelopePatch>| match p {
            Some(p) => env.patched(p),
            None => env,
        };
        Self {
            normal: pick(base.normal, &o.normal),
            safe: pick(base.safe, &o.safe),
            sport: pick(base.sport, &o.sport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_policy() {
        let t = EnvelopeTable::default();
        assert_eq!(t.get(FlightMode::Normal), FlightEnvelope::new(100, 30, 50, 20, 60));
        assert_eq!(t.get(FlightMode::Safe).min_battery, 30);
        assert_eq!(t.get(FlightMode::Sport).max_distance, 100);
    }

    #[test]
    fn overrides_patch_single_fields() {
        let src = r#"
            [safe]
            min_battery = 40

            [sport]
            max_speed = 200
            max_altitude = 80
        "#;
        let t: EnvelopeTable = toml::from_str(src).unwrap();
        assert_eq!(t.get(FlightMode::Normal), FlightEnvelope::NORMAL);
        assert_eq!(t.get(FlightMode::Safe), FlightEnvelope { min_battery: 40, ..FlightEnvelope::SAFE });
        let sport = t.get(FlightMode::Sport);
        assert_eq!((sport.max_speed, sport.max_altitude, sport.max_distance), (200, 80, 100));
    }

    #[test]
    fn iter_covers_every_mode() {
        let modes: Vec<_> = EnvelopeTable::default().iter().map(|(m, _)| m).collect();
        assert_eq!(modes, FlightMode::ALL.to_vec());
    }
}
