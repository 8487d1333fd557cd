use anyhow::Result;

use crate::{EnvelopeTable, LimitsConfig, MonitorConfig, SettleConfig};

pub fn check_envelopes(table: &EnvelopeTable) -> Result<()> {
    for (mode, env) in table.iter() {
        anyhow::ensure!(env.max_speed > 0, "envelopes.{mode}.max_speed must be positive");
        anyhow::ensure!(env.max_altitude > 0, "envelopes.{mode}.max_altitude must be positive");
        anyhow::ensure!(env.max_distance > 0, "envelopes.{mode}.max_distance must be positive");
        anyhow::ensure!(env.rotation_speed > 0, "envelopes.{mode}.rotation_speed must be positive");
        anyhow::ensure!(env.min_battery > 0 && env.min_battery < 100, "envelopes.{mode}.min_battery should be 1..99");
    }
    Ok(())
}

pub fn check_limits(limits: &LimitsConfig) -> Result<()> {
    anyhow::ensure!(limits.ground_tolerance_cm >= 0, "limits.ground_tolerance_cm negative");
    anyhow::ensure!(
        limits.min_takeoff_height_cm > limits.ground_tolerance_cm,
        "limits.min_takeoff_height_cm must exceed limits.ground_tolerance_cm"
    );
    anyhow::ensure!(limits.waypoint_tolerance_cm > 0, "limits.waypoint_tolerance_cm must be positive");
    anyhow::ensure!(
        limits.safe_altitude_cm > limits.ground_tolerance_cm && limits.safe_altitude_cm < limits.high_altitude_cm,
        "limits.safe_altitude_cm must lie between ground tolerance and high_altitude_cm"
    );
    anyhow::ensure!(limits.descent_speed_cm_s > 0, "limits.descent_speed_cm_s must be positive");
    Ok(())
}

pub fn check_monitor(monitor: &MonitorConfig) -> Result<()> {
    anyhow::ensure!((50..=10_000).contains(&monitor.interval_ms), "monitor.interval_ms should be 50..10000");
    anyhow::ensure!((30..=90).contains(&monitor.max_temperature_c), "monitor.max_temperature_c should be 30..90");
    Ok(())
}

pub fn check_settle(settle: &SettleConfig) -> Result<()> {
    let longest = [settle.takeoff_ms, settle.rotate_ms, settle.move_ms, settle.land_ms].into_iter().max().unwrap_or(0);
    anyhow::ensure!(longest <= 60_000, "settle delays above 60s look like a unit mistake");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeTable, FlightEnvelope};

    #[test]
    fn defaults_pass() {
        check_envelopes(&EnvelopeTable::default()).unwrap();
        check_limits(&LimitsConfig::default()).unwrap();
        check_monitor(&MonitorConfig::default()).unwrap();
        check_settle(&SettleConfig::default()).unwrap();
    }

    #[test]
    fn zero_envelope_field_is_named() {
        let bad = FlightEnvelope { max_distance: 0, ..FlightEnvelope::SAFE };
        let table = EnvelopeTable::new(FlightEnvelope::NORMAL, bad, FlightEnvelope::SPORT);
        let err = check_envelopes(&table).unwrap_err();
        assert!(err.to_string().contains("envelopes.safe.max_distance"));
    }

    #[test]
    fn takeoff_threshold_must_clear_ground_tolerance() {
        let limits = LimitsConfig::default();
        assert!(limits.min_takeoff_height_cm > limits.ground_tolerance_cm);

        let equal = LimitsConfig { min_takeoff_height_cm: limits.ground_tolerance_cm, ..limits };
        let err = check_limits(&equal).unwrap_err();
        assert!(err.to_string().contains("limits.min_takeoff_height_cm"));
    }

    #[test]
    fn safe_altitude_must_sit_below_high_altitude() {
        let limits = LimitsConfig { safe_altitude_cm: 150, ..LimitsConfig::default() };
        assert!(check_limits(&limits).is_err());
    }

    #[test]
    fn monitor_interval_bounds() {
        assert!(check_monitor(&MonitorConfig { interval_ms: 5, ..MonitorConfig::default() }).is_err());
    }
}
