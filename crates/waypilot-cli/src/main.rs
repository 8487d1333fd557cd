use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use waypilot_fc::sim::{SimConfig, SimDriver};
use waypilot_fc::{doctor as fc_doctor, planner};
use waypilot_fc::{ControllerConfig, EnvelopeTable, FlightController, FlightError, VehicleDriver};
use waypilot_fc::{LimitsConfig, MonitorConfig, SettleConfig};
use waypilot_proto::{DroneState, FlightMode, MissionPlan};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "waypilot", version, about = "waypilot - waypoint mission controller for small drones")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Print the flight envelope table in effect.
    Envelopes,
    /// Check a mission file against an envelope without flying it.
    Validate {
        #[arg(long)]
        mission: String,
        /// Defaults to vehicle.initial_mode.
        #[arg(long)]
        mode: Option<FlightMode>,
    },
    /// Connect, take off, fly the mission, land and disconnect.
    Fly {
        #[arg(long)]
        mission: String,
        #[arg(long)]
        mode: Option<FlightMode>,
    },
    /// Print one telemetry snapshot as JSON.
    State,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    vehicle: VehicleCfg,
    settle: SettleConfig,
    monitor: MonitorConfig,
    limits: LimitsConfig,
    envelopes: EnvelopeTable,
    sim: SimConfig,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct VehicleCfg {
    name: String,
    driver: String,
    initial_mode: FlightMode,
}

impl Default for VehicleCfg {
    fn default() -> Self {
        Self { name: "waypilot".into(), driver: "sim".into(), initial_mode: FlightMode::Normal }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

fn load_mission(path: &str) -> Result<MissionPlan> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read mission {path}"))?;
    toml::from_str(&s).context("parse mission toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Envelopes => envelopes(&cfg),
        Command::Validate { mission, mode } => validate(&cfg, &mission, mode)?,
        Command::Fly { mission, mode } => fly(&cfg, &mission, mode).await?,
        Command::State => state(&cfg).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(!cfg.vehicle.name.is_empty(), "vehicle.name missing");
    anyhow::ensure!(cfg.vehicle.driver == "sim", "vehicle.driver {:?} unsupported (only \"sim\")", cfg.vehicle.driver);

    fc_doctor::check_envelopes(&cfg.envelopes)?;
    fc_doctor::check_limits(&cfg.limits)?;
    fc_doctor::check_monitor(&cfg.monitor)?;
    fc_doctor::check_settle(&cfg.settle)?;

    let env = cfg.envelopes.get(cfg.vehicle.initial_mode);
    if i64::from(cfg.limits.min_takeoff_height_cm) > i64::from(env.max_altitude) {
        warn!(
            "limits.min_takeoff_height_cm {} above the {} envelope max_altitude {}",
            cfg.limits.min_takeoff_height_cm, cfg.vehicle.initial_mode, env.max_altitude
        );
    }
    if i64::from(cfg.sim.battery_pct) < i64::from(env.min_battery) {
        warn!("sim.battery_pct {} below {} min_battery; takeoff will be refused", cfg.sim.battery_pct, cfg.vehicle.initial_mode);
    }

    info!("doctor: OK");
    Ok(())
}

fn envelopes(cfg: &Config) {
    println!("{:<8} {:>9} {:>12} {:>12} {:>11} {:>14}", "mode", "max_speed", "max_altitude", "max_distance", "min_battery", "rotation_speed");
    for (mode, env) in cfg.envelopes.iter() {
        println!(
            "{:<8} {:>9} {:>12} {:>12} {:>11} {:>14}",
            mode, env.max_speed, env.max_altitude, env.max_distance, env.min_battery, env.rotation_speed
        );
    }
}

fn validate(cfg: &Config, mission: &str, mode: Option<FlightMode>) -> Result<()> {
    let plan = load_mission(mission)?;
    let mode = mode.unwrap_or(cfg.vehicle.initial_mode);
    let env = cfg.envelopes.get(mode);

    match planner::plan(&plan, &env) {
        Ok(m) => {
            println!("OK: {} waypoints under {} envelope", m.len(), mode);
            for (i, leg) in m.legs().iter().enumerate() {
                println!("  {}: offset {} speed {} rotate {}", i + 1, leg.waypoint, leg.speed, leg.rotation);
            }
            Ok(())
        }
        Err(r) => match r.leg {
            Some(leg) => anyhow::bail!("mission rejected under {} envelope: {} at waypoint {}", mode, r, leg + 1),
            None => anyhow::bail!("mission rejected under {} envelope: {}", mode, r),
        },
    }
}

fn open_vehicle(cfg: &Config, mode: Option<FlightMode>) -> Result<FlightController<SimDriver>> {
    let driver = match cfg.vehicle.driver.as_str() {
        "sim" => SimDriver::new(cfg.sim.clone()),
        other => anyhow::bail!("unknown vehicle.driver: {}", other),
    };
    let ccfg = ControllerConfig {
        name: cfg.vehicle.name.clone(),
        initial_mode: mode.unwrap_or(cfg.vehicle.initial_mode),
        settle: cfg.settle.clone(),
        monitor: cfg.monitor.clone(),
        limits: cfg.limits.clone(),
        envelopes: cfg.envelopes,
    };
    Ok(FlightController::new(driver, ccfg))
}

async fn fly(cfg: &Config, mission: &str, mode: Option<FlightMode>) -> Result<()> {
    let plan = load_mission(mission)?;
    let fc = Arc::new(open_vehicle(cfg, mode)?);
    info!("fly: {} waypoints under {} envelope", plan.waypoints.len(), fc.flight_mode());

    // Controller calls block (settle delays), so the flight runs off the runtime.
    let interrupted = Arc::new(AtomicBool::new(false));
    let (worker, stop) = (fc.clone(), interrupted.clone());
    let mut flight = tokio::task::spawn_blocking(move || fly_blocking(&*worker, &plan, &stop));

    let res = tokio::select! {
        res = &mut flight => res,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("interrupt: aborting flight");
            interrupt(&*fc, &interrupted);
            flight.await
        }
    };

    for ev in fc.events() {
        println!("{}", serde_json::to_string(&ev)?);
    }
    res.context("flight task")??;
    info!("fly: done");
    Ok(())
}

/// The controller's cancel flag only covers the running mission, so the
/// interrupt is also latched for the steps before it.
fn interrupt<D: VehicleDriver + 'static>(fc: &FlightController<D>, interrupted: &AtomicBool) {
    interrupted.store(true, Ordering::SeqCst);
    fc.abort();
}

fn fly_blocking<D: VehicleDriver + 'static>(
    fc: &FlightController<D>,
    plan: &MissionPlan,
    interrupted: &AtomicBool,
) -> Result<(), FlightError> {
    let proceed = || {
        if interrupted.load(Ordering::SeqCst) {
            warn!("fly: interrupted before the mission started");
            return Err(FlightError::MissionAborted { completed: 0, total: plan.waypoints.len() });
        }
        Ok(())
    };

    fc.connect()?;
    let res = proceed()
        .and_then(|()| fc.takeoff())
        .and_then(|()| proceed())
        .and_then(|()| fc.execute_mission(plan))
        .and_then(|()| fc.land());
    // lands first if a failed mission left the vehicle in the air
    if let Err(e) = fc.disconnect() {
        warn!("disconnect failed: {}", e);
    }
    res
}

async fn state(cfg: &Config) -> Result<()> {
    let fc = open_vehicle(cfg, None)?;
    let st = tokio::task::spawn_blocking(move || -> Result<DroneState> {
        fc.connect()?;
        let st = fc.get_state();
        if let Err(e) = fc.disconnect() {
            warn!("disconnect failed: {}", e);
        }
        Ok(st?)
    })
    .await
    .context("state task")??;
    println!("{}", serde_json::to_string_pretty(&st)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};
    use waypilot_fc::planner::MissionRule;
    use waypilot_fc::sim::Op;
    use waypilot_proto::Waypoint;

    const SAMPLE: &str = include_str!("../../../config/waypilot.toml");

    #[test]
    fn sample_config_passes_doctor_checks() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.vehicle.name, "sim-01");
        assert_eq!(cfg.envelopes.get(FlightMode::Sport).max_speed, 140);
        assert_eq!(cfg.envelopes.get(FlightMode::Sport).max_altitude, 50);
        fc_doctor::check_envelopes(&cfg.envelopes).unwrap();
        fc_doctor::check_limits(&cfg.limits).unwrap();
        fc_doctor::check_monitor(&cfg.monitor).unwrap();
        fc_doctor::check_settle(&cfg.settle).unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.vehicle.driver, "sim");
        assert_eq!(cfg.settle.move_ms, 3000);
        assert_eq!(cfg.sim.battery_pct, 100);
    }

    #[test]
    fn unknown_driver_is_refused() {
        let cfg: Config = toml::from_str("[vehicle]\ndriver = \"tello\"").unwrap();
        assert!(open_vehicle(&cfg, None).is_err());
    }

    #[test]
    fn sample_missions_validate_as_expected() {
        let env = EnvelopeTable::default().get(FlightMode::Normal);
        let square: MissionPlan = toml::from_str(include_str!("../../../missions/square.toml")).unwrap();
        assert_eq!(planner::plan(&square, &env).unwrap().len(), 4);

        let high: MissionPlan = toml::from_str(include_str!("../../../missions/too-high.toml")).unwrap();
        assert_eq!(planner::plan(&high, &env).unwrap_err().rule, MissionRule::AltitudeExceeded);
    }

    fn quiet_controller(sim: &SimDriver, takeoff_ms: u64) -> FlightController<SimDriver> {
        let cfg = ControllerConfig {
            settle: SettleConfig { takeoff_ms, ..SettleConfig::immediate() },
            monitor: MonitorConfig { interval_ms: 3_600_000, ..MonitorConfig::default() },
            ..ControllerConfig::default()
        };
        FlightController::new(sim.clone(), cfg)
    }

    fn two_legs() -> MissionPlan {
        MissionPlan::new(vec![Waypoint::new(10, 0, 0), Waypoint::new(0, 10, 0)])
    }

    #[test]
    fn uninterrupted_flight_runs_to_disconnect() {
        let sim = SimDriver::default();
        let fc = quiet_controller(&sim, 0);
        fly_blocking(&fc, &two_legs(), &AtomicBool::new(false)).unwrap();
        assert_eq!(sim.count(Op::Move), 2);
        assert_eq!(sim.count(Op::Land), 1);
        assert!(!sim.is_connected());
    }

    #[test]
    fn interrupt_before_takeoff_never_leaves_the_ground() {
        let sim = SimDriver::default();
        let fc = quiet_controller(&sim, 0);
        let res = fly_blocking(&fc, &two_legs(), &AtomicBool::new(true));
        assert!(matches!(res, Err(FlightError::MissionAborted { completed: 0, total: 2 })));
        assert_eq!(sim.count(Op::Takeoff), 0);
        assert!(!sim.is_connected());
    }

    #[test]
    fn interrupt_during_takeoff_skips_the_mission() {
        let sim = SimDriver::default();
        let fc = Arc::new(quiet_controller(&sim, 300));
        let interrupted = Arc::new(AtomicBool::new(false));

        let (ctl, flag, watch) = (fc.clone(), interrupted.clone(), sim.clone());
        let ctrl_c = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while watch.count(Op::Takeoff) == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            interrupt(&*ctl, &flag);
        });

        let res = fly_blocking(&*fc, &two_legs(), &interrupted);
        ctrl_c.join().unwrap();
        assert!(matches!(res, Err(FlightError::MissionAborted { completed: 0, total: 2 })));
        assert_eq!(sim.count(Op::Takeoff), 1);
        assert_eq!(sim.count(Op::Move), 0);
        // landed by disconnect
        assert_eq!(sim.count(Op::Land), 1);
        assert!(!sim.is_connected());
    }
}
