//! In-process simulated vehicle.
//!
//! Integrates commanded motion into a pose, drains the battery per motion
//! command and records every driver call in order. Faults and telemetry
//! overrides can be injected through any clone of the handle while a
//! controller is flying it.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::driver::{lock, VehicleDriver};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub battery_pct: i32,
    pub temperature_c: i32,
    pub takeoff_height_cm: i32,
    /// Battery percent used per motion command.
    pub drain_per_command: i32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { battery_pct: 100, temperature_c: 35, takeoff_height_cm: 12, drain_per_command: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    Disconnect,
    Takeoff,
    Land,
    EmergencyStop,
    Rotate,
    Move,
    Battery,
    Height,
    Temperature,
    FlightTime,
    Velocity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Connect,
    Disconnect,
    Takeoff,
    Land,
    EmergencyStop,
    RotateBy(i32),
    MoveBy { dx: i32, dy: i32, dz: i32, speed: u32 },
    Battery,
    Height,
    Temperature,
    FlightTime,
    Velocity,
}

impl DriverCall {
    pub fn op(&self) -> Op {
        match self {
            DriverCall::Connect => Op::Connect,
            DriverCall::Disconnect => Op::Disconnect,
            DriverCall::Takeoff => Op::Takeoff,
            DriverCall::Land => Op::Land,
            DriverCall::EmergencyStop => Op::EmergencyStop,
            DriverCall::RotateBy(_) => Op::Rotate,
            DriverCall::MoveBy { .. } => Op::Move,
            DriverCall::Battery => Op::Battery,
            DriverCall::Height => Op::Height,
            DriverCall::Temperature => Op::Temperature,
            DriverCall::FlightTime => Op::FlightTime,
            DriverCall::Velocity => Op::Velocity,
        }
    }

    /// Commands that make the vehicle do something physical.
    pub fn is_motion(&self) -> bool {
        matches!(
            self.op(),
            Op::Takeoff | Op::Land | Op::EmergencyStop | Op::Rotate | Op::Move
        )
    }
}

#[derive(Debug)]
struct SimVehicle {
    cfg: SimConfig,
    connected: bool,
    airborne: bool,
    battery: i32,
    temperature: i32,
    height: i32,
    x: i32,
    y: i32,
    yaw: i32,
    airborne_since: Option<Instant>,
    flight_time_s: i32,
    moves: usize,

    calls: Vec<DriverCall>,
    failing: HashSet<Op>,
    fail_once: HashSet<Op>,
    height_error: i32,
    stuck_on_land: bool,
    battery_drop: Option<(usize, i32)>,
}

impl SimVehicle {
    fn new(cfg: SimConfig) -> Self {
        Self {
            connected: false,
            airborne: false,
            battery: cfg.battery_pct,
            temperature: cfg.temperature_c,
            height: 0,
            x: 0,
            y: 0,
            yaw: 0,
            airborne_since: None,
            flight_time_s: 0,
            moves: 0,
            calls: Vec::new(),
            failing: HashSet::new(),
            fail_once: HashSet::new(),
            height_error: 0,
            stuck_on_land: false,
            battery_drop: None,
            cfg,
        }
    }

    fn enter(&mut self, call: DriverCall) -> Result<()> {
        self.calls.push(call);
        let op = call.op();
        if self.failing.contains(&op) || self.fail_once.remove(&op) {
            bail!("simulated {:?} failure", op);
        }
        if op != Op::Connect && !self.connected {
            bail!("vehicle not connected");
        }
        if call.is_motion() {
            self.battery = (self.battery - self.cfg.drain_per_command).max(0);
        }
        Ok(())
    }

    fn touch_down(&mut self) {
        self.height = 0;
        self.airborne = false;
        if let Some(t) = self.airborne_since.take() {
            self.flight_time_s += t.elapsed().as_secs() as i32;
        }
    }

    fn flight_time(&self) -> i32 {
        self.flight_time_s + self.airborne_since.map_or(0, |t| t.elapsed().as_secs() as i32)
    }
}

/// Cloneable handle; clones share one vehicle.
#[derive(Debug, Clone)]
pub struct SimDriver {
    inner: Arc<Mutex<SimVehicle>>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDriver {
    pub fn new(cfg: SimConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(SimVehicle::new(cfg))) }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn motion_calls(&self) -> Vec<DriverCall> {
        lock(&self.inner).calls.iter().copied().filter(DriverCall::is_motion).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        lock(&self.inner).calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner).calls.clear();
    }

    /// Every call of `op` fails until [`SimDriver::heal`].
    pub fn fail(&self, op: Op) {
        lock(&self.inner).failing.insert(op);
    }

    pub fn fail_once(&self, op: Op) {
        lock(&self.inner).fail_once.insert(op);
    }

    pub fn heal(&self, op: Op) {
        let mut v = lock(&self.inner);
        v.failing.remove(&op);
        v.fail_once.remove(&op);
    }

    pub fn set_battery(&self, pct: i32) {
        lock(&self.inner).battery = pct;
    }

    pub fn set_temperature(&self, c: i32) {
        lock(&self.inner).temperature = c;
    }

    /// Places the vehicle at `cm`; anything above ground counts as airborne.
    pub fn set_height(&self, cm: i32) {
        let mut v = lock(&self.inner);
        v.height = cm.max(0);
        v.airborne = cm > 0;
        if v.airborne && v.airborne_since.is_none() {
            v.airborne_since = Some(Instant::now());
        }
    }

    pub fn set_takeoff_height(&self, cm: i32) {
        lock(&self.inner).cfg.takeoff_height_cm = cm;
    }

    /// Added to the achieved height after every move (drift, wind).
    pub fn set_height_error(&self, cm: i32) {
        lock(&self.inner).height_error = cm;
    }

    /// Landing is acknowledged but the vehicle stays where it is.
    pub fn set_stuck_on_land(&self, stuck: bool) {
        lock(&self.inner).stuck_on_land = stuck;
    }

    /// Battery reads `pct` once `moves` move commands have completed.
    pub fn drop_battery_after_moves(&self, moves: usize, pct: i32) {
        lock(&self.inner).battery_drop = Some((moves, pct));
    }

    pub fn position(&self) -> (i32, i32, i32) {
        let v = lock(&self.inner);
        (v.x, v.y, v.height)
    }

    pub fn heading(&self) -> i32 {
        lock(&self.inner).yaw
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    pub fn is_airborne(&self) -> bool {
        lock(&self.inner).airborne
    }
}

impl VehicleDriver for SimDriver {
    fn connect(&mut self) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Connect)?;
        v.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Disconnect)?;
        v.connected = false;
        Ok(())
    }

    fn takeoff(&mut self) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Takeoff)?;
        if !v.airborne {
            v.airborne = true;
            v.airborne_since = Some(Instant::now());
            v.height = v.cfg.takeoff_height_cm.max(0);
        }
        Ok(())
    }

    fn land(&mut self) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Land)?;
        if !v.stuck_on_land {
            v.touch_down();
        }
        Ok(())
    }

    fn emergency_stop(&mut self) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::EmergencyStop)?;
        v.touch_down();
        Ok(())
    }

    fn rotate_by(&mut self, degrees: i32) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::RotateBy(degrees))?;
        v.yaw = (v.yaw + degrees).rem_euclid(360);
        Ok(())
    }

    fn move_by_offset_at_speed(&mut self, dx: i32, dy: i32, dz: i32, speed: u32) -> Result<()> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::MoveBy { dx, dy, dz, speed })?;
        if !v.airborne {
            bail!("move rejected: vehicle on the ground");
        }
        v.x += dx;
        v.y += dy;
        v.height = (v.height + dz + v.height_error).max(0);
        v.moves += 1;
        if let Some((after, pct)) = v.battery_drop {
            if v.moves >= after {
                v.battery = pct;
                v.battery_drop = None;
            }
        }
        Ok(())
    }

    fn battery(&mut self) -> Result<i32> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Battery)?;
        Ok(v.battery)
    }

    fn height(&mut self) -> Result<i32> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Height)?;
        Ok(v.height)
    }

    fn temperature(&mut self) -> Result<i32> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Temperature)?;
        Ok(v.temperature)
    }

    fn flight_time(&mut self) -> Result<i32> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::FlightTime)?;
        Ok(v.flight_time())
    }

    fn velocity(&mut self) -> Result<(i32, i32, i32)> {
        let mut v = lock(&self.inner);
        v.enter(DriverCall::Velocity)?;
        // commands block until settled, so a read never sees motion
        Ok((0, 0, 0))
    }
}
