use anyhow::Context;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Span};

use waypilot_proto::{DroneState, EventKind, FlightEvent, FlightMode, FlightPhase, MissionPlan};

use crate::driver::{lock, read_state, VehicleDriver};
use crate::envelope::FlightEnvelope;
use crate::error::FlightError;
use crate::planner::{self, Leg};
use crate::safety::{HealthLimits, LimitsSource, SafetyMonitor, Violation, ViolationHandler};
use crate::ControllerConfig;

const EVENT_HISTORY: usize = 64;

struct ModeState {
    mode: FlightMode,
    mission_active: bool,
}

struct Inner<D> {
    driver: Arc<Mutex<D>>,
    cfg: ControllerConfig,
    /// Held for the whole of every command sequence.
    ops: Mutex<()>,
    phase: Mutex<FlightPhase>,
    mode: Mutex<ModeState>,
    /// Set by the safety handler or by `abort()`, cleared at mission start.
    cancel: AtomicBool,
    /// A violation asked for a landing that nobody has flown yet.
    land_pending: AtomicBool,
    last_state: Mutex<Option<DroneState>>,
    events: Mutex<VecDeque<FlightEvent>>,
    span: Span,
}

/// Drives one vehicle through connect, takeoff, mission, land, disconnect
/// while a [`SafetyMonitor`] watches its health in the background.
///
/// All commands take `&self` and serialize internally, so the controller can
/// be shared behind an `Arc`.
pub struct FlightController<D: VehicleDriver + 'static> {
    inner: Arc<Inner<D>>,
    monitor: Mutex<SafetyMonitor>,
}

impl<D: VehicleDriver + 'static> FlightController<D> {
    pub fn new(driver: D, cfg: ControllerConfig) -> Self {
        let span = info_span!("flight", vehicle = %cfg.name);
        let monitor = SafetyMonitor::new(cfg.monitor.interval(), info_span!(parent: &span, "safety_monitor"));
        let mode = ModeState { mode: cfg.initial_mode, mission_active: false };
        let inner = Inner {
            driver: Arc::new(Mutex::new(driver)),
            cfg,
            ops: Mutex::new(()),
            phase: Mutex::new(FlightPhase::Disconnected),
            mode: Mutex::new(mode),
            cancel: AtomicBool::new(false),
            land_pending: AtomicBool::new(false),
            last_state: Mutex::new(None),
            events: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY)),
            span,
        };
        Self { inner: Arc::new(inner), monitor: Mutex::new(monitor) }
    }

    pub fn connect(&self) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let cockpit = self.inner.cockpit();
        if cockpit.phase().is_connected() {
            debug!("connect: already connected");
            return Err(FlightError::AlreadyConnected);
        }

        info!("connecting to vehicle");
        lock(&self.inner.driver).connect().map_err(FlightError::ConnectionFailure)?;

        let state = match self.inner.refresh() {
            Ok(st) => st,
            Err(e) => {
                self.inner.drop_link();
                return Err(FlightError::ConnectionFailure(anyhow::Error::new(e).context("initial telemetry")));
            }
        };
        cockpit.set_phase(FlightPhase::Connected);

        if let Err(e) = self.start_monitor() {
            self.inner.drop_link();
            cockpit.set_phase(FlightPhase::Disconnected);
            return Err(FlightError::ConnectionFailure(e));
        }

        info!("connected: battery {}%, temperature {}C", state.battery_pct, state.temperature_c);
        self.inner.record(EventKind::Status, format!("connected, battery {}%", state.battery_pct));
        Ok(())
    }

    fn start_monitor(&self) -> anyhow::Result<()> {
        let for_limits = Arc::clone(&self.inner);
        let for_violations = Arc::clone(&self.inner);
        let limits: LimitsSource = Arc::new(move || for_limits.limits());
        let handler: ViolationHandler = Arc::new(move |vs: &[Violation]| for_violations.on_violation(vs));
        lock(&self.monitor).start(Arc::clone(&self.inner.driver), limits, handler)?;
        Ok(())
    }

    pub fn takeoff(&self) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let cockpit = self.inner.cockpit();
        let phase = cockpit.phase();
        if !phase.is_connected() {
            return Err(FlightError::NotConnected);
        }
        if phase.is_airborne() {
            debug!("takeoff: already airborne");
            return Ok(());
        }

        let env = self.inner.envelope();
        let state = self.inner.refresh()?;
        let min_battery = cm(env.min_battery);
        if state.battery_pct < min_battery {
            warn!("takeoff refused: battery {}% below {}%", state.battery_pct, min_battery);
            self.inner.record(EventKind::Abort, format!("takeoff refused, battery {}%", state.battery_pct));
            return Err(FlightError::InsufficientBattery { battery_pct: state.battery_pct, min_battery: env.min_battery });
        }

        info!("taking off (battery {}%)", state.battery_pct);
        if let Err(e) = self.inner.call("takeoff", |d| d.takeoff()) {
            error!("takeoff failed: {}", e);
            cockpit.fallback_land("takeoff failed");
            return Err(e);
        }
        self.inner.settle(self.inner.cfg.settle.takeoff());

        let min_height_cm = self.inner.cfg.limits.min_takeoff_height_cm;
        let height_cm = match self.inner.refresh() {
            Ok(st) => st.height_cm,
            Err(e) => {
                error!("takeoff: post-takeoff telemetry failed: {}", e);
                cockpit.fallback_land("takeoff unverified");
                return Err(e);
            }
        };
        if height_cm < min_height_cm {
            error!("takeoff verification failed: height {}cm < {}cm", height_cm, min_height_cm);
            cockpit.fallback_land("takeoff verification failed");
            return Err(FlightError::TakeoffVerificationFailed { height_cm, min_height_cm });
        }

        cockpit.set_phase(FlightPhase::Airborne);
        info!("airborne at {}cm", height_cm);
        cockpit.land_if_pending("takeoff")
    }

    /// Validates the plan against the active envelope and flies it. The
    /// cancellation flag is honored between waypoints; a cancelled or
    /// driver-failed mission attempts a landing before reporting failure.
    pub fn execute_mission(&self, plan: &MissionPlan) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let cockpit = self.inner.cockpit();
        let phase = cockpit.phase();
        if !phase.is_connected() {
            return Err(FlightError::NotConnected);
        }
        if phase != FlightPhase::Airborne {
            return Err(FlightError::NotAirborne);
        }

        let (_active, mode, env) = MissionGuard::begin(&self.inner);
        let mission = planner::plan(plan, &env).map_err(|r| {
            match r.leg {
                Some(leg) => warn!("mission rejected under {} envelope: {} at waypoint {}", mode, r, leg + 1),
                None => warn!("mission rejected under {} envelope: {}", mode, r),
            }
            self.inner.record(EventKind::Abort, format!("mission rejected: {r}"));
            FlightError::InvalidMission(r)
        })?;

        self.inner.cancel.store(false, Ordering::SeqCst);
        let total = mission.len();
        info!("mission: {} waypoints under {} envelope", total, mode);

        for (i, leg) in mission.legs().iter().enumerate() {
            if self.inner.cancel.load(Ordering::SeqCst) {
                return Err(cockpit.abort_mission(i, total));
            }

            cockpit.set_phase(FlightPhase::Navigating);
            let res = cockpit.fly_leg(i, total, leg);
            cockpit.set_phase(FlightPhase::Airborne);

            match res {
                Ok(()) => {}
                Err(e @ FlightError::WaypointUnreachable { .. }) => {
                    warn!("{}; remaining waypoints dropped", e);
                    self.inner.record(EventKind::Abort, e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    error!("waypoint {}/{} failed: {}; aborting mission", i + 1, total, e);
                    self.inner.cancel.store(true, Ordering::SeqCst);
                    self.inner.record(EventKind::Abort, e.to_string());
                    cockpit.fallback_land("mission driver failure");
                    return Err(e);
                }
            }
        }

        // raised during the final waypoint
        if self.inner.cancel.load(Ordering::SeqCst) {
            return Err(cockpit.abort_mission(total, total));
        }
        info!("mission complete ({} waypoints)", total);
        self.inner.record(EventKind::Status, format!("mission complete, {total} waypoints"));
        Ok(())
    }

    /// Safe from any connected state, airborne or not.
    pub fn land(&self) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let cockpit = self.inner.cockpit();
        if !cockpit.phase().is_connected() {
            return Err(FlightError::NotConnected);
        }
        cockpit.land()
    }

    pub fn disconnect(&self) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let cockpit = self.inner.cockpit();
        if !cockpit.phase().is_connected() {
            debug!("disconnect: not connected");
            return Err(FlightError::NotConnected);
        }

        lock(&self.monitor).stop();

        if cockpit.phase().is_airborne() {
            if let Err(e) = cockpit.land() {
                error!("disconnect: landing failed: {}", e);
            }
        }

        let res = self.inner.call("disconnect", |d| d.disconnect());
        cockpit.set_phase(FlightPhase::Disconnected);
        info!("disconnected");
        self.inner.record(EventKind::Status, "disconnected".to_string());
        res
    }

    pub fn set_flight_mode(&self, mode: FlightMode) -> Result<(), FlightError> {
        let _span = self.inner.span.enter();
        let mut m = lock(&self.inner.mode);
        if m.mission_active {
            warn!("flight mode change to {} rejected: mission in progress", mode);
            return Err(FlightError::MissionInProgress);
        }
        if m.mode != mode {
            info!("flight mode {} -> {}", m.mode, mode);
            m.mode = mode;
        }
        Ok(())
    }

    /// Fresh telemetry; falls back to the last good sample if the read fails.
    pub fn get_state(&self) -> Result<DroneState, FlightError> {
        let _span = self.inner.span.enter();
        match self.inner.refresh() {
            Ok(st) => Ok(st),
            Err(e) => match *lock(&self.inner.last_state) {
                Some(st) => {
                    debug!("get_state: read failed ({}), returning last sample", e);
                    Ok(st)
                }
                None => Err(e),
            },
        }
    }

    /// Requests the running mission to stop at the next waypoint boundary.
    pub fn abort(&self) {
        info!("mission abort requested");
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> FlightPhase {
        self.inner.phase()
    }

    pub fn flight_mode(&self) -> FlightMode {
        lock(&self.inner.mode).mode
    }

    pub fn envelope(&self) -> FlightEnvelope {
        self.inner.envelope()
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor).is_running()
    }

    /// Most recent events, oldest first.
    pub fn events(&self) -> Vec<FlightEvent> {
        lock(&self.inner.events).iter().cloned().collect()
    }
}

impl<D: VehicleDriver + 'static> Inner<D> {
    fn cockpit(&self) -> Cockpit<'_, D> {
        Cockpit { inner: self, ops: Some(lock(&self.ops)) }
    }

    fn try_cockpit(&self) -> Option<Cockpit<'_, D>> {
        let ops = match self.ops.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(Cockpit { inner: self, ops: Some(ops) })
    }

    fn phase(&self) -> FlightPhase {
        *lock(&self.phase)
    }

    fn envelope(&self) -> FlightEnvelope {
        self.cfg.envelopes.get(lock(&self.mode).mode)
    }

    fn limits(&self) -> HealthLimits {
        let env = self.envelope();
        HealthLimits {
            min_battery: cm(env.min_battery),
            max_altitude: cm(env.max_altitude),
            max_temperature_c: self.cfg.monitor.max_temperature_c,
        }
    }

    fn call<T>(&self, op: &'static str, f: impl FnOnce(&mut D) -> anyhow::Result<T>) -> Result<T, FlightError> {
        let mut d = lock(&self.driver);
        f(&mut *d).map_err(FlightError::driver(op))
    }

    fn refresh(&self) -> Result<DroneState, FlightError> {
        let st = self.call("telemetry", |d| read_state(d))?;
        *lock(&self.last_state) = Some(st);
        Ok(st)
    }

    fn drop_link(&self) {
        if let Err(e) = lock(&self.driver).disconnect() {
            debug!("driver disconnect after failed connect: {:#}", e);
        }
    }

    fn settle(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }

    fn record(&self, kind: EventKind, msg: String) {
        let mut events = lock(&self.events);
        if events.len() == EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(FlightEvent::now(kind, msg));
    }

    /// Runs on the monitor thread. The landing itself is flown by a
    /// short-lived worker so sampling carries on while the vehicle descends.
    fn on_violation(self: &Arc<Self>, violations: &[Violation]) -> anyhow::Result<()> {
        self.cancel.store(true, Ordering::SeqCst);
        self.land_pending.store(true, Ordering::SeqCst);
        let summary = violations.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        self.record(EventKind::Violation, summary);

        let inner = Arc::clone(self);
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = Span::current();
        thread::Builder::new()
            .name("safety-landing".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _enter = span.enter();
                    inner.service_pending_landing();
                })
            })
            .context("spawn safety landing")?;
        Ok(())
    }

    /// Flies a requested safety landing if no command sequence is running.
    /// Otherwise the running sequence picks it up when its cockpit drops.
    fn service_pending_landing(&self) {
        if !self.land_pending.load(Ordering::SeqCst) {
            return;
        }
        let Some(cockpit) = self.try_cockpit() else {
            debug!("safety landing deferred until the running command finishes");
            return;
        };
        if !self.land_pending.swap(false, Ordering::SeqCst) || !cockpit.phase().is_airborne() {
            return;
        }
        warn!("safety violation: landing");
        match cockpit.land() {
            Ok(()) => self.record(EventKind::Recovery, "safety landing complete".to_string()),
            Err(e) => error!("safety landing failed: {}", e),
        }
    }
}

/// Exclusive right to command the vehicle. Dropping it services any safety
/// landing requested while it was held.
struct Cockpit<'a, D: VehicleDriver + 'static> {
    inner: &'a Inner<D>,
    ops: Option<MutexGuard<'a, ()>>,
}

impl<D: VehicleDriver + 'static> Cockpit<'_, D> {
    fn phase(&self) -> FlightPhase {
        self.inner.phase()
    }

    fn set_phase(&self, phase: FlightPhase) {
        *lock(&self.inner.phase) = phase;
    }

    fn land(&self) -> Result<(), FlightError> {
        let inner = self.inner;
        let lim = &inner.cfg.limits;
        inner.land_pending.store(false, Ordering::SeqCst);

        let height = match inner.refresh() {
            Ok(st) => Some(st.height_cm),
            Err(e) => {
                warn!("land: telemetry unavailable before landing: {}", e);
                None
            }
        };
        if let Some(h) = height.filter(|&h| h > lim.high_altitude_cm) {
            info!("land: descending from {}cm to {}cm first", h, lim.safe_altitude_cm);
            let dz = lim.safe_altitude_cm - h;
            match inner.call("descend", |d| d.move_by_offset_at_speed(0, 0, dz, lim.descent_speed_cm_s)) {
                Ok(()) => inner.settle(inner.cfg.settle.movement()),
                Err(e) => warn!("land: controlled descent failed: {}", e),
            }
        }

        info!("landing");
        match inner.call("land", |d| d.land()) {
            Ok(()) => inner.settle(inner.cfg.settle.landing()),
            Err(e) => error!("land command failed: {}", e),
        }

        let after = inner.refresh().map(|st| st.height_cm);
        if let Ok(h) = after {
            if h <= lim.ground_tolerance_cm {
                self.set_phase(FlightPhase::Landed);
                info!("landed (height {}cm)", h);
                return Ok(());
            }
        }

        let height_cm = after.ok();
        error!("landing not confirmed (height {:?}); emergency stop", height_cm);
        // last resort, nothing left to escalate to
        if let Err(e) = inner.call("emergency stop", |d| d.emergency_stop()) {
            error!("emergency stop failed: {}", e);
        }
        self.set_phase(FlightPhase::Landed);
        inner.record(EventKind::Recovery, format!("emergency stop, landing unconfirmed at {height_cm:?}cm"));
        Err(FlightError::LandingVerificationFailed { height_cm })
    }

    /// Flies a safety landing requested while this command ran and fails
    /// the command with it, instead of leaving it to the guard drop.
    fn land_if_pending(&self, during: &'static str) -> Result<(), FlightError> {
        if !self.inner.land_pending.load(Ordering::SeqCst) || !self.phase().is_airborne() {
            return Ok(());
        }
        warn!("safety violation during {}: landing", during);
        match self.land() {
            Ok(()) => self.inner.record(EventKind::Recovery, format!("safety landing during {during}")),
            Err(e) => error!("safety landing failed: {}", e),
        }
        Err(FlightError::SafetyLanding { during })
    }

    fn fallback_land(&self, why: &str) {
        warn!("{}: attempting landing", why);
        match self.land() {
            Ok(()) => self.inner.record(EventKind::Recovery, format!("{why}: landed")),
            Err(e) => error!("{}: fallback landing failed: {}", why, e),
        }
    }

    fn abort_mission(&self, completed: usize, total: usize) -> FlightError {
        warn!("mission aborted after {}/{} waypoints", completed, total);
        self.inner.record(EventKind::Abort, format!("mission aborted after {completed}/{total} waypoints"));
        self.fallback_land("mission aborted");
        FlightError::MissionAborted { completed, total }
    }

    fn fly_leg(&self, index: usize, total: usize, leg: &Leg) -> Result<(), FlightError> {
        let inner = self.inner;
        let before = inner.refresh()?;
        let wp = leg.waypoint;
        info!("waypoint {}/{}: offset {} at {}cm/s, rotate {}deg", index + 1, total, wp, leg.speed, leg.rotation);

        if leg.rotation != 0 {
            inner.call("rotate", |d| d.rotate_by(leg.rotation))?;
            inner.settle(inner.cfg.settle.rotation());
        }
        inner.call("move", |d| d.move_by_offset_at_speed(wp.x, wp.y, wp.z, leg.speed))?;
        inner.settle(inner.cfg.settle.movement());

        let after = inner.refresh()?;
        let expected_cm = before.height_cm.saturating_add(wp.z).max(0);
        let tolerance_cm = inner.cfg.limits.waypoint_tolerance_cm;
        if after.height_cm.abs_diff(expected_cm) > tolerance_cm.unsigned_abs() {
            return Err(FlightError::WaypointUnreachable {
                index,
                achieved_cm: after.height_cm,
                expected_cm,
                tolerance_cm,
            });
        }
        info!("waypoint {}/{} reached at {}cm", index + 1, total, after.height_cm);
        Ok(())
    }
}

impl<D: VehicleDriver + 'static> Drop for Cockpit<'_, D> {
    fn drop(&mut self) {
        drop(self.ops.take());
        self.inner.service_pending_landing();
    }
}

/// Marks a mission as running so the flight mode cannot change under it.
struct MissionGuard<'a> {
    mode: &'a Mutex<ModeState>,
}

impl<'a> MissionGuard<'a> {
    fn begin<D>(inner: &'a Inner<D>) -> (Self, FlightMode, FlightEnvelope) {
        let mut m = lock(&inner.mode);
        m.mission_active = true;
        let env = inner.cfg.envelopes.get(m.mode);
        (Self { mode: &inner.mode }, m.mode, env)
    }
}

impl Drop for MissionGuard<'_> {
    fn drop(&mut self) {
        lock(self.mode).mission_active = false;
    }
}

fn cm(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
