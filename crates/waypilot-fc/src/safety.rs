//! Background health watchdog.
//!
//! Samples battery, height and temperature on its own thread and reports
//! envelope breaches through a callback. Reporting is edge-triggered: a
//! breach that persists across ticks is reported once, and again only after
//! it has cleared and re-occurred.
//!
//! The callback runs on the sampling thread, so a slow callback delays the
//! next tick. Handlers should hand long work to another thread.

use anyhow::{Context, Result};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn, Span};

use crate::driver::{lock, VehicleDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    LowBattery,
    MaxAltitudeExceeded,
    HighTemperature,
}

impl ViolationKind {
    const ALL: [ViolationKind; 3] =
        [ViolationKind::LowBattery, ViolationKind::MaxAltitudeExceeded, ViolationKind::HighTemperature];

    fn slot(self) -> usize {
        match self {
            ViolationKind::LowBattery => 0,
            ViolationKind::MaxAltitudeExceeded => 1,
            ViolationKind::HighTemperature => 2,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::LowBattery => "LOW_BATTERY",
            ViolationKind::MaxAltitudeExceeded => "MAX_ALTITUDE_EXCEEDED",
            ViolationKind::HighTemperature => "HIGH_TEMPERATURE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub value: i32,
    pub limit: i32,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (value={} limit={})", self.kind, self.value, self.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub battery_pct: i32,
    pub height_cm: i32,
    pub temperature_c: i32,
}

/// Bounds in effect for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthLimits {
    pub min_battery: i32,
    pub max_altitude: i32,
    pub max_temperature_c: i32,
}

/// Every bound the sample breaks, in [`ViolationKind`] order.
pub fn check_sample(s: &HealthSample, l: &HealthLimits) -> Vec<Violation> {
    let mut out = Vec::new();
    if s.battery_pct < l.min_battery {
        out.push(Violation { kind: ViolationKind::LowBattery, value: s.battery_pct, limit: l.min_battery });
    }
    if s.height_cm > l.max_altitude {
        out.push(Violation { kind: ViolationKind::MaxAltitudeExceeded, value: s.height_cm, limit: l.max_altitude });
    }
    if s.temperature_c > l.max_temperature_c {
        out.push(Violation { kind: ViolationKind::HighTemperature, value: s.temperature_c, limit: l.max_temperature_c });
    }
    out
}

/// Remembers which kinds were active on the previous tick.
#[derive(Debug, Default)]
pub struct EdgeTrigger {
    active: [bool; 3],
}

impl EdgeTrigger {
    /// Returns the violations that were not active on the previous tick.
    pub fn update(&mut self, current: &[Violation]) -> Vec<Violation> {
        let mut fresh = Vec::new();
        for kind in ViolationKind::ALL {
            let now = current.iter().find(|v| v.kind == kind);
            let was = std::mem::replace(&mut self.active[kind.slot()], now.is_some());
            if let (Some(v), false) = (now, was) {
                fresh.push(*v);
            }
        }
        fresh
    }
}

pub type ViolationHandler = Arc<dyn Fn(&[Violation]) -> Result<()> + Send + Sync>;
pub type LimitsSource = Arc<dyn Fn() -> HealthLimits + Send + Sync>;

struct Worker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SafetyMonitor {
    interval: Duration,
    span: Span,
    worker: Option<Worker>,
}

impl SafetyMonitor {
    pub fn new(interval: Duration, span: Span) -> Self {
        Self { interval, span, worker: None }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawns the sampling thread. Returns `Ok(false)` without spawning if
    /// one is already running. The thread logs through the caller's current
    /// tracing dispatcher.
    pub fn start<D: VehicleDriver + 'static>(
        &mut self,
        driver: Arc<Mutex<D>>,
        limits: LimitsSource,
        on_violation: ViolationHandler,
    ) -> Result<bool> {
        if self.worker.is_some() {
            warn!("safety monitor already running");
            return Ok(false);
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = self.span.clone();
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("safety-monitor".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _enter = span.enter();
                    run(&driver, &limits, &on_violation, interval, &stop_rx);
                })
            })
            .context("spawn safety monitor thread")?;

        info!("safety monitor started (interval {}ms)", interval.as_millis());
        self.worker = Some(Worker { stop_tx, handle });
        Ok(true)
    }

    /// Blocks until the sampling thread has exited. No-op when stopped.
    pub fn stop(&mut self) {
        let Some(w) = self.worker.take() else { return; };
        let _ = w.stop_tx.send(());
        if w.handle.join().is_err() {
            error!("safety monitor thread panicked");
        }
        info!("safety monitor stopped");
    }
}

impl Drop for SafetyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<D: VehicleDriver>(
    driver: &Mutex<D>,
    limits: &LimitsSource,
    on_violation: &ViolationHandler,
    interval: Duration,
    stop_rx: &mpsc::Receiver<()>,
) {
    let mut edge = EdgeTrigger::default();
    loop {
        tick(driver, limits, on_violation, &mut edge);

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("safety monitor loop exited");
}

fn tick<D: VehicleDriver>(
    driver: &Mutex<D>,
    limits: &LimitsSource,
    on_violation: &ViolationHandler,
    edge: &mut EdgeTrigger,
) {
    let sample = {
        let mut d = lock(driver);
        read_health(&mut *d)
    };
    // A failed read says nothing about the vehicle; keep the edge state.
    let sample = match sample {
        Ok(s) => s,
        Err(e) => {
            warn!("safety monitor: telemetry read failed: {:#}", e);
            return;
        }
    };

    let fresh = edge.update(&check_sample(&sample, &limits()));
    if fresh.is_empty() {
        return;
    }
    for v in &fresh {
        warn!("safety violation: {}", v);
    }

    match catch_unwind(AssertUnwindSafe(|| on_violation(&fresh))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("violation handler failed: {:#}", e),
        Err(_) => error!("violation handler panicked"),
    }
}

fn read_health<D: VehicleDriver + ?Sized>(d: &mut D) -> Result<HealthSample> {
    Ok(HealthSample {
        battery_pct: d.battery().context("read battery")?,
        height_cm: d.height().context("read height")?,
        temperature_c: d.temperature().context("read temperature")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const LIMITS: HealthLimits = HealthLimits { min_battery: 20, max_altitude: 30, max_temperature_c: 60 };

    fn sample(battery_pct: i32, height_cm: i32, temperature_c: i32) -> HealthSample {
        HealthSample { battery_pct, height_cm, temperature_c }
    }

    fn kinds(vs: &[Violation]) -> Vec<ViolationKind> {
        vs.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn bounds_are_strict() {
        assert!(check_sample(&sample(20, 30, 60), &LIMITS).is_empty());
        assert_eq!(
            kinds(&check_sample(&sample(19, 31, 61), &LIMITS)),
            vec![ViolationKind::LowBattery, ViolationKind::MaxAltitudeExceeded, ViolationKind::HighTemperature]
        );
    }

    #[test]
    fn edge_trigger_fires_on_transitions_only() {
        let mut edge = EdgeTrigger::default();
        let low = check_sample(&sample(10, 0, 30), &LIMITS);
        assert_eq!(kinds(&edge.update(&low)), vec![ViolationKind::LowBattery]);
        assert!(edge.update(&low).is_empty());
        assert!(edge.update(&low).is_empty());

        // a second kind appearing fires only for itself
        let low_hot = check_sample(&sample(10, 0, 70), &LIMITS);
        assert_eq!(kinds(&edge.update(&low_hot)), vec![ViolationKind::HighTemperature]);

        assert!(edge.update(&[]).is_empty());
        assert_eq!(edge.update(&low).len(), 1);
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn connected_sim() -> (SimDriver, Arc<Mutex<SimDriver>>) {
        let mut sim = SimDriver::default();
        sim.connect().unwrap();
        (sim.clone(), Arc::new(Mutex::new(sim)))
    }

    fn fixed_limits() -> LimitsSource {
        Arc::new(|| LIMITS)
    }

    #[test]
    fn persistent_low_battery_fires_once_per_transition() {
        let (sim, shared) = connected_sim();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let mut mon = SafetyMonitor::new(Duration::from_millis(5), Span::none());
        mon.start(shared, fixed_limits(), Arc::new(move |vs: &[Violation]| -> Result<()> {
            assert_eq!(vs[0].kind, ViolationKind::LowBattery);
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        sim.set_battery(10);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        let reads = sim.count(Op::Battery);
        assert!(wait_for(|| sim.count(Op::Battery) > reads + 5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sim.set_battery(80);
        let reads = sim.count(Op::Battery);
        assert!(wait_for(|| sim.count(Op::Battery) > reads + 2));
        sim.set_battery(5);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));
        mon.stop();
    }

    #[test]
    fn double_start_is_refused() {
        let (_sim, shared) = connected_sim();
        let mut mon = SafetyMonitor::new(Duration::from_millis(10), Span::none());
        let noop: ViolationHandler = Arc::new(|_: &[Violation]| -> Result<()> { Ok(()) });
        assert!(mon.start(shared.clone(), fixed_limits(), noop.clone()).unwrap());
        assert!(!mon.start(shared, fixed_limits(), noop).unwrap());
        assert!(mon.is_running());
        mon.stop();
        assert!(!mon.is_running());
        mon.stop();
    }

    #[test]
    fn stop_joins_the_sampler() {
        let (sim, shared) = connected_sim();
        let mut mon = SafetyMonitor::new(Duration::from_millis(5), Span::none());
        mon.start(shared, fixed_limits(), Arc::new(|_: &[Violation]| -> Result<()> { Ok(()) })).unwrap();
        assert!(wait_for(|| sim.count(Op::Battery) > 2));
        mon.stop();
        let reads = sim.count(Op::Battery);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(sim.count(Op::Battery), reads);
    }

    #[test]
    fn read_failures_are_not_violations() {
        let (sim, shared) = connected_sim();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        sim.fail(Op::Height);
        let mut mon = SafetyMonitor::new(Duration::from_millis(5), Span::none());
        mon.start(shared, fixed_limits(), Arc::new(move |_: &[Violation]| -> Result<()> {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        assert!(wait_for(|| sim.count(Op::Height) > 3));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // loop survived the outage and still reports
        sim.heal(Op::Height);
        sim.set_temperature(75);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        mon.stop();
    }

    #[test]
    fn failing_handler_does_not_stop_sampling() {
        let (sim, shared) = connected_sim();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut mon = SafetyMonitor::new(Duration::from_millis(5), Span::none());
        mon.start(shared, fixed_limits(), Arc::new(move |_: &[Violation]| -> Result<()> {
            if calls2.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler blew up");
            }
            anyhow::bail!("handler refused")
        }))
        .unwrap();

        sim.set_battery(1);
        assert!(wait_for(|| calls.load(Ordering::SeqCst) == 1));
        sim.set_battery(90);
        let reads = sim.count(Op::Battery);
        assert!(wait_for(|| sim.count(Op::Battery) > reads + 2));
        sim.set_battery(1);
        assert!(wait_for(|| calls.load(Ordering::SeqCst) == 2));
        sim.set_battery(90);
        let reads = sim.count(Op::Battery);
        assert!(wait_for(|| sim.count(Op::Battery) > reads + 2));
        assert!(mon.is_running());
        mon.stop();
    }
}
