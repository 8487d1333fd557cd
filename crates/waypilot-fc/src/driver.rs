use anyhow::Result;
use std::sync::{Mutex, MutexGuard, PoisonError};

use waypilot_proto::{telemetry::now_unix_ms, DroneState};

/// Primitive vehicle commands and telemetry. Every call blocks until the
/// vehicle acknowledges and every call may fail.
pub trait VehicleDriver: Send {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn takeoff(&mut self) -> Result<()>;
    fn land(&mut self) -> Result<()>;
    fn emergency_stop(&mut self) -> Result<()>;
    fn rotate_by(&mut self, degrees: i32) -> Result<()>;
    fn move_by_offset_at_speed(&mut self, dx: i32, dy: i32, dz: i32, speed: u32) -> Result<()>;

    fn battery(&mut self) -> Result<i32>;
    fn height(&mut self) -> Result<i32>;
    fn temperature(&mut self) -> Result<i32>;
    fn flight_time(&mut self) -> Result<i32>;
    fn velocity(&mut self) -> Result<(i32, i32, i32)>;
}

/// Full telemetry snapshot. Fails on the first failed read, nothing is
/// carried over from earlier samples.
pub fn read_state<D: VehicleDriver + ?Sized>(d: &mut D) -> Result<DroneState> {
    let battery_pct = d.battery()?;
    let height_cm = d.height()?;
    let temperature_c = d.temperature()?;
    let flight_time_s = d.flight_time()?;
    let (vx, vy, vz) = d.velocity()?;
    Ok(DroneState {
        ts_unix_ms: now_unix_ms(),
        battery_pct,
        temperature_c,
        height_cm,
        flight_time_s,
        vx,
        vy,
        vz,
    })
}

// A panic on another thread must not take the vehicle link down with it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
