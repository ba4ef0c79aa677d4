//! Telemetry State Payload

use serde::{Deserialize, Serialize};

/// Telemetry snapshot produced by one physics tick.
///
/// Copy-trivial and fixed-width so the engine can publish it through a
/// sequence-counter cell and the history ring can store it inline.
/// `timestamp_ms` counts milliseconds on a process-local monotonic clock
/// with an arbitrary epoch; it is not comparable across hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub rpm: f64,
    /// Crank angle in radians, normalized to [0, 2π)
    pub angle_rad: f64,
    pub stress_pa: f64,
    /// Centrifugal stress normalized to the 8000 rpm value, clamped to [0, 1]
    pub stress_factor: f64,
    pub piston_force_n: f64,
    pub rod_force_n: f64,
    pub tangential_force_n: f64,
    pub torque_nm: f64,
    pub side_thrust_n: f64,
    pub timestamp_ms: u64,
}
