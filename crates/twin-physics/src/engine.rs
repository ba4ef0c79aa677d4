//! Deterministic Crank-Slider Integrator

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ring_buffer::RingBuffer;
use twin_protocol::StatePayload;

use crate::config::EngineConfig;
use crate::snapshot::SnapshotCell;

/// Rod obliquity guard: below this cosine the rod force is treated as zero.
const COS_PHI_EPSILON: f64 = 1e-4;

/// Thread-safe control and observation surface of the engine.
///
/// Session tasks hold this behind an `Arc`; the tick thread owns the
/// engine itself. Cross-thread traffic is limited to the atomic RPM
/// target and the published snapshot.
pub struct EngineControls {
    rpm_target_bits: AtomicU64,
    pub(crate) latest: SnapshotCell,
    rpm_min: f64,
    rpm_max: f64,
}

impl EngineControls {
    fn new(config: &EngineConfig) -> Self {
        Self {
            rpm_target_bits: AtomicU64::new(config.rpm_default.to_bits()),
            latest: SnapshotCell::new(StatePayload::default()),
            rpm_min: config.rpm_min,
            rpm_max: config.rpm_max,
        }
    }

    /// Set the RPM target, clamped to the configured range. Never blocks.
    ///
    /// NaN targets are ignored; JSON cannot carry one, but the clamp must
    /// not let one through into the integrator.
    pub fn set_rpm_target(&self, target: f64) {
        if target.is_nan() {
            return;
        }
        let clamped = target.clamp(self.rpm_min, self.rpm_max);
        self.rpm_target_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Current RPM target.
    pub fn rpm_target(&self) -> f64 {
        f64::from_bits(self.rpm_target_bits.load(Ordering::Relaxed))
    }

    /// Most recently published tick snapshot.
    pub fn snapshot(&self) -> StatePayload {
        self.latest.load()
    }
}

/// Deterministic fixed-timestep crank-slider integrator.
///
/// Owns all simulation state and the history ring. `step` and `history`
/// belong to the tick thread; everything shared across threads goes
/// through [`EngineControls`].
pub struct PhysicsEngine {
    config: EngineConfig,
    lambda: f64,
    stress_max_pa: f64,
    epoch: Instant,
    rpm: f64,
    angle_rad: f64,
    history: RingBuffer<StatePayload>,
    controls: Arc<EngineControls>,
}

impl PhysicsEngine {
    /// Create an engine at rest with the target at its configured default.
    pub fn new(config: EngineConfig) -> Self {
        let controls = Arc::new(EngineControls::new(&config));
        Self {
            lambda: config.lambda(),
            stress_max_pa: config.stress_max_pa(),
            epoch: Instant::now(),
            rpm: 0.0,
            angle_rad: 0.0,
            history: RingBuffer::with_capacity(config.history_capacity),
            controls,
            config,
        }
    }

    /// Shared control surface for session tasks.
    pub fn controls(&self) -> Arc<EngineControls> {
        Arc::clone(&self.controls)
    }

    /// See [`EngineControls::set_rpm_target`].
    pub fn set_rpm_target(&self, target: f64) {
        self.controls.set_rpm_target(target);
    }

    /// See [`EngineControls::rpm_target`].
    pub fn rpm_target(&self) -> f64 {
        self.controls.rpm_target()
    }

    /// See [`EngineControls::snapshot`].
    pub fn snapshot(&self) -> StatePayload {
        self.controls.snapshot()
    }

    /// History of the last snapshots, oldest first. Tick thread only:
    /// traversal must not overlap a concurrent `step`.
    pub fn history(&self) -> &RingBuffer<StatePayload> {
        &self.history
    }

    /// Advance the simulation by one fixed timestep and publish the
    /// resulting snapshot.
    pub fn step(&mut self) {
        let cfg = &self.config;
        let target = self.controls.rpm_target();

        // Smooth RPM response: rpm += (target - rpm) * (1 - exp(-dt / tau))
        let alpha = 1.0 - (-cfg.dt_s / cfg.rpm_tau_s).exp();
        self.rpm += (target - self.rpm) * alpha;
        self.rpm = self.rpm.clamp(cfg.rpm_min, cfg.rpm_max);

        let omega = self.rpm * TAU / 60.0;

        self.angle_rad = (self.angle_rad + omega * cfg.dt_s) % TAU;
        if self.angle_rad < 0.0 {
            self.angle_rad += TAU;
        }

        // Centrifugal stress on the rotating assembly
        let stress_pa = cfg.mass_kg * cfg.radius_m * omega * omega / cfg.area_m2;
        let stress_factor = (stress_pa / self.stress_max_pa).clamp(0.0, 1.0);

        // Crank-slider dynamics (inertial forces only, no gas pressure).
        // Piston acceleration, 2nd-order approximation:
        //   a = -R*w^2*(cos theta + lambda*cos 2theta)
        let omega2 = omega * omega;
        let (sin_theta, cos_theta) = self.angle_rad.sin_cos();
        let piston_accel =
            -cfg.crank_throw_m * omega2 * (cos_theta + self.lambda * (2.0 * self.angle_rad).cos());
        let piston_force_n = cfg.piston_mass_kg * piston_accel;

        // Connecting rod angle from the bore axis: phi = asin(lambda*sin theta)
        let sin_phi = (self.lambda * sin_theta).clamp(-1.0, 1.0);
        let phi = sin_phi.asin();
        let cos_phi = phi.cos();

        // Rod force along the rod axis: F_rod = F_piston / cos phi
        let rod_force_n = if cos_phi > COS_PHI_EPSILON {
            piston_force_n / cos_phi
        } else {
            0.0
        };

        // Tangential force at the crank pin drives rotation: F_t = F_rod * sin(theta + phi)
        let tangential_force_n = rod_force_n * (self.angle_rad + phi).sin();

        // Instantaneous torque: T = F_t * R
        let torque_nm = tangential_force_n * cfg.crank_throw_m;

        // Side thrust on the cylinder wall: F_side = F_piston * tan phi
        let side_thrust_n = if cos_phi > COS_PHI_EPSILON {
            piston_force_n * sin_phi / cos_phi
        } else {
            0.0
        };

        let state = StatePayload {
            rpm: self.rpm,
            angle_rad: self.angle_rad,
            stress_pa,
            stress_factor,
            piston_force_n,
            rod_force_n,
            tangential_force_n,
            torque_nm,
            side_thrust_n,
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
        };

        self.history.push(state);
        self.controls.latest.publish(state);
    }
}
