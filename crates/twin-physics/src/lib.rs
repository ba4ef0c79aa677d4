//! Crank-Slider Physics Engine
//!
//! Deterministic fixed-timestep simulation of a reciprocating
//! crankshaft-piston mechanism: smoothed RPM response, centrifugal stress,
//! and closed-form inertial forces, published atomically every tick.

mod config;
mod engine;
mod snapshot;

pub use config::EngineConfig;
pub use engine::{EngineControls, PhysicsEngine};
pub use snapshot::SnapshotCell;
