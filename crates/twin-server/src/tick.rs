//! Tick Driver
//!
//! Synchronous main-thread loop: advance the physics one fixed timestep,
//! serialize the snapshot once into a pooled slot, fan the shared frame
//! out to every session, and pace to the target tick period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use twin_physics::PhysicsEngine;
use twin_protocol::encode_state;

use crate::broadcast::{BroadcastPool, SessionSet, SkipReason};

/// Statistics emission interval.
const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Run the tick loop until `stop` is set.
pub fn run_tick_loop(
    mut engine: PhysicsEngine,
    mut pool: BroadcastPool,
    sessions: Arc<SessionSet>,
    stop: Arc<AtomicBool>,
    tick_period: Duration,
) {
    let mut broadcast_count: u64 = 0;
    let mut skipped_count: u64 = 0;
    let mut last_stats = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        engine.step();
        let snapshot = engine.snapshot();

        // Serialize once; the shared handle keeps the slot's region alive
        // until every session write against it completes.
        match pool.write_next(|region| encode_state(&snapshot, region)) {
            Ok(frame) => {
                sessions.broadcast(&frame);
                broadcast_count += 1;
            }
            Err(SkipReason::SlotBusy) => {
                // Rotation was outpaced: the slot is pinned by a session
                // whose write stalled at its queue bound. Evicting it is
                // what frees the slot for the next pass.
                sessions.evict_backlogged();
                skipped_count += 1;
            }
            Err(SkipReason::Oversize) => skipped_count += 1,
        }

        let since_stats = last_stats.elapsed();
        if since_stats >= STATS_INTERVAL {
            let rate = broadcast_count as f64 / since_stats.as_secs_f64();
            info!(
                clients = sessions.len(),
                broadcast_rate_hz = rate,
                rpm = snapshot.rpm,
                skipped_ticks = skipped_count,
                "tick stats"
            );
            broadcast_count = 0;
            skipped_count = 0;
            last_stats = Instant::now();
        }

        let elapsed = tick_start.elapsed();
        if elapsed < tick_period {
            std::thread::sleep(tick_period - elapsed);
        }
    }
}
