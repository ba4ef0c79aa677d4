//! Atomic Snapshot Publication
//!
//! `StatePayload` is wider than any platform atomic, so publication uses a
//! sequence counter: the writer bumps the counter to an odd value, writes
//! the payload, then bumps it to the next even value with release ordering.
//! Readers retry whenever the counter is odd or changed across their read.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use twin_protocol::StatePayload;

/// Single-writer, many-reader cell holding the latest published snapshot.
pub struct SnapshotCell {
    seq: AtomicU64,
    value: UnsafeCell<StatePayload>,
}

// SAFETY: readers only keep a value observed between two identical even
// sequence reads; the single writer holds the sequence odd for the whole
// duration of its store.
unsafe impl Sync for SnapshotCell {}

impl SnapshotCell {
    /// Create a cell pre-loaded with `value` at sequence zero.
    pub fn new(value: StatePayload) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Publish a new snapshot. Single writer: the tick thread only.
    pub fn publish(&self, value: StatePayload) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: the sequence is odd, so concurrent readers discard
        // anything they observe until the closing store below.
        unsafe { *self.value.get() = value };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Load the latest published snapshot, retrying across torn writes.
    pub fn load(&self) -> StatePayload {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the read may race a writer and tear; the sequence
            // comparison below rejects any such value.
            let value = unsafe { std::ptr::read_volatile(self.value.get()) };
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after {
                return value;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_publish_then_load() {
        let cell = SnapshotCell::new(StatePayload::default());

        let state = StatePayload {
            rpm: 1200.0,
            timestamp_ms: 10,
            ..Default::default()
        };
        cell.publish(state);

        assert_eq!(cell.load(), state);
    }

    #[test]
    fn test_load_never_observes_torn_snapshot() {
        let cell = Arc::new(SnapshotCell::new(StatePayload::default()));

        // Writer publishes payloads whose rpm mirrors timestamp_ms; a torn
        // read would break that pairing.
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 0..100_000u64 {
                    cell.publish(StatePayload {
                        rpm: i as f64,
                        angle_rad: i as f64,
                        timestamp_ms: i,
                        ..Default::default()
                    });
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..50_000 {
                        let state = cell.load();
                        assert_eq!(state.rpm, state.timestamp_ms as f64);
                        assert_eq!(state.rpm, state.angle_rad);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
