//! Broadcast Slot Pool and Session Set
//!
//! Each tick is serialized exactly once into a pooled fixed-capacity byte
//! region whose handle is then shared with every live session. Slots
//! rotate round-robin; a slot's region is reused only when no session
//! still holds its handle, which `Bytes::try_into_mut` checks for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use axum::extract::ws::Utf8Bytes;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

/// Number of pooled slots. Strictly greater than the per-session queue
/// bound, so rotation outpaces write completion for any live session.
pub const POOL_SLOTS: usize = 4;

/// Fixed capacity of one slot's byte region.
pub const SLOT_CAPACITY: usize = 512;

/// Per-session outbound queue bound, in frames. A session over this bound
/// has fallen too far behind and is evicted.
pub const OUTBOUND_QUEUE_FRAMES: usize = POOL_SLOTS - 1;

/// Why a tick's broadcast was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The slot is still referenced by an in-flight session write
    SlotBusy,
    /// The encoded frame did not fit the slot's region
    Oversize,
}

/// Round-robin pool of reference-counted broadcast regions.
///
/// Owned by the tick thread; the handles it returns are what cross into
/// the session tasks.
pub struct BroadcastPool {
    slots: Vec<Bytes>,
    slot_capacity: usize,
    next: usize,
}

impl BroadcastPool {
    /// Pre-allocate `slots` regions of `slot_capacity` bytes each.
    pub fn new(slots: usize, slot_capacity: usize) -> Self {
        assert!(slots >= 2, "pool needs at least two slots to rotate");
        assert!(slot_capacity > 0);
        let slots = (0..slots)
            .map(|_| {
                let mut region = BytesMut::with_capacity(slot_capacity);
                region.resize(slot_capacity, 0);
                region.freeze()
            })
            .collect();
        Self {
            slots,
            slot_capacity,
            next: 0,
        }
    }

    /// Pool sized for the 100 Hz broadcast path.
    pub fn with_defaults() -> Self {
        Self::new(POOL_SLOTS, SLOT_CAPACITY)
    }

    /// Serialize one tick into the next slot and return a shareable frame.
    ///
    /// `fill` receives the slot's full region and returns the encoded
    /// length, 0 meaning the region was too small. On failure the caller
    /// skips that tick's broadcast; [`SkipReason`] says why.
    pub fn write_next<F>(&mut self, fill: F) -> Result<Utf8Bytes, SkipReason>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();

        let parked = std::mem::take(&mut self.slots[index]);
        let mut region = match parked.try_into_mut() {
            Ok(region) => region,
            Err(parked) => {
                // A session write still references this slot.
                self.slots[index] = parked;
                debug!(slot = index, "slot still referenced, skipping tick");
                return Err(SkipReason::SlotBusy);
            }
        };

        region.resize(self.slot_capacity, 0);
        let len = fill(&mut region[..]);
        if len == 0 || len > self.slot_capacity {
            self.slots[index] = region.freeze();
            return Err(SkipReason::Oversize);
        }
        region.truncate(len);

        let frame = region.freeze();
        self.slots[index] = frame.clone();
        // The encoder emits JSON text; a non-UTF-8 region means the fill
        // callback misbehaved, and the tick is skipped rather than sent.
        match Utf8Bytes::try_from(frame) {
            Ok(text) => Ok(text),
            Err(_) => Err(SkipReason::Oversize),
        }
    }
}

/// Outbound handle to one session task.
struct SessionHandle {
    frames: mpsc::Sender<Utf8Bytes>,
    /// Abort handle of the session's drive task. Aborting releases every
    /// slot reference the session holds, including a stalled in-flight
    /// write that dropping the sender alone would never interrupt.
    abort: Option<AbortHandle>,
}

/// Set of live sessions, guarded by a mutex.
///
/// The lock covers insert, remove, and enqueue only. Enqueueing is a
/// non-blocking `try_send` and aborting a task just wakes it, so no
/// network operation ever runs under the lock.
pub struct SessionSet {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionSet {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Lock the registry, reporting poisoning instead of panicking so the
    /// tick thread keeps running if a session task died mid-update.
    fn locked(&self) -> Option<MutexGuard<'_, HashMap<u64, SessionHandle>>> {
        match self.sessions.lock() {
            Ok(sessions) => Some(sessions),
            Err(e) => {
                error!("session set lock error: {}", e);
                None
            }
        }
    }

    /// Register a session's outbound queue; returns the session id.
    ///
    /// If the registry is unavailable the sender is dropped, which the
    /// session observes as its queue closing.
    pub fn register(&self, frames: mpsc::Sender<Utf8Bytes>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(mut sessions) = self.locked() {
            sessions.insert(id, SessionHandle { frames, abort: None });
        }
        id
    }

    /// Attach the drive task's abort handle once it has been spawned.
    pub fn attach_abort(&self, id: u64, abort: AbortHandle) {
        let Some(mut sessions) = self.locked() else {
            return;
        };
        if let Some(handle) = sessions.get_mut(&id) {
            handle.abort = Some(abort);
        }
    }

    /// Remove a session (task exit or server shutdown).
    pub fn deregister(&self, id: u64) {
        if let Some(mut sessions) = self.locked() {
            sessions.remove(&id);
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.locked().map_or(0, |sessions| sessions.len())
    }

    /// Enqueue one tick's shared frame on every live session.
    ///
    /// A session whose queue is full has violated the backpressure bound
    /// and is evicted on the spot. Returns the number of sessions the
    /// frame was enqueued for.
    pub fn broadcast(&self, frame: &Utf8Bytes) -> usize {
        let Some(mut sessions) = self.locked() else {
            return 0;
        };
        let mut delivered = 0;
        let mut evicted: Vec<u64> = Vec::new();

        for (id, handle) in sessions.iter() {
            match handle.frames.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session = id, "outbound queue full, evicting slow client");
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            if let Some(handle) = sessions.remove(&id) {
                if let Some(abort) = handle.abort {
                    abort.abort();
                }
            }
        }
        delivered
    }

    /// Evict sessions whose queue is exhausted while a pool slot is still
    /// referenced.
    ///
    /// Called by the tick driver when rotation is outpaced. The session
    /// pinning the slot is at its bound with a write stalled mid-frame,
    /// so only the abort path can release its references.
    pub fn evict_backlogged(&self) {
        let Some(mut sessions) = self.locked() else {
            return;
        };
        sessions.retain(|id, handle| {
            if handle.frames.capacity() == 0 {
                warn!(session = id, "write stalled at queue bound, evicting");
                if let Some(abort) = &handle.abort {
                    abort.abort();
                }
                false
            } else {
                true
            }
        });
    }

    /// Abort and drop every session; used on server shutdown.
    pub fn clear(&self) {
        let Some(mut sessions) = self.locked() else {
            return;
        };
        for (_, handle) in sessions.drain() {
            if let Some(abort) = handle.abort {
                abort.abort();
            }
        }
    }
}
