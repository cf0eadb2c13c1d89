use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use gfxmux_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use tracing::{debug, warn};

use crate::ProcessId;

// Snapshot input is untrusted; bound the live-set size before replaying it.
const MAX_SNAPSHOT_PROCESSES: u32 = 1 << 20;

type CleanupCallback = Box<dyn Fn(ProcessId) + Send + Sync>;

/// Liveness registry of guest process ids, plus the id generation counter.
///
/// The live set is read and written by every render thread (a process may
/// open several channels) and by the control pipes; one mutex guards it.
/// The cleanup callback is supplied once by the backend that owns the real
/// driver objects; the tracker is only the trigger.
pub struct ProcessTracker {
    live: Mutex<HashSet<ProcessId>>,
    head_id: AtomicU64,
    cleanup: CleanupCallback,
}

impl core::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("live", &self.live)
            .field("head_id", &self.head_id)
            .finish_non_exhaustive()
    }
}

impl ProcessTracker {
    pub fn new(cleanup: impl Fn(ProcessId) + Send + Sync + 'static) -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
            head_id: AtomicU64::new(0),
            cleanup: Box::new(cleanup),
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashSet<ProcessId>> {
        self.live.lock().expect("process registry poisoned")
    }

    /// Assign the next sequential process id (first id is 1; 0 is reserved).
    pub fn allocate_id(&self) -> ProcessId {
        ProcessId(self.head_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Current value of the id generation counter, for snapshot save.
    pub fn head_id(&self) -> u64 {
        self.head_id.load(Ordering::Relaxed)
    }

    /// Restore the id generation counter. Must happen before any
    /// post-restore [`allocate_id`](Self::allocate_id) call, or new ids could
    /// collide with persisted ones.
    pub fn seed_head_id(&self, head: u64) {
        self.head_id.store(head, Ordering::Relaxed);
    }

    pub fn register_process(&self, id: ProcessId) {
        debug!(%id, "guest graphics process registered");
        self.live().insert(id);
    }

    /// Explicit removal without cleanup (normal close after the guest already
    /// released everything). Unknown ids are benign.
    pub fn unregister_process(&self, id: ProcessId) {
        if !self.live().remove(&id) {
            debug!(%id, "unregister of unknown process id ignored");
        }
    }

    /// Report that `id`'s control channel closed.
    ///
    /// Normal exit and crash are indistinguishable here by design: a closed
    /// pipe means the process is gone. Removal from the live set is the
    /// arbiter: only the caller that actually removed the id runs the
    /// cleanup callback, so concurrent or repeated close reports reduce to
    /// exactly one cleanup per process lifetime. The callback runs outside
    /// the registry lock.
    pub fn on_process_exit(&self, id: ProcessId) {
        let was_live = self.live().remove(&id);
        if was_live {
            debug!(%id, "guest process exited, running resource cleanup");
            (self.cleanup)(id);
        } else {
            debug!(%id, "process exit for unknown id ignored");
        }
    }

    pub fn is_live(&self, id: ProcessId) -> bool {
        self.live().contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    pub fn for_each_live_id(&self, mut f: impl FnMut(ProcessId)) {
        let mut ids: Vec<ProcessId> = self.live().iter().copied().collect();
        ids.sort_unstable();
        for id in ids {
            f(id);
        }
    }

    /// Atomically empty the live set, visiting every entry. Used for
    /// full-session teardown.
    pub fn for_each_live_id_drain(&self, mut f: impl FnMut(ProcessId)) {
        let drained: Vec<ProcessId> = {
            let mut live = self.live();
            let mut ids: Vec<ProcessId> = live.drain().collect();
            ids.sort_unstable();
            ids
        };
        for id in drained {
            f(id);
        }
    }

    /// Serialize the generation counter and the live-id set.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_u64_le(self.head_id())?;

        let mut ids: Vec<u64> = self.live().iter().map(|id| id.0).collect();
        ids.sort_unstable();

        let count: u32 = ids
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many live processes"))?;
        w.write_u32_le(count)?;
        for id in ids {
            w.write_u64_le(id)?;
        }
        Ok(())
    }

    /// Replace this tracker's state from a snapshot payload.
    ///
    /// The counter is reseeded first; every replayed id must have been
    /// assigned below it.
    pub fn load<R: Read>(&self, r: &mut R) -> Result<(), SnapshotError> {
        let head = r.read_u64_le()?;
        let count = r.read_u32_le()?;
        if count > MAX_SNAPSHOT_PROCESSES {
            return Err(SnapshotError::Corrupt("live process count too large"));
        }

        // Don't pre-size from an untrusted count.
        let mut ids = HashSet::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let raw = r.read_u64_le()?;
            if raw == 0 {
                return Err(SnapshotError::Corrupt("reserved process id zero"));
            }
            if raw > head {
                return Err(SnapshotError::Corrupt("process id ahead of generation counter"));
            }
            if !ids.insert(ProcessId(raw)) {
                warn!(id = raw, "snapshot repeated a live process id");
            }
        }

        self.seed_head_id(head);
        *self.live() = ids;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ids_are_sequential_from_one() {
        let tracker = ProcessTracker::new(|_| {});
        assert_eq!(tracker.allocate_id(), ProcessId(1));
        assert_eq!(tracker.allocate_id(), ProcessId(2));
        assert_eq!(tracker.head_id(), 2);
    }

    #[test]
    fn exit_runs_cleanup_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let tracker = {
            let fired = Arc::clone(&fired);
            ProcessTracker::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let id = tracker.allocate_id();
        tracker.register_process(id);
        tracker.on_process_exit(id);
        tracker.on_process_exit(id);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!tracker.is_live(id));
    }

    #[test]
    fn unregister_skips_cleanup() {
        let fired = Arc::new(AtomicUsize::new(0));
        let tracker = {
            let fired = Arc::clone(&fired);
            ProcessTracker::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let id = tracker.allocate_id();
        tracker.register_process(id);
        tracker.unregister_process(id);
        tracker.on_process_exit(id);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_empties_the_live_set() {
        let tracker = ProcessTracker::new(|_| {});
        for _ in 0..4 {
            let id = tracker.allocate_id();
            tracker.register_process(id);
        }

        let mut seen = Vec::new();
        tracker.for_each_live_id_drain(|id| seen.push(id));
        assert_eq!(seen.len(), 4);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn load_rejects_id_ahead_of_counter() {
        let tracker = ProcessTracker::new(|_| {});
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes()); // head counter
        bytes.extend_from_slice(&1u32.to_le_bytes()); // one live id
        bytes.extend_from_slice(&9u64.to_le_bytes()); // never assigned

        let err = tracker.load(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }
}
