use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use gfxmux_handles::{BoxedHandle, HandleError, HandleRegistry, HostHandle, MappingPolicy, ObjectType};
use gfxmux_process::ProcessId;

use crate::DispatchError;

/// Per-process attribution ledger: every boxed object a guest process owns,
/// so forced cleanup can find them after the process is gone.
///
/// The registry answers "is this handle valid"; the ledger answers "whose is
/// it". They are kept separate so the registry stays a leaf.
#[derive(Debug, Default)]
pub struct ProcessLedger {
    owned: Mutex<HashMap<ProcessId, Vec<(ObjectType, BoxedHandle)>>>,
}

impl ProcessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, Vec<(ObjectType, BoxedHandle)>>> {
        self.owned.lock().expect("process ledger poisoned")
    }

    /// Ensure an (empty) entry exists for a newly attributed process.
    pub fn on_process_create(&self, process_id: ProcessId) {
        self.owned().entry(process_id).or_default();
    }

    pub fn attribute(&self, process_id: ProcessId, object_type: ObjectType, boxed: BoxedHandle) {
        self.owned()
            .entry(process_id)
            .or_default()
            .push((object_type, boxed));
    }

    /// Remove one attribution after the guest explicitly destroyed the
    /// object. Unknown entries are a no-op.
    pub fn forget(&self, process_id: ProcessId, object_type: ObjectType, boxed: BoxedHandle) {
        if let Some(objects) = self.owned().get_mut(&process_id) {
            if let Some(pos) = objects
                .iter()
                .position(|&entry| entry == (object_type, boxed))
            {
                objects.swap_remove(pos);
            }
        }
    }

    pub fn owned_count(&self, process_id: ProcessId) -> usize {
        self.owned().get(&process_id).map_or(0, Vec::len)
    }

    /// Release everything `process_id` still owns.
    ///
    /// Runs on the cleanup worker after process exit; the guest is gone, so
    /// nothing is reported back; the objects are released against the
    /// driver and their mappings removed.
    pub fn cleanup_process(&self, process_id: ProcessId, registry: &HandleRegistry) {
        let Some(objects) = self.owned().remove(&process_id) else {
            debug!(%process_id, "cleanup for process with no attributed objects");
            return;
        };
        debug!(
            %process_id,
            count = objects.len(),
            "releasing objects owned by exited process"
        );
        for (object_type, boxed) in objects {
            // Resolve first: the driver-side release consumes the host
            // handle, then the mapping goes away.
            if let Ok(host) = registry.unbox_handle(object_type, boxed) {
                debug!(%object_type, host = host.0, "releasing driver object");
            }
            registry.release_boxed(object_type, &[boxed]);
        }
    }
}

/// Everything a decoder needs while executing one command buffer: the handle
/// registry, the attribution ledger, and the identity of the submitting
/// context.
pub struct DispatchContext<'a> {
    registry: &'a HandleRegistry,
    ledger: &'a ProcessLedger,
    process_id: ProcessId,
    context_id: u32,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        registry: &'a HandleRegistry,
        ledger: &'a ProcessLedger,
        process_id: ProcessId,
        context_id: u32,
    ) -> Self {
        Self {
            registry,
            ledger,
            process_id,
            context_id,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn registry(&self) -> &HandleRegistry {
        self.registry
    }

    /// Creation path: box the driver's outputs and attribute them to the
    /// submitting process. Returns the guest-visible values.
    pub fn box_created(&self, object_type: ObjectType, hosts: &[HostHandle]) -> Vec<BoxedHandle> {
        let boxed = self.registry.box_handles(object_type, hosts);
        for &b in &boxed {
            self.ledger.attribute(self.process_id, object_type, b);
        }
        boxed
    }

    /// Consumption path: resolve guest-supplied values, rejecting the call on
    /// the first forged/stale/wrong-typed handle.
    pub fn resolve(
        &self,
        object_type: ObjectType,
        boxed: &[BoxedHandle],
    ) -> Result<Vec<HostHandle>, HandleError> {
        self.registry.unbox_handles(object_type, boxed)
    }

    /// Destruction path: remove exactly the mappings the call consumed, and
    /// their attributions.
    pub fn release_destroyed(&self, object_type: ObjectType, boxed: &[BoxedHandle]) {
        self.registry.release_boxed(object_type, boxed);
        for &b in boxed {
            self.ledger.forget(self.process_id, object_type, b);
        }
    }

    /// Apply a call site's mapping policy to raw handle arguments in place,
    /// recording attribution for newly created objects.
    pub fn apply_policy(
        &self,
        policy: MappingPolicy,
        object_type: ObjectType,
        handles: &mut [u64],
    ) -> Result<(), HandleError> {
        policy.translate(self.registry, object_type, handles)?;
        if policy == MappingPolicy::BoxCreate {
            for &h in handles.iter() {
                self.ledger
                    .attribute(self.process_id, object_type, BoxedHandle(h));
            }
        }
        Ok(())
    }
}

/// Decoder seam. Wire parsing is out of scope for this layer: implementations
/// receive whole command buffers and are responsible for mapping registry
/// failures to the corresponding API error codes in their replies.
///
/// Returning [`DispatchError::DriverFatal`] tears down the owning channel;
/// any other error drops the buffer and the channel keeps running.
pub trait CommandDecoder: Send {
    fn decode(
        &mut self,
        commands: &[u8],
        cx: &mut DispatchContext<'_>,
    ) -> Result<Vec<u8>, DispatchError>;
}

/// Decoder that accepts and ignores every command buffer.
#[derive(Debug, Default)]
pub struct NullCommandDecoder;

impl NullCommandDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl CommandDecoder for NullCommandDecoder {
    fn decode(
        &mut self,
        _commands: &[u8],
        _cx: &mut DispatchContext<'_>,
    ) -> Result<Vec<u8>, DispatchError> {
        Ok(Vec::new())
    }
}
