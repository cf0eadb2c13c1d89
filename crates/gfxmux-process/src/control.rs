use std::io::{Read, Write};
use std::sync::Arc;

use gfxmux_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{ProcessId, ProcessTracker};

/// Fixed 4-byte acknowledgement the guest must send before the host reveals
/// the assigned process id.
pub const PROCESS_PIPE_CONFIRM_TOKEN: u32 = 100;

/// Transport a control pipe was opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Ordinary message-pipe transport; the pipe owns process attribution.
    Stream,
    /// Virtio-gpu transport, where context creation carries attribution.
    VirtioGpu,
}

/// Which transport is authoritative for process attribution.
///
/// The distilled protocol leaves this open; it is wiring, not protocol, so it
/// stays a constructor-level policy instead of a hard-coded rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionPolicy {
    /// The control pipe assigns an id on open for every transport.
    PipeAlways,
    /// Virtio-gpu pipes stay passive; attribution happens when the guest
    /// creates its rendering context.
    DeferVirtioGpu,
}

impl AttributionPolicy {
    fn pipe_assigns(self, kind: TransportKind) -> bool {
        match self {
            AttributionPolicy::PipeAlways => true,
            AttributionPolicy::DeferVirtioGpu => kind != TransportKind::VirtioGpu,
        }
    }
}

/// Guest-side protocol violations on the control pipe.
///
/// None of these are fatal to the host; the offending message is rejected and
/// the pipe stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlPipeError {
    #[error("control message too short ({len} bytes)")]
    ShortMessage { len: usize },

    #[error("unexpected confirmation token {token}")]
    UnexpectedToken { token: u32 },

    #[error("receive buffer too small for process id ({len} bytes)")]
    ShortReceiveBuffer { len: usize },
}

type CreationHook = Box<dyn Fn(ProcessId) + Send + Sync>;

/// Factory for per-process control pipes.
///
/// Owns the attribution policy and the backend's process-creation hook; every
/// pipe shares the session's [`ProcessTracker`].
pub struct ControlPipeService {
    tracker: Arc<ProcessTracker>,
    policy: AttributionPolicy,
    on_create: CreationHook,
}

impl ControlPipeService {
    pub fn new(
        tracker: Arc<ProcessTracker>,
        policy: AttributionPolicy,
        on_create: impl Fn(ProcessId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            tracker,
            policy,
            on_create: Box::new(on_create),
        }
    }

    pub fn policy(&self) -> AttributionPolicy {
        self.policy
    }

    /// Open a control pipe for a new guest process.
    ///
    /// The id is assigned and registered eagerly (unless the transport defers
    /// attribution) but not revealed: the guest only learns it after sending
    /// the confirmation token, which guards against reading uninitialized
    /// channel state on a freshly opened pipe.
    pub fn open(&self, kind: TransportKind) -> ControlPipe {
        let id = if self.policy.pipe_assigns(kind) {
            let id = self.tracker.allocate_id();
            self.tracker.register_process(id);
            (self.on_create)(id);
            Some(id)
        } else {
            debug!(?kind, "control pipe opened with deferred attribution");
            None
        };

        ControlPipe {
            tracker: Arc::clone(&self.tracker),
            id,
            reply_pending: false,
            closed: false,
        }
    }

    /// Reattach a pipe persisted by [`ControlPipe::encode`].
    pub fn load<R: Read>(&self, r: &mut R) -> Result<ControlPipe, SnapshotError> {
        let has_id = r.read_u8()? != 0;
        let raw_id = r.read_u64_le()?;
        let reply_pending = r.read_u8()? != 0;

        let id = if has_id {
            if raw_id == 0 {
                return Err(SnapshotError::Corrupt("reserved process id zero"));
            }
            let id = ProcessId(raw_id);
            self.tracker.register_process(id);
            (self.on_create)(id);
            Some(id)
        } else {
            None
        };

        Ok(ControlPipe {
            tracker: Arc::clone(&self.tracker),
            id,
            // A pending reply without an id cannot be replayed; drop it.
            reply_pending: reply_pending && id.is_some(),
            closed: false,
        })
    }
}

impl core::fmt::Debug for ControlPipeService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlPipeService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// One guest process's control channel endpoint.
///
/// Carries nothing but the id handshake; its real payload is its lifetime.
/// Closing it (normally or by guest death, indistinguishable here) reports
/// the exit to the tracker.
#[derive(Debug)]
pub struct ControlPipe {
    tracker: Arc<ProcessTracker>,
    id: Option<ProcessId>,
    reply_pending: bool,
    closed: bool,
}

impl ControlPipe {
    pub fn process_id(&self) -> Option<ProcessId> {
        self.id
    }

    /// The pipe is always ready in both directions; flow control lives in the
    /// transport underneath.
    pub fn poll_readable(&self) -> bool {
        true
    }

    pub fn poll_writable(&self) -> bool {
        true
    }

    /// Guest-to-host message: the confirmation token.
    ///
    /// Returns the number of bytes consumed. A wrong token is rejected
    /// without queueing a reply.
    pub fn on_guest_send(&mut self, buf: &[u8]) -> Result<usize, ControlPipeError> {
        let Some(token_bytes) = buf.get(..4) else {
            return Err(ControlPipeError::ShortMessage { len: buf.len() });
        };
        let token = u32::from_le_bytes(token_bytes.try_into().unwrap());
        if token != PROCESS_PIPE_CONFIRM_TOKEN {
            warn!(token, "guest sent bad control-pipe confirmation token");
            return Err(ControlPipeError::UnexpectedToken { token });
        }

        if self.id.is_some() {
            self.reply_pending = true;
        }
        Ok(buf.len())
    }

    /// Host-to-guest message: the 8-byte process id, exactly once per
    /// completed handshake. Returns 0 when no reply is queued.
    pub fn on_guest_recv(&mut self, buf: &mut [u8]) -> Result<usize, ControlPipeError> {
        if !self.reply_pending {
            return Ok(0);
        }
        let Some(id) = self.id else {
            return Ok(0);
        };
        let Some(slot) = buf.get_mut(..8) else {
            return Err(ControlPipeError::ShortReceiveBuffer { len: buf.len() });
        };
        slot.copy_from_slice(&id.0.to_le_bytes());
        self.reply_pending = false;
        Ok(8)
    }

    /// The guest side closed the pipe (exit or crash, no distinction).
    ///
    /// Reports the exit at most once; the tracker's live set makes the
    /// cleanup itself exactly-once even across duplicate reports.
    pub fn on_guest_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(id) = self.id {
            self.tracker.on_process_exit(id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Persist the pipe-level handshake state alongside the id, so a restore
    /// mid-handshake replays the pending reply instead of dropping it.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_u8(self.id.is_some() as u8)?;
        w.write_u64_le(self.id.map_or(0, |id| id.0))?;
        w.write_u8(self.reply_pending as u8)?;
        Ok(())
    }
}
