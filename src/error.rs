use std::io;

use gfxmux_handles::HandleError;
use gfxmux_snapshot::SnapshotError;
use thiserror::Error;

/// Supervisor-level failures.
#[derive(Debug, Error)]
pub enum RendererError {
    /// The supervisor is stopping; the guest context simply fails to attach
    /// and may retry at a higher level. No thread was started.
    #[error("channel creation refused: renderer is stopping")]
    ChannelCreationRefused,

    #[error("consumer context ({context_id}, {capset_id}) already exists")]
    ConsumerExists { context_id: u32, capset_id: u32 },

    #[error("unknown consumer context ({context_id}, {capset_id})")]
    UnknownConsumer { context_id: u32, capset_id: u32 },

    #[error("failed to spawn render thread")]
    ThreadSpawn(#[source] io::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Failures surfaced by a [`CommandDecoder`](crate::CommandDecoder) while
/// executing one guest command buffer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A guest-supplied handle failed to resolve. Protocol violation: the
    /// call is rejected (the decoder maps it to the API's invalid-handle
    /// error code) and the channel keeps running.
    #[error(transparent)]
    InvalidHandle(#[from] HandleError),

    /// The command stream itself was malformed. Also a protocol violation;
    /// the buffer is dropped and the channel keeps running.
    #[error("malformed command stream: {0}")]
    Malformed(&'static str),

    /// The driver reported an unrecoverable device condition. The owning
    /// channel tears itself down; sibling channels are unaffected.
    #[error("GPU driver fatal error: {0}")]
    DriverFatal(String),
}
