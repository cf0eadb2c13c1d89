//! gfxmux: host side of a GPU command virtualization layer.
//!
//! Guests running in a VM or sandbox issue graphics-API calls that are
//! encoded, carried across the boundary, and replayed here against the real
//! driver. Many guest processes and rendering contexts multiplex onto one
//! physical GPU; this crate is the trust and lifecycle layer that makes the
//! multiplexing safe and leak-free:
//!
//! - [`gfxmux_handles`] keeps raw driver handles out of guest hands through
//!   a per-object-type boxing registry, consulted on every decoded call.
//! - [`gfxmux_process`] detects guest process exit over a dedicated control
//!   pipe and triggers exactly-once cleanup of everything the process owned.
//! - The [`Renderer`] supervisor in this crate owns one render thread per
//!   guest context, coordinates startup/shutdown, and serializes the whole
//!   session for point-in-time snapshot and restore.
//!
//! Wire decoding, driver entry-point loading, shader helpers, and
//! presentation are out of scope: they plug in through the
//! [`CommandDecoder`] and [`ProcAddressTable`] seams.
#![forbid(unsafe_code)]

mod channel;
mod cleanup;
mod consumer;
mod dispatch;
mod error;
mod loader;
mod render_thread;
mod renderer;

pub use gfxmux_handles::{
    BoxedHandle, HandleError, HandleRegistry, HostHandle, MappingPolicy, ObjectType,
};
pub use gfxmux_process::{
    AttributionPolicy, ControlPipe, ControlPipeError, ControlPipeService, ProcessId,
    ProcessTracker, TransportKind, PROCESS_PIPE_CONFIRM_TOKEN,
};

pub use crate::channel::{ChannelState, ChannelStopped, RenderChannel};
pub use crate::consumer::{
    CommandRing, ConsumerContext, ConsumerDescriptor, RingPushError, DEFAULT_RING_CAPACITY,
};
pub use crate::dispatch::{CommandDecoder, DispatchContext, NullCommandDecoder, ProcessLedger};
pub use crate::error::{DispatchError, RendererError};
pub use crate::loader::{resolve_entry_point, ProcAddress, ProcAddressTable, VENDOR_SUFFIXES};
pub use crate::render_thread::RenderThread;
pub use crate::renderer::{Renderer, RendererConfig};
