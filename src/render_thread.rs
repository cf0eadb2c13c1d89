use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use gfxmux_handles::HandleRegistry;
use gfxmux_process::ProcessId;

use crate::channel::RenderChannel;
use crate::consumer::CommandRing;
use crate::dispatch::{CommandDecoder, DispatchContext, ProcessLedger};
use crate::DispatchError;

/// The execution unit behind one channel or consumer context: a dedicated OS
/// thread draining the incoming command stream in order.
#[derive(Debug)]
pub struct RenderThread {
    handle: JoinHandle<()>,
}

impl RenderThread {
    /// Spawn the thread for a message-pipe channel.
    pub(crate) fn spawn_for_channel(
        channel: Arc<RenderChannel>,
        decoder: Box<dyn CommandDecoder>,
        registry: Arc<HandleRegistry>,
        ledger: Arc<ProcessLedger>,
    ) -> io::Result<Self> {
        let name = format!("render-channel-{}", channel.context_id());
        let handle = thread::Builder::new().name(name).spawn(move || {
            run_channel(channel, decoder, &registry, &ledger);
        })?;
        Ok(Self { handle })
    }

    /// Spawn the thread for a shared-memory consumer context.
    pub(crate) fn spawn_for_ring(
        ring: Arc<CommandRing>,
        decoder: Box<dyn CommandDecoder>,
        registry: Arc<HandleRegistry>,
        ledger: Arc<ProcessLedger>,
        process_id: ProcessId,
        context_id: u32,
    ) -> io::Result<Self> {
        let name = format!("render-consumer-{context_id}");
        let handle = thread::Builder::new().name(name).spawn(move || {
            run_ring(&ring, decoder, &registry, &ledger, process_id, context_id);
        })?;
        Ok(Self { handle })
    }

    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            error!("render thread panicked");
        }
    }
}

fn run_channel(
    channel: Arc<RenderChannel>,
    mut decoder: Box<dyn CommandDecoder>,
    registry: &HandleRegistry,
    ledger: &ProcessLedger,
) {
    let process_id = channel.process_id();
    let context_id = channel.context_id();
    debug!(%process_id, context_id, "render thread started");

    while let Some(commands) = channel.host_recv_blocking() {
        let mut cx = DispatchContext::new(registry, ledger, process_id, context_id);
        match decoder.decode(&commands, &mut cx) {
            Ok(reply) => {
                if !reply.is_empty() {
                    // A stopped channel has nowhere to deliver the reply.
                    let _ = channel.host_send(reply);
                }
            }
            Err(DispatchError::DriverFatal(reason)) => {
                // Unrecoverable device condition: tear down this channel
                // only. The guest observes the closure; siblings keep going.
                error!(%process_id, context_id, %reason, "driver fatal, stopping channel");
                channel.stop();
                break;
            }
            Err(err) => {
                warn!(%process_id, context_id, %err, "rejected guest command buffer");
            }
        }
    }
    debug!(%process_id, context_id, "render thread exited");
}

fn run_ring(
    ring: &CommandRing,
    mut decoder: Box<dyn CommandDecoder>,
    registry: &HandleRegistry,
    ledger: &ProcessLedger,
    process_id: ProcessId,
    context_id: u32,
) {
    debug!(%process_id, context_id, "consumer render thread started");
    while let Some(commands) = ring.pop_blocking() {
        let mut cx = DispatchContext::new(registry, ledger, process_id, context_id);
        match decoder.decode(&commands, &mut cx) {
            Ok(_) => {}
            Err(DispatchError::DriverFatal(reason)) => {
                error!(%process_id, context_id, %reason, "driver fatal, stopping consumer");
                ring.stop();
                break;
            }
            Err(err) => {
                warn!(%process_id, context_id, %err, "rejected guest command record");
            }
        }
    }
    debug!(%process_id, context_id, "consumer render thread exited");
}
