use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use gfxmux_handles::HandleRegistry;
use gfxmux_process::{
    AttributionPolicy, ControlPipe, ControlPipeService, ProcessId, ProcessTracker, TransportKind,
};
use gfxmux_snapshot::{self as snapshot, ReadLeExt, SectionId, SnapshotError, WriteLeExt};

use crate::channel::RenderChannel;
use crate::cleanup::{CleanupQueue, CleanupWorker};
use crate::consumer::{ConsumerContext, ConsumerDescriptor};
use crate::dispatch::{CommandDecoder, ProcessLedger};
use crate::render_thread::RenderThread;
use crate::RendererError;

// Rosters come from untrusted snapshots; bound them before replay.
const MAX_SNAPSHOT_CHANNELS: u32 = 1 << 16;
const MAX_SNAPSHOT_CONSUMERS: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Which transport owns process attribution (see
    /// [`AttributionPolicy`]).
    pub attribution_policy: AttributionPolicy,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            // Virtio-gpu style transports attribute at context creation.
            attribution_policy: AttributionPolicy::DeferVirtioGpu,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelSets {
    active: Vec<Arc<RenderChannel>>,
    stopped: Vec<Arc<RenderChannel>>,
    stopping: bool,
}

/// The host session supervisor.
///
/// One `Renderer` instance owns all cross-channel state: the handle
/// registry, the process tracker and control-pipe service, the channel and
/// consumer sets, and the cleanup worker. Everything that used to be a
/// process-global in older designs is an explicit field here, initialized at
/// session start and drained by [`finish`](Renderer::finish).
///
/// A channel is in exactly one of the active or stopped sets at any time;
/// both sets share one lock, so the transition is atomic.
pub struct Renderer {
    registry: Arc<HandleRegistry>,
    ledger: Arc<ProcessLedger>,
    tracker: Arc<ProcessTracker>,
    control: ControlPipeService,
    cleanup: CleanupQueue,
    cleanup_worker: Mutex<CleanupWorker>,
    channels: Mutex<ChannelSets>,
    consumers: Mutex<HashMap<(u32, u32), Arc<ConsumerContext>>>,
    /// Consumer keys whose render threads were recreated after a snapshot
    /// load, tracked until [`resume_all`](Renderer::resume_all) reattaches
    /// them.
    additional_post_load: Mutex<Vec<(u32, u32)>>,
    decoder_factory: Box<dyn Fn() -> Box<dyn CommandDecoder> + Send + Sync>,
}

impl core::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Renderer")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    pub fn new(
        config: RendererConfig,
        decoder_factory: impl Fn() -> Box<dyn CommandDecoder> + Send + Sync + 'static,
    ) -> Result<Renderer, RendererError> {
        let registry = Arc::new(HandleRegistry::new());
        let ledger = Arc::new(ProcessLedger::new());

        let worker = CleanupWorker::spawn({
            let registry = Arc::clone(&registry);
            let ledger = Arc::clone(&ledger);
            move |pid| ledger.cleanup_process(pid, &registry)
        })
        .map_err(RendererError::ThreadSpawn)?;
        let cleanup = worker.queue();

        let tracker = Arc::new(ProcessTracker::new({
            let cleanup = cleanup.clone();
            move |pid| cleanup.enqueue(pid)
        }));

        let control = ControlPipeService::new(
            Arc::clone(&tracker),
            config.attribution_policy,
            {
                let ledger = Arc::clone(&ledger);
                move |pid| ledger.on_process_create(pid)
            },
        );

        Ok(Renderer {
            registry,
            ledger,
            tracker,
            control,
            cleanup,
            cleanup_worker: Mutex::new(worker),
            channels: Mutex::new(ChannelSets::default()),
            consumers: Mutex::new(HashMap::new()),
            additional_post_load: Mutex::new(Vec::new()),
            decoder_factory: Box::new(decoder_factory),
        })
    }

    pub fn handle_registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn process_tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn process_ledger(&self) -> &Arc<ProcessLedger> {
        &self.ledger
    }

    /// Open a control pipe for a new guest process (see
    /// [`ControlPipeService::open`]).
    pub fn open_control_pipe(&self, kind: TransportKind) -> ControlPipe {
        self.control.open(kind)
    }

    /// Reattach a control pipe persisted in a snapshot.
    pub fn load_control_pipe<R: Read>(&self, r: &mut R) -> Result<ControlPipe, RendererError> {
        Ok(self.control.load(r)?)
    }

    /// Attribution point for transports where the control pipe stays passive
    /// (virtio-gpu style): registers the process and creates its ledger
    /// entry. Idempotent.
    pub fn on_guest_process_create(&self, process_id: ProcessId) {
        self.tracker.register_process(process_id);
        self.ledger.on_process_create(process_id);
    }

    /// Force resource reclamation for a process, synchronously on the caller.
    ///
    /// The normal path goes through the control pipe and the cleanup worker;
    /// this is the direct entry for backends that detect process death out of
    /// band.
    pub fn cleanup_process_resources(&self, process_id: ProcessId) {
        self.ledger.cleanup_process(process_id, &self.registry);
    }

    /// Block until every cleanup queued before the call has completed, so no
    /// cleanup work straddles a snapshot boundary.
    pub fn wait_for_process_cleanup(&self) {
        self.cleanup.wait_idle();
    }

    /// Allocate a channel + render thread for one guest rendering context.
    ///
    /// Refused once the supervisor is stopping; no thread is started in that
    /// case and the guest context simply fails to attach.
    pub fn create_render_channel(
        &self,
        process_id: ProcessId,
        context_id: u32,
    ) -> Result<Arc<RenderChannel>, RendererError> {
        let mut sets = self.channels.lock().expect("channel sets poisoned");
        if sets.stopping {
            return Err(RendererError::ChannelCreationRefused);
        }

        // Channel creation is an attribution point for objects created on it.
        self.ledger.on_process_create(process_id);

        let channel = Arc::new(RenderChannel::new(process_id, context_id));
        let thread = RenderThread::spawn_for_channel(
            Arc::clone(&channel),
            (self.decoder_factory)(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
        )
        .map_err(RendererError::ThreadSpawn)?;
        channel.attach_thread(thread);

        sets.active.push(Arc::clone(&channel));
        debug!(%process_id, context_id, "render channel created");
        Ok(channel)
    }

    /// Transition every channel to stopped, moving it to the stopped set.
    ///
    /// With `wait`, blocks until every render thread has exited, so no GPU call
    /// is in flight when it returns. Without `wait`, stop is a best-effort
    /// asynchronous request and [`finish`](Renderer::finish) joins later.
    /// Stopped channels are kept (not destroyed) so final queries against
    /// them still work and the snapshot boundary stays well-defined.
    pub fn stop(&self, wait: bool) {
        let mut joins = Vec::new();
        {
            let mut sets = self.channels.lock().expect("channel sets poisoned");
            sets.stopping = true;
            let draining: Vec<Arc<RenderChannel>> = sets.active.drain(..).collect();
            for channel in draining {
                channel.stop();
                if wait {
                    if let Some(thread) = channel.take_thread() {
                        joins.push(thread);
                    }
                }
                sets.stopped.push(channel);
            }
        }
        for thread in joins {
            thread.join();
        }
    }

    /// Final teardown after [`stop`](Renderer::stop): destroys stopped
    /// channels and consumers and drains the cleanup worker.
    pub fn finish(&self) {
        self.stop(true);

        let stopped: Vec<Arc<RenderChannel>> = {
            let mut sets = self.channels.lock().expect("channel sets poisoned");
            sets.stopped.drain(..).collect()
        };
        for channel in &stopped {
            if let Some(thread) = channel.take_thread() {
                thread.join();
            }
        }
        drop(stopped);

        let consumers: Vec<Arc<ConsumerContext>> = {
            let mut consumers = self.consumers.lock().expect("consumer set poisoned");
            consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in consumers {
            consumer.ring().stop();
            if let Some(thread) = consumer.take_thread() {
                thread.join();
            }
        }
        self.additional_post_load
            .lock()
            .expect("post-load set poisoned")
            .clear();

        // Full-session teardown: reclaim everything still attributed to live
        // processes, then drain and stop the worker.
        self.tracker
            .for_each_live_id_drain(|pid| self.cleanup.enqueue(pid));
        self.cleanup_worker
            .lock()
            .expect("cleanup worker poisoned")
            .shutdown();
    }

    pub fn is_stopping(&self) -> bool {
        self.channels.lock().expect("channel sets poisoned").stopping
    }

    pub fn active_channel_count(&self) -> usize {
        self.channels.lock().expect("channel sets poisoned").active.len()
    }

    /// Snapshot of the active set (final queries on stopped channels go
    /// through [`stopped_channel_count`](Renderer::stopped_channel_count)).
    pub fn active_channels(&self) -> Vec<Arc<RenderChannel>> {
        self.channels
            .lock()
            .expect("channel sets poisoned")
            .active
            .clone()
    }

    pub fn consumer_lookup(&self, context_id: u32, capset_id: u32) -> Option<Arc<ConsumerContext>> {
        self.consumers
            .lock()
            .expect("consumer set poisoned")
            .get(&(context_id, capset_id))
            .cloned()
    }

    pub fn stopped_channel_count(&self) -> usize {
        self.channels.lock().expect("channel sets poisoned").stopped.len()
    }

    /// Quiesce every channel and consumer ahead of a snapshot save.
    pub fn pause_all_pre_save(&self) {
        let sets = self.channels.lock().expect("channel sets poisoned");
        for channel in &sets.active {
            channel.set_paused(true);
        }
        drop(sets);
        let consumers = self.consumers.lock().expect("consumer set poisoned");
        for consumer in consumers.values() {
            consumer.ring().set_paused(true);
        }
    }

    /// Undo [`pause_all_pre_save`](Renderer::pause_all_pre_save) and consider
    /// post-load render threads reattached.
    pub fn resume_all(&self) {
        let sets = self.channels.lock().expect("channel sets poisoned");
        for channel in &sets.active {
            channel.set_paused(false);
        }
        drop(sets);
        let consumers = self.consumers.lock().expect("consumer set poisoned");
        for consumer in consumers.values() {
            consumer.ring().set_paused(false);
        }
        drop(consumers);
        self.additional_post_load
            .lock()
            .expect("post-load set poisoned")
            .clear();
    }

    // ---- shared-memory consumer contexts ----

    /// Create a consumer context bound to a unique `(context_id, capset_id)`
    /// pair. This is the authoritative attribution point on transports where
    /// the control pipe defers it.
    pub fn consumer_create(
        &self,
        desc: ConsumerDescriptor,
    ) -> Result<Arc<ConsumerContext>, RendererError> {
        if self.is_stopping() {
            return Err(RendererError::ChannelCreationRefused);
        }
        let mut consumers = self.consumers.lock().expect("consumer set poisoned");
        let key = (desc.context_id, desc.capset_id);
        if consumers.contains_key(&key) {
            return Err(RendererError::ConsumerExists {
                context_id: desc.context_id,
                capset_id: desc.capset_id,
            });
        }

        self.on_guest_process_create(desc.process_id);

        let consumer = Arc::new(ConsumerContext::new(&desc));
        let thread = RenderThread::spawn_for_ring(
            Arc::clone(consumer.ring()),
            (self.decoder_factory)(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            desc.process_id,
            desc.context_id,
        )
        .map_err(RendererError::ThreadSpawn)?;
        consumer.attach_thread(thread);

        consumers.insert(key, Arc::clone(&consumer));
        debug!(
            context_id = desc.context_id,
            capset_id = desc.capset_id,
            "consumer context created"
        );
        Ok(consumer)
    }

    pub fn consumer_destroy(&self, context_id: u32, capset_id: u32) -> Result<(), RendererError> {
        let consumer = self
            .consumers
            .lock()
            .expect("consumer set poisoned")
            .remove(&(context_id, capset_id))
            .ok_or(RendererError::UnknownConsumer {
                context_id,
                capset_id,
            })?;
        consumer.ring().stop();
        if let Some(thread) = consumer.take_thread() {
            thread.join();
        }
        Ok(())
    }

    fn consumer(&self, context_id: u32, capset_id: u32) -> Result<Arc<ConsumerContext>, RendererError> {
        self.consumers
            .lock()
            .expect("consumer set poisoned")
            .get(&(context_id, capset_id))
            .cloned()
            .ok_or(RendererError::UnknownConsumer {
                context_id,
                capset_id,
            })
    }

    pub fn consumer_pre_save(&self, context_id: u32, capset_id: u32) -> Result<(), RendererError> {
        self.consumer(context_id, capset_id)?.ring().set_paused(true);
        Ok(())
    }

    pub fn consumer_save<W: Write>(
        &self,
        context_id: u32,
        capset_id: u32,
        w: &mut W,
    ) -> Result<(), RendererError> {
        Ok(self.consumer(context_id, capset_id)?.encode(w)?)
    }

    pub fn consumer_post_save(&self, context_id: u32, capset_id: u32) -> Result<(), RendererError> {
        self.consumer(context_id, capset_id)?
            .ring()
            .set_paused(false);
        Ok(())
    }

    /// Recreate the render thread for a consumer restored from a snapshot.
    ///
    /// Post-load threads are tracked in a separate set until
    /// [`resume_all`](Renderer::resume_all) declares them reattached.
    pub fn consumer_register_post_load_render_thread(
        &self,
        context_id: u32,
        capset_id: u32,
    ) -> Result<(), RendererError> {
        let consumer = self.consumer(context_id, capset_id)?;
        if consumer.has_thread() {
            return Ok(());
        }
        let thread = RenderThread::spawn_for_ring(
            Arc::clone(consumer.ring()),
            (self.decoder_factory)(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            consumer.process_id(),
            consumer.context_id(),
        )
        .map_err(RendererError::ThreadSpawn)?;
        consumer.attach_thread(thread);
        self.additional_post_load
            .lock()
            .expect("post-load set poisoned")
            .push((context_id, capset_id));
        Ok(())
    }

    pub fn post_load_thread_count(&self) -> usize {
        self.additional_post_load
            .lock()
            .expect("post-load set poisoned")
            .len()
    }

    // ---- whole-session snapshot ----

    /// Serialize the session: live processes and the id counter, the handle
    /// tables, the active-channel roster, and consumer bindings.
    ///
    /// Channels mid-destruction (the stopped set) are not persisted. In-flight
    /// cleanup is drained first and every stream is paused across the write,
    /// so the snapshot point is deterministic.
    pub fn save<W: Write + Seek>(&self, w: &mut W) -> Result<(), RendererError> {
        self.wait_for_process_cleanup();
        self.pause_all_pre_save();
        let result = self.save_sections(w);
        self.resume_all();
        result
    }

    fn save_sections<W: Write + Seek>(&self, w: &mut W) -> Result<(), RendererError> {
        snapshot::write_file_header(w)?;

        snapshot::write_section(w, SectionId::PROCESSES, 1, 0, |w| self.tracker.encode(w))?;
        snapshot::write_section(w, SectionId::HANDLES, 1, 0, |w| self.registry.encode(w))?;

        snapshot::write_section(w, SectionId::CHANNELS, 1, 0, |w| {
            let sets = self.channels.lock().expect("channel sets poisoned");
            let count: u32 = sets
                .active
                .len()
                .try_into()
                .map_err(|_| SnapshotError::Corrupt("too many channels"))?;
            w.write_u32_le(count)?;
            for channel in &sets.active {
                w.write_u64_le(channel.process_id().0)?;
                w.write_u32_le(channel.context_id())?;
            }
            Ok(())
        })?;

        snapshot::write_section(w, SectionId::CONSUMERS, 1, 0, |w| {
            let consumers = self.consumers.lock().expect("consumer set poisoned");
            let mut all: Vec<&Arc<ConsumerContext>> = consumers.values().collect();
            all.sort_by_key(|c| (c.context_id(), c.capset_id()));
            let count: u32 = all
                .len()
                .try_into()
                .map_err(|_| SnapshotError::Corrupt("too many consumers"))?;
            w.write_u32_le(count)?;
            for consumer in all {
                consumer.encode(w)?;
            }
            Ok(())
        })?;

        Ok(())
    }

    /// Restore a session saved by [`save`](Renderer::save) into this (freshly
    /// constructed) renderer.
    ///
    /// The process-id counter is reseeded before anything else so no id
    /// assigned after the restore can collide with a persisted one. Channels
    /// are recreated with new threads but identical `(process, context)`
    /// bindings; consumer contexts come back without threads until
    /// [`consumer_register_post_load_render_thread`] runs.
    ///
    /// [`consumer_register_post_load_render_thread`]:
    /// Renderer::consumer_register_post_load_render_thread
    pub fn load<R: Read>(&self, r: &mut R) -> Result<(), RendererError> {
        snapshot::read_file_header(r)?;

        let mut restored_channels: Vec<(ProcessId, u32)> = Vec::new();
        let mut restored_consumers: Vec<ConsumerDescriptor> = Vec::new();

        while let Some(header) = snapshot::read_section_header(r)? {
            let mut section = r.take(header.len);
            match header.id {
                id if id == SectionId::PROCESSES => {
                    if header.version == 1 {
                        self.tracker.load(&mut section)?;
                        self.tracker
                            .for_each_live_id(|pid| self.ledger.on_process_create(pid));
                    }
                }
                id if id == SectionId::HANDLES => {
                    if header.version == 1 {
                        self.registry.load(&mut section)?;
                    }
                }
                id if id == SectionId::CHANNELS => {
                    if header.version == 1 {
                        let count = section.read_u32_le()?;
                        if count > MAX_SNAPSHOT_CHANNELS {
                            return Err(RendererError::Snapshot(SnapshotError::Corrupt(
                                "channel roster too large",
                            )));
                        }
                        for _ in 0..count {
                            let raw_pid = section.read_u64_le()?;
                            let context_id = section.read_u32_le()?;
                            if raw_pid == 0 {
                                return Err(RendererError::Snapshot(SnapshotError::Corrupt(
                                    "reserved process id zero",
                                )));
                            }
                            restored_channels.push((ProcessId(raw_pid), context_id));
                        }
                    }
                }
                id if id == SectionId::CONSUMERS => {
                    if header.version == 1 {
                        let count = section.read_u32_le()?;
                        if count > MAX_SNAPSHOT_CONSUMERS {
                            return Err(RendererError::Snapshot(SnapshotError::Corrupt(
                                "consumer roster too large",
                            )));
                        }
                        for _ in 0..count {
                            restored_consumers.push(ConsumerContext::decode(&mut section)?);
                        }
                    }
                }
                id => {
                    debug!(%id, "skipping unknown snapshot section");
                }
            }
            snapshot::finish_section(&mut section)?;
        }

        for (process_id, context_id) in restored_channels {
            self.create_render_channel(process_id, context_id)?;
        }
        for desc in restored_consumers {
            let mut consumers = self.consumers.lock().expect("consumer set poisoned");
            let key = (desc.context_id, desc.capset_id);
            if consumers.contains_key(&key) {
                warn!(
                    context_id = desc.context_id,
                    capset_id = desc.capset_id,
                    "snapshot repeated a consumer binding"
                );
                continue;
            }
            consumers.insert(key, Arc::new(ConsumerContext::new(&desc)));
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.finish();
    }
}
