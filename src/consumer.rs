use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use gfxmux_process::ProcessId;
use gfxmux_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};

use crate::render_thread::RenderThread;

pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingPushError {
    #[error("ring is full")]
    Full,
    #[error("record larger than ring capacity")]
    TooLarge,
}

#[derive(Debug, Default)]
struct RingInner {
    /// Length-prefixed records, bounded by `capacity` total bytes.
    bytes: VecDeque<u8>,
    capacity: usize,
    stopped: bool,
    paused: bool,
}

/// Bounded byte ring carrying length-prefixed command records from the guest
/// mapping of the shared buffer to the consumer's render thread.
///
/// This is the low-overhead transport: the guest writes records directly into
/// shared memory instead of sending pipe messages. Records are delivered in
/// order; a full ring pushes back on the producer.
#[derive(Debug)]
pub struct CommandRing {
    inner: Mutex<RingInner>,
    cond: Condvar,
}

impl CommandRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 4, "ring capacity must hold at least one record");
        Self {
            inner: Mutex::new(RingInner {
                bytes: VecDeque::with_capacity(capacity),
                capacity,
                stopped: false,
                paused: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner.lock().expect("command ring poisoned")
    }

    pub fn capacity(&self) -> usize {
        self.inner().capacity
    }

    /// Append one record. `Full` is back-pressure, not a protocol error.
    pub fn try_push(&self, record: &[u8]) -> Result<(), RingPushError> {
        let mut inner = self.inner();
        if inner.stopped {
            // A stopped ring accepts nothing; treat as permanently full.
            return Err(RingPushError::Full);
        }
        let framed = 4 + record.len();
        if framed > inner.capacity {
            return Err(RingPushError::TooLarge);
        }
        if inner.bytes.len() + framed > inner.capacity {
            return Err(RingPushError::Full);
        }
        let len: u32 = record.len() as u32;
        inner.bytes.extend(len.to_le_bytes());
        inner.bytes.extend(record.iter().copied());
        self.cond.notify_all();
        Ok(())
    }

    /// Blocking ordered read; `None` once the ring stops.
    pub fn pop_blocking(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner();
        loop {
            if inner.stopped {
                return None;
            }
            if !inner.paused && !inner.bytes.is_empty() {
                let mut len_bytes = [0u8; 4];
                for b in &mut len_bytes {
                    *b = inner.bytes.pop_front().expect("length prefix present");
                }
                let len = u32::from_le_bytes(len_bytes) as usize;
                let record: Vec<u8> = inner.bytes.drain(..len).collect();
                return Some(record);
            }
            inner = self.cond.wait(inner).expect("command ring poisoned");
        }
    }

    pub fn stop(&self) {
        let mut inner = self.inner();
        inner.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner().stopped
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        let mut inner = self.inner();
        inner.paused = paused;
        self.cond.notify_all();
    }
}

/// Creation parameters for a shared-memory consumer context.
#[derive(Debug, Clone)]
pub struct ConsumerDescriptor {
    /// Guest-chosen context id; unique together with `capset_id`.
    pub context_id: u32,
    pub capset_id: u32,
    /// Owning guest process; on transports where the pipe defers attribution,
    /// this is the authoritative attribution point.
    pub process_id: ProcessId,
    pub name: Option<String>,
    pub ring_capacity: usize,
}

impl ConsumerDescriptor {
    pub fn new(context_id: u32, capset_id: u32, process_id: ProcessId) -> Self {
        Self {
            context_id,
            capset_id,
            process_id,
            name: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// Shared-memory channel endpoint: same lifecycle contract as a render
/// channel (create / destroy / pre-save / save / post-save / post-load
/// thread registration), different transport.
#[derive(Debug)]
pub struct ConsumerContext {
    context_id: u32,
    capset_id: u32,
    process_id: ProcessId,
    name: Option<String>,
    ring: Arc<CommandRing>,
    thread: Mutex<Option<RenderThread>>,
}

impl ConsumerContext {
    pub(crate) fn new(desc: &ConsumerDescriptor) -> Self {
        Self {
            context_id: desc.context_id,
            capset_id: desc.capset_id,
            process_id: desc.process_id,
            name: desc.name.clone(),
            ring: Arc::new(CommandRing::new(desc.ring_capacity)),
            thread: Mutex::new(None),
        }
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn ring(&self) -> &Arc<CommandRing> {
        &self.ring
    }

    pub(crate) fn attach_thread(&self, thread: RenderThread) {
        *self.thread.lock().expect("consumer thread slot poisoned") = Some(thread);
    }

    pub(crate) fn take_thread(&self) -> Option<RenderThread> {
        self.thread
            .lock()
            .expect("consumer thread slot poisoned")
            .take()
    }

    pub(crate) fn has_thread(&self) -> bool {
        self.thread
            .lock()
            .expect("consumer thread slot poisoned")
            .is_some()
    }

    /// Persist the binding; ring contents live in guest-visible shared
    /// memory and are saved with guest RAM, not here.
    pub(crate) fn encode<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_u32_le(self.context_id)?;
        w.write_u32_le(self.capset_id)?;
        w.write_u64_le(self.process_id.0)?;
        match &self.name {
            Some(name) => {
                w.write_u8(1)?;
                w.write_string_u32(name)?;
            }
            None => w.write_u8(0)?,
        }
        Ok(())
    }

    pub(crate) fn decode<R: Read>(r: &mut R) -> Result<ConsumerDescriptor, SnapshotError> {
        let context_id = r.read_u32_le()?;
        let capset_id = r.read_u32_le()?;
        let raw_pid = r.read_u64_le()?;
        if raw_pid == 0 {
            return Err(SnapshotError::Corrupt("reserved process id zero"));
        }
        let name = if r.read_u8()? != 0 {
            Some(r.read_string_u32()?)
        } else {
            None
        };
        Ok(ConsumerDescriptor {
            context_id,
            capset_id,
            process_id: ProcessId(raw_pid),
            name,
            ring_capacity: DEFAULT_RING_CAPACITY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_delivers_records_in_order() {
        let ring = CommandRing::new(64);
        ring.try_push(&[1, 2]).unwrap();
        ring.try_push(&[3]).unwrap();
        assert_eq!(ring.pop_blocking(), Some(vec![1, 2]));
        assert_eq!(ring.pop_blocking(), Some(vec![3]));
    }

    #[test]
    fn ring_bounds_are_enforced() {
        let ring = CommandRing::new(16);
        assert_eq!(ring.try_push(&[0u8; 16]), Err(RingPushError::TooLarge));

        ring.try_push(&[0u8; 8]).unwrap();
        assert_eq!(ring.try_push(&[0u8; 8]), Err(RingPushError::Full));

        // Draining frees the space again.
        assert_eq!(ring.pop_blocking().unwrap().len(), 8);
        ring.try_push(&[0u8; 8]).unwrap();
    }

    #[test]
    fn stopped_ring_rejects_and_unblocks() {
        let ring = CommandRing::new(64);
        ring.stop();
        assert_eq!(ring.try_push(&[1]), Err(RingPushError::Full));
        assert_eq!(ring.pop_blocking(), None);
    }

    #[test]
    fn consumer_binding_round_trips() {
        let mut desc = ConsumerDescriptor::new(12, 3, ProcessId(44));
        desc.name = Some("compositor".to_owned());
        let consumer = ConsumerContext::new(&desc);

        let mut bytes = Vec::new();
        consumer.encode(&mut bytes).unwrap();
        let restored = ConsumerContext::decode(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored.context_id, 12);
        assert_eq!(restored.capset_id, 3);
        assert_eq!(restored.process_id, ProcessId(44));
        assert_eq!(restored.name.as_deref(), Some("compositor"));
    }
}
