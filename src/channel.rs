use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use bitflags::bitflags;
use thiserror::Error;

use gfxmux_process::ProcessId;

use crate::render_thread::RenderThread;

bitflags! {
    /// Poll/lifecycle bits for one render channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelState: u8 {
        /// Host-to-guest data is waiting to be read.
        const READABLE = 1 << 0;
        /// The guest may submit more work.
        const WRITABLE = 1 << 1;
        /// The channel was stopped; pending work is dropped.
        const STOPPED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("render channel is stopped")]
pub struct ChannelStopped;

#[derive(Debug, Default)]
struct Queues {
    /// Guest-to-host command buffers, drained in order by the render thread.
    to_host: VecDeque<Vec<u8>>,
    /// Host-to-guest replies.
    to_guest: VecDeque<Vec<u8>>,
    stopped: bool,
    paused: bool,
}

/// One guest rendering context's connection to the host: an ordered,
/// reliable, bidirectional command stream bound to a process id, owning
/// exactly one render thread.
///
/// Ordering within the channel is enforced by the single render thread
/// draining `to_host`; there is no ordering guarantee across channels.
#[derive(Debug)]
pub struct RenderChannel {
    process_id: ProcessId,
    context_id: u32,
    queues: Mutex<Queues>,
    cond: Condvar,
    thread: Mutex<Option<RenderThread>>,
}

impl RenderChannel {
    pub(crate) fn new(process_id: ProcessId, context_id: u32) -> Self {
        Self {
            process_id,
            context_id,
            queues: Mutex::new(Queues::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn state(&self) -> ChannelState {
        let queues = self.queues.lock().expect("channel queues poisoned");
        let mut state = ChannelState::empty();
        if !queues.to_guest.is_empty() {
            state |= ChannelState::READABLE;
        }
        if queues.stopped {
            state |= ChannelState::STOPPED;
        } else {
            state |= ChannelState::WRITABLE;
        }
        state
    }

    /// Submit one command buffer from the guest side.
    pub fn guest_send(&self, commands: Vec<u8>) -> Result<(), ChannelStopped> {
        let mut queues = self.queues.lock().expect("channel queues poisoned");
        if queues.stopped {
            return Err(ChannelStopped);
        }
        queues.to_host.push_back(commands);
        self.cond.notify_all();
        Ok(())
    }

    /// Non-blocking read of the next host-to-guest reply.
    pub fn guest_recv(&self) -> Option<Vec<u8>> {
        self.queues
            .lock()
            .expect("channel queues poisoned")
            .to_guest
            .pop_front()
    }

    /// Blocking read on the host side; `None` once the channel stops.
    ///
    /// Stopping wins over pending work: a stopped channel drops whatever the
    /// guest had queued, so `stop(wait)` is bounded by the in-flight call,
    /// not the backlog.
    pub(crate) fn host_recv_blocking(&self) -> Option<Vec<u8>> {
        let mut queues = self.queues.lock().expect("channel queues poisoned");
        loop {
            if queues.stopped {
                return None;
            }
            if !queues.paused {
                if let Some(buf) = queues.to_host.pop_front() {
                    return Some(buf);
                }
            }
            queues = self.cond.wait(queues).expect("channel queues poisoned");
        }
    }

    pub(crate) fn host_send(&self, reply: Vec<u8>) -> Result<(), ChannelStopped> {
        let mut queues = self.queues.lock().expect("channel queues poisoned");
        if queues.stopped {
            return Err(ChannelStopped);
        }
        queues.to_guest.push_back(reply);
        Ok(())
    }

    /// Transition to stopped. Idempotent; wakes the render thread so it can
    /// exit.
    pub fn stop(&self) {
        let mut queues = self.queues.lock().expect("channel queues poisoned");
        queues.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.queues.lock().expect("channel queues poisoned").stopped
    }

    /// Quiesce (or resume) the render thread around a snapshot boundary.
    pub(crate) fn set_paused(&self, paused: bool) {
        let mut queues = self.queues.lock().expect("channel queues poisoned");
        queues.paused = paused;
        self.cond.notify_all();
    }

    pub(crate) fn attach_thread(&self, thread: RenderThread) {
        *self.thread.lock().expect("channel thread slot poisoned") = Some(thread);
    }

    pub(crate) fn take_thread(&self) -> Option<RenderThread> {
        self.thread.lock().expect("channel thread slot poisoned").take()
    }
}
