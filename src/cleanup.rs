use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use gfxmux_process::ProcessId;

enum CleanupMsg {
    Run(ProcessId),
    Shutdown,
}

#[derive(Default)]
struct PendingState {
    queued: u64,
}

/// Handle for enqueueing cleanup work and waiting for it to drain.
///
/// Cloned into the process tracker's exit callback; cheap to clone.
#[derive(Clone)]
pub(crate) struct CleanupQueue {
    tx: Sender<CleanupMsg>,
    pending: Arc<(Mutex<PendingState>, Condvar)>,
}

impl CleanupQueue {
    pub(crate) fn enqueue(&self, id: ProcessId) {
        {
            let (state, _) = &*self.pending;
            state.lock().expect("cleanup state poisoned").queued += 1;
        }
        if self.tx.send(CleanupMsg::Run(id)).is_err() {
            // Worker already shut down; nothing left that could leak.
            warn!(%id, "cleanup requested after worker shutdown");
            let (state, cond) = &*self.pending;
            state.lock().expect("cleanup state poisoned").queued -= 1;
            cond.notify_all();
        }
    }

    /// Block until every cleanup queued before this call has completed.
    ///
    /// Used to make snapshot points deterministic: no cleanup work may
    /// straddle a save boundary.
    pub(crate) fn wait_idle(&self) {
        let (state, cond) = &*self.pending;
        let mut guard = state.lock().expect("cleanup state poisoned");
        while guard.queued > 0 {
            guard = cond.wait(guard).expect("cleanup state poisoned");
        }
    }
}

/// Dedicated background thread draining process-exit notifications.
///
/// Decoupled from the render threads so a slow cleanup never blocks command
/// submission on unrelated channels. Work is not cancellable once dispatched;
/// it must run to completion or objects leak.
pub(crate) struct CleanupWorker {
    queue: CleanupQueue,
    handle: Option<JoinHandle<()>>,
}

impl CleanupWorker {
    pub(crate) fn spawn(
        run: impl Fn(ProcessId) + Send + 'static,
    ) -> std::io::Result<CleanupWorker> {
        let (tx, rx) = mpsc::channel();
        let pending: Arc<(Mutex<PendingState>, Condvar)> = Arc::default();

        let handle = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("process-cleanup".to_owned())
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            CleanupMsg::Run(id) => {
                                debug!(%id, "cleanup worker reclaiming process resources");
                                run(id);
                                let (state, cond) = &*pending;
                                state.lock().expect("cleanup state poisoned").queued -= 1;
                                cond.notify_all();
                            }
                            CleanupMsg::Shutdown => break,
                        }
                    }
                })?
        };

        Ok(CleanupWorker {
            queue: CleanupQueue { tx, pending },
            handle: Some(handle),
        })
    }

    pub(crate) fn queue(&self) -> CleanupQueue {
        self.queue.clone()
    }

    /// Drain outstanding work, then stop and join the worker thread.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.queue.wait_idle();
        let _ = self.queue.tx.send(CleanupMsg::Shutdown);
        if handle.join().is_err() {
            warn!("cleanup worker panicked during shutdown");
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
