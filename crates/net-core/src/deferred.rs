use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::reactor::Reactor;

/// Work queued from the reactor thread itself: timer-callback destructors,
/// "unregister me" requests raised mid-dispatch, and anything else that must
/// not run on the same stack frame that is iterating a registry.
pub type DeferredWork = Box<dyn FnOnce(&Reactor)>;

/// Work queued from a foreign thread via `Handle::post_atomic`.
///
/// The closure's captured environment must be `Send` (it crosses threads),
/// but the `&Reactor` argument handed to it at invocation time does not need
/// to be `Send` itself -- it is only ever called back on the reactor thread.
pub type AtomicWork = Box<dyn FnOnce(&Reactor) + Send>;

#[derive(Default)]
pub struct DeferredQueue {
    queue: VecDeque<DeferredWork>,
}

impl DeferredQueue {
    pub fn push(&mut self, work: DeferredWork) {
        self.queue.push_back(work);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains everything currently queued, in FIFO order. Work enqueued by a
    /// callback that runs during this drain is left for the *next* drain
    /// call, which is how the reactor's fixed-point loop converges instead
    /// of spinning forever on self-perpetuating deferred work.
    pub fn drain(&mut self) -> Vec<DeferredWork> {
        self.queue.drain(..).collect()
    }
}

/// Cross-thread mailbox. A foreign thread locks, pushes, unlocks and then
/// wakes the poller via `mio::Waker`; the reactor thread swaps the inner
/// `Vec` out from under the lock and runs the drained work lock-free.
#[derive(Clone)]
pub struct AtomicQueue {
    inner: Arc<Mutex<Vec<AtomicWork>>>,
}

impl AtomicQueue {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn push(&self, work: AtomicWork) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push(work);
    }

    /// Swaps out the pending work under the lock and returns it, leaving the
    /// mailbox empty for the next round of cross-thread posts.
    pub fn drain(&self) -> Vec<AtomicWork> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }
}

impl Default for AtomicQueue {
    fn default() -> Self {
        Self::new()
    }
}
