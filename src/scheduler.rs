//! Boundary to the platform's deferred-callback primitive.
//!
//! The engine defers two things: the automatic digest after `eval_async`
//! and the coalesced flush after `apply_async`. Both are cancelled when a
//! digest gets there first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Work handed to a [`Scheduler`].
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by [`Scheduler::defer`], used to cancel the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferToken(pub u64);

/// Runs callbacks at some later point, outside the current call stack.
pub trait Scheduler: Send + Sync + 'static {
    /// Queue `task` to run later.
    fn defer(&self, task: DeferredTask) -> DeferToken;

    /// Cancel a queued task. Returns false if it already ran or was cancelled.
    fn cancel(&self, token: DeferToken) -> bool;
}

/// Scheduler whose queue is drained explicitly by the host's event loop.
///
/// Nothing runs until [`ManualScheduler::flush`] is called, which makes it the
/// natural choice for tests and for hosts that own their own loop.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<(DeferToken, DeferredTask)>>,
    next_token: AtomicU64,
}

impl ManualScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued callbacks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run queued callbacks in FIFO order, including callbacks queued while
    /// flushing. Returns how many ran.
    pub fn flush(&self) -> usize {
        let mut ran = 0;
        loop {
            // The lock must be released before the task runs; tasks defer more work.
            let next = self.queue.lock().pop_front();
            let Some((_, task)) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn defer(&self, task: DeferredTask) -> DeferToken {
        let token = DeferToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.queue.lock().push_back((token, task));
        token
    }

    fn cancel(&self, token: DeferToken) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}
