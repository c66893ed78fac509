//! The three task queues shared by a whole tree.
//!
//! `eval_async` tasks are drained at the start of the next digest, before any
//! watcher runs. `apply_async` tasks are coalesced into a single apply.
//! `post_digest` tasks run once after the next digest stabilizes.
//!
//! The first two schedule a deferred callback through the configured
//! [`Scheduler`](crate::Scheduler) so queued work is never stranded; a digest
//! that gets there first cancels it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{ErrorCause, ScopeError};
use crate::expression::Locals;
use crate::runtime::Shared;
use crate::scheduler::DeferToken;
use crate::scope::{Scope, ScopeId};
use crate::watch::ListenerResult;

pub(crate) type ScopeTask = Box<dyn FnOnce(&Scope) -> anyhow::Result<()> + Send>;
pub(crate) type PostDigestTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

pub(crate) struct QueuedTask {
    pub key: usize,
    pub id: ScopeId,
    pub task: ScopeTask,
}

/// State of one deferred flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Deferral {
    #[default]
    Idle,
    /// Scheduled. The token is `None` while `defer` has not returned yet.
    Pending(Option<DeferToken>),
}

impl Deferral {
    /// Returns true if a callback has to be scheduled.
    fn arm(&mut self) -> bool {
        match self {
            Deferral::Idle => {
                *self = Deferral::Pending(None);
                true
            }
            Deferral::Pending(_) => false,
        }
    }

    /// Store the token of the callback scheduled by [`Deferral::arm`]. Returns
    /// false if the flush already happened, in which case the caller cancels.
    fn record(&mut self, token: DeferToken) -> bool {
        match self {
            Deferral::Pending(slot @ None) => {
                *slot = Some(token);
                true
            }
            _ => false,
        }
    }

    /// Back to idle; returns the token to cancel, if any.
    pub fn disarm(&mut self) -> Option<DeferToken> {
        match std::mem::take(self) {
            Deferral::Pending(token) => token,
            Deferral::Idle => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Queues {
    pub eval_async: VecDeque<QueuedTask>,
    pub apply_async: VecDeque<QueuedTask>,
    pub post_digest: VecDeque<PostDigestTask>,
    pub eval_async_flush: Deferral,
    pub apply_async_flush: Deferral,
}

impl Queues {
    /// Drop every queued task. Returns the tokens of callbacks to cancel.
    pub fn clear(&mut self) -> Vec<DeferToken> {
        self.eval_async.clear();
        self.apply_async.clear();
        self.post_digest.clear();
        [self.eval_async_flush.disarm(), self.apply_async_flush.disarm()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Flush {
    EvalAsync,
    ApplyAsync,
}

impl Flush {
    fn deferral(self, queues: &mut Queues) -> &mut Deferral {
        match self {
            Flush::EvalAsync => &mut queues.eval_async_flush,
            Flush::ApplyAsync => &mut queues.apply_async_flush,
        }
    }
}

fn boxed_task<F, R>(task: F) -> ScopeTask
where
    F: FnOnce(&Scope) -> R + Send + 'static,
    R: ListenerResult,
{
    Box::new(move |scope| task(scope).into_result())
}

impl Scope {
    /// Queue `task` to run against this scope at the start of the next digest.
    ///
    /// Tasks queued while a digest runs are drained by that same digest.
    /// Otherwise a digest of the root is deferred through the scheduler. Does
    /// nothing on a destroyed scope.
    pub fn eval_async<F, R>(&self, task: F)
    where
        F: FnOnce(&Scope) -> R + Send + 'static,
        R: ListenerResult,
    {
        self.enqueue(Flush::EvalAsync, boxed_task(task));
    }

    /// Parse `expression` and queue its evaluation like [`Scope::eval_async`].
    pub fn eval_async_expr(&self, expression: &str, locals: Option<Locals>) -> Result<(), ScopeError> {
        let expression = self.shared.evaluator.parse(expression)?;
        self.eval_async(move |scope| {
            expression.evaluate(scope, locals.as_ref());
        });
        Ok(())
    }

    /// Queue `task` for a coalesced apply.
    ///
    /// Every task queued before the deferred flush runs inside one apply, so a
    /// burst of calls costs a single digest. A digest of the root that happens
    /// first runs the queued tasks itself and cancels the flush.
    pub fn apply_async<F, R>(&self, task: F)
    where
        F: FnOnce(&Scope) -> R + Send + 'static,
        R: ListenerResult,
    {
        self.enqueue(Flush::ApplyAsync, boxed_task(task));
    }

    /// Parse `expression` and queue its evaluation like [`Scope::apply_async`].
    pub fn apply_async_expr(&self, expression: &str, locals: Option<Locals>) -> Result<(), ScopeError> {
        let expression = self.shared.evaluator.parse(expression)?;
        self.apply_async(move |scope| {
            expression.evaluate(scope, locals.as_ref());
        });
        Ok(())
    }

    /// Run `task` once, after the next digest stabilizes.
    ///
    /// Nothing is scheduled: the task waits for a digest to happen.
    pub fn post_digest<F, R>(&self, task: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: ListenerResult,
    {
        let mut state = self.shared.state.lock();
        if !state.tree.is_live(self.key, self.id) {
            return;
        }
        state
            .queues
            .post_digest
            .push_back(Box::new(move || task().into_result()));
    }

    fn enqueue(&self, flush: Flush, task: ScopeTask) {
        let schedule = {
            let mut state = self.shared.state.lock();
            if !state.tree.is_live(self.key, self.id) {
                return;
            }
            let entry = QueuedTask {
                key: self.key,
                id: self.id,
                task,
            };
            match flush {
                Flush::EvalAsync => state.queues.eval_async.push_back(entry),
                Flush::ApplyAsync => state.queues.apply_async.push_back(entry),
            }
            // A running digest or apply drains the queue itself.
            match flush {
                Flush::EvalAsync if state.phase.is_some() => false,
                _ => flush.deferral(&mut state.queues).arm(),
            }
        };
        if schedule {
            defer_flush(&self.shared, flush);
        }
    }
}

fn defer_flush(shared: &Arc<Shared>, flush: Flush) {
    let weak = Arc::downgrade(shared);
    let token = shared.scheduler.defer(Box::new(move || {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match flush {
            Flush::EvalAsync => run_deferred_digest(&shared),
            Flush::ApplyAsync => run_deferred_apply(&shared),
        }
    }));
    let kept = flush.deferral(&mut shared.state.lock().queues).record(token);
    if !kept {
        shared.scheduler.cancel(token);
    }
}

fn run_deferred_digest(shared: &Arc<Shared>) {
    let pending = {
        let mut state = shared.state.lock();
        state.queues.eval_async_flush.disarm();
        state.phase.is_none() && !state.queues.eval_async.is_empty()
    };
    if !pending {
        return;
    }
    tracing::debug!("deferred evalAsync digest");
    if let Err(err) = shared.root().digest() {
        if !err.is_in_progress() {
            shared.report(&err, ErrorCause::DeferredDigest);
        }
    }
}

fn run_deferred_apply(shared: &Arc<Shared>) {
    let ready = {
        let mut state = shared.state.lock();
        state.queues.apply_async_flush.disarm();
        state.phase.is_none()
    };
    // The running digest re-arms the flush when it finishes.
    if !ready {
        return;
    }
    tracing::debug!("deferred applyAsync flush");
    let root = shared.root();
    let flushed = root.apply_unreported(|_| {
        flush_apply_async(shared);
        Ok(())
    });
    if let Err(err) = flushed {
        if !err.is_in_progress() {
            shared.report(&err, ErrorCause::DeferredDigest);
        }
    }
}

/// Schedule a flush for applyAsync tasks left queued with no flush pending.
pub(crate) fn rearm_apply_async(shared: &Arc<Shared>) {
    let schedule = {
        let mut state = shared.state.lock();
        !state.queues.apply_async.is_empty() && state.queues.apply_async_flush.arm()
    };
    if schedule {
        defer_flush(shared, Flush::ApplyAsync);
    }
}

/// Run every queued applyAsync task. One failing task does not stop the rest.
pub(crate) fn flush_apply_async(shared: &Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            let Some(entry) = state.queues.apply_async.pop_front() else {
                return;
            };
            let alive = state.tree.is_live(entry.key, entry.id);
            (entry, alive)
        };
        let (entry, alive) = next;
        if !alive {
            continue;
        }
        let scope = shared.handle(entry.key, entry.id);
        if let Err(err) = (entry.task)(&scope) {
            shared.report(&ScopeError::task(err), ErrorCause::ApplyAsync);
        }
    }
}

/// Run queued evalAsync tasks until the queue is empty, including tasks queued
/// by the tasks themselves.
pub(crate) fn drain_eval_async(shared: &Arc<Shared>) {
    loop {
        let (entry, alive) = {
            let mut state = shared.state.lock();
            let Some(entry) = state.queues.eval_async.pop_front() else {
                return;
            };
            state.last_dirty_watch = None;
            let alive = state.tree.is_live(entry.key, entry.id);
            (entry, alive)
        };
        if !alive {
            continue;
        }
        let scope = shared.handle(entry.key, entry.id);
        if let Err(err) = (entry.task)(&scope) {
            shared.report(&ScopeError::task(err), ErrorCause::EvalAsync);
        }
    }
}

/// Run postDigest tasks in FIFO order, including tasks they queue.
pub(crate) fn drain_post_digest(shared: &Arc<Shared>) {
    loop {
        let Some(task) = shared.state.lock().queues.post_digest.pop_front() else {
            return;
        };
        if let Err(err) = task() {
            shared.report(&ScopeError::task(err), ErrorCause::PostDigest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferral_state_machine() {
        let mut deferral = Deferral::default();
        assert!(deferral.arm());
        assert!(!deferral.arm());
        assert!(deferral.record(DeferToken(7)));
        assert_eq!(deferral.disarm(), Some(DeferToken(7)));
        assert_eq!(deferral, Deferral::Idle);
    }

    #[test]
    fn test_record_after_flush_asks_for_cancel() {
        let mut deferral = Deferral::default();
        assert!(deferral.arm());
        // The callback ran inline before `defer` returned.
        assert_eq!(deferral.disarm(), None);
        assert!(!deferral.record(DeferToken(1)));
    }
}
