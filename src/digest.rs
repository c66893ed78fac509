//! The digest loop and `apply`.

use std::sync::Arc;

use crate::error::{ErrorCause, Phase, ScopeError, WatchLogEntry};
use crate::expression::{Getter, Locals};
use crate::node::{Equality, WatchId, WatchListenerFn};
use crate::queue::{drain_eval_async, drain_post_digest, flush_apply_async, rearm_apply_async};
use crate::runtime::PhaseGuard;
use crate::scope::{Scope, ScopeId};
use crate::tracer::{DigestOutcome, SpanId};
use crate::value::Value;
use crate::watch::remove_watch;

/// Iterations recorded for the unstable-digest diagnostic.
const WATCH_LOG_DEPTH: usize = 5;

struct WatchSnapshot {
    id: WatchId,
    getter: Getter,
    listener: Arc<WatchListenerFn>,
    equality: Equality,
    last: Option<Value>,
}

enum Slot {
    Watch(WatchSnapshot),
    Removed,
    End,
}

impl Scope {
    /// Run watchers of this scope and its descendants until nothing changes.
    ///
    /// Queued `eval_async` tasks are drained before every pass; if any are
    /// queued when the digest starts, the whole tree is digested instead. After
    /// the tree settles, `post_digest` tasks run.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::InProgress`] if a digest or apply is already running.
    ///   This is also reported to the error sink.
    /// - [`ScopeError::UnstableDigest`] if watchers still change after the
    ///   configured number of extra passes.
    pub fn digest(&self) -> Result<(), ScopeError> {
        let shared = &self.shared;
        let (target, target_id, tokens, flush_apply) = {
            let mut state = shared.state.lock();
            if let Some(phase) = state.phase {
                drop(state);
                return Err(self.reject(phase));
            }
            if !state.tree.is_live(self.key, self.id) {
                return Ok(());
            }
            state.phase = Some(Phase::Digest);

            let (target, target_id) = if state.queues.eval_async.is_empty() {
                (self.key, self.id)
            } else {
                state.tree.root()
            };
            let mut tokens: Vec<_> = state.queues.eval_async_flush.disarm().into_iter().collect();
            let flush_apply =
                (target, target_id) == state.tree.root() && !state.queues.apply_async.is_empty();
            if flush_apply {
                tokens.extend(state.queues.apply_async_flush.disarm());
            }
            state.last_dirty_watch = None;
            (target, target_id, tokens, flush_apply)
        };
        let guard = PhaseGuard::armed(shared);

        for token in tokens {
            shared.scheduler.cancel(token);
        }
        if flush_apply {
            flush_apply_async(shared);
        }

        let span = shared.tracer.new_span_id();
        shared.tracer.on_digest_start(span, target_id);
        tracing::debug!(target_scope = %target_id, "digest start");

        let mut ttl = shared.ttl;
        let mut watch_log: Vec<Vec<WatchLogEntry>> = vec![Vec::new(); WATCH_LOG_DEPTH];
        let mut passes = 0;
        let outcome = loop {
            drain_eval_async(shared);

            passes += 1;
            shared.tracer.on_digest_pass(span, passes);
            tracing::trace!(pass = passes, "digest pass");

            let log = if ttl < WATCH_LOG_DEPTH {
                Some(&mut watch_log[WATCH_LOG_DEPTH - 1 - ttl])
            } else {
                None
            };
            let dirty = self.walk(target, span, log);

            let again = dirty || !shared.state.lock().queues.eval_async.is_empty();
            if !again {
                break Ok(passes);
            }
            if ttl == 0 {
                break Err(ScopeError::UnstableDigest {
                    ttl: shared.ttl,
                    log: watch_log.into_iter().filter(|it| !it.is_empty()).collect(),
                });
            }
            ttl -= 1;
        };

        drop(guard);
        // A deferred applyAsync flush that fired during this digest stood down.
        rearm_apply_async(shared);

        match outcome {
            Ok(passes) => {
                shared
                    .tracer
                    .on_digest_end(span, DigestOutcome::Stable { passes });
                tracing::debug!(target_scope = %target_id, passes, "digest done");
                drain_post_digest(shared);
                Ok(())
            }
            Err(err) => {
                shared.tracer.on_digest_end(span, DigestOutcome::Unstable);
                tracing::warn!(ttl = shared.ttl, "digest did not stabilize");
                Err(err)
            }
        }
    }

    /// One pre-order pass over the subtree rooted at `target`. Returns true if
    /// any watcher fired.
    fn walk(&self, target: usize, span: SpanId, mut log: Option<&mut Vec<WatchLogEntry>>) -> bool {
        let shared = &self.shared;
        if shared.state.lock().tree.is_suspended_lineage(target) {
            return false;
        }

        let mut dirty = false;
        let mut current = Some(target);
        'walk: while let Some(key) = current {
            let visit = {
                let state = shared.state.lock();
                state
                    .tree
                    .node(key)
                    .filter(|node| !node.destroyed && !node.suspended)
                    .map(|node| node.id)
            };

            if let Some(node_id) = visit {
                let scope = shared.handle(key, node_id);
                let mut index = 0;
                loop {
                    let watch = match self.watch_at(key, node_id, index) {
                        Slot::End => break,
                        Slot::Removed => {
                            index += 1;
                            continue;
                        }
                        Slot::Watch(watch) => watch,
                    };

                    let value = watch.getter.get(&scope);
                    let changed = match &watch.last {
                        None => true,
                        Some(last) => !watch.equality.equal(&value, last),
                    };

                    if changed {
                        dirty = true;
                        self.record_last(key, node_id, index, watch.id, &value);
                        let old = watch.last.unwrap_or_else(|| value.clone());
                        if let Some(log) = log.as_deref_mut() {
                            log.push(WatchLogEntry {
                                description: watch.getter.description().to_string(),
                                new_value: value.clone(),
                                old_value: old.clone(),
                            });
                        }
                        shared
                            .tracer
                            .on_watch_fired(span, node_id, watch.getter.description());
                        if let Err(err) = (watch.listener)(&value, &old, &scope) {
                            shared.report(&ScopeError::task(err), ErrorCause::WatchListener);
                        }
                        if watch.getter.is_constant() {
                            remove_watch(shared, key, node_id, watch.id);
                        }
                    } else if shared.state.lock().last_dirty_watch == Some(watch.id) {
                        // Everything since the last change has been seen clean.
                        dirty = false;
                        break 'walk;
                    }
                    index += 1;
                }
            }

            current = shared.state.lock().tree.next_preorder(key, target, |node| {
                !node.suspended && node.watcher_count > 0
            });
        }
        dirty
    }

    fn watch_at(&self, key: usize, node_id: ScopeId, index: usize) -> Slot {
        let state = self.shared.state.lock();
        let Some(node) = state.tree.live(key, node_id) else {
            return Slot::End;
        };
        match node.watchers.get(index) {
            None => Slot::End,
            Some(None) => Slot::Removed,
            Some(Some(entry)) => Slot::Watch(WatchSnapshot {
                id: entry.id,
                getter: entry.getter.clone(),
                listener: entry.listener.clone(),
                equality: entry.equality,
                last: entry.last.clone(),
            }),
        }
    }

    fn record_last(&self, key: usize, node_id: ScopeId, index: usize, id: WatchId, value: &Value) {
        let mut state = self.shared.state.lock();
        state.last_dirty_watch = Some(id);
        if let Some(Some(entry)) = state
            .tree
            .live_mut(key, node_id)
            .and_then(|node| node.watchers.get_mut(index))
        {
            if entry.id == id {
                entry.last = Some(value.clone());
            }
        }
    }

    fn reject(&self, phase: Phase) -> ScopeError {
        let err = ScopeError::InProgress { phase };
        tracing::warn!(scope = %self.id, %phase, "rejected re-entrant call");
        self.shared.report(&err, ErrorCause::Reentrancy);
        err
    }

    /// Run `f`, then digest the whole tree.
    ///
    /// An error returned by `f` is reported to the error sink and yields
    /// `Ok(None)`; the digest still runs. On a destroyed scope nothing runs.
    ///
    /// # Errors
    ///
    /// [`ScopeError::InProgress`] when called from inside a digest or apply,
    /// and [`ScopeError::UnstableDigest`] when the digest does not settle. Both
    /// are also reported to the error sink.
    pub fn apply<F, R>(&self, f: F) -> Result<Option<R>, ScopeError>
    where
        F: FnOnce(&Scope) -> anyhow::Result<R>,
    {
        match self.apply_unreported(f) {
            Err(err) if err.is_unstable_digest() => {
                self.shared.report(&err, ErrorCause::Digest);
                Err(err)
            }
            other => other,
        }
    }

    /// [`Scope::apply`] without reporting an unstable digest.
    pub(crate) fn apply_unreported<F, R>(&self, f: F) -> Result<Option<R>, ScopeError>
    where
        F: FnOnce(&Scope) -> anyhow::Result<R>,
    {
        {
            let mut state = self.shared.state.lock();
            if let Some(phase) = state.phase {
                drop(state);
                return Err(self.reject(phase));
            }
            if !state.tree.is_live(self.key, self.id) {
                return Ok(None);
            }
            state.phase = Some(Phase::Apply);
        }

        let value = {
            let _guard = PhaseGuard::armed(&self.shared);
            match f(self) {
                Ok(value) => Some(value),
                Err(err) => {
                    self.shared.report(&ScopeError::task(err), ErrorCause::Apply);
                    None
                }
            }
        };
        self.root().digest()?;
        Ok(value)
    }

    /// Evaluate `expression` with the configured evaluator, then digest the
    /// whole tree.
    pub fn apply_expr(&self, expression: &str, locals: Option<&Locals>) -> Result<Option<Value>, ScopeError> {
        let expression = self.shared.evaluator.parse(expression)?;
        self.apply(|scope| Ok(expression.evaluate(scope, locals)))
    }

    /// Evaluate `expression` against this scope. No digest runs.
    pub fn eval(&self, expression: &str, locals: Option<&Locals>) -> Result<Value, ScopeError> {
        let expression = self.shared.evaluator.parse(expression)?;
        Ok(expression.evaluate(self, locals))
    }

    /// Run `f` against this scope. No digest runs.
    pub fn eval_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Scope) -> R,
    {
        f(self)
    }
}
