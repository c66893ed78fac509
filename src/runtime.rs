//! Shared runtime state and its builder.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorCause, ErrorSink, Phase, ScopeError, TracingErrorSink};
use crate::expression::{Evaluator, PathEvaluator};
use crate::node::{ListenerId, WatchId};
use crate::queue::Queues;
use crate::scheduler::{ManualScheduler, Scheduler};
use crate::scope::{next_scope_id, Scope, ScopeId};
use crate::tracer::{NoopTracer, Tracer};
use crate::tree::Tree;

/// Default digest iteration ceiling.
pub const DEFAULT_DIGEST_TTL: usize = 10;

/// Everything one scope tree shares. Every [`Scope`] handle holds an `Arc` to it.
///
/// The tree lock is never held while user code runs.
pub(crate) struct Shared {
    pub(crate) state: Mutex<TreeState>,
    pub(crate) ttl: usize,
    pub(crate) error_sink: Arc<dyn ErrorSink>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) tracer: Arc<dyn Tracer>,
}

impl Shared {
    pub(crate) fn report(&self, error: &ScopeError, cause: ErrorCause) {
        self.error_sink.report(error, cause);
    }

    pub(crate) fn handle(self: &Arc<Self>, key: usize, id: ScopeId) -> Scope {
        Scope {
            shared: self.clone(),
            key,
            id,
        }
    }

    pub(crate) fn root(self: &Arc<Self>) -> Scope {
        let (key, id) = self.state.lock().tree.root();
        self.handle(key, id)
    }
}

pub(crate) struct TreeState {
    pub(crate) tree: Tree,
    pub(crate) phase: Option<Phase>,
    /// Number of event dispatches currently walking the tree.
    pub(crate) dispatch_depth: usize,
    /// Last watch seen dirty by the running digest; reset whenever the set of
    /// watches or their inputs may have changed behind the digest's back.
    pub(crate) last_dirty_watch: Option<WatchId>,
    pub(crate) queues: Queues,
    next_watch: u64,
    next_listener: u64,
}

impl TreeState {
    fn new(tree: Tree) -> Self {
        Self {
            tree,
            phase: None,
            dispatch_depth: 0,
            last_dirty_watch: None,
            queues: Queues::default(),
            next_watch: 0,
            next_listener: 0,
        }
    }

    /// Something may be holding indices into watcher or listener lists.
    pub(crate) fn is_busy(&self) -> bool {
        self.phase.is_some() || self.dispatch_depth > 0
    }

    /// Compact and free buried nodes if nothing is walking.
    pub(crate) fn settle(&mut self) {
        if !self.is_busy() {
            self.tree.collect_garbage();
        }
    }

    pub(crate) fn next_watch_id(&mut self) -> WatchId {
        self.next_watch += 1;
        WatchId(self.next_watch)
    }

    pub(crate) fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }
}

/// Clears the active phase when dropped, including on early return.
pub(crate) struct PhaseGuard<'a> {
    shared: &'a Shared,
}

impl<'a> PhaseGuard<'a> {
    /// Caller must already have set the phase under the lock.
    pub(crate) fn armed(shared: &'a Shared) -> Self {
        Self { shared }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.phase = None;
        state.settle();
    }
}

/// Tracks an in-flight event dispatch.
pub(crate) struct DispatchGuard<'a> {
    shared: &'a Shared,
}

impl<'a> DispatchGuard<'a> {
    pub(crate) fn enter(shared: &'a Shared) -> Self {
        shared.state.lock().dispatch_depth += 1;
        Self { shared }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.dispatch_depth -= 1;
        state.settle();
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a scope tree with customizable collaborators.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use scope_flow::{CollectingErrorSink, ManualScheduler, Scope};
///
/// let errors = Arc::new(CollectingErrorSink::new());
/// let scheduler = Arc::new(ManualScheduler::new());
/// let root = Scope::builder()
///     .digest_ttl(20)
///     .error_sink(errors.clone())
///     .scheduler(scheduler.clone())
///     .build();
/// assert!(root.is_root());
/// ```
pub struct ScopeRuntimeBuilder {
    digest_ttl: usize,
    error_sink: Arc<dyn ErrorSink>,
    scheduler: Arc<dyn Scheduler>,
    evaluator: Arc<dyn Evaluator>,
    tracer: Arc<dyn Tracer>,
}

impl Default for ScopeRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeRuntimeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            digest_ttl: DEFAULT_DIGEST_TTL,
            error_sink: Arc::new(TracingErrorSink),
            scheduler: Arc::new(ManualScheduler::new()),
            evaluator: Arc::new(PathEvaluator),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Set how many extra passes a digest may take before it is declared
    /// unstable.
    pub fn digest_ttl(mut self, ttl: usize) -> Self {
        self.digest_ttl = ttl;
        self
    }

    /// Set the channel for caught errors.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Set the deferred-callback primitive.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the expression evaluator used by the `*_expr` methods.
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Set the tracer.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the tree and return its root scope.
    pub fn build(self) -> Scope {
        let id = next_scope_id();
        let tree = Tree::new(id);
        let (key, _) = tree.root();
        let shared = Arc::new(Shared {
            state: Mutex::new(TreeState::new(tree)),
            ttl: self.digest_ttl,
            error_sink: self.error_sink,
            scheduler: self.scheduler,
            evaluator: self.evaluator,
            tracer: self.tracer,
        });
        tracing::debug!(root = %id, ttl = self.digest_ttl, "scope tree created");
        shared.handle(key, id)
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<Scope>();
    assert_sync::<Scope>();
}
