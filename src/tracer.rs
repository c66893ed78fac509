//! Tracer trait for observing engine execution.
//!
//! The default [`NoopTracer`] ignores everything. [`TraceCollector`] records
//! [`TraceEvent`]s for assertions in tests and for offline inspection.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use scope_flow::{Scope, TraceCollector, TraceEvent};
//!
//! let collector = Arc::new(TraceCollector::new());
//! let root = Scope::builder().tracer(collector.clone()).build();
//! root.digest().unwrap();
//! assert!(matches!(collector.events()[0], TraceEvent::DigestStart { .. }));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::scope::ScopeId;

/// Identifies one digest run across its trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpanId(pub u64);

/// How a digest ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DigestOutcome {
    /// Converged after the given number of passes.
    Stable {
        /// Full tree walks performed.
        passes: usize,
    },
    /// Hit the iteration ceiling.
    Unstable,
}

/// Direction of an event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Towards the root.
    Emit,
    /// Through the subtree.
    Broadcast,
}

/// Observer of engine internals.
///
/// Every hook has an empty default. Hooks run with no engine lock held but
/// must not start a digest.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new span ID. Called once per digest.
    fn new_span_id(&self) -> SpanId;

    /// A digest starts at `target`.
    #[inline]
    fn on_digest_start(&self, _span_id: SpanId, _target: ScopeId) {}

    /// A full tree walk starts.
    #[inline]
    fn on_digest_pass(&self, _span_id: SpanId, _pass: usize) {}

    /// A watch reported a change and its listener is about to run.
    #[inline]
    fn on_watch_fired(&self, _span_id: SpanId, _scope: ScopeId, _watch: &str) {}

    /// A digest finished.
    #[inline]
    fn on_digest_end(&self, _span_id: SpanId, _outcome: DigestOutcome) {}

    /// An event dispatch reached a scope.
    #[inline]
    fn on_event_visit(&self, _name: &str, _scope: ScopeId, _direction: Direction) {}

    /// A child scope was linked under `parent`.
    #[inline]
    fn on_scope_created(&self, _scope: ScopeId, _parent: ScopeId) {}

    /// A scope was destroyed.
    #[inline]
    fn on_scope_destroyed(&self, _scope: ScopeId) {}
}

/// Tracer that discards all events.
pub struct NoopTracer;

static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A recorded tracer hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceEvent {
    /// See [`Tracer::on_digest_start`].
    DigestStart {
        /// Digest span.
        span_id: SpanId,
        /// Scope the digest started at.
        target: ScopeId,
    },
    /// See [`Tracer::on_digest_pass`].
    DigestPass {
        /// Digest span.
        span_id: SpanId,
        /// 1-based pass number.
        pass: usize,
    },
    /// See [`Tracer::on_watch_fired`].
    WatchFired {
        /// Digest span.
        span_id: SpanId,
        /// Owner of the watch.
        scope: ScopeId,
        /// Watch description.
        watch: String,
    },
    /// See [`Tracer::on_digest_end`].
    DigestEnd {
        /// Digest span.
        span_id: SpanId,
        /// Outcome.
        outcome: DigestOutcome,
    },
    /// See [`Tracer::on_event_visit`].
    EventVisit {
        /// Event name.
        name: String,
        /// Visited scope.
        scope: ScopeId,
        /// Dispatch direction.
        direction: Direction,
    },
    /// See [`Tracer::on_scope_created`].
    ScopeCreated {
        /// New scope.
        scope: ScopeId,
        /// Its parent.
        parent: ScopeId,
    },
    /// See [`Tracer::on_scope_destroyed`].
    ScopeDestroyed {
        /// Destroyed scope.
        scope: ScopeId,
    },
}

/// Tracer that records every hook as a [`TraceEvent`].
#[derive(Debug, Default)]
pub struct TraceCollector {
    events: Mutex<Vec<TraceEvent>>,
    next_span: AtomicU64,
}

impl TraceCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Take recorded events, clearing the collector.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Scopes visited by dispatches of `name`, in visit order.
    pub fn visits(&self, name: &str) -> Vec<ScopeId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TraceEvent::EventVisit { name: n, scope, .. } if n == name => Some(*scope),
                _ => None,
            })
            .collect()
    }

    /// Descriptions of fired watches, in firing order.
    pub fn fired_watches(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TraceEvent::WatchFired { watch, .. } => Some(watch.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for TraceCollector {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn on_digest_start(&self, span_id: SpanId, target: ScopeId) {
        self.push(TraceEvent::DigestStart { span_id, target });
    }

    fn on_digest_pass(&self, span_id: SpanId, pass: usize) {
        self.push(TraceEvent::DigestPass { span_id, pass });
    }

    fn on_watch_fired(&self, span_id: SpanId, scope: ScopeId, watch: &str) {
        self.push(TraceEvent::WatchFired {
            span_id,
            scope,
            watch: watch.to_string(),
        });
    }

    fn on_digest_end(&self, span_id: SpanId, outcome: DigestOutcome) {
        self.push(TraceEvent::DigestEnd { span_id, outcome });
    }

    fn on_event_visit(&self, name: &str, scope: ScopeId, direction: Direction) {
        self.push(TraceEvent::EventVisit {
            name: name.to_string(),
            scope,
            direction,
        });
    }

    fn on_scope_created(&self, scope: ScopeId, parent: ScopeId) {
        self.push(TraceEvent::ScopeCreated { scope, parent });
    }

    fn on_scope_destroyed(&self, scope: ScopeId) {
        self.push(TraceEvent::ScopeDestroyed { scope });
    }
}
