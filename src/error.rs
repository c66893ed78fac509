//! Error types and the error sink.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// Engine phase guarded against re-entrance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// A digest loop is running.
    Digest,
    /// An apply thunk is running.
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Digest => write!(f, "digest"),
            Phase::Apply => write!(f, "apply"),
        }
    }
}

/// A watch that fired during one of the last iterations of an unstable digest.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchLogEntry {
    /// Expression source or getter name.
    pub description: String,
    /// Value that made the watch dirty.
    pub new_value: Value,
    /// Value it was compared against.
    pub old_value: Value,
}

fn render_watch_log(log: &[Vec<WatchLogEntry>]) -> String {
    let iterations: Vec<String> = log
        .iter()
        .map(|entries| {
            let entries: Vec<String> = entries
                .iter()
                .map(|e| format!("{}: {} -> {}", e.description, e.old_value, e.new_value))
                .collect();
            format!("[{}]", entries.join("; "))
        })
        .collect();
    iterations.join(", ")
}

/// Errors surfaced by the scope engine.
///
/// Listener and task failures are wrapped in [`ScopeError::Task`] and handed to
/// the [`ErrorSink`]; structural failures are also returned to the caller of
/// `digest`/`apply`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    /// A digest or apply was requested while one is already running.
    #[error("{phase} already in progress")]
    InProgress {
        /// The phase that was active.
        phase: Phase,
    },

    /// The digest did not converge within the configured ceiling.
    #[error(
        "{ttl} digest iterations reached, aborting; watchers fired in the last 5 iterations: {}",
        render_watch_log(.log)
    )]
    UnstableDigest {
        /// Configured iteration ceiling.
        ttl: usize,
        /// Watches fired per iteration, oldest iteration first.
        log: Vec<Vec<WatchLogEntry>>,
    },

    /// Attempted to store model data under an engine-reserved key.
    #[error("`{0}` is reserved and cannot hold model data")]
    ReservedKey(String),

    /// The evaluator rejected an expression.
    #[error("cannot parse expression `{expression}`: {message}")]
    Parse {
        /// Source text.
        expression: String,
        /// Evaluator diagnostic.
        message: String,
    },

    /// A user callback failed.
    #[error("{0}")]
    Task(Arc<anyhow::Error>),
}

impl ScopeError {
    /// Wrap a user failure.
    pub fn task(err: impl Into<anyhow::Error>) -> Self {
        ScopeError::Task(Arc::new(err.into()))
    }

    /// Returns the inner user error if this is a `Task` variant.
    pub fn task_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ScopeError::Task(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.task_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns true for [`ScopeError::UnstableDigest`].
    pub fn is_unstable_digest(&self) -> bool {
        matches!(self, ScopeError::UnstableDigest { .. })
    }

    /// Returns true for [`ScopeError::InProgress`].
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ScopeError::InProgress { .. })
    }
}

/// Where an error was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// A watch listener returned an error.
    WatchListener,
    /// An event listener returned an error.
    EventListener,
    /// An evalAsync task failed.
    EvalAsync,
    /// An applyAsync task failed.
    ApplyAsync,
    /// A postDigest task failed.
    PostDigest,
    /// The thunk passed to `apply` failed.
    Apply,
    /// A digest started from a deferred flush failed.
    DeferredDigest,
    /// A digest or apply was rejected because another one is running.
    Reentrancy,
    /// A digest exceeded its iteration ceiling.
    Digest,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCause::WatchListener => "watch listener",
            ErrorCause::EventListener => "event listener",
            ErrorCause::EvalAsync => "evalAsync task",
            ErrorCause::ApplyAsync => "applyAsync task",
            ErrorCause::PostDigest => "postDigest task",
            ErrorCause::Apply => "apply",
            ErrorCause::DeferredDigest => "deferred digest",
            ErrorCause::Reentrancy => "reentrancy guard",
            ErrorCause::Digest => "digest",
        };
        f.write_str(name)
    }
}

/// Channel receiving every error the engine catches.
///
/// Implementations must not call back into a digest; they may be invoked from
/// inside one.
pub trait ErrorSink: Send + Sync + 'static {
    /// Called once per caught error.
    fn report(&self, error: &ScopeError, cause: ErrorCause);
}

impl<F> ErrorSink for F
where
    F: Fn(&ScopeError, ErrorCause) + Send + Sync + 'static,
{
    fn report(&self, error: &ScopeError, cause: ErrorCause) {
        self(error, cause)
    }
}

/// Default sink: logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &ScopeError, cause: ErrorCause) {
        tracing::error!(%cause, %error, "scope error");
    }
}

/// Sink that keeps every reported error, for tests and inspection.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    errors: Mutex<Vec<(ScopeError, ErrorCause)>>,
}

impl CollectingErrorSink {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported errors with their causes, oldest first.
    pub fn errors(&self) -> Vec<(ScopeError, ErrorCause)> {
        self.errors.lock().clone()
    }

    /// Display strings of the reported errors.
    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().iter().map(|(e, _)| e.to_string()).collect()
    }

    /// Causes of the reported errors.
    pub fn causes(&self) -> Vec<ErrorCause> {
        self.errors.lock().iter().map(|(_, c)| *c).collect()
    }

    /// Take reported errors, clearing the collector.
    pub fn take(&self) -> Vec<(ScopeError, ErrorCause)> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Number of reported errors.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Returns true if nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorSink for CollectingErrorSink {
    fn report(&self, error: &ScopeError, cause: ErrorCause) {
        self.errors.lock().push((error.clone(), cause));
    }
}
