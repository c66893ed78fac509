//! Scope-Flow: a reactive scope tree with dirty-checking digests.
//!
//! A tree of [`Scope`]s holds model data. Watches observe values computed from
//! a scope and fire their listeners when those values change; a digest
//! re-evaluates every watch until the tree is stable. Scopes also dispatch
//! named events up (`emit`) or down (`broadcast`) the tree.
//!
//! # Key Features
//!
//! - **Fixed-point digest**: watchers run until nothing changes, bounded by a configurable ceiling
//! - **Layered model data**: child scopes read through to their ancestors unless isolated
//! - **Task queues**: `eval_async`, `apply_async` (coalesced) and `post_digest`
//! - **Pruned dispatch**: broadcasts skip subtrees without listeners
//! - **Pluggable seams**: expression [`Evaluator`], deferred-callback [`Scheduler`], [`ErrorSink`] and [`Tracer`]
//!
//! # Example
//!
//! ```
//! use scope_flow::{Scope, Value};
//!
//! let root = Scope::new_root();
//! root.set("a", 1).unwrap();
//!
//! let child = root.create_child(false);
//! child
//!     .watch_expr("a", |new: &Value, _old: &Value, scope: &Scope| {
//!         scope.set("double", new.as_f64().unwrap_or(0.0) * 2.0)
//!     })
//!     .unwrap();
//!
//! root.apply(|root| root.set("a", 21).map_err(Into::into)).unwrap();
//! assert_eq!(child.get("double"), Value::from(42));
//! ```
//!
//! # Threading
//!
//! [`Scope`] handles are `Send + Sync` and callbacks may call back into any
//! scope API. Execution is still cooperative: a digest started while another
//! is running is rejected with [`ScopeError::InProgress`].

mod digest;
mod error;
mod event;
mod expression;
mod node;
mod queue;
mod runtime;
mod scheduler;
mod scope;
mod tracer;
mod tree;
mod value;
mod watch;

pub use error::*;
pub use event::*;
pub use expression::*;
pub use node::Equality;
pub use runtime::{ScopeRuntimeBuilder, DEFAULT_DIGEST_TTL};
pub use scheduler::*;
pub use scope::*;
pub use tracer::*;
pub use value::*;
pub use watch::*;
