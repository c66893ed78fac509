use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ScopeError;
use crate::node::ScopeNode;
use crate::runtime::{ScopeRuntimeBuilder, Shared};
use crate::value::Value;

/// Keys the engine owns. They never hold model data.
pub const RESERVED_KEYS: [&str; 4] = ["$id", "$parent", "$root", "this"];

/// Process-unique scope identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScopeId(pub u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_scope_id() -> ScopeId {
    ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Handle to a node of a scope tree.
///
/// Handles are cheap to clone and can be sent across threads. A handle whose
/// scope was destroyed stays valid to call: reads yield [`Value::Undefined`]
/// and everything else is a silent no-op.
#[derive(Clone)]
pub struct Scope {
    pub(crate) shared: Arc<Shared>,
    pub(crate) key: usize,
    pub(crate) id: ScopeId,
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Scope {
    /// Create a new tree with default settings and return its root.
    pub fn new_root() -> Self {
        ScopeRuntimeBuilder::new().build()
    }

    /// Builder for a tree with a custom digest ceiling, error sink, scheduler,
    /// evaluator or tracer.
    pub fn builder() -> ScopeRuntimeBuilder {
        ScopeRuntimeBuilder::new()
    }

    /// Run `f` on this scope's node if it is alive.
    pub(crate) fn with_node<R>(&self, f: impl FnOnce(&ScopeNode) -> R) -> Option<R> {
        let state = self.shared.state.lock();
        state.tree.live(self.key, self.id).map(f)
    }

    /// This scope's identifier.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// True once the scope (or an ancestor) was destroyed.
    pub fn is_destroyed(&self) -> bool {
        !self.shared.state.lock().tree.is_live(self.key, self.id)
    }

    /// True for the root of the tree.
    pub fn is_root(&self) -> bool {
        self.shared.state.lock().tree.root() == (self.key, self.id)
    }

    /// True if model lookups stop at this scope instead of falling through to
    /// the parent.
    pub fn is_isolated(&self) -> bool {
        self.with_node(|node| node.isolated).unwrap_or(false)
    }

    /// Root of this scope's tree.
    pub fn root(&self) -> Scope {
        self.shared.root()
    }

    /// Parent scope, or `None` for the root and for destroyed scopes.
    pub fn parent(&self) -> Option<Scope> {
        let state = self.shared.state.lock();
        let parent = state.tree.live(self.key, self.id)?.parent?;
        let id = state.tree.node(parent)?.id;
        Some(self.shared.handle(parent, id))
    }

    /// Direct children in creation order.
    pub fn children(&self) -> Vec<Scope> {
        let state = self.shared.state.lock();
        if !state.tree.is_live(self.key, self.id) {
            return Vec::new();
        }
        state
            .tree
            .children(self.key)
            .into_iter()
            .map(|(key, id)| self.shared.handle(key, id))
            .collect()
    }

    /// Create a child scope.
    ///
    /// A non-isolated child reads through to its ancestors' data for keys it
    /// does not hold itself. Called on a destroyed scope, this returns a scope
    /// that is already destroyed.
    pub fn create_child(&self, isolated: bool) -> Scope {
        let id = next_scope_id();
        let key = {
            let mut state = self.shared.state.lock();
            if !state.tree.is_live(self.key, self.id) {
                return self.shared.handle(usize::MAX, id);
            }
            state.tree.insert_child(self.key, id, isolated)
        };
        self.shared.tracer.on_scope_created(id, self.id);
        tracing::debug!(scope = %id, parent = %self.id, isolated, "scope created");
        self.shared.handle(key, id)
    }

    // ========================================================================
    // Model data
    // ========================================================================

    /// Read `key`, falling through non-isolated ancestors.
    ///
    /// `$id` yields the scope id. Missing keys and destroyed scopes yield
    /// [`Value::Undefined`].
    pub fn get(&self, key: &str) -> Value {
        let state = self.shared.state.lock();
        if !state.tree.is_live(self.key, self.id) {
            return Value::Undefined;
        }
        if key == "$id" {
            return Value::from(self.id.0 as f64);
        }
        state.tree.lookup(self.key, key).unwrap_or_default()
    }

    /// Read a dotted path such as `user.address.city`.
    pub fn get_path(&self, path: &str) -> Value {
        let mut segments = path.split('.');
        let head = segments.next().unwrap_or_default();
        segments.fold(self.get(head), |value, segment| value.field(segment))
    }

    /// Read `key` from this scope only.
    pub fn get_own(&self, key: &str) -> Option<Value> {
        self.with_node(|node| node.data.get(key).cloned()).flatten()
    }

    /// True if this scope itself holds `key`.
    pub fn has_own(&self, key: &str) -> bool {
        self.with_node(|node| node.data.contains_key(key))
            .unwrap_or(false)
    }

    /// Store `value` under `key` on this scope. Never writes to an ancestor.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ScopeError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(ScopeError::ReservedKey(key));
        }
        let mut state = self.shared.state.lock();
        if let Some(node) = state.tree.live_mut(self.key, self.id) {
            node.data.insert(key, value.into());
        }
        Ok(())
    }

    /// Remove `key` from this scope and return what it held.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut state = self.shared.state.lock();
        state.tree.live_mut(self.key, self.id)?.data.remove(key)
    }

    /// Keys held by this scope itself, sorted.
    pub fn own_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .with_node(|node| node.data.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    /// Exclude this scope and its descendants from digests.
    pub fn suspend(&self) {
        let mut state = self.shared.state.lock();
        if let Some(node) = state.tree.live_mut(self.key, self.id) {
            node.suspended = true;
        }
    }

    /// Undo [`Scope::suspend`] on this scope. Descendants suspended on their
    /// own stay suspended, and nothing is digested while an ancestor is
    /// still suspended.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if let Some(node) = state.tree.live_mut(self.key, self.id) {
            node.suspended = false;
            state.last_dirty_watch = None;
        }
    }

    /// This scope's own suspension flag. Ancestors are not consulted.
    pub fn is_suspended(&self) -> bool {
        self.with_node(|node| node.suspended).unwrap_or(false)
    }

    // ========================================================================
    // Counts
    // ========================================================================

    /// Watchers on this scope and all its descendants.
    pub fn count_watchers(&self) -> usize {
        self.with_node(|node| node.watcher_count).unwrap_or(0)
    }

    /// Descendant scopes, not counting this one.
    pub fn count_child_scopes(&self) -> usize {
        let state = self.shared.state.lock();
        if !state.tree.is_live(self.key, self.id) {
            return 0;
        }
        state.tree.subtree(self.key).len() - 1
    }

    /// `name` listeners on this scope and all its descendants.
    pub fn listener_count(&self, name: &str) -> usize {
        self.with_node(|node| node.aggregate_listener_count(name))
            .unwrap_or(0)
    }

    /// `name` listeners registered on this scope itself.
    pub fn own_listener_count(&self, name: &str) -> usize {
        self.with_node(|node| node.own_listener_count(name))
            .unwrap_or(0)
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroy this scope and its subtree.
    ///
    /// Broadcasts `$destroy` first, then detaches the subtree and releases
    /// its data, watchers and listeners. Destroying the root also drops every
    /// queued task. Calling this on a destroyed scope, or on a scope whose
    /// destruction (or an ancestor's) is already under way, does nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.tree.is_destroying_lineage(self.key) {
                return;
            }
            let Some(node) = state.tree.live_mut(self.key, self.id) else {
                return;
            };
            node.destroying = true;
        }
        self.broadcast_destroy();

        let tokens = {
            let mut state = self.shared.state.lock();
            let Some(node) = state.tree.live(self.key, self.id) else {
                return;
            };
            let parent = node.parent;
            let watchers = node.watcher_count;
            let listeners: Vec<(String, usize)> = node
                .listener_count
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect();

            let keys = state.tree.subtree(self.key);
            if let Some(parent) = parent {
                state.tree.adjust_watchers(parent, -(watchers as isize));
                for (name, count) in &listeners {
                    state.tree.adjust_listeners(parent, name, -(*count as isize));
                }
                state.tree.unlink(self.key);
            }
            for &key in &keys {
                if let Some(node) = state.tree.node_mut(key) {
                    node.tear_down();
                }
            }
            state.tree.bury(keys);

            let tokens = if parent.is_none() {
                state.queues.clear()
            } else {
                Vec::new()
            };
            state.settle();
            tokens
        };
        for token in tokens {
            self.shared.scheduler.cancel(token);
        }

        self.shared.tracer.on_scope_destroyed(self.id);
        tracing::debug!(scope = %self.id, "scope destroyed");
    }
}
