//! Watch registration.
//!
//! Every registration returns a [`Deregistration`]. Watches fire in
//! registration order within a scope, parents before children.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::ScopeError;
use crate::expression::Getter;
use crate::node::{Equality, WatchEntry, WatchId, WatchListenerFn};
use crate::runtime::Shared;
use crate::scope::{Scope, ScopeId};
use crate::value::Value;

/// Return type accepted from user callbacks.
///
/// Callbacks may return `()` or any `Result<(), E>` whose error converts into
/// [`anyhow::Error`]. Errors are reported to the error sink.
pub trait ListenerResult {
    /// Normalize into an `anyhow` result.
    fn into_result(self) -> anyhow::Result<()>;
}

impl ListenerResult for () {
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> ListenerResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// Handle that removes a watch or listener.
///
/// Cloning is cheap. Calling [`Deregistration::deregister`] more than once, or
/// after the scope was destroyed, does nothing.
#[derive(Clone)]
pub struct Deregistration {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Deregistration {
    pub(crate) fn new<F>(remove: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let done = AtomicBool::new(false);
        Self {
            remove: Arc::new(move || {
                if !done.swap(true, Ordering::AcqRel) {
                    remove();
                }
            }),
        }
    }

    /// A handle that removes nothing, returned for registrations on destroyed
    /// scopes.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Remove the registration.
    pub fn deregister(&self) {
        (self.remove)()
    }
}

impl fmt::Debug for Deregistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deregistration").finish_non_exhaustive()
    }
}

/// Remove a watch by id. Tombstones the slot while a digest or dispatch may
/// hold its index.
pub(crate) fn remove_watch(shared: &Shared, key: usize, scope: ScopeId, id: WatchId) -> bool {
    let mut state = shared.state.lock();
    let busy = state.is_busy();
    let Some(node) = state.tree.live_mut(key, scope) else {
        return false;
    };
    let Some(index) = node.watch_index(id) else {
        return false;
    };
    if busy {
        node.watchers[index] = None;
        state.tree.mark_for_compaction(key);
    } else {
        node.watchers.remove(index);
    }
    state.tree.adjust_watchers(key, -1);
    state.last_dirty_watch = None;
    true
}

fn boxed_listener<F, R>(listener: F) -> Arc<WatchListenerFn>
where
    F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
    R: ListenerResult,
{
    Arc::new(move |new: &Value, old: &Value, scope: &Scope| listener(new, old, scope).into_result())
}

impl Scope {
    /// Call `listener` with `(new, old, scope)` whenever `getter`'s value
    /// changes by identity.
    ///
    /// The first digest after registration always fires, with `old == new`.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use scope_flow::{Scope, Value};
    ///
    /// let root = Scope::new_root();
    /// let calls = Arc::new(AtomicUsize::new(0));
    /// let counter = calls.clone();
    /// root.watch(|s: &Scope| s.get("name"), move |_new: &Value, _old: &Value, _scope: &Scope| {
    ///     counter.fetch_add(1, Ordering::SeqCst);
    /// });
    /// root.digest().unwrap();
    /// root.set("name", "scope").unwrap();
    /// root.digest().unwrap();
    /// assert_eq!(calls.load(Ordering::SeqCst), 2);
    /// ```
    pub fn watch<G, F, R>(&self, getter: G, listener: F) -> Deregistration
    where
        G: Into<Getter>,
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        self.watch_with(getter, listener, Equality::Identity)
    }

    /// Like [`Scope::watch`], comparing values structurally.
    pub fn watch_deep<G, F, R>(&self, getter: G, listener: F) -> Deregistration
    where
        G: Into<Getter>,
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        self.watch_with(getter, listener, Equality::Deep)
    }

    /// Register a watch with an explicit [`Equality`].
    ///
    /// Constant getters are removed after their first evaluation. One-time
    /// getters are removed after a digest that leaves their value defined.
    pub fn watch_with<G, F, R>(&self, getter: G, listener: F, equality: Equality) -> Deregistration
    where
        G: Into<Getter>,
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        let getter = getter.into();
        let listener = boxed_listener(listener);
        if getter.is_one_time() && !getter.is_constant() {
            self.register_one_time(getter, listener, equality)
        } else {
            self.register_watch(getter, listener, equality)
        }
    }

    /// Parse `expression` with the configured evaluator and watch it.
    ///
    /// `::`-prefixed expressions are one-time; literals are constant.
    pub fn watch_expr<F, R>(&self, expression: &str, listener: F) -> Result<Deregistration, ScopeError>
    where
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        self.watch_expr_with(expression, listener, Equality::Identity)
    }

    /// [`Scope::watch_expr`] with an explicit [`Equality`].
    pub fn watch_expr_with<F, R>(
        &self,
        expression: &str,
        listener: F,
        equality: Equality,
    ) -> Result<Deregistration, ScopeError>
    where
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        let expression = self.shared.evaluator.parse(expression)?;
        Ok(self.watch_with(Getter::from(expression), listener, equality))
    }

    fn register_watch(&self, getter: Getter, listener: Arc<WatchListenerFn>, equality: Equality) -> Deregistration {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_watch_id();
            let Some(node) = state.tree.live_mut(self.key, self.id) else {
                return Deregistration::noop();
            };
            node.watchers.push(Some(WatchEntry {
                id,
                getter,
                listener,
                equality,
                last: None,
            }));
            state.tree.adjust_watchers(self.key, 1);
            state.last_dirty_watch = None;
            id
        };

        let shared = Arc::downgrade(&self.shared);
        let (key, scope) = (self.key, self.id);
        Deregistration::new(move || {
            if let Some(shared) = shared.upgrade() {
                remove_watch(&shared, key, scope, id);
            }
        })
    }

    fn register_one_time(&self, getter: Getter, listener: Arc<WatchListenerFn>, equality: Equality) -> Deregistration {
        let literal = getter.is_literal();
        let is_done = move |value: &Value| {
            if literal {
                value.is_all_defined()
            } else {
                value.is_defined()
            }
        };
        let handle: Arc<OnceLock<Deregistration>> = Arc::new(OnceLock::new());
        let last_value = Arc::new(Mutex::new(Value::Undefined));

        let wrapped = {
            let handle = handle.clone();
            move |new: &Value, old: &Value, scope: &Scope| {
                *last_value.lock() = new.clone();
                let result = listener(new, old, scope);
                if is_done(new) {
                    let handle = handle.clone();
                    let last_value = last_value.clone();
                    scope.post_digest(move || {
                        if is_done(&last_value.lock()) {
                            if let Some(deregistration) = handle.get() {
                                deregistration.deregister();
                            }
                        }
                    });
                }
                result
            }
        };

        let deregistration = self.register_watch(getter, Arc::new(wrapped), equality);
        let _ = handle.set(deregistration.clone());
        deregistration
    }

    // ========================================================================
    // Groups and collections
    // ========================================================================

    /// Watch several getters and call `listener` once per digest pass in
    /// which any of them changed.
    ///
    /// The listener receives `(new_values, old_values, scope)`, with
    /// `old_values` holding the values passed at its previous call. The
    /// first call passes `new_values` twice. The call itself is queued with
    /// [`Scope::eval_async`], so changes to several members coalesce.
    pub fn watch_group<F, R>(&self, mut getters: Vec<Getter>, listener: F) -> Deregistration
    where
        F: Fn(&[Value], &[Value], &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        let listener = Arc::new(listener);

        if getters.is_empty() {
            let should_call = Arc::new(AtomicBool::new(true));
            {
                let should_call = should_call.clone();
                self.eval_async(move |scope| {
                    if should_call.load(Ordering::Acquire) {
                        listener(&[], &[], scope).into_result()
                    } else {
                        Ok(())
                    }
                });
            }
            return Deregistration::new(move || should_call.store(false, Ordering::Release));
        }

        if getters.len() == 1 {
            if let Some(getter) = getters.pop() {
                return self.watch(getter, move |new: &Value, old: &Value, scope: &Scope| {
                    let new_values = [new.clone()];
                    if new.identical(old) {
                        listener(&new_values, &new_values, scope)
                    } else {
                        listener(&new_values, &[old.clone()], scope)
                    }
                });
            }
        }

        let group = Arc::new(Mutex::new(GroupState {
            new_values: vec![Value::Undefined; getters.len()],
            old_values: vec![Value::Undefined; getters.len()],
            scheduled: false,
            first_run: true,
        }));

        let deregistrations: Vec<Deregistration> = getters
            .into_iter()
            .enumerate()
            .map(|(index, getter)| {
                let group = group.clone();
                let listener = listener.clone();
                self.watch(getter, move |new: &Value, _old: &Value, scope: &Scope| {
                    let schedule = {
                        let mut state = group.lock();
                        state.new_values[index] = new.clone();
                        !std::mem::replace(&mut state.scheduled, true)
                    };
                    if schedule {
                        let group = group.clone();
                        let listener = listener.clone();
                        scope.eval_async(move |scope| {
                            let (new_values, old_values) = {
                                let mut state = group.lock();
                                state.scheduled = false;
                                let new_values = state.new_values.clone();
                                let old_values = if std::mem::take(&mut state.first_run) {
                                    new_values.clone()
                                } else {
                                    state.old_values.clone()
                                };
                                (new_values, old_values)
                            };
                            let result = listener(&new_values, &old_values, scope).into_result();
                            group.lock().old_values = new_values;
                            result
                        });
                    }
                })
            })
            .collect();

        Deregistration::new(move || {
            for deregistration in &deregistrations {
                deregistration.deregister();
            }
        })
    }

    /// Watch a list or map shallowly.
    ///
    /// Lists change when their length or any element's identity changes; maps
    /// when a key is added or removed or a value's identity changes. Other
    /// values compare by identity. The listener receives
    /// `(new, previous, scope)` where `previous` is the collection as it was
    /// at the previous listener call; the first call passes `new` twice.
    pub fn watch_collection<G, F, R>(&self, getter: G, listener: F) -> Deregistration
    where
        G: Into<Getter>,
        F: Fn(&Value, &Value, &Scope) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        let inner: Getter = getter.into();
        let description = inner.description().to_string();
        let tracker = Arc::new(Mutex::new(CollectionTracker::default()));

        let detector = {
            let tracker = tracker.clone();
            Getter::new(move |scope| {
                let value = inner.get(scope);
                tracker.lock().detect(value)
            })
            .named(description)
        };

        self.watch(detector, move |_: &Value, _: &Value, scope: &Scope| {
            let (new, previous) = {
                let mut state = tracker.lock();
                let new = state.current.clone();
                let previous = if std::mem::take(&mut state.init_run) {
                    new.clone()
                } else {
                    state.very_old.clone()
                };
                (new, previous)
            };
            let result = listener(&new, &previous, scope);
            tracker.lock().very_old = new;
            result
        })
    }
}

struct GroupState {
    new_values: Vec<Value>,
    old_values: Vec<Value>,
    scheduled: bool,
    first_run: bool,
}

/// Shallow copy of the last seen collection.
#[derive(Default)]
enum Snapshot {
    #[default]
    Empty,
    Scalar(Value),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

struct CollectionTracker {
    snapshot: Snapshot,
    changes: u64,
    current: Value,
    very_old: Value,
    init_run: bool,
}

impl Default for CollectionTracker {
    fn default() -> Self {
        Self {
            snapshot: Snapshot::Empty,
            changes: 0,
            current: Value::Undefined,
            very_old: Value::Undefined,
            init_run: true,
        }
    }
}

impl CollectionTracker {
    /// Compare `value` against the snapshot and return a change counter, or
    /// `Undefined` when there is no collection.
    fn detect(&mut self, value: Value) -> Value {
        self.current = value.clone();
        match &value {
            Value::Undefined => return Value::Undefined,
            Value::List(items) => {
                if !matches!(self.snapshot, Snapshot::List(_)) {
                    self.snapshot = Snapshot::List(Vec::new());
                    self.changes += 1;
                }
                if let Snapshot::List(old) = &mut self.snapshot {
                    if old.len() != items.len() {
                        self.changes += 1;
                        old.resize(items.len(), Value::Undefined);
                    }
                    for (slot, item) in old.iter_mut().zip(items.iter()) {
                        if !slot.identical(item) {
                            self.changes += 1;
                            *slot = item.clone();
                        }
                    }
                }
            }
            Value::Map(entries) => {
                if !matches!(self.snapshot, Snapshot::Map(_)) {
                    self.snapshot = Snapshot::Map(BTreeMap::new());
                    self.changes += 1;
                }
                if let Snapshot::Map(old) = &mut self.snapshot {
                    for (key, item) in entries.iter() {
                        match old.get_mut(key) {
                            Some(slot) => {
                                if !slot.identical(item) {
                                    self.changes += 1;
                                    *slot = item.clone();
                                }
                            }
                            None => {
                                self.changes += 1;
                                old.insert(key.clone(), item.clone());
                            }
                        }
                    }
                    if old.len() > entries.len() {
                        self.changes += 1;
                        old.retain(|key, _| entries.contains_key(key));
                    }
                }
            }
            scalar => {
                let same = matches!(&self.snapshot, Snapshot::Scalar(old) if old.identical(scalar));
                if !same {
                    self.snapshot = Snapshot::Scalar(scalar.clone());
                    self.changes += 1;
                }
            }
        }
        Value::Number(self.changes as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_tracker_counts_shallow_changes() {
        let mut tracker = CollectionTracker::default();
        let list = Value::list([1, 2]);
        let first = tracker.detect(list.clone());
        assert_eq!(tracker.detect(list.clone()), first);

        // Same contents in a new container are not a change.
        assert_eq!(tracker.detect(Value::list([1, 2])), first);

        let grown = tracker.detect(Value::list([1, 2, 3]));
        assert_ne!(grown, first);

        let map = tracker.detect(Value::map([("a", 1)]));
        assert_ne!(map, grown);
        assert_eq!(tracker.detect(Value::map([("a", 1)])), map);
        assert_ne!(tracker.detect(Value::map([("b", 1)])), map);
    }

    #[test]
    fn test_collection_tracker_undefined_is_passed_through() {
        let mut tracker = CollectionTracker::default();
        assert_eq!(tracker.detect(Value::Undefined), Value::Undefined);
        assert_eq!(tracker.detect(Value::from(f64::NAN)), Value::Number(1.0));
        assert_eq!(tracker.detect(Value::from(f64::NAN)), Value::Number(1.0));
    }

    #[test]
    fn test_deregistration_runs_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let deregistration = {
            let count = count.clone();
            Deregistration::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let clone = deregistration.clone();
        deregistration.deregister();
        clone.deregister();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
