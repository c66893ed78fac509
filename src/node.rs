use std::sync::Arc;

use ahash::AHashMap;

use crate::event::Event;
use crate::expression::Getter;
use crate::scope::{Scope, ScopeId};
use crate::value::Value;

pub(crate) type WatchListenerFn = dyn Fn(&Value, &Value, &Scope) -> anyhow::Result<()> + Send + Sync;
pub(crate) type EventListenerFn = dyn Fn(&mut Event, &[Value]) -> anyhow::Result<()> + Send + Sync;

/// Runtime-unique identifier of a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WatchId(pub u64);

/// Runtime-unique identifier of a registered event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(pub u64);

/// How a watch compares a fresh value with the last one it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Equality {
    /// Reference comparison ([`Value::identical`]).
    #[default]
    Identity,
    /// Structural comparison ([`Value::deep_eq`]).
    Deep,
}

impl Equality {
    /// Compare according to this mode. `NaN` always equals `NaN`.
    pub fn equal(self, a: &Value, b: &Value) -> bool {
        match self {
            Equality::Identity => a.identical(b),
            Equality::Deep => a.deep_eq(b),
        }
    }
}

pub(crate) struct WatchEntry {
    pub id: WatchId,
    pub getter: Getter,
    pub listener: Arc<WatchListenerFn>,
    pub equality: Equality,
    /// `None` until the first evaluation.
    pub last: Option<Value>,
}

pub(crate) struct ListenerEntry {
    pub id: ListenerId,
    pub listener: Arc<EventListenerFn>,
}

/// A scope as stored in the arena.
///
/// Links are slab keys. Watcher and listener slots are `None` once removed
/// while the runtime was busy; they are compacted when it goes idle so that
/// in-flight walks keep stable indices.
pub(crate) struct ScopeNode {
    pub id: ScopeId,
    pub parent: Option<usize>,
    pub first_child: Option<usize>,
    pub last_child: Option<usize>,
    pub next_sibling: Option<usize>,
    pub prev_sibling: Option<usize>,
    pub isolated: bool,
    pub suspended: bool,
    /// Set before `$destroy` is broadcast, so the teardown runs once.
    pub destroying: bool,
    pub destroyed: bool,
    pub data: AHashMap<String, Value>,
    pub watchers: Vec<Option<WatchEntry>>,
    pub listeners: AHashMap<String, Vec<Option<ListenerEntry>>>,
    /// Own plus descendant listeners, per event name.
    pub listener_count: AHashMap<String, usize>,
    /// Own plus descendant watchers.
    pub watcher_count: usize,
}

impl ScopeNode {
    pub fn new(id: ScopeId, parent: Option<usize>, isolated: bool) -> Self {
        Self {
            id,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            isolated,
            suspended: false,
            destroying: false,
            destroyed: false,
            data: AHashMap::new(),
            watchers: Vec::new(),
            listeners: AHashMap::new(),
            listener_count: AHashMap::new(),
            watcher_count: 0,
        }
    }

    pub fn watch_index(&self, id: WatchId) -> Option<usize> {
        self.watchers
            .iter()
            .position(|w| w.as_ref().is_some_and(|w| w.id == id))
    }

    pub fn listener_index(&self, name: &str, id: ListenerId) -> Option<usize> {
        self.listeners
            .get(name)?
            .iter()
            .position(|l| l.as_ref().is_some_and(|l| l.id == id))
    }

    pub fn own_listener_count(&self, name: &str) -> usize {
        self.listeners
            .get(name)
            .map_or(0, |list| list.iter().filter(|l| l.is_some()).count())
    }

    pub fn aggregate_listener_count(&self, name: &str) -> usize {
        self.listener_count.get(name).copied().unwrap_or(0)
    }

    /// Drop tombstoned slots.
    pub fn compact(&mut self) {
        self.watchers.retain(Option::is_some);
        for list in self.listeners.values_mut() {
            list.retain(Option::is_some);
        }
        self.listeners.retain(|_, list| !list.is_empty());
    }

    /// Release everything a destroyed scope holds. Links stay so that walks
    /// already positioned on this node can step past it.
    pub fn tear_down(&mut self) {
        self.destroyed = true;
        self.data.clear();
        self.watchers.clear();
        self.listeners.clear();
        self.listener_count.clear();
        self.watcher_count = 0;
    }
}
