//! Named events dispatched up (`emit`) or down (`broadcast`) the tree.

use std::sync::Arc;

use crate::error::{ErrorCause, ScopeError};
use crate::node::{EventListenerFn, ListenerEntry, ListenerId, ScopeNode};
use crate::runtime::{DispatchGuard, Shared};
use crate::scope::{Scope, ScopeId};
use crate::tracer::Direction;
use crate::value::Value;
use crate::watch::{Deregistration, ListenerResult};

/// Broadcast to a scope's subtree right before it is destroyed.
pub const DESTROY_EVENT: &str = "$destroy";

/// An event being dispatched.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    target_scope: Scope,
    current_scope: Option<Scope>,
    default_prevented: bool,
    propagation_stopped: bool,
    stoppable: bool,
}

impl Event {
    fn new(name: &str, target_scope: Scope, stoppable: bool) -> Self {
        Self {
            name: name.to_string(),
            target_scope,
            current_scope: None,
            default_prevented: false,
            propagation_stopped: false,
            stoppable,
        }
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope the dispatch started from.
    pub fn target_scope(&self) -> &Scope {
        &self.target_scope
    }

    /// Scope whose listeners are running. `None` once dispatch is over.
    pub fn current_scope(&self) -> Option<&Scope> {
        self.current_scope.as_ref()
    }

    /// Set the default-prevented flag.
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    /// True once any listener called [`Event::prevent_default`].
    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented
    }

    /// Stop an `emit` from reaching further ancestors. The remaining
    /// listeners of the current scope still run. Has no effect on broadcasts.
    pub fn stop_propagation(&mut self) {
        if self.stoppable {
            self.propagation_stopped = true;
        }
    }

    /// True once [`Event::stop_propagation`] took effect.
    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }
}

fn remove_listener(shared: &Shared, key: usize, scope: ScopeId, name: &str, id: ListenerId) -> bool {
    let mut state = shared.state.lock();
    let busy = state.is_busy();
    let Some(node) = state.tree.live_mut(key, scope) else {
        return false;
    };
    let Some(index) = node.listener_index(name, id) else {
        return false;
    };
    let Some(list) = node.listeners.get_mut(name) else {
        return false;
    };
    if busy {
        list[index] = None;
        state.tree.mark_for_compaction(key);
    } else {
        list.remove(index);
        if list.is_empty() {
            node.listeners.remove(name);
        }
    }
    state.tree.adjust_listeners(key, name, -1);
    true
}

impl Scope {
    /// Listen for `name` on this scope.
    ///
    /// The listener receives the event and the dispatch arguments. Listeners
    /// added while a scope is being dispatched to are not called for that
    /// dispatch.
    pub fn on<F, R>(&self, name: &str, listener: F) -> Deregistration
    where
        F: Fn(&mut Event, &[Value]) -> R + Send + Sync + 'static,
        R: ListenerResult,
    {
        let listener: Arc<EventListenerFn> =
            Arc::new(move |event: &mut Event, args: &[Value]| listener(event, args).into_result());
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_listener_id();
            let Some(node) = state.tree.live_mut(self.key, self.id) else {
                return Deregistration::noop();
            };
            node.listeners
                .entry(name.to_string())
                .or_default()
                .push(Some(ListenerEntry { id, listener }));
            state.tree.adjust_listeners(self.key, name, 1);
            id
        };

        let shared = Arc::downgrade(&self.shared);
        let (key, scope, name) = (self.key, self.id, name.to_string());
        Deregistration::new(move || {
            if let Some(shared) = shared.upgrade() {
                remove_listener(&shared, key, scope, &name, id);
            }
        })
    }

    /// Dispatch `name` to this scope, then to each ancestor up to the root.
    pub fn emit(&self, name: &str, args: &[Value]) -> Event {
        let mut event = Event::new(name, self.clone(), true);
        if self.is_destroyed() {
            return event;
        }
        let _dispatch = DispatchGuard::enter(&self.shared);

        let mut current = Some((self.key, self.id));
        while let Some((key, id)) = current {
            self.visit(key, id, Direction::Emit, &mut event, args);
            if event.propagation_stopped {
                break;
            }
            let state = self.shared.state.lock();
            current = state
                .tree
                .live(key, id)
                .and_then(|node| node.parent)
                .and_then(|parent| {
                    state
                        .tree
                        .node(parent)
                        .filter(|node| !node.destroyed)
                        .map(|node| (parent, node.id))
                });
        }

        event.current_scope = None;
        event
    }

    /// Dispatch `name` to this scope and its whole subtree, pre-order.
    ///
    /// Subtrees without a listener for `name` are skipped without being
    /// entered.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Event {
        self.dispatch_down(name, args, false)
    }

    /// Broadcast [`DESTROY_EVENT`] ahead of teardown. Descendants whose own
    /// destruction is already running have seen it and are skipped.
    pub(crate) fn broadcast_destroy(&self) {
        self.dispatch_down(DESTROY_EVENT, &[], true);
    }

    fn dispatch_down(&self, name: &str, args: &[Value], skip_destroying: bool) -> Event {
        let mut event = Event::new(name, self.clone(), false);
        let listening = self
            .with_node(|node| node.aggregate_listener_count(name) > 0)
            .unwrap_or(false);
        if !listening {
            return event;
        }
        let _dispatch = DispatchGuard::enter(&self.shared);

        let target = self.key;
        let skipped = |node: &ScopeNode| skip_destroying && node.destroying && node.id != self.id;
        let mut current = Some(target);
        while let Some(key) = current {
            let id = {
                let state = self.shared.state.lock();
                state
                    .tree
                    .node(key)
                    .filter(|node| !node.destroyed && !skipped(node))
                    .map(|node| node.id)
            };
            if let Some(id) = id {
                self.visit(key, id, Direction::Broadcast, &mut event, args);
            }
            current = self.shared.state.lock().tree.next_preorder(key, target, |node| {
                node.aggregate_listener_count(name) > 0 && !skipped(node)
            });
        }

        event.current_scope = None;
        event
    }

    /// Run `event`'s listeners on one scope.
    fn visit(&self, key: usize, id: ScopeId, direction: Direction, event: &mut Event, args: &[Value]) {
        let shared = &self.shared;
        event.current_scope = Some(shared.handle(key, id));
        shared.tracer.on_event_visit(&event.name, id, direction);

        let len = {
            let state = shared.state.lock();
            state
                .tree
                .live(key, id)
                .and_then(|node| node.listeners.get(&event.name))
                .map_or(0, Vec::len)
        };
        for index in 0..len {
            let listener = {
                let state = shared.state.lock();
                state
                    .tree
                    .live(key, id)
                    .and_then(|node| node.listeners.get(&event.name))
                    .and_then(|list| list.get(index))
                    .and_then(|slot| slot.as_ref())
                    .map(|entry| entry.listener.clone())
            };
            let Some(listener) = listener else {
                continue;
            };
            if let Err(err) = listener(event, args) {
                shared.report(&ScopeError::task(err), ErrorCause::EventListener);
            }
        }
    }
}
