//! Slab arena holding every scope of one runtime.
//!
//! Parent, child and sibling links are slab keys. Aggregate counters are kept
//! exact on every mutation by walking the parent chain.

use slab::Slab;

use crate::node::ScopeNode;
use crate::scope::ScopeId;
use crate::value::Value;

pub(crate) struct Tree {
    nodes: Slab<ScopeNode>,
    root: usize,
    root_id: ScopeId,
    /// Nodes with tombstoned watcher/listener slots.
    pending_compaction: Vec<usize>,
    /// Destroyed nodes whose slots are freed once nothing walks the tree.
    graveyard: Vec<usize>,
}

impl Tree {
    pub fn new(root_id: ScopeId) -> Self {
        let mut nodes = Slab::new();
        let root = nodes.insert(ScopeNode::new(root_id, None, true));
        Self {
            nodes,
            root,
            root_id,
            pending_compaction: Vec::new(),
            graveyard: Vec::new(),
        }
    }

    pub fn root(&self) -> (usize, ScopeId) {
        (self.root, self.root_id)
    }

    /// Node behind a key regardless of its identity, for walks.
    pub fn node(&self, key: usize) -> Option<&ScopeNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: usize) -> Option<&mut ScopeNode> {
        self.nodes.get_mut(key)
    }

    /// Node behind a handle, only if it is still alive.
    pub fn live(&self, key: usize, id: ScopeId) -> Option<&ScopeNode> {
        self.nodes
            .get(key)
            .filter(|node| node.id == id && !node.destroyed)
    }

    pub fn live_mut(&mut self, key: usize, id: ScopeId) -> Option<&mut ScopeNode> {
        self.nodes
            .get_mut(key)
            .filter(|node| node.id == id && !node.destroyed)
    }

    pub fn is_live(&self, key: usize, id: ScopeId) -> bool {
        self.live(key, id).is_some()
    }

    /// Append a new child under `parent` and return its key.
    pub fn insert_child(&mut self, parent: usize, id: ScopeId, isolated: bool) -> usize {
        let key = self.nodes.insert(ScopeNode::new(id, Some(parent), isolated));
        let tail = self.nodes[parent].last_child;
        self.nodes[key].prev_sibling = tail;
        match tail {
            Some(tail) => self.nodes[tail].next_sibling = Some(key),
            None => self.nodes[parent].first_child = Some(key),
        }
        self.nodes[parent].last_child = Some(key);
        key
    }

    /// Detach `key` from its parent's child list in O(1).
    ///
    /// The detached node keeps its own `parent` and `next_sibling` so a walk
    /// currently standing on it can continue.
    pub fn unlink(&mut self, key: usize) {
        let (parent, prev, next) = {
            let node = &self.nodes[key];
            (node.parent, node.prev_sibling, node.next_sibling)
        };
        let Some(parent) = parent else {
            return;
        };
        match prev {
            Some(prev) => self.nodes[prev].next_sibling = next,
            None => self.nodes[parent].first_child = next,
        }
        match next {
            Some(next) => self.nodes[next].prev_sibling = prev,
            None => self.nodes[parent].last_child = prev,
        }
        self.nodes[key].prev_sibling = None;
    }

    /// Add `delta` to the watcher count of `from` and every ancestor.
    pub fn adjust_watchers(&mut self, from: usize, delta: isize) {
        let mut current = Some(from);
        while let Some(key) = current {
            let node = &mut self.nodes[key];
            node.watcher_count = node.watcher_count.saturating_add_signed(delta);
            current = node.parent;
        }
    }

    /// Add `delta` to the `name` listener count of `from` and every ancestor.
    pub fn adjust_listeners(&mut self, from: usize, name: &str, delta: isize) {
        let mut current = Some(from);
        while let Some(key) = current {
            let node = &mut self.nodes[key];
            let count = node.listener_count.entry(name.to_string()).or_insert(0);
            *count = count.saturating_add_signed(delta);
            if *count == 0 {
                node.listener_count.remove(name);
            }
            current = node.parent;
        }
    }

    /// Pre-order successor of `current` inside the subtree rooted at `target`.
    ///
    /// Children are entered only when `descend` accepts the current node;
    /// this is where digests prune watcher-free subtrees and broadcasts prune
    /// listener-free ones.
    pub fn next_preorder(
        &self,
        current: usize,
        target: usize,
        descend: impl Fn(&ScopeNode) -> bool,
    ) -> Option<usize> {
        let node = self.nodes.get(current)?;
        if !node.destroyed && descend(node) {
            if let Some(child) = node.first_child {
                return Some(child);
            }
        }
        let mut cursor = current;
        loop {
            if cursor == target {
                return None;
            }
            let node = self.nodes.get(cursor)?;
            if let Some(next) = node.next_sibling {
                return Some(next);
            }
            cursor = node.parent?;
        }
    }

    /// Keys of `key` and all its descendants, pre-order.
    pub fn subtree(&self, key: usize) -> Vec<usize> {
        let mut keys = Vec::new();
        let mut current = Some(key);
        while let Some(k) = current {
            keys.push(k);
            current = self.next_preorder(k, key, |_| true);
        }
        keys
    }

    /// Direct children of `key`, in insertion order.
    pub fn children(&self, key: usize) -> Vec<(usize, ScopeId)> {
        let mut children = Vec::new();
        let mut current = self.nodes.get(key).and_then(|n| n.first_child);
        while let Some(k) = current {
            let node = &self.nodes[k];
            children.push((k, node.id));
            current = node.next_sibling;
        }
        children
    }

    /// True if `key` or any ancestor is suspended.
    pub fn is_suspended_lineage(&self, key: usize) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            let Some(node) = self.nodes.get(k) else {
                return false;
            };
            if node.suspended {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// True if `key` or any ancestor is already being destroyed.
    pub fn is_destroying_lineage(&self, key: usize) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            let Some(node) = self.nodes.get(k) else {
                return false;
            };
            if node.destroying {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Layered model lookup: own data, then ancestors until an isolated scope.
    pub fn lookup(&self, key: usize, name: &str) -> Option<Value> {
        let mut current = Some(key);
        while let Some(k) = current {
            let node = self.nodes.get(k)?;
            if let Some(value) = node.data.get(name) {
                return Some(value.clone());
            }
            if node.isolated {
                return None;
            }
            current = node.parent;
        }
        None
    }

    pub fn mark_for_compaction(&mut self, key: usize) {
        if !self.pending_compaction.contains(&key) {
            self.pending_compaction.push(key);
        }
    }

    /// Queue destroyed nodes for freeing.
    pub fn bury(&mut self, keys: impl IntoIterator<Item = usize>) {
        self.graveyard.extend(keys);
    }

    /// Compact tombstones and free buried nodes. Only valid while no walk is
    /// in progress.
    pub fn collect_garbage(&mut self) {
        for key in std::mem::take(&mut self.pending_compaction) {
            if let Some(node) = self.nodes.get_mut(key) {
                node.compact();
            }
        }
        for key in std::mem::take(&mut self.graveyard) {
            if self.nodes.contains(key) && self.nodes[key].destroyed && key != self.root {
                self.nodes.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
