//! Transactions
//!
//! A transaction accumulates everything one outermost `dispatch`/`batch`
//! call produces: new cache records (the patch map), the set of connected
//! nodes invalidated by those records, effects and lifecycle hooks to run
//! after commit, and listeners to roll back should it abort.
//!
//! # Invalidation
//!
//! When a record's state changes, every connected dependent is marked stale,
//! transitively, and queued. A dependent reached along two paths is queued
//! once:
//!
//! ```text
//!        A            A changes: B, D, C are marked, D only once
//!       / \
//!      B   C          commit drains the queue; actualizing D pulls B and C
//!       \ /           first, so D recomputes a single time
//!        D
//! ```
//!
//! Unconnected nodes are never marked: they are checked against their
//! dependencies when next read.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use super::cache::{Cache, CacheRecord};
use super::node::NodeId;
use crate::error::Error;
use crate::reactive::{Job, ListenerId};

/// Identifier of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    /// Marker used by records that predate every transaction.
    pub(crate) const ROOT: TxId = TxId(0);

    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// The in-flight batch of changes of one context.
pub(crate) struct Transaction {
    pub(crate) id: TxId,

    /// Nesting depth; only depth zero commits.
    pub(crate) depth: usize,

    /// Cause of everything this transaction produces at top level.
    pub(crate) cause: Cache,

    /// Pending records, in first-touch order.
    pub(crate) patches: IndexMap<NodeId, Cache>,

    stale: HashSet<NodeId>,
    queue: VecDeque<NodeId>,

    /// Nodes already actualized since the last state change.
    fresh: HashSet<NodeId>,

    /// Effects and lifecycle hooks to run after commit.
    pub(crate) jobs: Vec<Job>,

    /// Listeners registered inside this transaction.
    pub(crate) added_listeners: Vec<(NodeId, ListenerId)>,

    /// Listeners unsubscribed inside this transaction. They hear nothing
    /// more and are detached once the transaction has ended.
    pub(crate) removed_listeners: Vec<(NodeId, ListenerId)>,

    /// First error a nested call reported; forces the abort of the whole
    /// transaction even if the caller swallowed it.
    pub(crate) poison: Option<Error>,
}

impl Transaction {
    pub(crate) fn new(cause: Cache) -> Self {
        Self {
            id: TxId::next(),
            depth: 0,
            cause,
            patches: IndexMap::new(),
            stale: HashSet::new(),
            queue: VecDeque::new(),
            fresh: HashSet::new(),
            jobs: Vec::new(),
            added_listeners: Vec::new(),
            removed_listeners: Vec::new(),
            poison: None,
        }
    }

    /// The record currently in effect for `id`: the pending one if any,
    /// otherwise the committed one.
    pub(crate) fn current<'a>(
        &'a self,
        committed: &'a HashMap<NodeId, Cache>,
        id: NodeId,
    ) -> Option<&'a Cache> {
        self.patches.get(&id).or_else(|| committed.get(&id))
    }

    /// Store a new record for its node.
    pub(crate) fn record(&mut self, record: Cache) {
        self.patches.insert(record.node.id(), record);
    }

    /// Mutable access to the pending record of `id`, copying the committed
    /// record into the patch map first. Shared records are cloned, never
    /// mutated.
    pub(crate) fn patch_mut(
        &mut self,
        committed: &HashMap<NodeId, Cache>,
        id: NodeId,
    ) -> Option<&mut CacheRecord> {
        if !self.patches.contains_key(&id) {
            let record = committed.get(&id)?;
            self.patches.insert(id, Rc::clone(record));
        }
        self.patches.get_mut(&id).map(Rc::make_mut)
    }

    pub(crate) fn is_stale(&self, id: NodeId) -> bool {
        self.stale.contains(&id)
    }

    pub(crate) fn is_fresh(&self, id: NodeId) -> bool {
        self.fresh.contains(&id)
    }

    /// Record that `id` is up to date for the current state of the graph.
    pub(crate) fn settle(&mut self, id: NodeId) {
        self.stale.remove(&id);
        self.fresh.insert(id);
    }

    /// React to a state change of `changed`: every connected dependent,
    /// transitively, becomes stale and is queued for recomputation.
    ///
    /// Returns how many nodes were newly marked.
    pub(crate) fn invalidate(
        &mut self,
        committed: &HashMap<NodeId, Cache>,
        changed: &CacheRecord,
    ) -> usize {
        self.fresh.clear();

        let mut marked = 0;
        let mut pending: Vec<NodeId> = changed.subs.iter().rev().copied().collect();

        while let Some(id) = pending.pop() {
            if !self.stale.insert(id) {
                continue;
            }
            marked += 1;
            self.queue.push_back(id);

            if let Some(record) = self.current(committed, id) {
                pending.extend(record.subs.iter().rev().copied());
            }
        }

        marked
    }

    /// Next queued node that is still stale.
    pub(crate) fn next_stale(&mut self) -> Option<NodeId> {
        while let Some(id) = self.queue.pop_front() {
            if self.stale.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Drop a queued node without recomputing it (it lost its observers).
    pub(crate) fn forget_stale(&mut self, id: NodeId) {
        self.stale.remove(&id);
    }

    /// Records produced so far, in first-touch order.
    pub(crate) fn log(&self) -> Vec<Cache> {
        self.patches.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Node;
    use std::sync::Arc;

    fn committed(
        store: &mut HashMap<NodeId, Cache>,
        root: &Cache,
        subs: &[NodeId],
    ) -> NodeId {
        let mut record =
            CacheRecord::new(Node::action(None), Arc::new(()), Rc::clone(root), TxId::ROOT);
        record.subs.extend(subs.iter().copied());
        let id = record.node.id();
        store.insert(id, Rc::new(record));
        id
    }

    #[test]
    fn transaction_ids_increase() {
        let a = TxId::next();
        let b = TxId::next();
        assert!(b > a);
        assert_ne!(a, TxId::ROOT);
    }

    #[test]
    fn invalidation_marks_diamond_once() {
        let root = CacheRecord::root();
        let mut store = HashMap::new();

        let d = committed(&mut store, &root, &[]);
        let b = committed(&mut store, &root, &[d]);
        let c = committed(&mut store, &root, &[d]);
        let a = committed(&mut store, &root, &[b, c]);

        let mut tx = Transaction::new(Rc::clone(&root));
        let changed = Rc::clone(&store[&a]);
        assert_eq!(tx.invalidate(&store, &changed), 3);

        let mut order = Vec::new();
        while let Some(id) = tx.next_stale() {
            order.push(id);
            tx.settle(id);
        }
        assert_eq!(order, vec![b, d, c]);
    }

    #[test]
    fn settled_nodes_are_skipped() {
        let root = CacheRecord::root();
        let mut store = HashMap::new();
        let c = committed(&mut store, &root, &[]);
        let b = committed(&mut store, &root, &[c]);
        let a = committed(&mut store, &root, &[b]);

        let mut tx = Transaction::new(Rc::clone(&root));
        let changed = Rc::clone(&store[&a]);
        tx.invalidate(&store, &changed);

        // c was pulled while b recomputed
        tx.settle(c);
        assert_eq!(tx.next_stale(), Some(b));
        tx.settle(b);
        assert_eq!(tx.next_stale(), None);
        assert!(tx.is_fresh(c));
    }

    #[test]
    fn invalidation_clears_freshness() {
        let root = CacheRecord::root();
        let mut store = HashMap::new();
        let a = committed(&mut store, &root, &[]);

        let mut tx = Transaction::new(Rc::clone(&root));
        tx.settle(a);
        assert!(tx.is_fresh(a));

        let changed = Rc::clone(&store[&a]);
        tx.invalidate(&store, &changed);
        assert!(!tx.is_fresh(a));
    }

    #[test]
    fn patch_mut_copies_shared_records() {
        let root = CacheRecord::root();
        let mut store = HashMap::new();
        let a = committed(&mut store, &root, &[]);
        let sub = NodeId::new();

        let mut tx = Transaction::new(Rc::clone(&root));
        tx.patch_mut(&store, a).unwrap().subs.insert(sub);

        assert!(store[&a].subs.is_empty());
        assert!(tx.current(&store, a).unwrap().subs.contains(&sub));
        assert!(tx.current(&store, a).unwrap().same_state(&store[&a]));
        assert_eq!(tx.log().len(), 1);
    }
}
