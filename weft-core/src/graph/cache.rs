//! Cache Records
//!
//! A cache record is the snapshot of one node's state inside one context at
//! one point of the graph's history. Records are immutable once shared: a
//! transaction that changes a node builds a new record, and the commit swaps
//! it in. Old records stay alive for as long as something still points at
//! them (a dependent's `pubs`, a descendant's `cause`).

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{Node, NodeId, State};
use super::transaction::TxId;

/// Shared handle to a cache record.
pub type Cache = Rc<CacheRecord>;

/// Dependency records in first-read order.
pub(crate) type Pubs = SmallVec<[Cache; 4]>;

/// Snapshot of a node's state, dependencies, dependents and provenance.
#[derive(Clone)]
pub struct CacheRecord {
    pub(crate) node: Node,
    pub(crate) state: State,
    pub(crate) pubs: Pubs,
    pub(crate) subs: IndexSet<NodeId>,
    pub(crate) cause: Option<Cache>,
    pub(crate) tx: TxId,
}

impl CacheRecord {
    /// The sentinel record every cause chain ends in.
    pub(crate) fn root() -> Cache {
        Rc::new(Self {
            node: Node::root(),
            state: Arc::new(()),
            pubs: Pubs::new(),
            subs: IndexSet::new(),
            cause: None,
            tx: TxId::ROOT,
        })
    }

    pub(crate) fn new(node: Node, state: State, cause: Cache, tx: TxId) -> Self {
        Self {
            node,
            state,
            pubs: Pubs::new(),
            subs: IndexSet::new(),
            cause: Some(cause),
            tx,
        }
    }

    /// The node this record belongs to.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The erased state.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The state downcast to `T`.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    /// Dependency records read by the computation that produced this record.
    pub fn pubs(&self) -> &[Cache] {
        &self.pubs
    }

    /// Connected dependents.
    pub fn subs(&self) -> &IndexSet<NodeId> {
        &self.subs
    }

    /// The record that caused this one. `None` only for the root sentinel.
    pub fn cause(&self) -> Option<&Cache> {
        self.cause.as_ref()
    }

    /// Transaction that produced this record.
    pub fn transaction(&self) -> TxId {
        self.tx
    }

    /// Whether this is the root sentinel.
    pub fn is_root(&self) -> bool {
        self.cause.is_none()
    }

    /// Whether both records hold the very same state value.
    pub(crate) fn same_state(&self, other: &CacheRecord) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Walk the cause chain backwards, starting with this record's cause and
    /// ending with the root sentinel.
    pub fn cause_chain(&self) -> CauseChain<'_> {
        CauseChain {
            next: self.cause.as_deref(),
        }
    }

    /// Render the cause trail as `"parent <-- grandparent"`, or `"root"` when
    /// the record was caused directly by the root.
    pub fn describe_cause(&self) -> String {
        let trail: Vec<String> = self
            .cause_chain()
            .take_while(|record| !record.is_root())
            .map(|record| record.node.label())
            .collect();

        if trail.is_empty() {
            "root".to_owned()
        } else {
            trail.join(" <-- ")
        }
    }
}

/// Count how often `id` appears in the chain starting at (and including)
/// `record`.
pub(crate) fn occurrences(record: &CacheRecord, id: NodeId) -> usize {
    std::iter::once(record)
        .chain(record.cause_chain())
        .filter(|r| r.node.id() == id)
        .count()
}

/// Iterator over a record's ancestors, see [`CacheRecord::cause_chain`].
pub struct CauseChain<'a> {
    next: Option<&'a CacheRecord>,
}

impl<'a> Iterator for CauseChain<'a> {
    type Item = &'a CacheRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.cause.as_deref();
        Some(current)
    }
}

impl fmt::Debug for CacheRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pubs: Vec<String> = self.pubs.iter().map(|p| p.node.label()).collect();
        f.debug_struct("CacheRecord")
            .field("node", &self.node.label())
            .field("tx", &self.tx)
            .field("pubs", &pubs)
            .field("subs", &self.subs)
            .field("cause", &self.cause.as_ref().map(|c| c.node.label()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, cause: &Cache) -> Cache {
        Rc::new(CacheRecord::new(
            Node::action(Some(name.to_owned())),
            Arc::new(()),
            Rc::clone(cause),
            TxId::ROOT,
        ))
    }

    #[test]
    fn root_is_terminal() {
        let root = CacheRecord::root();
        assert!(root.is_root());
        assert_eq!(root.cause_chain().count(), 0);
    }

    #[test]
    fn describes_cause_trail() {
        let root = CacheRecord::root();
        let act1 = record("act1", &root);
        let act2 = record("act2", &act1);
        let a1 = record("a1", &act2);

        assert_eq!(act1.describe_cause(), "root");
        assert_eq!(a1.describe_cause(), "act2 <-- act1");
        assert_eq!(a1.cause_chain().count(), 3);
    }

    #[test]
    fn counts_occurrences_including_start() {
        let root = CacheRecord::root();
        let first = record("loop", &root);
        let mut second = CacheRecord::clone(&first);
        second.cause = Some(Rc::clone(&first));
        let second = Rc::new(second);

        assert_eq!(occurrences(&second, first.node.id()), 2);
        assert_eq!(occurrences(&root, first.node.id()), 0);
    }
}
