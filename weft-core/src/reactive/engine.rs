//! Actualization Engine
//!
//! Reading a node *actualizes* it: the engine makes sure the node's record
//! agrees with the current state of everything it read last time, and
//! recomputes it otherwise.
//!
//! # Staleness
//!
//! 1. A node that was never computed is computed.
//! 2. A connected node that was not invalidated in this transaction is a
//!    cache hit. Every state change marks connected dependents stale, so a
//!    connected record without a mark is current.
//! 3. Anything else walks its previous dependencies in order, actualizing
//!    each. The first one whose state differs from the recorded one triggers
//!    a recomputation, and its record becomes the cause of the new record.
//!    If none differs the record is kept.
//!
//! Unconnected nodes are pure pull: nothing marks them, and a per-epoch
//! freshness memo on the transaction keeps repeated reads cheap.
//!
//! # Lifecycle
//!
//! A node is connected while it has listeners or connected dependents.
//! Connection state changes only through [`Store::link`] and
//! [`Store::unlink`]. Connecting a node queues its connect hooks and then
//! links it into each of its dependencies, connecting those that had no
//! observers yet; disconnecting mirrors it. Hooks run after commit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::action::{Action, ActionCall, CallLog};
use super::context::{Frame, FrameGuard, Spy};
use super::effect::Job;
use super::runtime::Context;
use super::subscriber::{Listener, ListenerId, TransactionListener};
use crate::error::{Error, Result};
use crate::graph::{
    occurrences, Cache, CacheRecord, Lifecycle, Node, NodeId, NodeKind, State, Transaction,
};

const NO_TRANSACTION: &str = "graph access outside of a transaction";

/// Mutable state of a context.
#[derive(Default)]
pub(crate) struct Store {
    /// Committed records.
    pub(crate) caches: HashMap<NodeId, Cache>,
    pub(crate) listeners: HashMap<NodeId, IndexMap<ListenerId, Listener>>,
    pub(crate) tx_listeners: IndexMap<ListenerId, TransactionListener>,
    pub(crate) tx: Option<Transaction>,
    pub(crate) frames: Vec<Rc<Frame>>,
    /// Hooks and effects of committed transactions, in FIFO order.
    pub(crate) queue: VecDeque<Job>,
    pub(crate) flushing: bool,
    /// Cause of the effect currently running.
    pub(crate) ambient_cause: Option<Cache>,
    /// Runaway chain detected while flushing.
    pub(crate) runaway: Option<Error>,
    /// Latest undelivered state per listener, when notifications are handed
    /// to a custom scheduler.
    pub(crate) pending: IndexMap<(NodeId, ListenerId), (Listener, State)>,
}

impl Store {
    pub(crate) fn tx(&self) -> &Transaction {
        self.tx.as_ref().expect(NO_TRANSACTION)
    }

    pub(crate) fn tx_mut(&mut self) -> &mut Transaction {
        self.tx.as_mut().expect(NO_TRANSACTION)
    }

    /// The record in effect for `id`, pending or committed.
    pub(crate) fn current(&self, id: NodeId) -> Option<&Cache> {
        match &self.tx {
            Some(tx) => tx.current(&self.caches, id),
            None => self.caches.get(&id),
        }
    }

    fn patch_mut(&mut self, id: NodeId) -> Option<&mut CacheRecord> {
        let tx = self.tx.as_mut().expect(NO_TRANSACTION);
        tx.patch_mut(&self.caches, id)
    }

    pub(crate) fn is_connected(&self, id: NodeId) -> bool {
        self.listeners.get(&id).is_some_and(|l| !l.is_empty())
            || self.current(id).is_some_and(|r| !r.subs.is_empty())
    }

    fn is_computing(&self, id: NodeId) -> bool {
        self.frames.iter().any(|frame| frame.node().id() == id)
    }

    /// Cause of whatever is being produced right now.
    pub(crate) fn current_cause(&self) -> Cache {
        match self.frames.last() {
            Some(frame) => Rc::clone(frame.cause()),
            None => Rc::clone(&self.tx().cause),
        }
    }

    /// Queue `job` on the innermost frame, or on the transaction.
    pub(crate) fn enqueue(&mut self, mut job: Job) {
        if let Some(frame) = self.frames.last() {
            frame.push_job(job);
            return;
        }
        let tx = self.tx_mut();
        job.bind(&tx.cause);
        tx.jobs.push(job);
    }

    /// Queue jobs collected by a frame, attributed to `record`.
    fn adopt(&mut self, jobs: Vec<Job>, record: &Cache) {
        let tx = self.tx_mut();
        for mut job in jobs {
            job.bind(record);
            tx.jobs.push(job);
        }
    }

    /// Make `record` the node's pending record; when its state changed,
    /// invalidate connected dependents.
    fn put(&mut self, record: CacheRecord, changed: bool) -> Cache {
        let record = Rc::new(record);
        let tx = self.tx.as_mut().expect(NO_TRANSACTION);
        tx.record(Rc::clone(&record));

        if changed {
            let marked = tx.invalidate(&self.caches, &record);
            if marked > 0 {
                trace!(node = %record.node.label(), marked, "invalidated dependents");
            }
        }
        record
    }

    /// Add `sub` to the dependents of `id`.
    pub(crate) fn link(&mut self, id: NodeId, sub: NodeId) {
        let was_connected = self.is_connected(id);
        match self.patch_mut(id) {
            Some(record) => {
                record.subs.insert(sub);
            }
            None => return,
        }
        if !was_connected {
            self.connect(id);
        }
    }

    /// Remove `sub` from the dependents of `id`.
    pub(crate) fn unlink(&mut self, id: NodeId, sub: NodeId) {
        let removed = self
            .patch_mut(id)
            .is_some_and(|record| record.subs.shift_remove(&sub));
        if removed && !self.is_connected(id) {
            self.disconnect(id);
        }
    }

    fn connect(&mut self, id: NodeId) {
        let Some(record) = self.current(id).cloned() else {
            return;
        };
        debug!(node = %record.node.label(), "connect");

        self.queue_hooks(&record.node, Lifecycle::Connect);
        for dep in &record.pubs {
            self.link(dep.node.id(), id);
        }
    }

    fn disconnect(&mut self, id: NodeId) {
        let Some(record) = self.current(id).cloned() else {
            return;
        };
        debug!(node = %record.node.label(), "disconnect");

        self.tx_mut().forget_stale(id);
        self.queue_hooks(&record.node, Lifecycle::Disconnect);
        for dep in &record.pubs {
            self.unlink(dep.node.id(), id);
        }
    }

    /// Diff old and new dependencies by identity: link additions first, then
    /// unlink removals.
    fn relink(&mut self, id: NodeId, old: &[Cache], new: &[Cache]) {
        let before: HashSet<NodeId> = old.iter().map(|r| r.node.id()).collect();
        let after: HashSet<NodeId> = new.iter().map(|r| r.node.id()).collect();

        for dep in new.iter().filter(|r| !before.contains(&r.node.id())) {
            self.link(dep.node.id(), id);
        }
        for dep in old.iter().filter(|r| !after.contains(&r.node.id())) {
            self.unlink(dep.node.id(), id);
        }
    }

    fn queue_hooks(&mut self, node: &Node, lifecycle: Lifecycle) {
        let hooks = node.hooks(lifecycle);
        if hooks.is_empty() {
            return;
        }
        let tx = self.tx_mut();
        tx.jobs.extend(hooks.into_iter().map(Job::lifecycle));
    }

    pub(crate) fn add_listener(&mut self, id: NodeId, listener_id: ListenerId, listener: Listener) {
        let was_connected = self.is_connected(id);
        self.listeners
            .entry(id)
            .or_default()
            .insert(listener_id, listener);
        self.tx_mut().added_listeners.push((id, listener_id));

        if !was_connected {
            self.connect(id);
        }
    }

    pub(crate) fn remove_listener(&mut self, id: NodeId, listener_id: ListenerId) {
        if self.drop_listener(id, listener_id) && !self.is_connected(id) {
            self.disconnect(id);
        }
    }

    /// Forget a listener without touching the graph.
    pub(crate) fn drop_listener(&mut self, id: NodeId, listener_id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&id) else {
            return false;
        };
        let removed = listeners.shift_remove(&listener_id).is_some();
        if listeners.is_empty() {
            self.listeners.remove(&id);
        }
        removed
    }
}

impl Context {
    /// Bring `node` up to date and return its record.
    pub(crate) fn actualize(&self, node: &Node) -> Result<Cache> {
        let id = node.id();
        if node.kind() == NodeKind::Root {
            return Err(Error::Unreadable { node: node.label() });
        }
        let prev = {
            let store = self.store();
            if !node.is_action() && store.is_computing(id) {
                return Err(Error::CyclicDependency { node: node.label() });
            }

            let tx = store.tx();
            let prev = tx.current(&store.caches, id).cloned();
            if let Some(record) = &prev {
                let hit = node.is_action()
                    || tx.is_fresh(id)
                    || (!tx.is_stale(id) && store.is_connected(id));
                if hit {
                    return Ok(Rc::clone(record));
                }
            }
            prev
        };

        let record = match prev {
            None if node.is_action() => self.init_action(node),
            None => {
                let cause = self.store().current_cause();
                self.recompute(node, None, cause)?
            }
            Some(prev) => match self.changed_dependency(&prev)? {
                Some(cause) => self.recompute(node, Some(prev), cause)?,
                None => prev,
            },
        };

        self.store().tx_mut().settle(id);
        Ok(record)
    }

    /// The current record of the first dependency of `record` whose state
    /// changed since `record` was computed.
    fn changed_dependency(&self, record: &CacheRecord) -> Result<Option<Cache>> {
        for dep in &record.pubs {
            let current = self.actualize(&dep.node)?;
            if !current.same_state(dep) {
                return Ok(Some(current));
            }
        }
        Ok(None)
    }

    fn recompute(&self, node: &Node, prev: Option<Cache>, cause: Cache) -> Result<Cache> {
        let compute = Arc::clone(
            node.compute_fn()
                .expect("only computed nodes are recomputed"),
        );
        self.check_reentry(node, &cause)?;
        trace!(node = %node.label(), cause = %cause.node.label(), "recompute");

        let frame = Frame::new(node.clone(), prev.clone(), cause);
        let result = {
            let _guard = FrameGuard::enter(self, Rc::clone(&frame));
            let spy = Spy::new(self, Rc::clone(&frame));
            compute(&spy, prev.as_ref().map(|p| p.state()))
        };
        let (pubs, jobs) = frame.finish();

        let state = match result {
            Ok(state) => state,
            Err(error) => {
                let error = error.in_node(&node.label());
                for job in jobs {
                    job.reject(error.clone());
                }
                return Err(error);
            }
        };

        // Equal values keep the previous state so dependents see no change.
        let (state, changed) = match &prev {
            Some(prev) if node.same_value(prev.state(), &state) => (Arc::clone(prev.state()), false),
            _ => (state, true),
        };

        let mut guard = self.store();
        let store = &mut *guard;
        let subs = store
            .current(node.id())
            .map(|latest| latest.subs.clone())
            .unwrap_or_default();

        let mut record = CacheRecord::new(node.clone(), state, Rc::clone(frame.cause()), store.tx().id);
        record.pubs = pubs;
        record.subs = subs;
        let record = store.put(record, changed);

        if store.is_connected(node.id()) {
            let old = prev.as_ref().map_or(&[][..], |p| p.pubs());
            store.relink(node.id(), old, record.pubs());
        }
        store.adopt(jobs, &record);

        Ok(record)
    }

    fn init_action(&self, node: &Node) -> Cache {
        let mut store = self.store();
        let cause = store.current_cause();
        let tx_id = store.tx().id;
        store.put(CacheRecord::new(node.clone(), CallLog::empty(), cause, tx_id), false)
    }

    /// Replace a source node's state.
    pub(crate) fn write(&self, node: &Node, state: State) -> Result<()> {
        let current = self.actualize(node)?;
        if node.same_value(current.state(), &state) {
            return Ok(());
        }

        let cause = self.store().current_cause();
        self.check_reentry(node, &cause)?;

        let mut store = self.store();
        let mut record = CacheRecord::new(node.clone(), state, cause, store.tx().id);
        record.subs = current.subs.clone();
        store.put(record, true);
        Ok(())
    }

    /// Run one call of `action` inside the current transaction.
    pub(crate) fn dispatch_call<P, R>(&self, action: &Action<P, R>, params: P) -> Result<R>
    where
        P: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let node = action.node();
        self.actualize(node)?;

        let cause = self.store().current_cause();
        self.check_reentry(node, &cause)?;

        // Records produced by the body are caused by this call.
        let call = {
            let store = self.store();
            CacheRecord::new(node.clone(), CallLog::empty(), Rc::clone(&cause), store.tx().id)
        };
        let frame = Frame::new(node.clone(), None, Rc::new(call));
        let result = {
            let _guard = FrameGuard::enter(self, Rc::clone(&frame));
            action.call(self, &params)
        };
        let (_, jobs) = frame.finish();

        let payload = match result {
            Ok(payload) => payload,
            Err(error) => {
                let error = error.in_node(&node.label());
                for job in jobs {
                    job.reject(error.clone());
                }
                return Err(error);
            }
        };

        let mut guard = self.store();
        let store = &mut *guard;
        let tx_id = store.tx().id;
        let current = store
            .current(node.id())
            .cloned()
            .expect("dispatched action has a record");

        let entry = Arc::new(ActionCall {
            params,
            payload: payload.clone(),
        });
        let mut record = CacheRecord::new(
            node.clone(),
            CallLog::append(&current, tx_id, entry),
            cause,
            tx_id,
        );
        record.subs = current.subs.clone();
        let record = store.put(record, true);
        store.adopt(jobs, &record);

        Ok(payload)
    }

    /// Fail when `node` already appears too often in the chain of `cause`.
    fn check_reentry(&self, node: &Node, cause: &CacheRecord) -> Result<()> {
        let limit = self.config().max_effect_reentries;
        let count = occurrences(cause, node.id());
        if count > limit {
            warn!(node = %node.label(), count, limit, "cyclic update detected");
            return Err(Error::CyclicUpdate {
                node: node.label(),
                count,
                limit,
            });
        }
        Ok(())
    }
}
