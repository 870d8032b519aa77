//! Reactive Runtime
//!
//! [`Context`] owns everything that changes: the cache store, listeners, the
//! transaction in flight and the effect queue. Node descriptors hold no
//! per-context data, so independent contexts (one per test, say) coexist
//! without interfering.
//!
//! # Transactions
//!
//! Every public operation runs inside a transaction. The outermost call
//! opens it; nested calls (an action body dispatching another action, a
//! batch setting several atoms) join it. When the outermost call returns:
//!
//! 1. connected nodes invalidated during the transaction are recomputed,
//! 2. the new records are swapped into the store,
//! 3. transaction listeners get the log, node listeners their new state,
//! 4. queued lifecycle hooks and effects run, in queue order.
//!
//! Any error aborts the outermost transaction instead: nothing it wrote
//! becomes visible, listeners registered inside it are removed, deferred
//! handles of its effects are rejected, and transaction listeners receive
//! the partial log together with the error.
//!
//! # Threading
//!
//! A context is single-threaded (`!Send`). Its store sits in a `RefCell`
//! that is never borrowed while user code (computations, action bodies,
//! listeners, hooks, effects) runs.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, warn};

use super::action::Action;
use super::atom::{AtomMut, Readable};
use super::effect::{Deferred, Job, ScheduledEffect};
use super::engine::Store;
use super::subscriber::{
    notify, notify_transaction, Listener, ListenerId, PendingNotifications, Subscription,
    TransactionListener,
};
use crate::config::{ContextOptions, EngineConfig};
use crate::error::{Error, Result};
use crate::graph::{Cache, CacheRecord, Node, NodeId, State, Transaction};

pub(crate) struct ContextInner {
    pub(crate) store: RefCell<Store>,
    pub(crate) options: ContextOptions,
    pub(crate) root: Cache,
}

/// An isolated reactive graph.
///
/// Cloning yields another handle to the same graph.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Rc<ContextInner>,
}

impl Context {
    /// A context with default options.
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    /// A context with the given options.
    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                store: RefCell::new(Store::default()),
                options,
                root: CacheRecord::root(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn store(&self) -> RefMut<'_, Store> {
        self.inner.store.borrow_mut()
    }

    /// Engine policy of this context.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.options.config
    }

    /// The sentinel record every cause chain ends in.
    pub fn root(&self) -> &Cache {
        &self.inner.root
    }

    /// Read the current value of `target`, recomputing it if needed.
    pub fn read<R>(&self, target: &R) -> Result<R::Value>
    where
        R: Readable + ?Sized,
    {
        self.transact(|ctx| {
            let record = ctx.actualize(target.node())?;
            target.extract(record.state(), 0)
        })
    }

    /// Call `listener` with the current value of `target`, and with the new
    /// value after every committed change.
    ///
    /// The first call happens when the subscribing transaction commits:
    /// before `subscribe` returns at top level, at the end of the enclosing
    /// batch or action otherwise.
    ///
    /// The subscription keeps `target` (and everything it reads) connected.
    pub fn subscribe<R, F>(&self, target: &R, mut listener: F) -> Result<Subscription>
    where
        R: Readable + Clone + 'static,
        F: FnMut(R::Value) + 'static,
    {
        let decoder = target.clone();
        let listener: Listener = Rc::new(RefCell::new(move |state: &State| {
            match decoder.extract(state, 0) {
                Ok(value) => listener(value),
                Err(error) => warn!(%error, "listener skipped"),
            }
        }));
        self.subscribe_node(target.node(), listener)
    }

    /// Erased form of [`subscribe`](Self::subscribe).
    ///
    /// Fails with [`Error::InvalidSubscriber`] if `listener` is currently
    /// running and therefore cannot be invoked.
    pub fn subscribe_node(&self, node: &Node, listener: Listener) -> Result<Subscription> {
        if listener.try_borrow_mut().is_err() {
            return Err(Error::InvalidSubscriber {
                reason: format!("listener for `{}` is already running", node.label()),
            });
        }

        let id = ListenerId::new();
        let subscription = Subscription::node(self, node.clone(), id);
        self.transact(|ctx| {
            ctx.actualize(node)?;
            ctx.store().add_listener(node.id(), id, listener);
            Ok(())
        })?;
        Ok(subscription)
    }

    /// Call `listener` after every transaction that produced records, with
    /// their log and, for aborted transactions, the error.
    pub fn subscribe_transactions<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&[Cache], Option<&Error>) + 'static,
    {
        let id = ListenerId::new();
        let listener: TransactionListener = Rc::new(RefCell::new(listener));
        self.store().tx_listeners.insert(id, listener);
        Subscription::transactions(self, id)
    }

    pub(crate) fn remove_listener(&self, node: &Node, id: ListenerId) -> Result<()> {
        if let Some(tx) = self.store().tx.as_mut() {
            tx.removed_listeners.push((node.id(), id));
            return Ok(());
        }
        self.transact(|ctx| {
            ctx.store().remove_listener(node.id(), id);
            Ok(())
        })
    }

    /// Detach listeners unsubscribed while a transaction was in flight,
    /// whether it committed or not.
    fn detach(&self, removed: Vec<(NodeId, ListenerId)>) {
        if removed.is_empty() {
            return;
        }
        let detached = self.transact(|ctx| {
            let mut store = ctx.store();
            for (node, id) in removed {
                store.remove_listener(node, id);
            }
            Ok(())
        });
        if let Err(error) = detached {
            warn!(%error, "detaching listeners failed");
        }
    }

    pub(crate) fn remove_transaction_listener(&self, id: ListenerId) {
        self.store().tx_listeners.shift_remove(&id);
    }

    /// Dispatch `action`, returning the payload its body produced.
    pub fn dispatch<P, R>(&self, action: &Action<P, R>, params: P) -> Result<R>
    where
        P: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.transact(|ctx| ctx.dispatch_call(action, params))
    }

    /// Set a source atom. Setting an equal value changes nothing.
    pub fn set<T>(&self, atom: &AtomMut<T>, value: T) -> Result<()>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.transact(|ctx| ctx.write(atom.node(), Arc::new(value)))
    }

    /// Replace a source atom's value with `f(current)`, returning the new
    /// value.
    pub fn update<T, F>(&self, atom: &AtomMut<T>, f: F) -> Result<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        self.transact(|ctx| {
            let next = f(&ctx.read(atom)?);
            ctx.write(atom.node(), Arc::new(next.clone()))?;
            Ok(next)
        })
    }

    /// Run `body` as one transaction: its changes commit together, and
    /// listeners hear about them once.
    pub fn batch<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Context) -> Result<T>,
    {
        self.transact(body)
    }

    /// Schedule `effect` to run after the current transaction commits, or,
    /// outside of any transaction, right away after an empty one.
    pub fn schedule<T, F>(&self, effect: F) -> Deferred<T>
    where
        T: 'static,
        F: FnOnce(&Context) -> Result<T> + 'static,
    {
        let (job, deferred) = Job::effect(effect);
        let scheduled = self.transact(move |ctx| {
            ctx.store().enqueue(job);
            Ok(())
        });
        if let Err(error) = scheduled {
            debug!(%error, "effect queue drained with an error");
        }
        deferred
    }

    /// The committed record of `target`, without actualizing it.
    pub fn inspect<R>(&self, target: &R) -> Option<Cache>
    where
        R: Readable + ?Sized,
    {
        self.store().caches.get(&target.node().id()).cloned()
    }

    /// Whether `target` currently has observers in this context.
    pub fn is_connected<R>(&self, target: &R) -> bool
    where
        R: Readable + ?Sized,
    {
        self.store().is_connected(target.node().id())
    }

    /// Whether a transaction is in progress.
    pub fn in_transaction(&self) -> bool {
        self.store().tx.is_some()
    }

    /// Run `body` in the current transaction, or in a new one that commits
    /// (or aborts) when `body` returns.
    pub(crate) fn transact<T>(&self, body: impl FnOnce(&Context) -> Result<T>) -> Result<T> {
        let joined = match self.store().tx.as_mut() {
            Some(tx) => {
                tx.depth += 1;
                true
            }
            None => false,
        };
        if joined {
            return self.join(body);
        }

        let cause = self
            .store()
            .ambient_cause
            .clone()
            .unwrap_or_else(|| Rc::clone(&self.inner.root));
        self.store().tx = Some(Transaction::new(cause));
        let guard = TransactionGuard { ctx: self };

        let result = body(self).and_then(|value| {
            self.settle()?;
            Ok(value)
        });
        let poison = self.store().tx_mut().poison.take();
        let result = match (result, poison) {
            (Ok(_), Some(error)) => Err(error),
            (result, _) => result,
        };

        match result {
            Ok(value) => {
                let removed = self.commit();
                drop(guard);
                let flushed = self.flush();
                self.detach(removed);
                flushed.map(|()| value)
            }
            Err(error) => {
                let removed = self.abort(&error);
                self.detach(removed);
                Err(error)
            }
        }
    }

    fn join<T>(&self, body: impl FnOnce(&Context) -> Result<T>) -> Result<T> {
        let result = body(self);

        let mut store = self.store();
        if let Some(tx) = store.tx.as_mut() {
            tx.depth -= 1;
            if let Err(error) = &result {
                tx.poison.get_or_insert_with(|| error.clone());
            }
        }
        result
    }

    /// Recompute every connected node invalidated so far.
    fn settle(&self) -> Result<()> {
        loop {
            let node = {
                let mut guard = self.store();
                let store = &mut *guard;
                let Some(id) = store.tx_mut().next_stale() else {
                    break;
                };
                if !store.is_connected(id) {
                    store.tx_mut().forget_stale(id);
                    continue;
                }
                match store.current(id) {
                    Some(record) => record.node().clone(),
                    None => continue,
                }
            };
            self.actualize(&node)?;
        }
        Ok(())
    }

    /// Swap the transaction's records into the store and notify listeners.
    /// Returns the listeners unsubscribed during the transaction.
    fn commit(&self) -> Vec<(NodeId, ListenerId)> {
        let handoff = self.inner.options.on_effect_scheduled.clone();
        let late = self.inner.options.on_notifications_scheduled.clone();

        let (log, notifications, tx_listeners, handed, schedule_late, removed) = {
            let mut guard = self.store();
            let store = &mut *guard;
            let mut tx = store.tx.take().expect("commit without a transaction");

            let mut changes = Vec::new();
            for (id, record) in &tx.patches {
                let changed = store
                    .caches
                    .get(id)
                    .map_or(true, |old| !old.same_state(record));
                if !changed {
                    continue;
                }
                let Some(listeners) = store.listeners.get(id) else {
                    continue;
                };
                for (listener_id, listener) in listeners {
                    let key = (*id, *listener_id);
                    if !tx.added_listeners.contains(&key) && !tx.removed_listeners.contains(&key) {
                        changes.push((key, Rc::clone(listener), Arc::clone(record.state())));
                    }
                }
            }

            let patches = std::mem::take(&mut tx.patches);
            debug!(tx = %tx.id, patches = patches.len(), "commit");
            let log: Vec<Cache> = patches.values().cloned().collect();
            store.caches.extend(patches);

            // New listeners get the committed state, whether it changed or not.
            let mut notifications: Vec<(Listener, State)> = Vec::new();
            for key in &tx.added_listeners {
                if tx.removed_listeners.contains(key) {
                    continue;
                }
                let listener = store.listeners.get(&key.0).and_then(|l| l.get(&key.1));
                if let (Some(listener), Some(record)) = (listener, store.caches.get(&key.0)) {
                    notifications.push((Rc::clone(listener), Arc::clone(record.state())));
                }
            }

            let mut schedule_late = false;
            if late.is_some() {
                schedule_late = store.pending.is_empty() && !changes.is_empty();
                for (key, listener, state) in changes {
                    store.pending.insert(key, (listener, state));
                }
            } else {
                notifications.extend(changes.into_iter().map(|(_, listener, state)| (listener, state)));
            }

            let mut handed = Vec::new();
            for job in tx.jobs.drain(..) {
                if handoff.is_some() && !job.is_lifecycle() {
                    handed.push(job);
                } else {
                    store.queue.push_back(job);
                }
            }

            let tx_listeners: Vec<TransactionListener> = if log.is_empty() {
                Vec::new()
            } else {
                store.tx_listeners.values().cloned().collect()
            };
            let removed = std::mem::take(&mut tx.removed_listeners);
            (log, notifications, tx_listeners, handed, schedule_late, removed)
        };

        for listener in &tx_listeners {
            notify_transaction(listener, &log, None);
        }
        for (listener, state) in &notifications {
            notify(listener, state);
        }
        if let Some(handoff) = handoff {
            for job in handed {
                handoff(ScheduledEffect::new(self, job));
            }
        }
        if let (true, Some(late)) = (schedule_late, late) {
            late(PendingNotifications::new(self));
        }
        removed
    }

    /// Deliver the notifications collected for a custom scheduler.
    pub(crate) fn deliver_pending(&self) {
        let due: Vec<(Listener, State)> = {
            let mut guard = self.store();
            let store = &mut *guard;
            std::mem::take(&mut store.pending)
                .into_iter()
                .filter(|((node, id), _)| {
                    store.listeners.get(node).is_some_and(|l| l.contains_key(id))
                })
                .map(|(_, due)| due)
                .collect()
        };
        for (listener, state) in &due {
            notify(listener, state);
        }
    }

    /// Throw the transaction away. Returns the listeners unsubscribed
    /// during it; their removal stands.
    fn abort(&self, error: &Error) -> Vec<(NodeId, ListenerId)> {
        let (log, jobs, tx_listeners, removed) = {
            let mut guard = self.store();
            let store = &mut *guard;
            let Some(mut tx) = store.tx.take() else {
                return Vec::new();
            };

            for (node, id) in tx.added_listeners.drain(..) {
                store.drop_listener(node, id);
            }
            if store.flushing && error.is_cyclic_update() && store.runaway.is_none() {
                store.runaway = Some(error.clone());
            }
            warn!(tx = %tx.id, %error, "transaction aborted");

            let log = tx.log();
            let jobs = std::mem::take(&mut tx.jobs);
            let tx_listeners: Vec<TransactionListener> =
                store.tx_listeners.values().cloned().collect();
            let removed = std::mem::take(&mut tx.removed_listeners);
            (log, jobs, tx_listeners, removed)
        };

        for job in jobs {
            job.reject(error.clone());
        }
        for listener in &tx_listeners {
            notify_transaction(listener, &log, Some(error));
        }
        removed
    }

    /// Run queued hooks and effects until the queue is empty. Only the
    /// outermost call drains; it reports a runaway chain detected meanwhile.
    fn flush(&self) -> Result<()> {
        {
            let mut store = self.store();
            if store.flushing {
                return Ok(());
            }
            store.flushing = true;
        }
        let _guard = FlushGuard { ctx: self };

        while let Some(job) = self.next_job() {
            self.run_job(job);
        }

        match self.store().runaway.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_job(&self) -> Option<Job> {
        self.store().queue.pop_front()
    }

    /// Run `job` with its cause as the ambient cause.
    pub(crate) fn run_job(&self, job: Job) {
        let cause = job.cause().cloned();
        let previous = std::mem::replace(&mut self.store().ambient_cause, cause);
        job.run(self);
        self.store().ambient_cause = previous;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Discards a transaction left behind by a panicking body.
struct TransactionGuard<'a> {
    ctx: &'a Context,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut store) = self.ctx.inner.store.try_borrow_mut() {
            if store.tx.take().is_some() {
                warn!("transaction discarded after a panic");
            }
        }
    }
}

/// Clears the flushing flag, also when an effect panics.
struct FlushGuard<'a> {
    ctx: &'a Context,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut store) = self.ctx.inner.store.try_borrow_mut() {
            store.flushing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Atom;
    use std::cell::Cell;

    #[test]
    fn reads_are_cached() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let source = AtomMut::new(2i32);
        let square = Atom::new({
            let (source, runs) = (source.clone(), Arc::clone(&runs));
            move |spy, _| {
                runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(spy.get(&source)?.pow(2))
            }
        });

        let ctx = Context::new();
        assert_eq!(ctx.read(&square).unwrap(), 4);
        assert_eq!(ctx.read(&square).unwrap(), 4);
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        ctx.set(&source, 3).unwrap();
        assert_eq!(ctx.read(&square).unwrap(), 9);
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn contexts_are_isolated() {
        let source = AtomMut::new(1);
        let a = Context::new();
        let b = Context::new();

        a.set(&source, 5).unwrap();
        assert_eq!(a.read(&source).unwrap(), 5);
        assert_eq!(b.read(&source).unwrap(), 1);
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let ctx = Context::new();
        let source = AtomMut::new("same".to_owned());
        let transactions = Rc::new(Cell::new(0));

        let _sub = ctx.subscribe_transactions({
            let transactions = Rc::clone(&transactions);
            move |_, _| transactions.set(transactions.get() + 1)
        });
        ctx.read(&source).unwrap();
        assert_eq!(transactions.get(), 1);

        ctx.set(&source, "same".to_owned()).unwrap();
        assert_eq!(transactions.get(), 1);
    }

    #[test]
    fn swallowed_nested_error_still_aborts() {
        let ctx = Context::new();
        let source = AtomMut::new(0);
        let failing: Action<()> = Action::with("failing", |_, _| Err(Error::msg("nope")));

        let result = ctx.batch(|ctx| {
            ctx.set(&source, 1)?;
            let _ = ctx.dispatch(&failing, ());
            Ok(())
        });

        assert!(result.unwrap_err().is_computation());
        assert_eq!(ctx.read(&source).unwrap(), 0);
        assert!(!ctx.in_transaction());
    }

    #[test]
    fn scheduled_effect_runs_after_commit() {
        let ctx = Context::new();
        let source = AtomMut::new(1);

        let mut seen = ctx.batch(|ctx| {
            ctx.set(&source, 2)?;
            let source = source.clone();
            Ok(ctx.schedule(move |ctx| ctx.read(&source)))
        })
        .unwrap();

        assert_eq!(seen.try_take().unwrap().unwrap(), 2);
    }

    #[test]
    fn root_is_not_readable() {
        let ctx = Context::new();
        let root = ctx.root().node().clone();

        let err = ctx.read(&root).unwrap_err();
        assert!(matches!(err, Error::Unreadable { ref node } if node == "root"));

        let listener: Listener = Rc::new(RefCell::new(|_: &State| {}));
        assert!(ctx.subscribe_node(&root, listener).is_err());
        assert!(!ctx.in_transaction());
    }

    #[test]
    fn effects_are_handed_to_a_custom_scheduler() {
        let handed: Rc<RefCell<Vec<ScheduledEffect>>> = Rc::default();
        let options = ContextOptions::new().on_effect_scheduled({
            let handed = Rc::clone(&handed);
            move |effect| handed.borrow_mut().push(effect)
        });
        let ctx = Context::with_options(options);

        let mut deferred = ctx.schedule(|_| Ok("ran"));
        assert!(deferred.try_take().is_none());

        let effect = handed.borrow_mut().pop().unwrap();
        assert!(effect.cause().unwrap().is_root());
        effect.run();
        assert_eq!(deferred.try_take().unwrap().unwrap(), "ran");
    }
}
