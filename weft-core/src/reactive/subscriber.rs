//! Subscriptions
//!
//! External observers of a context: per-node listeners, called with the new
//! state after each commit that changed the node, and transaction listeners,
//! called with the log of every finished transaction.
//!
//! A listener keeps its node connected. Dropping the [`Subscription`]
//! removes the listener and, if it was the last observer, disconnects the
//! node before `drop` returns.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::atom::Readable;
use super::runtime::{Context, ContextInner};
use crate::error::{Error, Result};
use crate::graph::{Cache, HookHandle, Node, State};

/// Erased per-node listener.
pub type Listener = Rc<RefCell<dyn FnMut(&State)>>;

/// Listener for finished transactions: the log of records they produced and
/// the error that aborted them, if any.
pub(crate) type TransactionListener = Rc<RefCell<dyn FnMut(&[Cache], Option<&Error>)>>;

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn notify(listener: &Listener, state: &State) {
    match listener.try_borrow_mut() {
        Ok(mut listener) => (&mut *listener)(state),
        Err(_) => debug!("listener is still running, notification skipped"),
    }
}

pub(crate) fn notify_transaction(
    listener: &TransactionListener,
    log: &[Cache],
    error: Option<&Error>,
) {
    match listener.try_borrow_mut() {
        Ok(mut listener) => (&mut *listener)(log, error),
        Err(_) => debug!("transaction listener is still running, notification skipped"),
    }
}

/// Listener notifications handed to a custom scheduler.
///
/// See [`ContextOptions::on_notifications_scheduled`](crate::ContextOptions::on_notifications_scheduled).
/// The batch keeps growing until it is delivered, so a listener hears once
/// about any number of commits, with the latest state. Dropping it without
/// delivering discards what is pending.
pub struct PendingNotifications {
    ctx: Option<Weak<ContextInner>>,
}

impl PendingNotifications {
    pub(crate) fn new(ctx: &Context) -> Self {
        Self {
            ctx: Some(ctx.downgrade()),
        }
    }

    /// Call every listener with pending changes. Listeners removed since
    /// the commit are skipped.
    pub fn deliver(mut self) {
        if let Some(inner) = self.ctx.take().and_then(|ctx| ctx.upgrade()) {
            Context::from_inner(inner).deliver_pending();
        }
    }
}

impl Drop for PendingNotifications {
    fn drop(&mut self) {
        let Some(inner) = self.ctx.take().and_then(|ctx| ctx.upgrade()) else {
            return;
        };
        if let Ok(mut store) = inner.store.try_borrow_mut() {
            if !store.pending.is_empty() {
                debug!(count = store.pending.len(), "pending notifications discarded");
                store.pending.clear();
            }
        };
    }
}

impl fmt::Debug for PendingNotifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingNotifications").finish_non_exhaustive()
    }
}

enum Target {
    Node(Node, ListenerId),
    Transactions(ListenerId),
}

/// Registration of a listener. Unsubscribes when dropped.
pub struct Subscription {
    ctx: Weak<ContextInner>,
    target: Target,
    active: bool,
}

impl Subscription {
    pub(crate) fn node(ctx: &Context, node: Node, id: ListenerId) -> Self {
        Self {
            ctx: ctx.downgrade(),
            target: Target::Node(node, id),
            active: true,
        }
    }

    pub(crate) fn transactions(ctx: &Context, id: ListenerId) -> Self {
        Self {
            ctx: ctx.downgrade(),
            target: Target::Transactions(id),
            active: true,
        }
    }

    /// Remove the listener, reporting failures of the disconnect.
    ///
    /// Inside a transaction the listener goes silent at once and is
    /// detached when the transaction ends, even if it aborts.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.release()
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.active && self.ctx.strong_count() > 0
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.active) {
            return Ok(());
        }
        let Some(inner) = self.ctx.upgrade() else {
            return Ok(());
        };

        let ctx = Context::from_inner(inner);
        match &self.target {
            Target::Node(node, id) => ctx.remove_listener(node, *id),
            Target::Transactions(id) => {
                ctx.remove_transaction_listener(*id);
                Ok(())
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(%error, "unsubscribe failed");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Node(node, _) => node.label(),
            Target::Transactions(_) => "transactions".to_owned(),
        };
        f.debug_struct("Subscription")
            .field("target", &target)
            .field("active", &self.active)
            .finish()
    }
}

/// Register a hook fired when `target` gains its first observer in a
/// context.
pub fn on_connect<R, F>(target: &R, hook: F) -> HookHandle
where
    R: Readable + ?Sized,
    F: Fn(&Context) + Send + Sync + 'static,
{
    target.node().on_connect(hook)
}

/// Register a hook fired when `target` loses its last observer in a
/// context.
pub fn on_disconnect<R, F>(target: &R, hook: F) -> HookHandle
where
    R: Readable + ?Sized,
    F: Fn(&Context) + Send + Sync + 'static,
{
    target.node().on_disconnect(hook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::AtomMut;
    use std::cell::Cell;

    #[test]
    fn listener_ids_are_unique() {
        let id1 = ListenerId::new();
        let id2 = ListenerId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let ctx = Context::new();
        let count = AtomMut::new(0);
        let calls = Rc::new(Cell::new(0));

        let sub = ctx
            .subscribe(&count, {
                let calls = Rc::clone(&calls);
                move |_| calls.set(calls.get() + 1)
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert!(sub.is_active());

        ctx.set(&count, 1).unwrap();
        assert_eq!(calls.get(), 2);

        drop(sub);
        ctx.set(&count, 2).unwrap();
        assert_eq!(calls.get(), 2);
        assert!(!ctx.is_connected(&count));
    }

    #[test]
    fn running_listener_is_rejected() {
        let ctx = Context::new();
        let count = AtomMut::new(0);
        let listener: Listener = Rc::new(RefCell::new(|_: &State| {}));

        let _running = listener.borrow_mut();
        let err = ctx.subscribe_node(count.node(), Rc::clone(&listener)).unwrap_err();
        assert!(matches!(err, Error::InvalidSubscriber { .. }));
        assert!(!ctx.is_connected(&count));
    }

    #[test]
    fn subscription_outlives_context() {
        let ctx = Context::new();
        let count = AtomMut::new(0);
        let sub = ctx.subscribe(&count, |_| {}).unwrap();
        drop(ctx);
        assert!(!sub.is_active());
        sub.unsubscribe().unwrap();
    }
}
