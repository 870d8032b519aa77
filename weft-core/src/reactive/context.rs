//! Dependency Tracking
//!
//! Every computation and every action body runs inside a [`Frame`] pushed on
//! the context's frame stack. While the frame is open, the computation's
//! [`Spy`] records each node it reads (once, in first-read order) and
//! collects the effects it schedules. When the computation returns the frame
//! is closed and the spy becomes unusable.
//!
//! The frame stack also answers two questions for the engine: "what caused
//! the work happening right now" (the top frame's cause) and "is this node
//! already being computed" (a synchronous dependency cycle).

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use super::action::CallLog;
use super::atom::Readable;
use super::effect::{Deferred, Job};
use super::runtime::Context;
use crate::error::{Error, Result};
use crate::graph::{Cache, Node, NodeId, Pubs};

/// One open computation.
pub(crate) struct Frame {
    node: Node,
    prev: Option<Cache>,
    cause: Cache,
    pubs: RefCell<Pubs>,
    seen: RefCell<HashSet<NodeId>>,
    jobs: RefCell<Vec<Job>>,
    active: Cell<bool>,
}

impl Frame {
    pub(crate) fn new(node: Node, prev: Option<Cache>, cause: Cache) -> Rc<Self> {
        Rc::new(Self {
            node,
            prev,
            cause,
            pubs: RefCell::new(Pubs::new()),
            seen: RefCell::new(HashSet::new()),
            jobs: RefCell::new(Vec::new()),
            active: Cell::new(true),
        })
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    /// Cause of everything produced inside this frame.
    pub(crate) fn cause(&self) -> &Cache {
        &self.cause
    }

    /// The record of `id` the previous run of this computation read.
    fn previous_read(&self, id: NodeId) -> Option<&Cache> {
        self.prev
            .as_ref()?
            .pubs
            .iter()
            .find(|record| record.node.id() == id)
    }

    fn track(&self, record: &Cache) {
        if self.seen.borrow_mut().insert(record.node.id()) {
            self.pubs.borrow_mut().push(Rc::clone(record));
        }
    }

    pub(crate) fn push_job(&self, job: Job) {
        self.jobs.borrow_mut().push(job);
    }

    /// Close the frame, handing back what it collected.
    pub(crate) fn finish(&self) -> (Pubs, Vec<Job>) {
        self.active.set(false);
        (self.pubs.take(), self.jobs.take())
    }
}

/// Keeps a frame on the stack for as long as it lives.
///
/// The frame is popped when the guard is dropped, also when the computation
/// panics.
pub(crate) struct FrameGuard {
    ctx: Context,
    frame: Rc<Frame>,
}

impl FrameGuard {
    pub(crate) fn enter(ctx: &Context, frame: Rc<Frame>) -> Self {
        ctx.store().frames.push(Rc::clone(&frame));
        Self {
            ctx: ctx.clone(),
            frame,
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.frame.active.set(false);
        if let Ok(mut store) = self.ctx.inner.store.try_borrow_mut() {
            let popped = store.frames.pop();
            debug_assert!(
                popped.is_some_and(|frame| Rc::ptr_eq(&frame, &self.frame)),
                "frame stack mismatch for `{}`",
                self.frame.node.label()
            );
        }
    }
}

/// Tracking handle passed to a computation.
///
/// Reading a node through the spy makes it a dependency of the running
/// computation. The handle is only valid while that computation runs; a
/// clone smuggled out (into an effect, say) fails with
/// [`Error::StaleTracking`].
#[derive(Clone)]
pub struct Spy {
    ctx: Context,
    frame: Rc<Frame>,
}

impl Spy {
    pub(crate) fn new(ctx: &Context, frame: Rc<Frame>) -> Self {
        Self {
            ctx: ctx.clone(),
            frame,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.frame.active.get() {
            Ok(())
        } else {
            Err(Error::StaleTracking {
                node: self.frame.node.label(),
            })
        }
    }

    /// Read `target`, registering it as a dependency.
    ///
    /// Reading an action yields the calls this computation has not seen yet:
    /// the calls appended since its previous run within the same
    /// transaction, or the whole log of a later dispatching transaction.
    /// On its first run a computation only sees calls made in the current
    /// transaction.
    pub fn get<R>(&self, target: &R) -> Result<R::Value>
    where
        R: Readable + ?Sized,
    {
        self.ensure_active()?;

        let node = target.node();
        let record = self.ctx.actualize(node)?;
        let skip = if node.is_action() {
            self.unseen_from(&record)
        } else {
            0
        };

        self.frame.track(&record);
        target.extract(record.state(), skip)
    }

    fn unseen_from(&self, record: &Cache) -> usize {
        let len = CallLog::len(record.state());
        match self.frame.previous_read(record.node.id()) {
            Some(seen) if seen.same_state(record) => len,
            Some(seen) if seen.tx == record.tx => CallLog::len(seen.state()),
            Some(_) => 0,
            None if record.tx == self.ctx.store().tx().id => 0,
            None => len,
        }
    }

    /// Schedule `effect` to run after the current transaction commits.
    ///
    /// The effect is attributed to the record this computation produces.
    pub fn schedule<T, F>(&self, effect: F) -> Result<Deferred<T>>
    where
        T: 'static,
        F: FnOnce(&Context) -> Result<T> + 'static,
    {
        self.ensure_active()?;
        let (job, deferred) = Job::effect(effect);
        self.frame.push_job(job);
        Ok(deferred)
    }

    /// The node being computed.
    pub fn node(&self) -> &Node {
        self.frame.node()
    }

    /// The record that triggered this computation.
    pub fn cause(&self) -> &Cache {
        self.frame.cause()
    }

    /// Whether the computation is still running.
    pub fn is_active(&self) -> bool {
        self.frame.active.get()
    }
}

impl fmt::Debug for Spy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spy")
            .field("node", &self.frame.node.label())
            .field("active", &self.frame.active.get())
            .finish()
    }
}
