//! Reactive Primitives
//!
//! This module implements the reactive layer on top of the graph model:
//! typed handles, dependency tracking, the actualization engine,
//! transactions, subscriptions and effects.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An [`Atom`] is a derived value computed from whatever it reads through its
//! [`Spy`]. An [`AtomMut`] is a source value set from outside.
//!
//! ## Actions
//!
//! An [`Action`] is an event source. Dispatching it runs its body inside a
//! transaction and appends the call to its log, which computations read
//! like any other node.
//!
//! ## Context
//!
//! A [`Context`] holds the state of one graph: current records, listeners,
//! the transaction in flight and queued effects. Reading a node pulls it up
//! to date; changing a node pushes invalidation to observed dependents,
//! which are recomputed before the transaction commits.
//!
//! ## Effects
//!
//! Effects scheduled during a transaction run after it commits, attributed
//! to the record that scheduled them. A chain of effects re-entering the
//! same node too often is stopped with
//! [`Error::CyclicUpdate`](crate::Error::CyclicUpdate).

mod action;
mod atom;
mod context;
mod effect;
mod engine;
mod runtime;
mod subscriber;

pub use action::{Action, ActionCall};
pub use atom::{Atom, AtomMut, Readable};
pub use context::Spy;
pub use effect::{Deferred, ScheduledEffect};
pub use runtime::Context;
pub use subscriber::{
    on_connect, on_disconnect, Listener, ListenerId, PendingNotifications, Subscription,
};

pub(crate) use effect::Job;
