//! Weft Core
//!
//! This crate provides an incremental, lazily evaluated reactive
//! computation graph. It implements:
//!
//! - Computed and source atoms with dynamic dependency discovery
//! - Glitch-free propagation with early cutoff on equal values
//! - Transactions that batch any number of changes into one commit
//! - Connect/disconnect lifecycle hooks driven by observation
//! - Deferred effects that keep track of what caused them
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node descriptors, cache records and transactions
//! - `reactive`: typed handles, tracking, the engine and the context
//! - `config`: engine policy and context options
//! - `error`: the error type shared by every operation
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::{Action, Atom, AtomMut, Context};
//!
//! let items = AtomMut::named("items", vec![1, 2, 3]);
//! let total = Atom::named("total", {
//!     let items = items.clone();
//!     move |spy, _| Ok(spy.get(&items)?.iter().sum::<i32>())
//! });
//! let add = Action::with("add", {
//!     let items = items.clone();
//!     move |ctx: &Context, item: &i32| {
//!         ctx.update(&items, |items| [items.as_slice(), &[*item]].concat())?;
//!         Ok(())
//!     }
//! });
//!
//! let ctx = Context::new();
//! let _sub = ctx.subscribe(&total, |total| println!("total: {total}"))?;
//! // prints "total: 6"
//!
//! ctx.batch(|ctx| {
//!     ctx.dispatch(&add, 4)?;
//!     ctx.dispatch(&add, 5)
//! })?;
//! // prints "total: 15", once
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{ContextOptions, EngineConfig};
pub use error::{Error, Result};
pub use graph::{Cache, CacheRecord, Node, NodeId, TxId};
pub use reactive::{
    on_connect, on_disconnect, Action, ActionCall, Atom, AtomMut, Context, Deferred,
    PendingNotifications, Readable, ScheduledEffect, Spy, Subscription,
};
