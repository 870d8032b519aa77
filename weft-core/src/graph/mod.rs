//! Dependency Graph
//!
//! The data model of the reactive graph.
//!
//! # Overview
//!
//! - [`Node`]s are static descriptors, shared by every context.
//! - [`CacheRecord`]s are per-context snapshots of a node: its state, the
//!   records it read (`pubs`), its connected dependents (`subs`), and the
//!   record that caused it.
//! - A [`Transaction`] collects new records until they are committed.
//!
//! Edges point both ways but never own each other: `pubs` hold the exact
//! dependency records a computation saw, while `subs` hold node ids resolved
//! through the context's store. Cycles through dependents are therefore
//! representable without reference cycles, and disconnecting never leaves a
//! dangling reference.

mod cache;
mod node;
mod transaction;

pub use cache::{Cache, CacheRecord, CauseChain};
pub use node::{Hook, HookHandle, Lifecycle, Node, NodeId, NodeKind, State};
pub use transaction::TxId;

pub(crate) use cache::{occurrences, Pubs};
pub(crate) use node::ComputeFn;
pub(crate) use transaction::Transaction;
