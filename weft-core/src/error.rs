//! Error types for the reactive graph.
//!
//! Every fallible operation returns [`Result`]. Errors are cheap to clone so
//! that one failure can be delivered to the caller, to transaction listeners
//! and to every deferred effect handle of the aborted transaction.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A shareable boxed error raised by user code.
pub type BoxError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the reactive graph.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A node's computation (or an action body) failed.
    ///
    /// The enclosing transaction is aborted and nothing it wrote becomes
    /// visible.
    #[error("computation of `{node}` failed: {source}")]
    Computation {
        /// Label of the node whose computation failed.
        node: String,
        /// The underlying failure.
        #[source]
        source: BoxError,
    },

    /// A tracking handle was used after its computation finished.
    #[error("tracking handle of `{node}` used outside of its computation")]
    StaleTracking {
        /// Label of the node that owned the handle.
        node: String,
    },

    /// A listener cannot be invoked.
    #[error("invalid subscriber: {reason}")]
    InvalidSubscriber {
        /// Why the listener was rejected.
        reason: String,
    },

    /// An effect-triggered update chain re-entered the same node too often.
    #[error("update chain re-entered `{node}` {count} times (limit {limit})")]
    CyclicUpdate {
        /// Label of the re-entered node.
        node: String,
        /// How many times the node already appears in the cause chain.
        count: usize,
        /// Configured bound.
        limit: usize,
    },

    /// A computation (transitively) read itself.
    #[error("`{node}` depends on itself")]
    CyclicDependency {
        /// Label of the node found on its own dependency path.
        node: String,
    },

    /// Erased state did not have the type the handle expected.
    #[error("state of `{node}` is not a `{expected}`")]
    TypeMismatch {
        /// Label of the node.
        node: String,
        /// Expected Rust type name.
        expected: &'static str,
    },

    /// The node has no state of its own, like the root of cause chains.
    #[error("`{node}` cannot be read")]
    Unreadable {
        /// Label of the node.
        node: String,
    },

    /// A scheduled effect was dropped without running.
    #[error("scheduled effect was dropped before it ran")]
    Cancelled,

    /// Engine configuration could not be parsed.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// A failure raised by user code, not yet attributed to a node.
    #[error("{0}")]
    Failed(BoxError),
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl Error {
    /// Wrap an arbitrary error raised by a computation, action or effect.
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Raise a plain message as a failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(Arc::new(Message(message.into())))
    }

    /// Attribute a user failure to the node whose computation raised it.
    ///
    /// Errors that already carry their own meaning pass through unchanged.
    pub(crate) fn in_node(self, node: &str) -> Self {
        match self {
            Self::Failed(source) => Self::Computation {
                node: node.to_owned(),
                source,
            },
            other => other,
        }
    }

    /// Whether this is a computation failure.
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Computation { .. })
    }

    /// Whether this error reports a runaway effect chain.
    pub fn is_cyclic_update(&self) -> bool {
        matches!(self, Self::CyclicUpdate { .. })
    }
}
