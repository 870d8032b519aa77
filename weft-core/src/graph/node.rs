//! Graph Nodes
//!
//! A [`Node`] is the static descriptor of one reactive unit. It is created
//! once, never changes apart from its lifecycle hook registries, and may be
//! shared by any number of contexts. All per-context data (values, edges,
//! listeners) lives in [`CacheRecord`](super::CacheRecord)s owned by a
//! context.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::reactive::{Context, Spy};

/// Erased node state.
pub type State = Arc<dyn Any + Send + Sync>;

/// Erased computation: receives the tracking handle and the previous state.
pub(crate) type ComputeFn = Arc<dyn Fn(&Spy, Option<&State>) -> Result<State> + Send + Sync>;

/// Erased equality used for early cutoff.
pub(crate) type EqualsFn = fn(&State, &State) -> bool;

/// Lifecycle hook callback.
pub type Hook = Arc<dyn Fn(&Context) + Send + Sync>;

/// Unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of node this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A pure function of the nodes it spies on. Source atoms are computed
    /// nodes without dependencies whose value is set from outside.
    Computed,

    /// An event source. Its state is the log of calls made in the
    /// transaction that last dispatched it.
    Action,

    /// The sentinel every cause chain ends in.
    Root,
}

/// Which lifecycle transition a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Observer count went from zero to non-zero.
    Connect,

    /// Observer count went from non-zero to zero.
    Disconnect,
}

type HookRegistry = Mutex<Vec<(u64, Hook)>>;

struct NodeInner {
    id: NodeId,
    name: Option<String>,
    kind: NodeKind,
    compute: Option<ComputeFn>,
    equals: Option<EqualsFn>,
    connect_hooks: HookRegistry,
    disconnect_hooks: HookRegistry,
}

/// Static descriptor of a reactive unit.
///
/// Cloning a `Node` yields another handle to the same descriptor; equality
/// and hashing use the node's identity.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    fn build(
        kind: NodeKind,
        name: Option<String>,
        compute: Option<ComputeFn>,
        equals: Option<EqualsFn>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::new(),
                name,
                kind,
                compute,
                equals,
                connect_hooks: Mutex::new(Vec::new()),
                disconnect_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn computed(
        name: Option<String>,
        compute: ComputeFn,
        equals: Option<EqualsFn>,
    ) -> Self {
        Self::build(NodeKind::Computed, name, Some(compute), equals)
    }

    pub(crate) fn action(name: Option<String>) -> Self {
        Self::build(NodeKind::Action, name, None, None)
    }

    pub(crate) fn root() -> Self {
        Self::build(NodeKind::Root, Some("root".to_owned()), None, None)
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the node's name, if it was given one.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Name for diagnostics: the given name, or the ID.
    pub fn label(&self) -> String {
        match &self.inner.name {
            Some(name) => name.clone(),
            None => self.inner.id.to_string(),
        }
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.inner.kind
    }

    /// Whether this node is an action.
    pub fn is_action(&self) -> bool {
        self.inner.kind == NodeKind::Action
    }

    pub(crate) fn compute_fn(&self) -> Option<&ComputeFn> {
        self.inner.compute.as_ref()
    }

    /// Whether two states are the same value for this node.
    pub(crate) fn same_value(&self, old: &State, new: &State) -> bool {
        Arc::ptr_eq(old, new) || self.inner.equals.is_some_and(|eq| eq(old, new))
    }

    /// Register a hook fired when this node gains its first observer.
    pub fn on_connect<F>(&self, hook: F) -> HookHandle
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.add_hook(Lifecycle::Connect, Arc::new(hook))
    }

    /// Register a hook fired when this node loses its last observer.
    pub fn on_disconnect<F>(&self, hook: F) -> HookHandle
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.add_hook(Lifecycle::Disconnect, Arc::new(hook))
    }

    fn registry(&self, lifecycle: Lifecycle) -> &HookRegistry {
        match lifecycle {
            Lifecycle::Connect => &self.inner.connect_hooks,
            Lifecycle::Disconnect => &self.inner.disconnect_hooks,
        }
    }

    fn add_hook(&self, lifecycle: Lifecycle, hook: Hook) -> HookHandle {
        static HOOK_IDS: AtomicU64 = AtomicU64::new(0);
        let id = HOOK_IDS.fetch_add(1, Ordering::Relaxed);
        self.registry(lifecycle).lock().push((id, hook));
        HookHandle {
            node: self.clone(),
            lifecycle,
            id,
        }
    }

    /// Snapshot of the hooks registered for `lifecycle`, in registration order.
    pub(crate) fn hooks(&self, lifecycle: Lifecycle) -> Vec<Hook> {
        self.registry(lifecycle)
            .lock()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// Registration of a lifecycle hook. Call [`HookHandle::remove`] to
/// unregister it; dropping the handle keeps the hook installed.
#[derive(Debug)]
pub struct HookHandle {
    node: Node,
    lifecycle: Lifecycle,
    id: u64,
}

impl HookHandle {
    /// Unregister the hook. Returns whether it was still installed.
    pub fn remove(self) -> bool {
        let mut hooks = self.node.registry(self.lifecycle).lock();
        let before = hooks.len();
        hooks.retain(|(id, _)| *id != self.id);
        hooks.len() != before
    }
}
