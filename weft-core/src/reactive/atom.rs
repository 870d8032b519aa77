//! Atoms
//!
//! Typed handles over computed node descriptors.
//!
//! - [`Atom<T>`] is a derived value: a pure function of whatever it reads
//!   through its [`Spy`], plus its own previous value.
//! - [`AtomMut<T>`] is a source value, set from outside through
//!   [`Context::set`](crate::Context::set) and
//!   [`Context::update`](crate::Context::update).
//!
//! Handles are cheap to clone and `Send + Sync`: declare them once (even as
//! statics behind a `OnceLock`) and use them with any number of contexts.
//! Values require `PartialEq`; a recomputation producing an equal value does
//! not count as a change and does not wake dependents.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::context::Spy;
use crate::error::{Error, Result};
use crate::graph::{ComputeFn, Node, State};

/// Anything a context can read: atoms, actions, and raw nodes.
pub trait Readable {
    /// What a read produces.
    type Value;

    /// The underlying descriptor.
    fn node(&self) -> &Node;

    /// Turn erased state into a value. For actions, `skip` leading calls
    /// are left out; other nodes ignore it.
    #[doc(hidden)]
    fn extract(&self, state: &State, skip: usize) -> Result<Self::Value>;
}

pub(crate) fn downcast<T: Clone + 'static>(node: &Node, state: &State) -> Result<T> {
    state
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::TypeMismatch {
            node: node.label(),
            expected: type_name::<T>(),
        })
}

fn equals<T: PartialEq + 'static>(old: &State, new: &State) -> bool {
    match (old.downcast_ref::<T>(), new.downcast_ref::<T>()) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}

/// A derived value.
///
/// # Example
///
/// ```rust,ignore
/// let price = AtomMut::named("price", 10);
/// let total = Atom::named("total", {
///     let price = price.clone();
///     move |spy, _| Ok(spy.get(&price)? * 3)
/// });
///
/// let ctx = Context::new();
/// assert_eq!(ctx.read(&total)?, 30);
/// ```
pub struct Atom<T> {
    node: Node,
    _value: PhantomData<fn() -> T>,
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Declare a derived value.
    ///
    /// The computation receives the tracking handle and the previous value
    /// (`None` on the first run).
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&Spy, Option<&T>) -> Result<T> + Send + Sync + 'static,
    {
        Self::declare(None, compute)
    }

    /// Declare a derived value with a diagnostic name.
    pub fn named<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Spy, Option<&T>) -> Result<T> + Send + Sync + 'static,
    {
        Self::declare(Some(name.into()), compute)
    }

    fn declare<F>(name: Option<String>, compute: F) -> Self
    where
        F: Fn(&Spy, Option<&T>) -> Result<T> + Send + Sync + 'static,
    {
        let erased: ComputeFn = Arc::new(move |spy: &Spy, prev: Option<&State>| {
            let prev = prev.and_then(|state| state.downcast_ref::<T>());
            compute(spy, prev).map(|value| Arc::new(value) as State)
        });

        Self {
            node: Node::computed(name, erased, Some(equals::<T>)),
            _value: PhantomData,
        }
    }
}

impl<T> Atom<T> {
    /// The underlying descriptor.
    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<T> Eq for Atom<T> {}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.node.label()).finish()
    }
}

impl<T> Readable for Atom<T>
where
    T: Clone + 'static,
{
    type Value = T;

    fn node(&self) -> &Node {
        &self.node
    }

    fn extract(&self, state: &State, _skip: usize) -> Result<T> {
        downcast(&self.node, state)
    }
}

/// A source value.
///
/// Equality is identity, so atoms can themselves be stored in atoms (a list
/// of item atoms, for instance).
pub struct AtomMut<T> {
    atom: Atom<T>,
}

impl<T> AtomMut<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Declare a source value.
    pub fn new(initial: T) -> Self {
        Self::declare(None, initial)
    }

    /// Declare a source value with a diagnostic name.
    pub fn named(name: impl Into<String>, initial: T) -> Self {
        Self::declare(Some(name.into()), initial)
    }

    fn declare(name: Option<String>, initial: T) -> Self {
        let compute = move |_: &Spy, prev: Option<&T>| Ok(prev.unwrap_or(&initial).clone());
        Self {
            atom: Atom::declare(name, compute),
        }
    }
}

impl<T> AtomMut<T> {
    /// The underlying descriptor.
    pub fn node(&self) -> &Node {
        self.atom.node()
    }

    /// Read-only view of this atom.
    pub fn as_atom(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T> Clone for AtomMut<T> {
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
        }
    }
}

impl<T> PartialEq for AtomMut<T> {
    fn eq(&self, other: &Self) -> bool {
        self.atom == other.atom
    }
}

impl<T> Eq for AtomMut<T> {}

impl<T> fmt::Debug for AtomMut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomMut").field(&self.atom.node.label()).finish()
    }
}

impl<T> Readable for AtomMut<T>
where
    T: Clone + 'static,
{
    type Value = T;

    fn node(&self) -> &Node {
        self.atom.node()
    }

    fn extract(&self, state: &State, skip: usize) -> Result<T> {
        self.atom.extract(state, skip)
    }
}

/// Raw nodes read as erased state.
impl Readable for Node {
    type Value = State;

    fn node(&self) -> &Node {
        self
    }

    fn extract(&self, state: &State, _skip: usize) -> Result<State> {
        Ok(Arc::clone(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Context;

    #[test]
    fn equality_is_by_value_type() {
        let a: State = Arc::new(3_u8);
        let b: State = Arc::new(3_u8);
        let c: State = Arc::new(3_u16);
        assert!(equals::<u8>(&a, &b));
        assert!(!equals::<u8>(&a, &c));
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = AtomMut::new(1);
        let b = AtomMut::new(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn computation_receives_previous_value() {
        let source = AtomMut::named("source", 1);
        let history = Atom::named("history", {
            let source = source.clone();
            move |spy, prev: Option<&Vec<i32>>| {
                let mut seen = prev.cloned().unwrap_or_default();
                seen.push(spy.get(&source)?);
                Ok(seen)
            }
        });

        let ctx = Context::new();
        let _sub = ctx.subscribe(&history, |_| {}).unwrap();
        ctx.set(&source, 2).unwrap();
        ctx.set(&source, 3).unwrap();
        assert_eq!(ctx.read(&history).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn raw_nodes_read_erased_state() {
        let count = AtomMut::new(4_i64);
        let ctx = Context::new();
        let state = ctx.read(count.node()).unwrap();
        assert_eq!(state.downcast_ref::<i64>(), Some(&4));
    }

    #[test]
    fn mismatched_state_is_reported() {
        let node = Node::action(Some("clicks".into()));
        let state: State = Arc::new("text");
        let err = downcast::<i32>(&node, &state).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { ref node, .. } if node == "clicks"));
    }
}
