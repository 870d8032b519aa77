//! Actions
//!
//! An action is an event source. Dispatching it runs its body inside the
//! transaction and appends an [`ActionCall`] (params and payload) to the
//! action's state: the log of calls made by the transaction that last
//! dispatched it. The log restarts with every new dispatching transaction.
//!
//! Computations that read an action through their [`Spy`](super::Spy) see
//! each call once; see [`Spy::get`](super::Spy::get).

use std::fmt;
use std::sync::Arc;

use super::atom::{downcast, Readable};
use super::runtime::Context;
use crate::error::{Error, Result};
use crate::graph::{CacheRecord, Node, State, TxId};

/// One call of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall<P, R> {
    /// Parameters passed to `dispatch`.
    pub params: P,
    /// What the body returned.
    pub payload: R,
}

/// Erased action state.
#[derive(Debug, Default)]
pub(crate) struct CallLog(Vec<State>);

impl CallLog {
    pub(crate) fn empty() -> State {
        Arc::new(CallLog::default())
    }

    pub(crate) fn len(state: &State) -> usize {
        state.downcast_ref::<CallLog>().map_or(0, |log| log.0.len())
    }

    /// State of `record` after one more call made by transaction `tx`.
    pub(crate) fn append(record: &CacheRecord, tx: TxId, call: State) -> State {
        let mut calls = match record.state().downcast_ref::<CallLog>() {
            Some(log) if record.transaction() == tx => log.0.clone(),
            _ => Vec::new(),
        };
        calls.push(call);
        Arc::new(CallLog(calls))
    }
}

type Body<P, R> = Arc<dyn Fn(&Context, &P) -> Result<R> + Send + Sync>;

/// An event source with parameters `P` and payload `R`.
///
/// The body receives the context, so it may read and set atoms, dispatch
/// other actions and schedule effects, all within the dispatching
/// transaction. A failing body aborts that transaction.
pub struct Action<P, R = P> {
    node: Node,
    body: Body<P, R>,
}

impl<P> Action<P, P>
where
    P: Clone + Send + Sync + 'static,
{
    /// An action whose payload echoes its params.
    pub fn new() -> Self {
        Self::declare(None, |_, params: &P| Ok(params.clone()))
    }

    /// A named action whose payload echoes its params.
    pub fn named(name: impl Into<String>) -> Self {
        Self::declare(Some(name.into()), |_, params: &P| Ok(params.clone()))
    }
}

impl<P> Default for Action<P, P>
where
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R> Action<P, R>
where
    P: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// A named action with a body.
    pub fn with<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Context, &P) -> Result<R> + Send + Sync + 'static,
    {
        Self::declare(Some(name.into()), body)
    }

    fn declare<F>(name: Option<String>, body: F) -> Self
    where
        F: Fn(&Context, &P) -> Result<R> + Send + Sync + 'static,
    {
        Self {
            node: Node::action(name),
            body: Arc::new(body),
        }
    }
}

impl<P, R> Action<P, R> {
    /// The underlying descriptor.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub(crate) fn call(&self, ctx: &Context, params: &P) -> Result<R> {
        (self.body)(ctx, params)
    }
}

impl<P, R> Clone for Action<P, R> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl<P, R> PartialEq for Action<P, R> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<P, R> fmt::Debug for Action<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.node.label()).finish()
    }
}

impl<P, R> Readable for Action<P, R>
where
    P: Clone + 'static,
    R: Clone + 'static,
{
    type Value = Vec<ActionCall<P, R>>;

    fn node(&self) -> &Node {
        &self.node
    }

    fn extract(&self, state: &State, skip: usize) -> Result<Self::Value> {
        let log = state
            .downcast_ref::<CallLog>()
            .ok_or_else(|| Error::TypeMismatch {
                node: self.node.label(),
                expected: "action call log",
            })?;

        log.0
            .iter()
            .skip(skip)
            .map(|call| downcast::<ActionCall<P, R>>(&self.node, call))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::AtomMut;

    #[test]
    fn dispatch_returns_payload() {
        let ctx = Context::new();
        let double = Action::with("double", |_, n: &i32| Ok(n * 2));
        assert_eq!(ctx.dispatch(&double, 21).unwrap(), 42);

        let log = ctx.read(&double).unwrap();
        assert_eq!(log, vec![ActionCall { params: 21, payload: 42 }]);
    }

    #[test]
    fn log_restarts_with_each_transaction() {
        let ctx = Context::new();
        let ping: Action<u8> = Action::named("ping");

        ctx.batch(|ctx| {
            ctx.dispatch(&ping, 1)?;
            ctx.dispatch(&ping, 2)
        })
        .unwrap();
        assert_eq!(ctx.read(&ping).unwrap().len(), 2);

        ctx.dispatch(&ping, 3).unwrap();
        let log = ctx.read(&ping).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].params, 3);
    }

    #[test]
    fn body_writes_are_discarded_on_failure() {
        let ctx = Context::new();
        let balance = AtomMut::named("balance", 100);
        let withdraw = Action::with("withdraw", {
            let balance = balance.clone();
            move |ctx: &Context, amount: &i32| {
                let left = ctx.update(&balance, |b| b - amount)?;
                if left < 0 {
                    return Err(Error::msg("insufficient funds"));
                }
                Ok(left)
            }
        });

        assert_eq!(ctx.dispatch(&withdraw, 30).unwrap(), 70);

        let err = ctx.dispatch(&withdraw, 500).unwrap_err();
        assert!(matches!(err, Error::Computation { ref node, .. } if node == "withdraw"));
        assert_eq!(ctx.read(&balance).unwrap(), 70);
    }

    #[test]
    fn appending_keeps_calls_of_the_same_transaction() {
        let node = Node::action(None);
        let root = CacheRecord::root();
        let tx = TxId::next();
        let record = CacheRecord::new(node, CallLog::empty(), root, tx);

        let one = CallLog::append(&record, tx, Arc::new(1));
        assert_eq!(CallLog::len(&one), 1);

        let other = CallLog::append(&record, TxId::next(), Arc::new(1));
        assert_eq!(CallLog::len(&other), 1);
    }
}
