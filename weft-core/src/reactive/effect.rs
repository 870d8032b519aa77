//! Effects
//!
//! An effect is a side-effecting callback deferred until the outermost
//! transaction that scheduled it has committed. Effects never observe a
//! half-applied transaction, so they may freely open new ones.
//!
//! # Causality
//!
//! Every effect carries the record that was being processed when it was
//! scheduled. While the effect runs, that record becomes the ambient cause:
//! transactions it opens use it as their root cause, so a chain of hops
//! through several effects stays attributable to where it started.
//!
//! # Settlement
//!
//! Scheduling returns a [`Deferred`], settled exactly once: with the
//! callback's result, with the error that aborted the scheduling
//! transaction, or with [`Error::Cancelled`] if the effect was dropped
//! without running. A failure nobody awaits is logged, never raised.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context as TaskContext, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use super::runtime::{Context, ContextInner};
use crate::error::{Error, Result};
use crate::graph::{Cache, Hook};

/// Work queued on a transaction and run after commit.
pub(crate) trait Task {
    /// Run the work.
    fn run(self: Box<Self>, ctx: &Context);

    /// The scheduling transaction aborted; settle without running.
    fn reject(self: Box<Self>, error: Error);
}

struct EffectTask<F, T> {
    effect: F,
    settle: oneshot::Sender<Result<T>>,
}

impl<F, T> Task for EffectTask<F, T>
where
    F: FnOnce(&Context) -> Result<T>,
{
    fn run(self: Box<Self>, ctx: &Context) {
        let EffectTask { effect, settle } = *self;
        let result = effect(ctx);

        if let Err(error) = &result {
            if settle.is_closed() {
                debug!(%error, "effect failed and nobody awaits it");
            }
        }

        // The receiver may be gone; that is not an error.
        let _ = settle.send(result);
    }

    fn reject(self: Box<Self>, error: Error) {
        let _ = self.settle.send(Err(error));
    }
}

struct LifecycleTask(Hook);

impl Task for LifecycleTask {
    fn run(self: Box<Self>, ctx: &Context) {
        (self.0)(ctx)
    }

    fn reject(self: Box<Self>, _error: Error) {}
}

/// A queued task plus the record that caused it.
pub(crate) struct Job {
    task: Box<dyn Task>,
    cause: Option<Cache>,
    lifecycle: bool,
}

impl Job {
    /// Wrap a user effect, returning the job and its settlement handle.
    pub(crate) fn effect<T, F>(effect: F) -> (Self, Deferred<T>)
    where
        T: 'static,
        F: FnOnce(&Context) -> Result<T> + 'static,
    {
        let (settle, settled) = oneshot::channel();
        let job = Self {
            task: Box::new(EffectTask { effect, settle }),
            cause: None,
            lifecycle: false,
        };
        (job, Deferred { settled })
    }

    /// Wrap a connect/disconnect hook.
    pub(crate) fn lifecycle(hook: Hook) -> Self {
        Self {
            task: Box::new(LifecycleTask(hook)),
            cause: None,
            lifecycle: true,
        }
    }

    /// Attribute the job to `cause`.
    pub(crate) fn bind(&mut self, cause: &Cache) {
        self.cause = Some(Rc::clone(cause));
    }

    pub(crate) fn cause(&self) -> Option<&Cache> {
        self.cause.as_ref()
    }

    pub(crate) fn is_lifecycle(&self) -> bool {
        self.lifecycle
    }

    pub(crate) fn run(self, ctx: &Context) {
        self.task.run(ctx)
    }

    pub(crate) fn reject(self, error: Error) {
        self.task.reject(error)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("lifecycle", &self.lifecycle)
            .field("cause", &self.cause.as_ref().map(|c| c.node().label()))
            .finish()
    }
}

/// Handle to the eventual result of a scheduled effect.
///
/// `Deferred` is a [`Future`]; outside of an async runtime, poll it with
/// [`Deferred::try_take`]. Dropping it does not cancel the effect.
pub struct Deferred<T> {
    settled: oneshot::Receiver<Result<T>>,
}

impl<T> Deferred<T> {
    /// Take the result if the effect has settled.
    ///
    /// Returns `None` while the effect is still queued. The result can be
    /// taken once; later calls report [`Error::Cancelled`].
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.settled.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Cancelled)),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.settled)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Cancelled)))
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

/// An effect handed to a custom scheduler.
///
/// See [`ContextOptions::on_effect_scheduled`](crate::ContextOptions::on_effect_scheduled).
/// Dropping it without calling [`run`](Self::run) settles its deferred with
/// [`Error::Cancelled`].
pub struct ScheduledEffect {
    ctx: Weak<ContextInner>,
    job: Job,
}

impl ScheduledEffect {
    pub(crate) fn new(ctx: &Context, job: Job) -> Self {
        Self {
            ctx: ctx.downgrade(),
            job,
        }
    }

    /// The record the effect is attributed to.
    pub fn cause(&self) -> Option<&Cache> {
        self.job.cause()
    }

    /// Run the effect now, with its cause as the ambient cause.
    pub fn run(self) {
        match self.ctx.upgrade() {
            Some(inner) => Context::from_inner(inner).run_job(self.job),
            None => self.job.reject(Error::Cancelled),
        }
    }
}

impl fmt::Debug for ScheduledEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledEffect")
            .field("job", &self.job)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;

    #[test]
    fn deferred_settles_when_run() {
        let ctx = Context::new();
        let (job, mut deferred) = Job::effect(|_| Ok(7));

        assert!(deferred.try_take().is_none());
        job.run(&ctx);
        assert_eq!(deferred.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn rejected_effect_never_runs() {
        let (job, deferred) = Job::effect(|_| -> Result<()> { panic!("must not run") });
        job.reject(Error::msg("aborted"));

        let err = deferred.now_or_never().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "aborted");
    }

    #[test]
    fn dropped_effect_cancels() {
        let (job, mut deferred) = Job::effect(|_| Ok(()));
        drop(job);
        assert!(matches!(deferred.try_take(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn failure_without_receiver_is_silent() {
        let ctx = Context::new();
        let (job, deferred) = Job::effect(|_| -> Result<()> { Err(Error::msg("lost")) });
        drop(deferred);
        job.run(&ctx);
    }

    #[test]
    fn lifecycle_jobs_ignore_rejection() {
        let hook: Hook = Arc::new(|_| panic!("must not run"));
        let job = Job::lifecycle(hook);
        assert!(job.is_lifecycle());
        job.reject(Error::Cancelled);
    }
}
