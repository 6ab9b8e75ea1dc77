//! Scheduling primitive for `delayed` beats.
//!
//! The conductor never relies on an implicit event loop: deferred work goes
//! through a [`TurnScheduler`], which runs it once the current task yields.

use std::fmt;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

/// Work handed to a [`TurnScheduler`].
pub type DeferredWork = BoxFuture<'static, ()>;

/// Runs work after the current task/turn has completed.
pub trait TurnScheduler: Send + Sync {
    fn schedule_after_current_turn(&self, work: DeferredWork) -> Deferred;
}

/// Completion signal of work scheduled through a [`TurnScheduler`].
pub struct Deferred {
    done: oneshot::Receiver<()>,
}

impl Deferred {
    /// Creates a signal pair. Scheduler implementations call
    /// [`DeferredSignal::complete`] once the work has finished.
    pub fn channel() -> (DeferredSignal, Deferred) {
        let (tx, rx) = oneshot::channel();
        (DeferredSignal { tx }, Deferred { done: rx })
    }

    /// Waits for the scheduled work. Returns `false` when the work was
    /// dropped without running to completion.
    pub async fn join(self) -> bool {
        self.done.await.is_ok()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish()
    }
}

/// Sending half of a [`Deferred`].
#[derive(Debug)]
pub struct DeferredSignal {
    tx: oneshot::Sender<()>,
}

impl DeferredSignal {
    pub fn complete(self) {
        let _ = self.tx.send(());
    }
}

/// [`TurnScheduler`] backed by the ambient tokio runtime. The work is spawned
/// and yields once before it starts, so the scheduling task keeps running
/// until its next suspension point.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTurnScheduler;

impl TokioTurnScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl TurnScheduler for TokioTurnScheduler {
    fn schedule_after_current_turn(&self, work: DeferredWork) -> Deferred {
        let (signal, deferred) = Deferred::channel();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            work.await;
            signal.complete();
        });
        deferred
    }
}
