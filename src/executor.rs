//! Execution of deferred work.
//!
//! All work the [`Manager`] defers, such as notification delivery, fetcher start and
//! cancellation, hint probes and prefetch fetches, is submitted through one [`Executor`]
//! passed in at construction.
//!
//! [`Manager`]: crate::Manager

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use n0_future::{boxed::BoxFuture, task};
use tracing::trace;

/// Runs futures off the calling path.
pub trait Executor: std::fmt::Debug + Send + Sync + 'static {
    /// Spawns a future to run to completion in the background.
    ///
    /// The `name` is only used for diagnostics.
    fn spawn(&self, name: &'static str, fut: BoxFuture<()>);
}

impl<T: Executor> Executor for Arc<T> {
    fn spawn(&self, name: &'static str, fut: BoxFuture<()>) {
        self.as_ref().spawn(name, fut)
    }
}

/// Spawns onto the ambient tokio runtime.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioExecutor {
    spawned: Arc<AtomicUsize>,
}

impl TokioExecutor {
    /// Creates a new executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of futures spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, name: &'static str, fut: BoxFuture<()>) {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        trace!(%name, n, "spawn");
        // Detached, tasks stop on their own or through their cancellation tokens.
        drop(task::spawn(fut));
    }
}
