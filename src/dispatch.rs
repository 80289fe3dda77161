//! Serial, off-lock delivery of callback notifications.
//!
//! Notifications are enqueued while the manager state is locked, so their order matches the
//! order of the state updates that caused them. Delivery happens later on a single drain job
//! submitted to the [`Executor`], so callbacks never run under the lock and never run
//! concurrently with each other.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{Instrument, debug_span, error, trace};

use crate::{
    callback::{CallbackRef, EditionFound},
    executor::Executor,
    key::VersionedKey,
    metrics::Metrics,
};

#[derive(Debug)]
pub(crate) enum Delivery {
    Found {
        callback: CallbackRef,
        found: EditionFound,
    },
    RoundFinished {
        callback: CallbackRef,
        key: VersionedKey,
    },
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Found { callback, found } => callback.on_edition_found(found),
            Delivery::RoundFinished { callback, key } => callback.on_round_finished(&key),
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<Delivery>,
    draining: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    queue: Arc<Mutex<Queue>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            queue: Default::default(),
            metrics,
        }
    }

    /// Queues a delivery. Does not run anything, see [`Self::flush`].
    pub fn enqueue(&self, delivery: Delivery) {
        self.metrics.notifications_queued.inc();
        self.queue.lock().pending.push_back(delivery);
    }

    /// Starts a drain job if there is pending work and none is running yet.
    ///
    /// Must be called without holding the manager lock.
    pub fn flush(&self, executor: &dyn Executor) {
        {
            let mut queue = self.queue.lock();
            if queue.draining || queue.pending.is_empty() {
                return;
            }
            queue.draining = true;
        }
        let this = self.clone();
        executor.spawn(
            "dispatch",
            Box::pin(
                async move {
                    this.drain();
                }
                .instrument(debug_span!("dispatch")),
            ),
        );
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            trace!(?next, "deliver");
            if catch_unwind(AssertUnwindSafe(|| next.deliver())).is_err() {
                error!("edition callback panicked");
                continue;
            }
            self.metrics.notifications_delivered.inc();
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::{
        executor::TokioExecutor,
        test_utils::{RecordingCallback, settle, test_key},
    };

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order() {
        let dispatcher = Dispatcher::new(Default::default());
        let executor = TokioExecutor::new();
        let recorder = Arc::new(RecordingCallback::default());
        let callback = CallbackRef::from(recorder.clone());
        for edition in [1, 4, 2] {
            dispatcher.enqueue(Delivery::Found {
                callback: callback.clone(),
                found: EditionFound {
                    key: test_key(1),
                    edition,
                    is_known_good: false,
                    is_new_slot: true,
                },
            });
        }
        dispatcher.enqueue(Delivery::RoundFinished {
            callback,
            key: test_key(1),
        });
        assert!(recorder.editions().is_empty());

        dispatcher.flush(&executor);
        dispatcher.flush(&executor);
        settle().await;
        assert_eq!(recorder.editions(), vec![1, 4, 2]);
        assert_eq!(recorder.rounds(), 1);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(executor.spawned(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn panicking_callback_does_not_stall_delivery() {
        let dispatcher = Dispatcher::new(Default::default());
        let executor = TokioExecutor::new();
        let recorder = Arc::new(RecordingCallback::default());
        let healthy = CallbackRef::from(recorder.clone());
        let broken = CallbackRef::new(|found: EditionFound| {
            if found.edition > 0 {
                panic!("broken subscriber");
            }
        });
        let found = |edition| EditionFound {
            key: test_key(1),
            edition,
            is_known_good: false,
            is_new_slot: true,
        };

        for edition in [1, 2] {
            dispatcher.enqueue(Delivery::Found {
                callback: broken.clone(),
                found: found(edition),
            });
            dispatcher.enqueue(Delivery::Found {
                callback: healthy.clone(),
                found: found(edition),
            });
            dispatcher.flush(&executor);
            settle().await;
        }
        assert_eq!(recorder.editions(), vec![1, 2]);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(dispatcher.metrics.notifications_delivered.get(), 2);
        assert!(logs_contain("edition callback panicked"));
    }
}
