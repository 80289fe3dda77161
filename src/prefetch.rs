//! Speculative confirmation of stalled slots.
//!
//! Keys resolved with content prefetching carry a mark recording when their slot last
//! advanced. A periodic sweep picks the keys whose slot has been sitting ahead of the known
//! good edition for longer than the prefetch delay, and the manager then fetches the content
//! of that slot once to confirm it.

use std::collections::BTreeMap;

use n0_future::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    key::{EditionUri, VersionedKey},
    manager::WeakManager,
    tracker::EditionTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefetchMark {
    /// Nothing to confirm until the slot advances again.
    Idle,
    /// The slot last advanced at this time.
    Since(Instant),
}

#[derive(Debug, Default)]
pub(crate) struct PrefetchMarks {
    marks: BTreeMap<VersionedKey, PrefetchMark>,
}

impl PrefetchMarks {
    /// Starts tracking `key`, armed right away if its slot is ahead of the known good edition.
    pub fn arm(&mut self, key: &VersionedKey, tracker: &EditionTracker, now: Instant) {
        let slot = tracker.lookup_slot(key);
        let stalled = slot.is_some() && tracker.lookup_known_good(key) != slot;
        let mark = self.marks.entry(key.clone()).or_insert(PrefetchMark::Idle);
        if stalled && *mark == PrefetchMark::Idle {
            *mark = PrefetchMark::Since(now);
        }
    }

    /// Restarts the clock for `key`, if it is tracked.
    pub fn on_slot_advanced(&mut self, key: &VersionedKey, now: Instant) {
        if let Some(mark) = self.marks.get_mut(key) {
            *mark = PrefetchMark::Since(now);
        }
    }

    pub fn remove(&mut self, key: &VersionedKey) {
        self.marks.remove(key);
    }

    /// Returns the slots to confirm and disarms every mark older than `delay`.
    pub fn sweep(
        &mut self,
        tracker: &EditionTracker,
        now: Instant,
        delay: Duration,
    ) -> Vec<EditionUri> {
        let mut due = Vec::new();
        for (key, mark) in self.marks.iter_mut() {
            let PrefetchMark::Since(since) = *mark else {
                continue;
            };
            if now.duration_since(since) < delay {
                continue;
            }
            *mark = PrefetchMark::Idle;
            let Some(slot) = tracker.lookup_slot(key) else {
                continue;
            };
            if tracker.lookup_known_good(key) < Some(slot) {
                due.push(key.at(slot));
            }
        }
        due
    }

    #[cfg(test)]
    pub fn get(&self, key: &VersionedKey) -> Option<PrefetchMark> {
        self.marks.get(key).copied()
    }
}

/// Runs the prefetch sweep every `period` until cancelled or the manager is dropped.
pub(crate) async fn run_ticker(manager: WeakManager, period: Duration, cancel: CancellationToken) {
    debug!(?period, "prefetch ticker started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep(period) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let n = manager.run_prefetch_sweep();
        trace!(n, "prefetch sweep");
    }
    debug!("prefetch ticker stopped");
}
