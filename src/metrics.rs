//! Metrics for the edition manager.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a [`Manager`](crate::Manager).
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "editions")]
pub struct Metrics {
    /// Latest slot moved forward.
    pub slot_updates: Counter,
    /// Latest known good edition moved forward.
    pub known_good_updates: Counter,
    /// Notifications handed to the dispatcher.
    pub notifications_queued: Counter,
    /// Notifications delivered to callbacks.
    pub notifications_delivered: Counter,

    /// Successful subscribe calls.
    pub subscriptions: Counter,
    /// Subscriptions that were removed.
    pub unsubscriptions: Counter,

    /// Background fetchers started, including promoted temporary fetchers.
    pub background_fetchers_started: Counter,
    /// Background fetchers stopped.
    pub background_fetchers_stopped: Counter,
    /// Temporary fetchers created by `resolve_once`.
    pub temporary_fetchers_created: Counter,
    /// Temporary fetchers evicted from the cache.
    pub temporary_fetchers_evicted: Counter,

    /// Block probes issued by fetchers and hints.
    pub probes: Counter,
    /// Probes that found the edition.
    pub probes_exists: Counter,
    /// Probes that were answered with not found.
    pub probes_absent: Counter,
    /// Probes that failed for other reasons.
    pub probes_indeterminate: Counter,
    /// Completed polling rounds.
    pub poll_rounds: Counter,

    /// Confirmation fetches issued by the prefetch sweep.
    pub prefetch_fetches: Counter,
    /// Confirmation fetches that succeeded.
    pub prefetch_success: Counter,

    /// Internal consistency checks that failed.
    pub invariant_violations: Counter,
}
