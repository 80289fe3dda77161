//! The [`Manager`], entry point for everything edition related.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use n0_future::time::Instant;
use parking_lot::Mutex;
use snafu::ensure;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, error_span, trace};

use crate::{
    callback::{CallbackRef, EditionFound, SparseCallback},
    config::Config,
    dispatch::Dispatcher,
    executor::Executor,
    fetch::{Fetch, FetchRequest, ProbeOutcome},
    fetcher::{EditionFetcher, FetcherContext, FetcherHandle, FetcherMode},
    hint::{HintCallback, HintKind, HintResult, fetch_block},
    key::{Edition, EditionUri, VersionedKey},
    metrics::Metrics,
    pool::BackgroundFetcherPool,
    prefetch::{self, PrefetchMarks},
    retriever::{ContentCallback, ContentSubscription, RetrievingCallback},
    subscriptions::{
        PersistentSnafu, SubscribeError, SubscribeOptions, SubscriptionHandle,
        SubscriptionRegistry,
    },
    temporary::TemporaryFetcherCache,
    tracker::EditionTracker,
};

/// Options for [`Manager::resolve_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Speculatively fetch the content of the latest slot if it stays unconfirmed for longer
    /// than [`Config::prefetch_delay`].
    pub prefetch_content: bool,
}

/// Everything guarded by the manager lock.
#[derive(Debug)]
struct State {
    tracker: EditionTracker,
    subscriptions: SubscriptionRegistry,
    background: BackgroundFetcherPool,
    temporary: TemporaryFetcherCache,
    prefetch: PrefetchMarks,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    fetch: Arc<dyn Fetch>,
    executor: Arc<dyn Executor>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    next_fetcher_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Tracks the latest editions of versioned keys.
///
/// The manager keeps, for every key it has seen, the latest *slot* (the newest edition
/// known to exist) and the latest *known good* edition (the newest edition whose content
/// was fetched). Both only ever move forward.
///
/// New editions are discovered by fetchers that probe the network through the [`Fetch`]
/// implementation passed to [`Manager::new`]:
///
/// - [`Manager::resolve_once`] starts a temporary fetcher, kept in a bounded LRU cache.
/// - [`Manager::subscribe`] with [`SubscribeOptions::background_poll`] keeps a background
///   fetcher polling the key for as long as the subscription lives.
///
/// Subscribers are notified of new editions through their [`EditionCallback`]. Callbacks
/// run on the [`Executor`], one at a time and in the order of the updates.
///
/// The manager is cheap to clone, clones share the same state. All background work stops
/// when the last clone is dropped or [`Manager::shutdown`] is called.
///
/// [`EditionCallback`]: crate::EditionCallback
#[derive(Debug, Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

/// A weak reference to a [`Manager`], held by the tasks it spawns.
#[derive(Debug, Clone, Default)]
pub(crate) struct WeakManager(Weak<Inner>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<Manager> {
        self.0.upgrade().map(|inner| Manager { inner })
    }
}

impl Manager {
    /// Creates a new manager and starts its prefetch ticker on `executor`.
    ///
    /// When using [`TokioExecutor`] this must be called from within a tokio runtime.
    ///
    /// [`TokioExecutor`]: crate::TokioExecutor
    pub fn new(config: Config, fetch: impl Fetch, executor: impl Executor) -> Self {
        let metrics = Arc::new(Metrics::default());
        let state = State {
            tracker: Default::default(),
            subscriptions: Default::default(),
            background: Default::default(),
            temporary: TemporaryFetcherCache::new(config.max_temporary_fetchers),
            prefetch: Default::default(),
        };
        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            fetch: Arc::new(fetch),
            executor: Arc::new(executor),
            dispatcher: Dispatcher::new(metrics.clone()),
            config: Arc::new(config),
            metrics,
            shutdown: CancellationToken::new(),
            next_fetcher_id: AtomicU64::new(0),
        });
        let this = Self { inner };
        let ticker = prefetch::run_ticker(
            this.downgrade(),
            this.inner.config.prefetch_delay,
            this.inner.shutdown.child_token(),
        );
        this.inner.executor.spawn(
            "prefetch_ticker",
            Box::pin(ticker.instrument(error_span!("prefetch"))),
        );
        this
    }

    /// The configuration this manager was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Metrics of this manager.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Subscribes `callback` to new editions of `key`.
    ///
    /// If an edition newer than [`SubscribeOptions::requested_edition`] is already known, the
    /// callback is notified right away, asynchronously. Subscribing the same callback to the
    /// same key again only notifies it if there is news it has not heard about yet.
    ///
    /// Returns [`SubscribeError::Persistent`] for persistent subscriptions, which are not
    /// supported.
    pub fn subscribe(
        &self,
        key: &VersionedKey,
        callback: impl Into<CallbackRef>,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        ensure!(!opts.persistent, PersistentSnafu);
        let mut callback = callback.into();
        if opts.sparse {
            callback = CallbackRef::new(SparseCallback::new(callback));
        }
        let background_poll = opts.background_poll || opts.sparse;

        let start = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if state
                .subscriptions
                .insert(key, &callback, opts.requested_edition)
            {
                self.inner.metrics.subscriptions.inc();
            }
            if let Some(slot) = state.tracker.lookup_slot(key) {
                let found = EditionFound {
                    key: key.clone(),
                    edition: slot,
                    is_known_good: state.tracker.lookup_known_good(key) == Some(slot),
                    is_new_slot: true,
                };
                if let Some(delivery) = state.subscriptions.offer(&callback, found) {
                    self.inner.dispatcher.enqueue(delivery);
                }
            }
            let mut start = None;
            if background_poll {
                if state.background.get(key).is_none() {
                    let handle = match state.temporary.take(key) {
                        Some(handle) => {
                            debug!(%key, id = handle.id(), "promoting temporary fetcher");
                            handle.poll_forever();
                            handle
                        }
                        None => {
                            let (fetcher, handle) = self.new_fetcher(
                                key,
                                opts.requested_edition,
                                FetcherMode::Forever,
                            );
                            start = Some(fetcher);
                            handle
                        }
                    };
                    state.background.insert(key.clone(), handle);
                    self.inner.metrics.background_fetchers_started.inc();
                }
                state.background.add_subscriber(key, &callback);
            }
            start
        };
        self.flush();
        if let Some(fetcher) = start {
            self.spawn_fetcher(fetcher, Vec::new());
        }
        debug!(%key, requested = opts.requested_edition, background_poll, "subscribed");
        Ok(SubscriptionHandle {
            key: key.clone(),
            callback,
            background_poll,
        })
    }

    /// Removes a subscription.
    ///
    /// Stops the background fetcher of the key if this was its last subscriber. Calling
    /// this more than once is a noop.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let key = &handle.key;
        let cancel = {
            let mut state = self.inner.state.lock();
            if state.subscriptions.remove(key, &handle.callback) {
                self.inner.metrics.unsubscriptions.inc();
            }
            // a plain handle may share its callback with a background subscription
            let cancel = state.background.remove_subscriber(key, &handle.callback);
            if cancel.is_some() {
                self.inner.metrics.background_fetchers_stopped.inc();
            }
            cancel
        };
        if let Some(fetcher) = cancel {
            debug!(%key, id = fetcher.id(), "stopping background fetcher");
            fetcher.cancel();
        }
    }

    /// Subscribes to the content of new editions of `key`.
    ///
    /// The content of every new edition is fetched and handed to `callback`. With
    /// background polling only the newest edition found in each polling round is fetched.
    pub fn subscribe_content(
        &self,
        key: &VersionedKey,
        callback: impl ContentCallback,
        mut opts: SubscribeOptions,
    ) -> Result<ContentSubscription, SubscribeError> {
        opts.sparse |= opts.background_poll;
        let retriever = Arc::new(RetrievingCallback::new(
            Arc::new(callback),
            self.inner.fetch.clone(),
            self.inner.executor.clone(),
            self.downgrade(),
            self.inner.shutdown.child_token(),
        ));
        let handle = self.subscribe(key, retriever.clone(), opts)?;
        Ok(ContentSubscription { handle, retriever })
    }

    /// Removes a content subscription and cancels its fetch in flight.
    pub fn unsubscribe_content(&self, subscription: &ContentSubscription) {
        self.unsubscribe(&subscription.handle);
        subscription.retriever.cancel();
    }

    /// Records that a block for `edition` of `key` exists.
    ///
    /// Returns whether the latest slot moved forward. Subscribers are notified if it did.
    pub fn notify_slot(&self, key: &VersionedKey, edition: Edition) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.tracker.advance_slot(key, edition) {
                return false;
            }
            self.inner.metrics.slot_updates.inc();
            state.prefetch.on_slot_advanced(key, Instant::now());
            let found = EditionFound {
                key: key.clone(),
                edition,
                is_known_good: false,
                is_new_slot: true,
            };
            for delivery in state.subscriptions.broadcast(&found) {
                self.inner.dispatcher.enqueue(delivery);
            }
        }
        debug!(%key, edition, "new slot");
        self.flush();
        true
    }

    /// Records that the content of `edition` of `key` was fetched.
    ///
    /// Returns whether the known good edition moved forward. Subscribers are notified if
    /// it did.
    pub fn notify_known_good(&self, key: &VersionedKey, edition: Edition) -> bool {
        {
            let mut state = self.inner.state.lock();
            let update = state.tracker.advance_known_good(key, edition);
            if !update.changed {
                return false;
            }
            self.inner.metrics.known_good_updates.inc();
            if update.slot_advanced {
                self.inner.metrics.slot_updates.inc();
                state.prefetch.on_slot_advanced(key, Instant::now());
            }
            let found = EditionFound {
                key: key.clone(),
                edition,
                is_known_good: true,
                is_new_slot: update.slot_advanced,
            };
            for delivery in state.subscriptions.broadcast(&found) {
                self.inner.dispatcher.enqueue(delivery);
            }
        }
        debug!(%key, edition, "new known good edition");
        self.flush();
        true
    }

    /// Feedback from a layer that fetched `uri` on its own.
    ///
    /// A full fetch makes the edition known good. A metadata only fetch proves that the
    /// edition exists, so it only advances the slot.
    pub fn check_fetched(&self, uri: &EditionUri, is_metadata: bool) {
        if is_metadata {
            self.notify_slot(uri.key(), uri.edition());
        } else {
            self.notify_known_good(uri.key(), uri.edition());
        }
    }

    /// The newest edition of `key` whose content was fetched, if any.
    pub fn lookup_known_good(&self, key: &VersionedKey) -> Option<Edition> {
        self.inner.state.lock().tracker.lookup_known_good(key)
    }

    /// The newest edition of `key` known to exist, if any.
    pub fn lookup_latest_slot(&self, key: &VersionedKey) -> Option<Edition> {
        self.inner.state.lock().tracker.lookup_slot(key)
    }

    /// Starts a lookup for editions of `uri`'s key, starting at `uri`'s edition.
    ///
    /// If a fetcher for the key is already running the edition is handed to it as a hint.
    /// Otherwise a temporary fetcher is created, which may evict the least recently used
    /// temporary fetcher. Discovered editions are reported to subscribers as usual.
    pub fn resolve_once(&self, uri: &EditionUri, opts: ResolveOptions) -> FetcherHandle {
        let key = uri.key();
        let mut evicted = Vec::new();
        let (handle, start) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let existing = match state.background.get(key) {
                Some(handle) => Some(handle.clone()),
                None => state.temporary.touch(key).cloned(),
            };
            let res = match existing {
                Some(handle) => {
                    trace!(%uri, id = handle.id(), "hinting running fetcher");
                    handle.add_hint(uri.edition());
                    (handle, None)
                }
                None => {
                    let (fetcher, handle) =
                        self.new_fetcher(key, uri.edition(), FetcherMode::Once);
                    self.inner.metrics.temporary_fetchers_created.inc();
                    if let Some(old) = state.temporary.insert(key.clone(), handle.clone()) {
                        state.prefetch.remove(old.key());
                        self.inner.metrics.temporary_fetchers_evicted.inc();
                        evicted.push(old);
                    }
                    (handle, Some(fetcher))
                }
            };
            if opts.prefetch_content {
                state.prefetch.arm(key, &state.tracker, Instant::now());
            }
            res
        };
        if let Some(fetcher) = start {
            self.spawn_fetcher(fetcher, evicted);
        }
        handle
    }

    /// Probes whether `uri` exists and records the outcome.
    ///
    /// On [`ProbeOutcome::Exists`] the slot is advanced, or the known good edition if
    /// `kind` is [`HintKind::KnownGood`]. The other outcomes change nothing.
    pub async fn probe_existence(&self, uri: &EditionUri, kind: HintKind) -> ProbeOutcome {
        let res = fetch_block(self.inner.fetch.as_ref(), &self.inner.metrics, uri.clone()).await;
        let outcome = ProbeOutcome::from_result(&res);
        if outcome == ProbeOutcome::Exists {
            match kind {
                HintKind::Slot => self.notify_slot(uri.key(), uri.edition()),
                HintKind::KnownGood => self.notify_known_good(uri.key(), uri.edition()),
            };
        }
        outcome
    }

    /// Hints that `uri` might exist.
    ///
    /// Hints older than the latest known slot are ignored. Otherwise the edition is probed
    /// in the background and the slot advanced if it exists.
    pub fn hint_update(&self, uri: &EditionUri) {
        if self.lookup_latest_slot(uri.key()) > Some(uri.edition()) {
            trace!(%uri, "ignoring stale hint");
            return;
        }
        let this = self.clone();
        let uri = uri.clone();
        let span = debug_span!("hint", %uri);
        self.inner.executor.spawn(
            "hint",
            Box::pin(
                async move {
                    let outcome = this.probe_existence(&uri, HintKind::Slot).await;
                    debug!(%outcome, "hint probed");
                }
                .instrument(span),
            ),
        );
    }

    /// Probes whether `uri` exists and reports the result to `callback`.
    ///
    /// Advances the slot if it does.
    pub fn hint_check(&self, uri: &EditionUri, callback: impl HintCallback) {
        let this = self.clone();
        let uri = uri.clone();
        let callback = Box::new(callback);
        let span = debug_span!("hint_check", %uri);
        self.inner.executor.spawn(
            "hint_check",
            Box::pin(
                async move {
                    let res =
                        fetch_block(this.inner.fetch.as_ref(), &this.inner.metrics, uri.clone())
                            .await;
                    let result = HintResult::from_result(res);
                    if result.exists() {
                        this.notify_slot(uri.key(), uri.edition());
                    }
                    callback.on_result(uri, result);
                }
                .instrument(span),
            ),
        );
    }

    /// Number of running background fetchers.
    pub fn background_fetcher_count(&self) -> usize {
        self.inner.state.lock().background.len()
    }

    /// Number of temporary fetchers in the cache.
    pub fn temporary_fetcher_count(&self) -> usize {
        self.inner.state.lock().temporary.len()
    }

    /// Number of registered subscriptions, over all keys.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Number of keys with known editions.
    pub fn tracked_key_count(&self) -> usize {
        self.inner.state.lock().tracker.len()
    }

    /// Stops the prefetch ticker and all fetchers.
    ///
    /// Lookups and notifications keep working, but nothing is polled anymore.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = {
            let mut state = self.inner.state.lock();
            let mut handles = state.background.drain();
            self.inner
                .metrics
                .background_fetchers_stopped
                .inc_by(handles.len() as _);
            handles.extend(state.temporary.drain());
            handles
        };
        debug!(fetchers = handles.len(), "shutdown");
        for handle in handles {
            handle.cancel();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    pub(crate) fn next_unknown(&self, key: &VersionedKey) -> Edition {
        self.inner.state.lock().tracker.next_unknown(key)
    }

    /// Called by fetchers after every polling round.
    pub(crate) fn on_round_finished(&self, key: &VersionedKey) {
        {
            let state = self.inner.state.lock();
            for delivery in state.subscriptions.round_finished(key) {
                self.inner.dispatcher.enqueue(delivery);
            }
        }
        self.flush();
    }

    /// Called by fetchers when their task ends.
    pub(crate) fn on_fetcher_exited(&self, key: &VersionedKey, id: u64, cancelled: bool) {
        let (stale, background) = {
            let mut state = self.inner.state.lock();
            match state.background.remove_if_id(key, id) {
                Some(handle) => (Some(handle), true),
                None => (state.temporary.remove_if_id(key, id), false),
            }
        };
        let Some(handle) = stale else {
            return;
        };
        if background {
            self.inner.metrics.background_fetchers_stopped.inc();
        }
        if cancelled {
            debug!(%key, id, "cancelled fetcher was still indexed");
        } else {
            error!(%key, id, background, "fetcher exited while still in use");
            self.inner.metrics.invariant_violations.inc();
        }
        handle.cancel();
    }

    /// Starts confirmation fetches for stalled slots. Returns how many were started.
    pub(crate) fn run_prefetch_sweep(&self) -> usize {
        let due = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            state
                .prefetch
                .sweep(&state.tracker, Instant::now(), self.inner.config.prefetch_delay)
        };
        let n = due.len();
        for uri in due {
            self.inner.metrics.prefetch_fetches.inc();
            let manager = self.downgrade();
            let fetch = self.inner.fetch.clone();
            let span = debug_span!("prefetch", %uri);
            let fut = async move {
                match fetch.fetch(FetchRequest::content(uri.clone())).await {
                    Ok(_) => {
                        if let Some(manager) = manager.upgrade() {
                            manager.inner.metrics.prefetch_success.inc();
                            manager.notify_known_good(uri.key(), uri.edition());
                        }
                    }
                    Err(err) => debug!("prefetch failed: {err:#}"),
                }
            };
            self.inner
                .executor
                .spawn("prefetch", Box::pin(fut.instrument(span)));
        }
        n
    }

    fn new_fetcher(
        &self,
        key: &VersionedKey,
        origin: Edition,
        mode: FetcherMode,
    ) -> (EditionFetcher, FetcherHandle) {
        let id = self.inner.next_fetcher_id.fetch_add(1, Ordering::Relaxed);
        let ctx = FetcherContext {
            manager: self.downgrade(),
            fetch: self.inner.fetch.clone(),
            config: self.inner.config.clone(),
            metrics: self.inner.metrics.clone(),
        };
        EditionFetcher::new(
            id,
            key.clone(),
            origin,
            mode,
            ctx,
            self.inner.shutdown.child_token(),
        )
    }

    /// Cancels `evicted` and runs `fetcher`, both off the calling path.
    fn spawn_fetcher(&self, fetcher: EditionFetcher, evicted: Vec<FetcherHandle>) {
        let span = error_span!(
            "fetcher",
            key = %fetcher.key().public_key().fmt_short(),
            doc = %fetcher.key().doc_name(),
            id = fetcher.id(),
        );
        let fut = async move {
            for handle in evicted {
                handle.cancel();
            }
            fetcher.run().await
        };
        self.inner
            .executor
            .spawn("fetcher", Box::pin(fut.instrument(span)));
    }

    fn flush(&self) {
        self.inner.dispatcher.flush(self.inner.executor.as_ref());
    }
}
