//! Subscriptions that fetch the content of every new edition.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span};

use crate::{
    callback::{EditionCallback, EditionFound},
    executor::Executor,
    fetch::{Fetch, FetchError, FetchRequest},
    key::{Edition, EditionUri},
    manager::WeakManager,
    subscriptions::SubscriptionHandle,
};

/// Receives the content of newly found editions.
pub trait ContentCallback: Send + Sync + 'static {
    /// Called with the content of a new edition.
    fn on_content(&self, uri: EditionUri, content: Bytes);

    /// Called when fetching the content of a found edition failed.
    fn on_fetch_failed(&self, _uri: EditionUri, _error: FetchError) {}
}

#[derive(Debug, Default)]
struct RetrieverState {
    /// Newest edition a fetch was started for.
    latest: Option<Edition>,
    /// Cancels the fetch in flight.
    current: Option<CancellationToken>,
}

/// Fetches the content of every newly found edition and hands it to a [`ContentCallback`].
///
/// Only the newest edition is fetched: finding a newer one cancels the fetch in flight.
/// Successful fetches are reported back to the manager as known good.
#[derive(derive_more::Debug)]
pub struct RetrievingCallback {
    #[debug("ContentCallback")]
    inner: Arc<dyn ContentCallback>,
    fetch: Arc<dyn Fetch>,
    executor: Arc<dyn Executor>,
    manager: WeakManager,
    cancel: CancellationToken,
    state: Mutex<RetrieverState>,
}

impl RetrievingCallback {
    pub(crate) fn new(
        inner: Arc<dyn ContentCallback>,
        fetch: Arc<dyn Fetch>,
        executor: Arc<dyn Executor>,
        manager: WeakManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            fetch,
            executor,
            manager,
            cancel,
            state: Default::default(),
        }
    }

    /// The newest edition a fetch was started for.
    pub fn latest(&self) -> Option<Edition> {
        self.state.lock().latest
    }

    /// Stops the fetch in flight and ignores further editions.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn retrieve(&self, uri: EditionUri) {
        let token = {
            let mut state = self.state.lock();
            if state.latest >= Some(uri.edition()) || self.cancel.is_cancelled() {
                return;
            }
            state.latest = Some(uri.edition());
            if let Some(previous) = state.current.take() {
                previous.cancel();
            }
            let token = self.cancel.child_token();
            state.current = Some(token.clone());
            token
        };
        let fetch = self.fetch.clone();
        let inner = self.inner.clone();
        let manager = self.manager.clone();
        let span = debug_span!("retrieve", %uri);
        let fut = async move {
            let res = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("superseded");
                    return;
                }
                res = fetch.fetch(FetchRequest::content(uri.clone())) => res,
            };
            match res {
                Ok(content) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.check_fetched(&uri, false);
                    }
                    inner.on_content(uri, content);
                }
                Err(err) => {
                    debug!("content fetch failed: {err:#}");
                    inner.on_fetch_failed(uri, err);
                }
            }
        };
        self.executor.spawn("retrieve", Box::pin(fut.instrument(span)));
    }
}

impl EditionCallback for RetrievingCallback {
    fn on_edition_found(&self, found: EditionFound) {
        self.retrieve(found.uri());
    }
}

/// A content subscription, returned by [`Manager::subscribe_content`].
///
/// [`Manager::subscribe_content`]: crate::Manager::subscribe_content
#[derive(Debug, Clone)]
pub struct ContentSubscription {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) retriever: Arc<RetrievingCallback>,
}

impl ContentSubscription {
    /// The underlying edition subscription.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// The newest edition a content fetch was started for.
    pub fn latest(&self) -> Option<Edition> {
        self.retriever.latest()
    }
}
