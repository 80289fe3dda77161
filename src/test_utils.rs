//! Helpers shared by the tests.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use n0_future::{
    boxed::BoxFuture,
    time::{self, Duration},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    callback::{EditionCallback, EditionFound},
    fetch::{Fetch, FetchError, FetchKind, FetchRequest},
    fetcher::{EditionFetcher, FetcherContext, FetcherHandle, FetcherMode},
    key::{Edition, EditionUri, VersionedKey},
    manager::WeakManager,
    retriever::ContentCallback,
};

pub(crate) fn test_key(n: u8) -> VersionedKey {
    VersionedKey::new([n; 32], "doc")
}

/// Lets all spawned tasks run until they are idle.
pub(crate) async fn settle() {
    time::sleep(Duration::from_millis(1)).await;
}

/// A handle whose fetcher was never started.
pub(crate) fn detached_handle(id: u64, key: &VersionedKey) -> FetcherHandle {
    let ctx = FetcherContext {
        manager: WeakManager::default(),
        fetch: Arc::new(MemoryFetch::default()),
        config: Default::default(),
        metrics: Default::default(),
    };
    let (_fetcher, handle) = EditionFetcher::new(
        id,
        key.clone(),
        0,
        FetcherMode::Once,
        ctx,
        CancellationToken::new(),
    );
    handle
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Editions whose block exists.
    blocks: BTreeSet<EditionUri>,
    /// Editions whose content is retrievable.
    content: BTreeSet<EditionUri>,
    requests: Vec<FetchRequest>,
    hang: bool,
}

/// An in-memory network.
#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryFetch {
    state: Arc<Mutex<MemoryState>>,
    in_flight: Arc<AtomicUsize>,
}

impl MemoryFetch {
    /// Publishes an edition with retrievable content.
    pub fn publish(&self, uri: EditionUri) {
        let mut state = self.state.lock();
        state.blocks.insert(uri.clone());
        state.content.insert(uri);
    }

    /// Publishes only the block of an edition, content fetches fail with data found.
    pub fn publish_block(&self, uri: EditionUri) {
        self.state.lock().blocks.insert(uri);
    }

    /// Makes all following fetches hang until they are dropped.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests of `kind` issued for `uri`.
    pub fn count(&self, kind: FetchKind, uri: &EditionUri) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.kind == kind && &r.uri == uri)
            .count()
    }

    /// Number of requests of `kind` over all editions.
    pub fn count_kind(&self, kind: FetchKind) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Fetch for MemoryFetch {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<Bytes, FetchError>> {
        let (res, hang) = {
            let mut state = self.state.lock();
            let res = match request.kind {
                FetchKind::Block if state.blocks.contains(&request.uri) => Ok(Bytes::new()),
                FetchKind::Content if state.content.contains(&request.uri) => {
                    Ok(Bytes::from(request.uri.to_string()))
                }
                FetchKind::Content if state.blocks.contains(&request.uri) => {
                    Err(FetchError::data_found())
                }
                _ => Err(FetchError::not_found()),
            };
            state.requests.push(request);
            (res, state.hang)
        };
        let guard = InFlightGuard::new(self.in_flight.clone());
        Box::pin(async move {
            let _guard = guard;
            if hang {
                std::future::pending::<()>().await;
            }
            res
        })
    }
}

/// Records everything it is told.
#[derive(Debug, Default)]
pub(crate) struct RecordingCallback {
    found: Mutex<Vec<EditionFound>>,
    rounds: AtomicUsize,
}

impl RecordingCallback {
    pub fn found(&self) -> Vec<EditionFound> {
        self.found.lock().clone()
    }

    pub fn editions(&self) -> Vec<Edition> {
        self.found.lock().iter().map(|f| f.edition).collect()
    }

    /// `(edition, is_known_good)` pairs in delivery order.
    pub fn events(&self) -> Vec<(Edition, bool)> {
        self.found
            .lock()
            .iter()
            .map(|f| (f.edition, f.is_known_good))
            .collect()
    }

    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }
}

impl EditionCallback for RecordingCallback {
    fn on_edition_found(&self, found: EditionFound) {
        self.found.lock().push(found);
    }

    fn on_round_finished(&self, _key: &VersionedKey) {
        self.rounds.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records retrieved content.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingContent {
    content: Arc<Mutex<Vec<(EditionUri, Bytes)>>>,
    failed: Arc<Mutex<Vec<EditionUri>>>,
}

impl RecordingContent {
    pub fn editions(&self) -> Vec<Edition> {
        self.content.lock().iter().map(|(uri, _)| uri.edition()).collect()
    }

    pub fn failed(&self) -> Vec<Edition> {
        self.failed.lock().iter().map(|uri| uri.edition()).collect()
    }
}

impl ContentCallback for RecordingContent {
    fn on_content(&self, uri: EditionUri, content: Bytes) {
        self.content.lock().push((uri, content));
    }

    fn on_fetch_failed(&self, uri: EditionUri, _error: FetchError) {
        self.failed.lock().push(uri);
    }
}
