//! Bounded cache of temporary fetchers started by `resolve_once`.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::{fetcher::FetcherHandle, key::VersionedKey};

/// Temporary fetchers in least recently used order.
///
/// Capacity is a hard limit: inserting into a full cache evicts the least recently used
/// fetcher, which the caller has to cancel. Fetchers that gain subscribers are taken out of
/// the cache and moved to the background pool, so every entry here is evictable.
#[derive(Debug)]
pub(crate) struct TemporaryFetcherCache {
    fetchers: LruCache<VersionedKey, FetcherHandle>,
}

impl TemporaryFetcherCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            fetchers: LruCache::new(capacity),
        }
    }

    /// Looks up the fetcher for `key` and marks it as most recently used.
    pub fn touch(&mut self, key: &VersionedKey) -> Option<&FetcherHandle> {
        self.fetchers.get(key)
    }

    /// Inserts a fetcher for a key not in the cache. Returns the evicted fetcher, if any.
    pub fn insert(&mut self, key: VersionedKey, handle: FetcherHandle) -> Option<FetcherHandle> {
        debug_assert!(!self.fetchers.contains(&key));
        let (evicted_key, evicted) = self.fetchers.push(key, handle)?;
        debug!(key = %evicted_key, id = evicted.id(), "temporary fetcher evicted");
        Some(evicted)
    }

    /// Takes the fetcher for `key` out of the cache.
    pub fn take(&mut self, key: &VersionedKey) -> Option<FetcherHandle> {
        self.fetchers.pop(key)
    }

    /// Removes the entry for `key` if it still belongs to fetcher `id`.
    pub fn remove_if_id(&mut self, key: &VersionedKey, id: u64) -> Option<FetcherHandle> {
        if self.fetchers.peek(key)?.id() != id {
            return None;
        }
        self.fetchers.pop(key)
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = &VersionedKey> {
        self.fetchers.iter().map(|(key, _)| key)
    }

    pub fn drain(&mut self) -> Vec<FetcherHandle> {
        let mut handles = Vec::with_capacity(self.fetchers.len());
        while let Some((_, handle)) = self.fetchers.pop_lru() {
            handles.push(handle);
        }
        handles
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }
}
