//! Background fetchers, one per key with background subscribers.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{callback::CallbackRef, fetcher::FetcherHandle, key::VersionedKey};

#[derive(Debug)]
struct PoolEntry {
    handle: FetcherHandle,
    subscribers: Vec<CallbackRef>,
}

/// Background fetchers indexed by key.
///
/// An entry lives exactly as long as its subscriber set is non-empty.
#[derive(Debug, Default)]
pub(crate) struct BackgroundFetcherPool {
    entries: BTreeMap<VersionedKey, PoolEntry>,
}

impl BackgroundFetcherPool {
    pub fn get(&self, key: &VersionedKey) -> Option<&FetcherHandle> {
        self.entries.get(key).map(|e| &e.handle)
    }

    /// Inserts a fetcher for a key that has none yet.
    ///
    /// Callers check [`Self::get`] first, under the same lock.
    pub fn insert(&mut self, key: VersionedKey, handle: FetcherHandle) {
        debug_assert!(!self.entries.contains_key(&key));
        debug!(%key, id = handle.id(), "background fetcher added");
        self.entries.insert(
            key,
            PoolEntry {
                handle,
                subscribers: Vec::new(),
            },
        );
    }

    /// Adds a subscriber to an existing fetcher. Adding the same callback twice is a noop.
    pub fn add_subscriber(&mut self, key: &VersionedKey, callback: &CallbackRef) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.subscribers.contains(callback) {
            entry.subscribers.push(callback.clone());
        }
        true
    }

    /// Removes a subscriber. Returns the fetcher to cancel if that was the last one.
    pub fn remove_subscriber(
        &mut self,
        key: &VersionedKey,
        callback: &CallbackRef,
    ) -> Option<FetcherHandle> {
        let entry = self.entries.get_mut(key)?;
        entry.subscribers.retain(|s| s != callback);
        if !entry.subscribers.is_empty() {
            return None;
        }
        let entry = self.entries.remove(key)?;
        debug!(%key, id = entry.handle.id(), "background fetcher removed");
        Some(entry.handle)
    }

    /// Removes the entry for `key` if it still belongs to fetcher `id`.
    pub fn remove_if_id(&mut self, key: &VersionedKey, id: u64) -> Option<FetcherHandle> {
        if self.entries.get(key)?.handle.id() != id {
            return None;
        }
        self.entries.remove(key).map(|e| e.handle)
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, key: &VersionedKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.subscribers.len())
    }

    /// Removes all fetchers.
    pub fn drain(&mut self) -> Vec<FetcherHandle> {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| e.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
