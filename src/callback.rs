//! Subscriber callbacks.
//!
//! Subscribers implement [`EditionCallback`]. Specialized behavior is added by wrapping a
//! callback rather than by implementing a different trait:
//!
//! - [`SparseCallback`] only reports the newest slot once a polling round has finished.
//! - [`RetrievingCallback`] fetches the content of every newly found edition.
//!
//! [`RetrievingCallback`]: crate::retriever::RetrievingCallback

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::key::{Edition, EditionUri, VersionedKey};

/// A newly found edition of a versioned key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditionFound {
    /// The key the edition belongs to.
    pub key: VersionedKey,
    /// The edition.
    pub edition: Edition,
    /// Whether the content of the edition was fetched successfully, rather than only its
    /// block being observed.
    pub is_known_good: bool,
    /// Whether this edition is also a new latest slot.
    ///
    /// Always true for slot updates. For known good updates this tells whether the edition
    /// was not previously known to exist at all.
    pub is_new_slot: bool,
}

impl EditionFound {
    /// The URI of the found edition.
    pub fn uri(&self) -> EditionUri {
        self.key.at(self.edition)
    }
}

/// Receives edition updates for a subscribed key.
///
/// Callbacks are invoked off the thread that caused the update, one at a time and in the
/// order the updates happened. They must not block for long.
pub trait EditionCallback: Send + Sync + 'static {
    /// Called when a new edition was found.
    fn on_edition_found(&self, found: EditionFound);

    /// Called after a polling round for the key finished.
    fn on_round_finished(&self, _key: &VersionedKey) {}
}

impl<F> EditionCallback for F
where
    F: Fn(EditionFound) + Send + Sync + 'static,
{
    fn on_edition_found(&self, found: EditionFound) {
        (self)(found)
    }
}

/// A shared reference to a callback, compared by identity.
///
/// Two [`CallbackRef`]s are equal if they point to the same callback instance. This is what
/// makes subscribing the same callback twice detectable.
#[derive(Clone)]
pub struct CallbackRef(Arc<dyn EditionCallback>);

impl std::fmt::Debug for CallbackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallbackRef({:p})", Arc::as_ptr(&self.0))
    }
}

impl CallbackRef {
    /// Wraps a callback.
    pub fn new(callback: impl EditionCallback) -> Self {
        Self(Arc::new(callback))
    }

    pub(crate) fn on_edition_found(&self, found: EditionFound) {
        self.0.on_edition_found(found)
    }

    pub(crate) fn on_round_finished(&self, key: &VersionedKey) {
        self.0.on_round_finished(key)
    }
}

impl<T: EditionCallback> From<Arc<T>> for CallbackRef {
    fn from(callback: Arc<T>) -> Self {
        Self(callback)
    }
}

impl PartialEq for CallbackRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl Eq for CallbackRef {}

#[derive(Debug, Default)]
struct SparseState {
    /// Newest slot seen since the last round finished.
    pending: Option<EditionFound>,
    /// Newest edition handed to the inner callback.
    delivered: Option<Edition>,
}

/// Forwards only the newest slot, and only once a polling round has finished.
///
/// Known good updates that do not advance the slot are dropped. This keeps subscribers
/// from hearing about every intermediate edition while a poller is still catching up.
#[derive(Debug)]
pub struct SparseCallback {
    inner: CallbackRef,
    state: Mutex<SparseState>,
}

impl SparseCallback {
    /// Wraps `inner`.
    pub fn new(inner: impl Into<CallbackRef>) -> Self {
        Self {
            inner: inner.into(),
            state: Default::default(),
        }
    }
}

impl EditionCallback for SparseCallback {
    fn on_edition_found(&self, found: EditionFound) {
        if found.is_known_good && !found.is_new_slot {
            return;
        }
        let mut state = self.state.lock();
        let newer = state
            .pending
            .as_ref()
            .is_none_or(|pending| found.edition > pending.edition);
        if newer {
            state.pending = Some(found);
        }
    }

    fn on_round_finished(&self, key: &VersionedKey) {
        let found = {
            let mut state = self.state.lock();
            match state.pending.take() {
                Some(found) if Some(found.edition) > state.delivered => {
                    state.delivered = Some(found.edition);
                    Some(found)
                }
                _ => None,
            }
        };
        if let Some(found) = found {
            trace!(key = %found.key, edition = found.edition, "sparse: forwarding");
            self.inner.on_edition_found(found);
        }
        self.inner.on_round_finished(key);
    }
}
