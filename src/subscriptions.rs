//! Subscriber registrations and the per-subscriber delivery filter.

use std::collections::BTreeMap;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tracing::trace;

use crate::{
    callback::{CallbackRef, EditionFound},
    dispatch::Delivery,
    key::{Edition, VersionedKey},
};

/// Options for [`Manager::subscribe`].
///
/// [`Manager::subscribe`]: crate::Manager::subscribe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// The edition the subscriber already knows about.
    ///
    /// Only editions strictly newer than this are reported.
    pub requested_edition: Edition,
    /// Keep a background fetcher polling the key while this subscription is alive.
    pub background_poll: bool,
    /// Only report the newest slot after each polling round, see [`SparseCallback`].
    ///
    /// Implies `background_poll`.
    ///
    /// [`SparseCallback`]: crate::SparseCallback
    pub sparse: bool,
    /// Request a subscription that survives restarts. Not supported.
    pub persistent: bool,
}

impl SubscribeOptions {
    /// Options for a subscriber that already knows `edition`.
    pub fn from_edition(edition: Edition) -> Self {
        Self {
            requested_edition: edition,
            ..Default::default()
        }
    }

    /// Enables background polling.
    pub fn background(mut self) -> Self {
        self.background_poll = true;
        self
    }

    /// Enables sparse delivery, which implies background polling.
    ///
    /// Every sparse subscribe wraps the callback anew, so subscribing the same callback
    /// sparsely twice registers it twice. Unsubscribe each returned handle.
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self.background_poll = true;
        self
    }
}

/// Error returned by [`Manager::subscribe`].
///
/// [`Manager::subscribe`]: crate::Manager::subscribe
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum SubscribeError {
    #[snafu(display("persistent subscriptions are not supported"))]
    Persistent {},
}

/// A live subscription, returned by [`Manager::subscribe`].
///
/// Pass it to [`Manager::unsubscribe`] to remove the subscription. Dropping the handle does
/// not unsubscribe.
///
/// [`Manager::subscribe`]: crate::Manager::subscribe
/// [`Manager::unsubscribe`]: crate::Manager::unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) key: VersionedKey,
    pub(crate) callback: CallbackRef,
    pub(crate) background_poll: bool,
}

impl SubscriptionHandle {
    /// The subscribed key.
    pub fn key(&self) -> &VersionedKey {
        &self.key
    }

    /// Whether this subscription keeps a background fetcher alive.
    pub fn is_background(&self) -> bool {
        self.background_poll
    }
}

#[derive(Debug)]
struct Subscriber {
    callback: CallbackRef,
    requested: Edition,
    /// The last edition handed to this subscriber, and whether it was known good.
    delivered: Option<(Edition, bool)>,
}

impl Subscriber {
    /// Whether `found` is news for this subscriber. Records it as delivered if so.
    fn accept(&mut self, found: &EditionFound) -> bool {
        if found.edition <= self.requested {
            return false;
        }
        let news = match self.delivered {
            None => true,
            Some((edition, known_good)) => {
                found.edition > edition
                    || (found.edition == edition && found.is_known_good && !known_good)
            }
        };
        if news {
            self.delivered = Some((found.edition, found.is_known_good));
        }
        news
    }
}

/// Callbacks registered per key.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subscribers: BTreeMap<VersionedKey, Vec<Subscriber>>,
}

impl SubscriptionRegistry {
    /// Registers `callback` for `key`. Returns false if it was already registered.
    pub fn insert(
        &mut self,
        key: &VersionedKey,
        callback: &CallbackRef,
        requested: Edition,
    ) -> bool {
        let subscribers = self.subscribers.entry(key.clone()).or_default();
        if subscribers.iter().any(|s| &s.callback == callback) {
            trace!(%key, "already subscribed");
            return false;
        }
        subscribers.push(Subscriber {
            callback: callback.clone(),
            requested,
            delivered: None,
        });
        true
    }

    /// Removes `callback` from `key`. Returns false if it was not registered.
    pub fn remove(&mut self, key: &VersionedKey, callback: &CallbackRef) -> bool {
        let Some(subscribers) = self.subscribers.get_mut(key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| &s.callback != callback);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.subscribers.remove(key);
        }
        removed
    }

    /// Offers `found` to a single subscriber.
    pub fn offer(&mut self, callback: &CallbackRef, found: EditionFound) -> Option<Delivery> {
        let subscriber = self
            .subscribers
            .get_mut(&found.key)?
            .iter_mut()
            .find(|s| &s.callback == callback)?;
        subscriber.accept(&found).then(|| Delivery::Found {
            callback: callback.clone(),
            found,
        })
    }

    /// Offers `found` to every subscriber of its key.
    pub fn broadcast(&mut self, found: &EditionFound) -> Vec<Delivery> {
        let Some(subscribers) = self.subscribers.get_mut(&found.key) else {
            return Vec::new();
        };
        subscribers
            .iter_mut()
            .filter_map(|s| {
                s.accept(found).then(|| Delivery::Found {
                    callback: s.callback.clone(),
                    found: found.clone(),
                })
            })
            .collect()
    }

    /// Tells every subscriber of `key` that a polling round finished.
    pub fn round_finished(&self, key: &VersionedKey) -> Vec<Delivery> {
        self.subscribers
            .get(key)
            .into_iter()
            .flatten()
            .map(|s| Delivery::RoundFinished {
                callback: s.callback.clone(),
                key: key.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.values().map(Vec::len).sum()
    }
}
