//! Tracks and resolves the latest edition of versioned keys.
//!
//! A versioned key names a mutable document whose editions are immutable snapshots
//! numbered by an increasing integer. There is no authority that knows which edition is
//! the latest, so the [`Manager`] keeps a best effort view per key:
//!
//! - the latest *slot*, the newest edition known to exist, and
//! - the latest *known good* edition, the newest edition whose content was fetched.
//!
//! Both only ever move forward. New editions are found by fetchers probing the network
//! through a [`Fetch`] implementation, by hints, and by feedback from higher layers, and
//! are reported to subscribers through [`EditionCallback`]s.
//!
//! ```no_run
//! # use iroh_editions::*;
//! # async fn wrapper(fetch: impl Fetch) -> n0_snafu::Result {
//! let manager = Manager::new(Config::default(), fetch, TokioExecutor::new());
//! let key: EditionUri = "yxjyofxeojm9g6bbgy85rtptz1uak3z4qxtiwfqqt1b9w5tdqruy/site/3".parse()?;
//! let handle = manager.subscribe(
//!     key.key(),
//!     CallbackRef::new(|found: EditionFound| println!("found {}", found.uri())),
//!     SubscribeOptions::from_edition(key.edition()).background(),
//! )?;
//! // ...
//! manager.unsubscribe(&handle);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod callback;
pub mod config;
pub mod executor;
pub mod fetch;
pub mod hint;
pub mod key;
pub mod metrics;
pub mod retriever;

mod dispatch;
mod fetcher;
mod manager;
mod pool;
mod prefetch;
mod subscriptions;
mod temporary;
mod tracker;

#[cfg(test)]
mod test_utils;

pub use self::{
    callback::{CallbackRef, EditionCallback, EditionFound, SparseCallback},
    config::{Config, ConfigError},
    executor::{Executor, TokioExecutor},
    fetch::{Fetch, FetchError, FetchKind, FetchRequest, ProbeOutcome},
    fetcher::FetcherHandle,
    hint::{HintCallback, HintKind, HintResult},
    key::{Edition, EditionUri, ParseUriError, PublicKeyBytes, VersionedKey},
    manager::{Manager, ResolveOptions},
    retriever::{ContentCallback, ContentSubscription, RetrievingCallback},
    subscriptions::{SubscribeError, SubscribeOptions, SubscriptionHandle},
};
