//! Existence probes for single editions.

use tracing::trace;

use crate::{
    fetch::{Fetch, FetchError, FetchRequest, ProbeOutcome},
    key::EditionUri,
    metrics::Metrics,
};

/// What a successful existence probe proves about an edition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HintKind {
    /// The edition exists, its content may not be retrievable.
    #[default]
    Slot,
    /// The probe validates that the edition is fetchable.
    KnownGood,
}

/// Result of [`Manager::hint_check`].
///
/// [`Manager::hint_check`]: crate::Manager::hint_check
#[derive(Debug)]
pub enum HintResult {
    /// The edition exists. The manager state was updated.
    Exists,
    /// The network reported the edition as not found.
    NotFound(FetchError),
    /// The probe failed for any other reason.
    Failed(FetchError),
}

impl HintResult {
    pub(crate) fn from_result<T>(res: Result<T, FetchError>) -> Self {
        match res {
            Ok(_) => Self::Exists,
            Err(err) if err.is_data_found() => Self::Exists,
            Err(err) if err.is_not_found() => Self::NotFound(err),
            Err(err) => Self::Failed(err),
        }
    }

    /// Whether the edition exists.
    pub fn exists(&self) -> bool {
        matches!(self, Self::Exists)
    }
}

/// Receives the outcome of [`Manager::hint_check`].
///
/// [`Manager::hint_check`]: crate::Manager::hint_check
pub trait HintCallback: Send + 'static {
    /// Called once with the probe result.
    fn on_result(self: Box<Self>, uri: EditionUri, result: HintResult);
}

impl<F> HintCallback for F
where
    F: FnOnce(EditionUri, HintResult) + Send + 'static,
{
    fn on_result(self: Box<Self>, uri: EditionUri, result: HintResult) {
        (self)(uri, result)
    }
}

/// Fetches the block of `uri` and records the outcome in the metrics.
pub(crate) async fn probe_block(
    fetch: &dyn Fetch,
    metrics: &Metrics,
    uri: EditionUri,
) -> ProbeOutcome {
    let res = fetch_block(fetch, metrics, uri).await;
    ProbeOutcome::from_result(&res)
}

/// Like [`probe_block`], but returns the raw fetch result.
pub(crate) async fn fetch_block(
    fetch: &dyn Fetch,
    metrics: &Metrics,
    uri: EditionUri,
) -> Result<bytes::Bytes, FetchError> {
    metrics.probes.inc();
    let res = fetch.fetch(FetchRequest::block(uri.clone())).await;
    let outcome = ProbeOutcome::from_result(&res);
    match outcome {
        ProbeOutcome::Exists => metrics.probes_exists.inc(),
        ProbeOutcome::Absent => metrics.probes_absent.inc(),
        ProbeOutcome::Indeterminate => metrics.probes_indeterminate.inc(),
    };
    trace!(%uri, %outcome, "probed block");
    res
}
