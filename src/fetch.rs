//! The network fetch capability consumed by the manager.
//!
//! Retrieving blocks and content from the network is out of scope for this crate. The
//! [`Manager`] only needs to issue requests for single editions and to tell a handful of
//! failure classes apart, which is what the [`Fetch`] trait captures.
//!
//! [`Manager`]: crate::Manager

use std::sync::Arc;

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, Snafu};

use crate::key::EditionUri;

/// What a [`FetchRequest`] should retrieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FetchKind {
    /// Only the signed block of the edition, to check that it exists.
    Block,
    /// The full content of the edition.
    Content,
}

/// A request for a single edition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// The edition to fetch.
    pub uri: EditionUri,
    /// Whether to fetch only the block or the whole content.
    pub kind: FetchKind,
}

impl FetchRequest {
    /// Creates a request for the block of an edition.
    pub fn block(uri: EditionUri) -> Self {
        Self {
            uri,
            kind: FetchKind::Block,
        }
    }

    /// Creates a request for the full content of an edition.
    pub fn content(uri: EditionUri) -> Self {
        Self {
            uri,
            kind: FetchKind::Content,
        }
    }
}

/// Failure of a [`Fetch`].
///
/// The manager only cares about the coarse classification: whether the block was found even
/// though the request failed, whether the network is confident the edition does not exist,
/// or anything else.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FetchError {
    /// The block was found, but the rest of the request failed.
    #[snafu(display("data found, but the request failed later"))]
    DataFound {},
    /// The edition was not found after exhausting retries.
    #[snafu(display("data not found"))]
    NotFound {},
    /// Any other failure, e.g. route not found, overload or timeout.
    #[snafu(display("fetch failed"))]
    Other {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl FetchError {
    /// Creates a [`FetchError::DataFound`] error.
    pub fn data_found() -> Self {
        DataFoundSnafu.build()
    }

    /// Creates a [`FetchError::NotFound`] error.
    pub fn not_found() -> Self {
        NotFoundSnafu.build()
    }

    /// Creates a [`FetchError::Other`] error from an arbitrary error type.
    pub fn other<T: std::error::Error + Send + Sync + 'static>(source: T) -> Self {
        OtherSnafu.into_error(Box::new(source))
    }

    /// Whether the block itself was found.
    pub fn is_data_found(&self) -> bool {
        matches!(self, Self::DataFound { .. })
    }

    /// Whether the edition was definitely not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Retrieves editions from the network.
///
/// Implementations must be cancel safe: the manager drops the returned future to cancel an
/// in-flight request.
pub trait Fetch: std::fmt::Debug + Send + Sync + 'static {
    /// Fetches a single edition.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<Bytes, FetchError>>;
}

impl<T: Fetch> Fetch for Arc<T> {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<Bytes, FetchError>> {
        self.as_ref().fetch(request)
    }
}

/// Outcome of an existence probe for a single edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProbeOutcome {
    /// The block of the edition exists.
    Exists,
    /// The network reported the edition as not found.
    Absent,
    /// The probe failed for any other reason.
    Indeterminate,
}

impl ProbeOutcome {
    /// Classifies the result of a block fetch.
    pub fn from_result<T>(res: &Result<T, FetchError>) -> Self {
        match res {
            Ok(_) => Self::Exists,
            Err(err) if err.is_data_found() => Self::Exists,
            Err(err) if err.is_not_found() => Self::Absent,
            Err(_) => Self::Indeterminate,
        }
    }
}
