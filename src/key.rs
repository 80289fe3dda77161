//! Versioned key identities and edition URIs.
//!
//! A [`VersionedKey`] is the "clear" form of a versioned key: the public key of the author
//! and the document name, with the edition number stripped. Every edition of a document
//! maps to the same [`VersionedKey`], which is what all per-key state is indexed by.
//! An [`EditionUri`] points at one specific edition.

use std::{fmt, num::ParseIntError, str::FromStr, sync::Arc};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};

/// Edition number of a versioned key.
///
/// Editions of one key are totally ordered, a higher number is newer.
pub type Edition = u64;

/// Errors when parsing keys and edition URIs.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ParseUriError {
    #[snafu(display("public key was not encoded in valid z32"))]
    InvalidEncodingZ32 { source: z32::Z32Error },
    #[snafu(display("length must be 32 bytes, but got {len} byte(s)"))]
    InvalidLength { len: usize },
    #[snafu(display("expected <key>/<document>/<edition>"))]
    MissingSegment {},
    #[snafu(display("document name must not be empty"))]
    EmptyDocName {},
    #[snafu(display("invalid edition number"))]
    InvalidEdition { source: ParseIntError },
}

/// The 32 byte public key of the author of a versioned key.
#[derive(
    derive_more::From, derive_more::Into, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    /// Decodes a public key from its z-base-32 representation.
    pub fn from_z32(s: &str) -> Result<Self, ParseUriError> {
        let bytes = z32::decode(s.as_bytes()).context(InvalidEncodingZ32Snafu)?;
        let len = bytes.len();
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidLengthSnafu { len }.build())?;
        Ok(Self(bytes))
    }

    /// Encodes the public key in z-base-32.
    pub fn to_z32(&self) -> String {
        z32::encode(&self.0)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns a shortened z32 form, for logging.
    pub fn fmt_short(&self) -> String {
        let mut s = self.to_z32();
        s.truncate(10);
        s
    }
}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_z32())
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.to_z32())
    }
}

impl FromStr for PublicKeyBytes {
    type Err = ParseUriError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_z32(s)
    }
}

impl AsRef<[u8; 32]> for PublicKeyBytes {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The identity of a versioned key, independent of any edition.
///
/// Ordered first by public key, then by document name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionedKey {
    public_key: PublicKeyBytes,
    doc_name: Arc<str>,
}

impl VersionedKey {
    /// Creates a new versioned key identity.
    pub fn new(public_key: impl Into<PublicKeyBytes>, doc_name: impl Into<Arc<str>>) -> Self {
        Self {
            public_key: public_key.into(),
            doc_name: doc_name.into(),
        }
    }

    /// The public key of the author.
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    /// The document name.
    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    /// Returns the URI of the given edition of this key.
    pub fn at(&self, edition: Edition) -> EditionUri {
        EditionUri {
            key: self.clone(),
            edition,
        }
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.public_key, self.doc_name)
    }
}

impl fmt::Debug for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VersionedKey({}/{})",
            self.public_key.fmt_short(),
            self.doc_name
        )
    }
}

/// A URI pointing at one edition of a versioned key.
///
/// The string form is `<z32 public key>/<document name>/<edition>`. The document name may
/// itself contain slashes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EditionUri {
    key: VersionedKey,
    edition: Edition,
}

impl EditionUri {
    /// Creates a new edition URI.
    pub fn new(key: VersionedKey, edition: Edition) -> Self {
        Self { key, edition }
    }

    /// The clear identity of the key, without the edition.
    pub fn key(&self) -> &VersionedKey {
        &self.key
    }

    /// The edition this URI points at.
    pub fn edition(&self) -> Edition {
        self.edition
    }

    /// Returns the URI of another edition of the same key.
    pub fn with_edition(&self, edition: Edition) -> Self {
        self.key.at(edition)
    }
}

impl fmt::Display for EditionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key, self.edition)
    }
}

impl FromStr for EditionUri {
    type Err = ParseUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, edition) = s.rsplit_once('/').ok_or(MissingSegmentSnafu.build())?;
        let (public_key, doc_name) = rest.split_once('/').ok_or(MissingSegmentSnafu.build())?;
        ensure!(!doc_name.is_empty(), EmptyDocNameSnafu);
        let public_key = PublicKeyBytes::from_z32(public_key)?;
        let edition = edition.parse().context(InvalidEditionSnafu)?;
        Ok(VersionedKey::new(public_key, doc_name).at(edition))
    }
}
