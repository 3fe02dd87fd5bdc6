use std::error::Error as StdError;
use std::sync::Arc;

use strum::Display;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable classification of [`Error`] for the request-handling layer.
///
/// The cache only tells kinds apart; translating them into responses (not found, server error, bad request) is up to
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    NotFound,
    Adapter,
    InvalidOperator,
    TypeMismatch,
    CacheConsistency,
    Config,
}

// Must stay cheap to clone: one failed fetch is delivered to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{collection} '{id}' not found")]
    NotFound { collection: String, id: String },

    #[error("persistence adapter failed: {0}")]
    Adapter(#[source] Arc<dyn StdError + Send + Sync + 'static>),

    #[error("invalid update operator: {0}")]
    InvalidOperator(String),

    #[error("type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path:     String,
        expected: &'static str,
        found:    &'static str,
    },

    /// The store accepted the update but the cached copy could not replay it. The entry has been evicted.
    #[error("{collection} '{id}' updated in the store but its cached copy could not be mirrored: {source}")]
    CacheConsistency {
        collection: String,
        id:         String,
        #[source]
        source:     Box<Error>,
    },

    #[error("malformed {collection} record: {reason}")]
    MalformedRecord { collection: String, reason: String },

    #[error("fetch of {collection} '{id}' ended without a result")]
    FetchAborted { collection: String, id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to build {0}")]
    Builder(String),
}

impl Error {
    pub fn adapter<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Adapter(Arc::new(err))
    }

    pub fn not_found(collection: impl ToString, id: impl ToString) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id:         id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Adapter(_) | Self::MalformedRecord { .. } | Self::FetchAborted { .. } => ErrorKind::Adapter,
            Self::InvalidOperator(_) => ErrorKind::InvalidOperator,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::CacheConsistency { .. } => ErrorKind::CacheConsistency,
            Self::Config(_) | Self::Builder(_) => ErrorKind::Config,
        }
    }

    /// `true` when the durable update went through despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::CacheConsistency { .. })
    }
}

impl From<fieldx::error::FieldXError> for Error {
    fn from(err: fieldx::error::FieldXError) -> Self {
        Self::Builder(err.to_string())
    }
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::Config(report.to_string())
    }
}
