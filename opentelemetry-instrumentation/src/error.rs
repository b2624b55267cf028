//! Errors of the instrumentation layer and the error detail recorded on an
//! observation.
//!
//! Two failure families never mix. The wrapped operation's own error is
//! recorded on its observation as an [`ErrorDetail`] and handed back to the
//! caller untouched. Faults of the instrumentation itself are
//! [`InstrumentationError`]s; they are logged and swallowed at the boundary
//! of the wrapped call.
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use thiserror::Error;

/// A specialized `Result` type for instrumentation operations.
pub type InstrumentationResult<T> = Result<T, InstrumentationError>;

/// Faults raised by the instrumentation layer itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InstrumentationError {
    /// A keyed cache or context store operation failed.
    #[error("cache operation failed: {0}")]
    Cache(#[from] CacheError),

    /// A carrier held a value that could not be decoded.
    #[error("propagation failed: {0}")]
    Propagation(String),

    /// An attributes, name, kind or status extractor panicked.
    #[error("extractor `{0}` panicked")]
    Extractor(String),

    /// The observation lifecycle was misused, e.g. ended twice.
    #[error("observation lifecycle violated: {0}")]
    Lifecycle(String),

    /// Other errors not covered above
    #[error(transparent)]
    Other(#[from] Box<dyn Error + Send + Sync + 'static>),
}

impl From<String> for InstrumentationError {
    fn from(err_msg: String) -> Self {
        InstrumentationError::Other(err_msg.into())
    }
}

impl From<&'static str> for InstrumentationError {
    fn from(err_msg: &'static str) -> Self {
        InstrumentationError::Other(err_msg.into())
    }
}

/// Errors returned to direct users of [`KeyedCache`] and [`ContextStore`].
///
/// [`KeyedCache`]: crate::cache::KeyedCache
/// [`ContextStore`]: crate::cache::ContextStore
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// The computation for a key re-entered the cache for the same key on
    /// the same thread. Waiting would deadlock.
    #[error("recursive computation for the same key on the same thread")]
    Reentrant,
}

/// Classification of the error recorded on a failed observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The wrapped operation returned an error.
    Operation,
    /// The pending operation was cancelled before it settled.
    Cancelled,
    /// Every handle to the pending observation was dropped without `end`.
    Abandoned,
}

impl ErrorKind {
    /// Stable lowercase name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Operation => "operation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail attached to an observation ending in failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    /// What kind of failure ended the observation.
    pub kind: ErrorKind,
    /// Type of the error, e.g. `std::io::Error`, or a status class such as
    /// `500` when the failure was derived from a response.
    pub type_name: Cow<'static, str>,
    /// Display message of the error.
    pub message: String,
}

impl ErrorDetail {
    /// Detail for an error returned by the wrapped operation.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: Error + ?Sized,
    {
        ErrorDetail {
            kind: ErrorKind::Operation,
            type_name: Cow::Borrowed(std::any::type_name::<E>()),
            message: error.to_string(),
        }
    }

    /// Detail for an operation cancelled before it settled.
    pub fn cancelled() -> Self {
        ErrorDetail {
            kind: ErrorKind::Cancelled,
            type_name: Cow::Borrowed("cancelled"),
            message: "operation cancelled before completion".to_string(),
        }
    }

    /// Detail for an observation dropped while still pending.
    pub fn abandoned() -> Self {
        ErrorDetail {
            kind: ErrorKind::Abandoned,
            type_name: Cow::Borrowed("abandoned"),
            message: "observation dropped without being ended".to_string(),
        }
    }

    /// Overrides the recorded type name.
    pub fn with_type_name(mut self, type_name: impl Into<Cow<'static, str>>) -> Self {
        self.type_name = type_name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_error_converts() {
        let err: InstrumentationError = CacheError::Reentrant.into();
        assert!(matches!(err, InstrumentationError::Cache(CacheError::Reentrant)));
        assert!(err.to_string().contains("recursive"));
    }

    #[test]
    fn detail_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let detail = ErrorDetail::from_error(&io);
        assert_eq!(detail.kind, ErrorKind::Operation);
        assert!(detail.type_name.ends_with("Error"));
        assert_eq!(detail.message, "timed out");
    }
}
