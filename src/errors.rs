//! Connector error types.
//!
//! Every failure surfaced by a connector is one [`BlobError`] variant.
//! Backend clients report `anyhow::Error`; the connector wraps those into
//! [`BlobError::ReadFailure`] or [`BlobError::WriteFailure`] depending on
//! whether the operation queries or mutates state, so callers can branch
//! on [`BlobError::code`] without knowing which backend is underneath.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BlobError>;

/// Failure kinds of the blob-chunking layer.
#[derive(Debug, Error)]
pub enum BlobError {
    /// A backend-native key could not be parsed into a path and ordinal.
    #[error("malformed blob key: {key:?}")]
    MalformedKey { key: String },

    /// A blob was described with an inconsistent byte range.
    #[error("invalid blob range: start={start} end={end}")]
    InvalidRange { start: i64, end: i64 },

    /// A required blob (or listing) could not be fetched.
    #[error("read of {path} failed: {source}")]
    ReadFailure {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// A chunk could not be persisted or acknowledged.
    ///
    /// Chunks committed before the failure are left in place.
    #[error("write to {path} failed: {source}")]
    WriteFailure {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The backend deleted a different number of blobs than requested.
    #[error("inconsistent delete of {path}: expected {expected} blobs, deleted {deleted}")]
    InconsistentDelete {
        path: String,
        expected: usize,
        deleted: usize,
    },

    /// A container or path name violates the backend's naming rules.
    #[error("name {name:?} is not valid: {reason}")]
    NamingViolation { name: String, reason: String },

    /// A caller-supplied argument cannot be honoured.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The connector has already been closed.
    #[error("connector is closed")]
    Closed,
}

impl BlobError {
    /// Return the stable kind string for this error.
    pub fn code(&self) -> &'static str {
        match self {
            BlobError::MalformedKey { .. } => "MalformedKey",
            BlobError::InvalidRange { .. } => "InvalidRange",
            BlobError::ReadFailure { .. } => "ReadFailure",
            BlobError::WriteFailure { .. } => "WriteFailure",
            BlobError::InconsistentDelete { .. } => "InconsistentDelete",
            BlobError::NamingViolation { .. } => "NamingViolation",
            BlobError::InvalidArgument { .. } => "InvalidArgument",
            BlobError::Closed => "Closed",
        }
    }

    /// Wrap a backend error raised while querying `path`.
    pub fn read(path: impl ToString, source: impl Into<anyhow::Error>) -> Self {
        BlobError::ReadFailure {
            path: path.to_string(),
            source: source.into(),
        }
    }

    /// Wrap a backend error raised while mutating `path`.
    pub fn write(path: impl ToString, source: impl Into<anyhow::Error>) -> Self {
        BlobError::WriteFailure {
            path: path.to_string(),
            source: source.into(),
        }
    }

    pub fn naming(name: impl ToString, reason: impl ToString) -> Self {
        BlobError::NamingViolation {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_argument(message: impl ToString) -> Self {
        BlobError::InvalidArgument {
            message: message.to_string(),
        }
    }
}

/// Extension for attaching a path to backend results.
pub(crate) trait ResultExt<T> {
    /// Map the error into [`BlobError::ReadFailure`].
    fn or_read(self, path: &dyn std::fmt::Display) -> Result<T>;

    /// Map the error into [`BlobError::WriteFailure`].
    fn or_write(self, path: &dyn std::fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn or_read(self, path: &dyn std::fmt::Display) -> Result<T> {
        self.map_err(|e| BlobError::read(path, e))
    }

    fn or_write(self, path: &dyn std::fmt::Display) -> Result<T> {
        self.map_err(|e| BlobError::write(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            BlobError::MalformedKey { key: "x".into() },
            BlobError::InvalidRange { start: 2, end: 1 },
            BlobError::read("c/f", anyhow::anyhow!("boom")),
            BlobError::write("c/f", anyhow::anyhow!("boom")),
            BlobError::InconsistentDelete {
                path: "c/f".into(),
                expected: 2,
                deleted: 1,
            },
            BlobError::naming("Bad", "uppercase"),
            BlobError::invalid_argument("nope"),
            BlobError::Closed,
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_read_failure_keeps_source_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("socket reset"))
            .or_read(&"bucket/file")
            .unwrap_err();
        assert_eq!(err.code(), "ReadFailure");
        let source = std::error::Error::source(&err).expect("source present");
        assert_eq!(source.to_string(), "socket reset");
        assert!(err.to_string().contains("bucket/file"));
    }
}
