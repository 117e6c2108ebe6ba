//! Immutable descriptors of the physical chunks behind a file.

use std::cmp::Ordering;

use crate::errors::{BlobError, Result};
use crate::key;

/// Where a broker-backed blob lives in the log, plus the byte range of the
/// file it covers (inclusive end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogCoordinates {
    pub partition: i32,
    pub offset: i64,
    pub range_start: i64,
    pub range_end: i64,
}

/// One physical chunk of a logical file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Blob {
    key: String,
    ordinal: u64,
    size: u64,
    log: Option<LogCoordinates>,
}

impl Blob {
    /// A blob addressed by key with a backend-reported size.
    pub fn keyed(key: impl Into<String>, size: u64) -> Result<Self> {
        let key = key.into();
        let ordinal = key::ordinal_of(&key)?;
        Ok(Self {
            key,
            ordinal,
            size,
            log: None,
        })
    }

    /// A blob stored as a broker record covering `[range_start, range_end]`.
    pub fn logged(key: impl Into<String>, coordinates: LogCoordinates) -> Result<Self> {
        let LogCoordinates {
            range_start,
            range_end,
            ..
        } = coordinates;
        let invalid = || BlobError::InvalidRange {
            start: range_start,
            end: range_end,
        };
        if range_start < 0 || range_end < range_start {
            return Err(invalid());
        }
        let size = range_end
            .checked_sub(range_start)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(invalid)?;
        let key = key.into();
        let ordinal = key::ordinal_of(&key)?;
        Ok(Self {
            key,
            ordinal,
            size: size as u64,
            log: Some(coordinates),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Broker coordinates, if this blob lives in a log.
    pub fn log(&self) -> Option<&LogCoordinates> {
        self.log.as_ref()
    }
}

impl PartialOrd for Blob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Blob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal
            .cmp(&other.ordinal)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Sum of the sizes of `blobs`.
pub fn total_size(blobs: &[Blob]) -> u64 {
    blobs.iter().map(Blob::size).sum()
}

/// Ordinal the next written blob receives: one past the highest existing.
pub fn next_ordinal(blobs: &[Blob]) -> u64 {
    blobs.iter().map(Blob::ordinal).max().map_or(0, |max| max + 1)
}
