//! Chunking and reassembly arithmetic shared by every backend.
//!
//! Writes are carved into chunks of at most `max_blob_size` bytes across
//! the caller's buffers; reads are planned as a list of sub-ranges of the
//! blobs intersecting the requested byte window.

use bytes::{Bytes, BytesMut};

use crate::blob::Blob;

/// Total number of bytes in `buffers`.
pub fn total_size(buffers: &[Bytes]) -> u64 {
    buffers.iter().map(|b| b.len() as u64).sum()
}

/// Iterator over the chunks of a buffer sequence.
///
/// A chunk that lies within one source buffer is a zero-copy slice; only
/// chunks straddling buffer boundaries are copied.
pub struct Chunks<'a> {
    buffers: &'a [Bytes],
    index: usize,
    position: usize,
    max: usize,
}

/// Split `buffers` into chunks of at most `max_blob_size` bytes.
///
/// Empty input yields no chunks.  `max_blob_size` must be at least 1.
pub fn chunks(buffers: &[Bytes], max_blob_size: u64) -> Chunks<'_> {
    Chunks {
        buffers,
        index: 0,
        position: 0,
        max: usize::try_from(max_blob_size.max(1)).unwrap_or(usize::MAX),
    }
}

impl Chunks<'_> {
    /// Bytes not yet handed out.
    fn remaining(&self) -> usize {
        let rest: usize = self.buffers[self.index.min(self.buffers.len())..]
            .iter()
            .map(Bytes::len)
            .sum();
        rest - self.position
    }

    fn skip_exhausted(&mut self) {
        while self.index < self.buffers.len() && self.position >= self.buffers[self.index].len() {
            self.index += 1;
            self.position = 0;
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.skip_exhausted();
        if self.index >= self.buffers.len() {
            return None;
        }

        let current = &self.buffers[self.index];
        let available = current.len() - self.position;
        let is_last = self.buffers[self.index + 1..].iter().all(Bytes::is_empty);
        if available >= self.max || is_last {
            let take = available.min(self.max);
            let chunk = current.slice(self.position..self.position + take);
            self.position += take;
            return Some(chunk);
        }

        let mut chunk = BytesMut::with_capacity(self.remaining().min(self.max));
        while chunk.len() < self.max {
            self.skip_exhausted();
            if self.index >= self.buffers.len() {
                break;
            }
            let current = &self.buffers[self.index];
            let take = (current.len() - self.position).min(self.max - chunk.len());
            chunk.extend_from_slice(&current[self.position..self.position + take]);
            self.position += take;
        }
        Some(chunk.freeze())
    }
}

/// Number of chunks `len` bytes split into.
pub fn chunk_count(len: u64, max_blob_size: u64) -> u64 {
    len.div_ceil(max_blob_size.max(1))
}

/// One blob-local range to copy during a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSegment {
    /// Index into the ordered blob list.
    pub index: usize,
    /// Offset inside the blob.
    pub blob_offset: u64,
    /// Bytes to copy from the blob.
    pub length: u64,
}

/// Plan the reads needed to cover `[offset, offset + length)` of a file
/// made of `blobs` (in ordinal order).
///
/// Blobs entirely before `offset` are skipped and planning stops once
/// `length` bytes are covered or the blobs run out.
pub fn plan_read(blobs: &[Blob], offset: u64, length: u64) -> Vec<ReadSegment> {
    let mut segments = Vec::new();
    let mut remaining = length;
    let mut blob_start = 0u64;
    for (index, blob) in blobs.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let size = blob.size();
        let blob_end = blob_start + size;
        if blob_end <= offset {
            blob_start = blob_end;
            continue;
        }
        let blob_offset = offset.saturating_sub(blob_start);
        let take = (size - blob_offset).min(remaining);
        if take > 0 {
            segments.push(ReadSegment {
                index,
                blob_offset,
                length: take,
            });
        }
        remaining -= take;
        blob_start = blob_end;
    }
    segments
}

/// Locate the blob containing byte `position`.
///
/// Returns the blob index and the offset at which that blob starts, or
/// `None` if `position` lies at or beyond the end of the file.
pub fn locate(blobs: &[Blob], position: u64) -> Option<(usize, u64)> {
    let mut blob_start = 0u64;
    for (index, blob) in blobs.iter().enumerate() {
        let blob_end = blob_start + blob.size();
        if position < blob_end {
            return Some((index, blob_start));
        }
        blob_start = blob_end;
    }
    None
}
