//! Connector core.
//!
//! [`Connector`] is the file-level contract the handle layer calls into.
//! [`BlobConnector`] implements it once, generically, on top of a
//! [`BlobBackend`] that only knows how to list, put, fetch and delete
//! individual blobs.  Chunking, reassembly, truncation, move/copy and the
//! compaction fallback for append-only backends all live here, so each
//! backend supplies just its primitives and its maximum blob size.
//!
//! Preconditions:
//! - Paths passed to operations come from [`Connector::resolve`], which
//!   applies the backend's naming rules once.
//! - `close` must not race in-flight operations.
//! - Writers of one path in *different* connector instances are not
//!   serialized.  Within one instance, mutations of a path are.

pub mod caching;
#[cfg(test)]
pub(crate) mod contract;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use bytes::{Bytes, BytesMut};
use metrics::counter;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::blob::{self, Blob};
use crate::chunking;
use crate::config::ConnectorConfig;
use crate::errors::{BlobError, Result, ResultExt};
use crate::metrics::{
    BLOBS_DELETED_TOTAL, BLOBS_WRITTEN_TOTAL, BYTES_READ_TOTAL, BYTES_WRITTEN_TOTAL,
    COMPACTIONS_TOTAL,
};
use crate::path::{PathValidator, VirtualPath};
use crate::BoxFuture;

pub use caching::CachingConnector;

/// Direct children of a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Children {
    /// First-level subdirectory names, sorted.
    pub directories: Vec<String>,
    /// File names, sorted.
    pub files: Vec<String>,
}

impl Children {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }
}

// -- Connector contract -------------------------------------------------------

/// File operations over a blob backend.
pub trait Connector: Send + Sync + 'static {
    /// Parse `raw` and check it against the backend's naming rules.
    fn resolve(&self, raw: &str) -> Result<VirtualPath>;

    /// True iff at least one blob of `file` exists.
    fn file_exists(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>>;

    /// Sum of the sizes of the blobs of `file`; 0 if it has none.
    fn file_size(&self, file: &VirtualPath) -> BoxFuture<'_, Result<u64>>;

    /// Blobs of `file` in ordinal order.
    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, Result<Vec<Blob>>>;

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Reads past the end of the file return only the available bytes.
    fn read_data(&self, file: &VirtualPath, offset: u64, length: u64)
        -> BoxFuture<'_, Result<Bytes>>;

    /// Read up to `length` bytes at `offset` into the front of `target`,
    /// returning the number of bytes copied.
    fn read_into<'a>(
        &'a self,
        file: &VirtualPath,
        target: &'a mut [u8],
        offset: u64,
        length: u64,
    ) -> BoxFuture<'a, Result<u64>> {
        let file = file.clone();
        Box::pin(async move {
            if (target.len() as u64) < length {
                return Err(BlobError::invalid_argument(format!(
                    "target holds {} bytes, {length} requested",
                    target.len()
                )));
            }
            let data = self.read_data(&file, offset, length).await?;
            target[..data.len()].copy_from_slice(&data);
            Ok(data.len() as u64)
        })
    }

    /// Append `data` to `file`, returning the number of bytes written.
    fn write_data(&self, file: &VirtualPath, data: Vec<Bytes>) -> BoxFuture<'_, Result<u64>>;

    /// Delete every blob of `file`.  Returns false if there were none.
    fn delete_file(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>>;

    /// Delete the given blobs of `file`, keeping the rest readable in order.
    /// Blobs that are not currently part of `file` fail the whole call with
    /// [`BlobError::InconsistentDelete`].
    fn delete_blobs(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, Result<bool>>;

    /// Cut `file` down to `new_length` bytes.
    fn truncate_file(&self, file: &VirtualPath, new_length: u64) -> BoxFuture<'_, Result<()>>;

    /// Move `source` onto the end of `target`; `source` stops existing.
    fn move_file(&self, source: &VirtualPath, target: &VirtualPath) -> BoxFuture<'_, Result<()>>;

    /// Append all of `source` to `target`, returning the bytes copied.
    fn copy_file(&self, source: &VirtualPath, target: &VirtualPath)
        -> BoxFuture<'_, Result<u64>>;

    /// Append `length` bytes of `source` starting at `offset` to `target`.
    fn copy_range(
        &self,
        source: &VirtualPath,
        target: &VirtualPath,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, Result<u64>>;

    /// Files and first-level subdirectories directly below `directory`.
    fn list_children(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<Children>>;

    /// Directories are implicit, so every resolvable directory exists.
    fn directory_exists(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<bool>>;

    /// True iff `directory` has no children.
    fn is_empty(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        let directory = directory.clone();
        Box::pin(async move { Ok(self.list_children(&directory).await?.is_empty()) })
    }

    /// Files materialize on first write; this only checks the connector is open.
    fn create_file(&self, file: &VirtualPath) -> BoxFuture<'_, Result<()>>;

    /// Directories materialize with their first file.
    fn create_directory(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<()>>;

    /// Release every cached handle.  Idempotent; later operations fail with
    /// [`BlobError::Closed`].
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

// -- Backend primitives -------------------------------------------------------

/// How a backend removes individual blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Blobs can be deleted one by one.
    Selective,
    /// Only a prefix of the log can be dropped: partial deletes rewrite the
    /// surviving content and then trim everything superseded.
    Compacting,
}

/// Blob-level primitives a backend family provides to [`BlobConnector`].
pub trait BlobBackend: Send + Sync + 'static {
    /// Short backend name for logs and metric labels.
    fn kind(&self) -> &'static str;

    /// Largest blob this backend stores.
    fn max_blob_size(&self) -> u64;

    fn validator(&self) -> &dyn PathValidator;

    fn delete_mode(&self) -> DeleteMode {
        DeleteMode::Selective
    }

    /// Current blobs of `file`, in any order.
    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<Vec<Blob>>>;

    /// Every file that has `directory` as a strict ancestor.
    fn files_below(&self, directory: &VirtualPath)
        -> BoxFuture<'_, anyhow::Result<Vec<VirtualPath>>>;

    /// `length` bytes of `blob` starting at `offset` within it.
    fn read_blob(
        &self,
        file: &VirtualPath,
        blob: &Blob,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>>;

    /// Persist one chunk as blob number `ordinal`, covering file bytes
    /// starting at `position`.
    fn put_blob(
        &self,
        file: &VirtualPath,
        ordinal: u64,
        position: u64,
        data: Bytes,
    ) -> BoxFuture<'_, anyhow::Result<Blob>>;

    /// Record blobs persisted by one write.  Called once per write after
    /// every chunk is acknowledged.
    fn commit_blobs(&self, _file: &VirtualPath, _blobs: &[Blob]) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Remove `blobs`, returning how many were removed.  For
    /// [`DeleteMode::Compacting`] backends this trims the log up to and
    /// including the given blobs.
    fn delete_blobs(&self, file: &VirtualPath, blobs: &[Blob])
        -> BoxFuture<'_, anyhow::Result<usize>>;

    /// Remove `file` and all of its `blobs`, returning how many blobs were
    /// removed.
    fn delete_file(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, anyhow::Result<usize>> {
        self.delete_blobs(file, blobs)
    }

    /// Forget the recorded blobs of `file` ahead of a compaction rewrite.
    fn reset_index(&self, _file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Rename `blobs` of `source` to ordinals `first_ordinal..` of `target`
    /// in the same container without moving data.  Returns false if the
    /// backend cannot.
    fn relabel_blobs(
        &self,
        _source: &VirtualPath,
        _target: &VirtualPath,
        _blobs: &[Blob],
        _first_ordinal: u64,
    ) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    /// Server-side copy of `blobs` to ordinals `first_ordinal..` of
    /// `target`.  Returns the bytes copied, or `None` if unsupported.
    fn copy_blobs(
        &self,
        _source: &VirtualPath,
        _target: &VirtualPath,
        _blobs: &[Blob],
        _first_ordinal: u64,
    ) -> BoxFuture<'_, anyhow::Result<Option<u64>>> {
        Box::pin(async { Ok(None) })
    }

    /// Release cached handles.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

// -- Generic connector ----------------------------------------------------------

/// [`Connector`] implementation shared by every backend family.
pub struct BlobConnector<B> {
    backend: B,
    max_blob_size: u64,
    open: AtomicBool,
    write_locks: WriteLocks,
}

type WriteLocks = std::sync::Mutex<HashMap<VirtualPath, Arc<Mutex<()>>>>;

/// Write locks held on a set of paths.
///
/// On drop the locks are released, and map entries nobody else holds or
/// waits on are removed.
struct PathGuards<'a> {
    guards: Vec<OwnedMutexGuard<()>>,
    paths: Vec<VirtualPath>,
    locks: &'a WriteLocks,
}

impl Drop for PathGuards<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for path in &self.paths {
            if map.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                map.remove(path);
            }
        }
    }
}

impl<B: BlobBackend> BlobConnector<B> {
    pub fn new(backend: B) -> Self {
        let max_blob_size = backend.max_blob_size().max(1);
        Self {
            backend,
            max_blob_size,
            open: AtomicBool::new(true),
            write_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Use blobs of at most `max_blob_size` bytes, capped at the backend's
    /// own limit.
    pub fn with_max_blob_size(mut self, max_blob_size: u64) -> Result<Self> {
        if max_blob_size == 0 {
            return Err(BlobError::invalid_argument("max blob size must be at least 1"));
        }
        self.max_blob_size = max_blob_size.min(self.backend.max_blob_size());
        Ok(self)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BlobError::Closed)
        }
    }

    /// Take the write locks of `paths` in a fixed order.
    async fn lock_paths(&self, paths: &[&VirtualPath]) -> PathGuards<'_> {
        let ordered: BTreeSet<&VirtualPath> = paths.iter().copied().collect();
        let paths: Vec<VirtualPath> = ordered.into_iter().cloned().collect();
        let locks: Vec<Arc<Mutex<()>>> = {
            let mut map = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
            paths
                .iter()
                .map(|path| Arc::clone(map.entry(path.clone()).or_default()))
                .collect()
        };
        let mut held = PathGuards {
            guards: Vec::with_capacity(locks.len()),
            paths,
            locks: &self.write_locks,
        };
        for lock in locks {
            held.guards.push(lock.lock_owned().await);
        }
        held
    }

    async fn list(&self, file: &VirtualPath) -> Result<Vec<Blob>> {
        let mut blobs = self.backend.blobs(file).await.or_read(file)?;
        blobs.sort();
        Ok(blobs)
    }

    async fn read_range(
        &self,
        file: &VirtualPath,
        blobs: &[Blob],
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let segments = chunking::plan_read(blobs, offset, length);
        let mut parts = Vec::with_capacity(segments.len());
        for segment in &segments {
            let blob = &blobs[segment.index];
            let data = self
                .backend
                .read_blob(file, blob, segment.blob_offset, segment.length)
                .await
                .or_read(file)?;
            if data.len() as u64 != segment.length {
                return Err(BlobError::read(
                    file,
                    anyhow::anyhow!(
                        "short read of blob {}: expected {} bytes, got {}",
                        blob.key(),
                        segment.length,
                        data.len()
                    ),
                ));
            }
            parts.push(data);
        }

        let data = match parts.len() {
            0 => Bytes::new(),
            1 => parts.swap_remove(0),
            _ => {
                let mut joined = BytesMut::with_capacity(chunking::total_size(&parts) as usize);
                for part in &parts {
                    joined.extend_from_slice(part);
                }
                joined.freeze()
            }
        };
        debug!(
            "read_data: path={} offset={} bytes={} blobs={}",
            file,
            offset,
            data.len(),
            segments.len()
        );
        counter!(BYTES_READ_TOTAL, "backend" => self.backend.kind()).increment(data.len() as u64);
        Ok(data)
    }

    /// Chunk `data` into new blobs following `existing`.
    async fn append(&self, file: &VirtualPath, data: &[Bytes], existing: &[Blob]) -> Result<u64> {
        let total = chunking::total_size(data);
        let mut ordinal = blob::next_ordinal(existing);
        let mut position = blob::total_size(existing);
        let mut written = Vec::with_capacity(chunking::chunk_count(total, self.max_blob_size) as usize);

        for chunk in chunking::chunks(data, self.max_blob_size) {
            let len = chunk.len() as u64;
            let blob = self
                .backend
                .put_blob(file, ordinal, position, chunk)
                .await
                .or_write(file)?;
            debug!("put_blob: path={} key={} size={}", file, blob.key(), len);
            written.push(blob);
            ordinal += 1;
            position += len;
        }

        if !written.is_empty() {
            self.backend.commit_blobs(file, &written).await.or_write(file)?;
        }
        let kind = self.backend.kind();
        counter!(BLOBS_WRITTEN_TOTAL, "backend" => kind).increment(written.len() as u64);
        counter!(BYTES_WRITTEN_TOTAL, "backend" => kind).increment(total);
        Ok(total)
    }

    /// Delete the blobs of `file` named by `doomed`.
    ///
    /// Every doomed blob must be one of `all`, the current blobs of `file`;
    /// otherwise nothing is deleted.  Deleting every blob deletes the file.
    async fn remove_blobs(&self, file: &VirtualPath, all: &[Blob], doomed: &[Blob]) -> Result<bool> {
        if doomed.is_empty() {
            return Ok(false);
        }
        let live: HashSet<&str> = all.iter().map(Blob::key).collect();
        let doomed_keys: HashSet<&str> = doomed.iter().map(Blob::key).collect();
        if !doomed_keys.is_subset(&live) {
            return Err(BlobError::InconsistentDelete {
                path: file.to_string(),
                expected: doomed.len(),
                deleted: 0,
            });
        }
        if doomed_keys.len() == all.len() {
            self.drop_file(file, all).await?;
            return Ok(true);
        }

        let (doomed, survivors): (Vec<&Blob>, Vec<&Blob>) =
            all.iter().partition(|b| doomed_keys.contains(b.key()));
        match self.backend.delete_mode() {
            DeleteMode::Selective => {
                let doomed: Vec<Blob> = doomed.into_iter().cloned().collect();
                let deleted = self.backend.delete_blobs(file, &doomed).await.or_write(file)?;
                if deleted != doomed.len() {
                    return Err(BlobError::InconsistentDelete {
                        path: file.to_string(),
                        expected: doomed.len(),
                        deleted,
                    });
                }
            }
            DeleteMode::Compacting => self.compact(file, all, &survivors).await?,
        }
        counter!(BLOBS_DELETED_TOTAL, "backend" => self.backend.kind())
            .increment(doomed_keys.len() as u64);
        Ok(true)
    }

    /// Rewrite the `survivors` among the blobs of `file`.
    ///
    /// Order matters: surviving content is read before the index is reset,
    /// and the old log is trimmed only after the rewrite is committed.
    async fn compact(&self, file: &VirtualPath, all: &[Blob], survivors: &[&Blob]) -> Result<()> {
        let mut contents = Vec::with_capacity(survivors.len());
        for blob in survivors {
            let data = self
                .backend
                .read_blob(file, blob, 0, blob.size())
                .await
                .or_read(file)?;
            contents.push(data);
        }

        info!(
            "Compacting {}: {} of {} blobs survive",
            file,
            survivors.len(),
            all.len()
        );
        self.backend.reset_index(file).await.or_write(file)?;
        self.append(file, &contents, &[]).await?;

        let trimmed = self.backend.delete_blobs(file, all).await.or_write(file)?;
        if trimmed != all.len() {
            return Err(BlobError::InconsistentDelete {
                path: file.to_string(),
                expected: all.len(),
                deleted: trimmed,
            });
        }
        counter!(COMPACTIONS_TOTAL, "backend" => self.backend.kind()).increment(1);
        Ok(())
    }

    async fn remove_file(&self, file: &VirtualPath) -> Result<bool> {
        let blobs = self.list(file).await?;
        if blobs.is_empty() {
            return Ok(false);
        }
        self.drop_file(file, &blobs).await?;
        Ok(true)
    }

    /// Delete `file`, whose current blobs are `blobs`.
    async fn drop_file(&self, file: &VirtualPath, blobs: &[Blob]) -> Result<()> {
        let deleted = self.backend.delete_file(file, blobs).await.or_write(file)?;
        if deleted != blobs.len() {
            return Err(BlobError::InconsistentDelete {
                path: file.to_string(),
                expected: blobs.len(),
                deleted,
            });
        }
        debug!("delete_file: path={} blobs={}", file, deleted);
        counter!(BLOBS_DELETED_TOTAL, "backend" => self.backend.kind()).increment(deleted as u64);
        Ok(())
    }

    async fn truncate(&self, file: &VirtualPath, new_length: u64) -> Result<()> {
        if new_length == 0 {
            self.remove_file(file).await?;
            return Ok(());
        }

        let blobs = self.list(file).await?;
        let size = blob::total_size(&blobs);
        if new_length > size {
            return Err(BlobError::invalid_argument(format!(
                "cannot truncate {file} to {new_length} bytes, file has {size}"
            )));
        }
        let Some((index, blob_start)) = chunking::locate(&blobs, new_length) else {
            return Ok(());
        };

        if blob_start == new_length {
            self.remove_blobs(file, &blobs, &blobs[index..]).await?;
            return Ok(());
        }

        let head = self
            .backend
            .read_blob(file, &blobs[index], 0, new_length - blob_start)
            .await
            .or_read(file)?;
        self.remove_blobs(file, &blobs, &blobs[index..]).await?;
        let remaining = self.list(file).await?;
        self.append(file, &[head], &remaining).await?;
        Ok(())
    }

    async fn copy_whole(&self, source: &VirtualPath, target: &VirtualPath) -> Result<u64> {
        let blobs = self.list(source).await?;
        if blobs.is_empty() {
            return Ok(0);
        }
        let existing = self.list(target).await?;
        let first_ordinal = blob::next_ordinal(&existing);
        if let Some(copied) = self
            .backend
            .copy_blobs(source, target, &blobs, first_ordinal)
            .await
            .or_write(target)?
        {
            debug!("copy_file: {} -> {} server-side bytes={}", source, target, copied);
            return Ok(copied);
        }
        let data = self
            .read_range(source, &blobs, 0, blob::total_size(&blobs))
            .await?;
        self.append(target, &[data], &existing).await
    }
}

impl<B: BlobBackend> Connector for BlobConnector<B> {
    fn resolve(&self, raw: &str) -> Result<VirtualPath> {
        let path = VirtualPath::parse(raw)?;
        self.backend.validator().validate(&path)?;
        Ok(path)
    }

    fn file_exists(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            Ok(!self.list(&file).await?.is_empty())
        })
    }

    fn file_size(&self, file: &VirtualPath) -> BoxFuture<'_, Result<u64>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            Ok(blob::total_size(&self.list(&file).await?))
        })
    }

    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, Result<Vec<Blob>>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            self.list(&file).await
        })
    }

    fn read_data(
        &self,
        file: &VirtualPath,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, Result<Bytes>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let blobs = self.list(&file).await?;
            self.read_range(&file, &blobs, offset, length).await
        })
    }

    fn write_data(&self, file: &VirtualPath, data: Vec<Bytes>) -> BoxFuture<'_, Result<u64>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&file]).await;
            let existing = self.list(&file).await?;
            let written = self.append(&file, &data, &existing).await?;
            debug!("write_data: path={} bytes={}", file, written);
            Ok(written)
        })
    }

    fn delete_file(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&file]).await;
            self.remove_file(&file).await
        })
    }

    fn delete_blobs(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        let doomed = blobs.to_vec();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&file]).await;
            let all = self.list(&file).await?;
            self.remove_blobs(&file, &all, &doomed).await
        })
    }

    fn truncate_file(&self, file: &VirtualPath, new_length: u64) -> BoxFuture<'_, Result<()>> {
        let file = file.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&file]).await;
            self.truncate(&file, new_length).await
        })
    }

    fn move_file(&self, source: &VirtualPath, target: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            self.ensure_open()?;
            if source == target {
                return Ok(());
            }
            let _guards = self.lock_paths(&[&source, &target]).await;

            if source.container() == target.container() {
                let blobs = self.list(&source).await?;
                if blobs.is_empty() {
                    return Ok(());
                }
                let existing = self.list(&target).await?;
                let relabelled = self
                    .backend
                    .relabel_blobs(&source, &target, &blobs, blob::next_ordinal(&existing))
                    .await
                    .or_write(&target)?;
                if relabelled {
                    debug!("move_file: {} -> {} relabelled {} blobs", source, target, blobs.len());
                    return Ok(());
                }
            }

            self.copy_whole(&source, &target).await?;
            self.remove_file(&source).await?;
            debug!("move_file: {} -> {} by copy", source, target);
            Ok(())
        })
    }

    fn copy_file(&self, source: &VirtualPath, target: &VirtualPath) -> BoxFuture<'_, Result<u64>> {
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&target]).await;
            self.copy_whole(&source, &target).await
        })
    }

    fn copy_range(
        &self,
        source: &VirtualPath,
        target: &VirtualPath,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, Result<u64>> {
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let _guards = self.lock_paths(&[&target]).await;
            let blobs = self.list(&source).await?;
            if offset == 0 && length >= blob::total_size(&blobs) {
                return self.copy_whole(&source, &target).await;
            }
            let data = self.read_range(&source, &blobs, offset, length).await?;
            let existing = self.list(&target).await?;
            self.append(&target, &[data], &existing).await
        })
    }

    fn list_children(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<Children>> {
        let directory = directory.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let files = self
                .backend
                .files_below(&directory)
                .await
                .or_read(&directory)?;
            let depth = directory.elements().len();
            let mut directories = BTreeSet::new();
            let mut names = BTreeSet::new();
            for file in files.iter().filter(|f| directory.is_ancestor_of(f)) {
                let below = &file.elements()[depth..];
                if below.len() == 1 {
                    names.insert(below[0].clone());
                } else {
                    directories.insert(below[0].clone());
                }
            }
            Ok(Children {
                directories: directories.into_iter().collect(),
                files: names.into_iter().collect(),
            })
        })
    }

    fn directory_exists(&self, _directory: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(true)
        })
    }

    fn create_file(&self, _file: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.ensure_open() })
    }

    fn create_directory(&self, _directory: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.ensure_open() })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            info!("Closing {} connector", self.backend.kind());
            self.write_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            if let Err(e) = self.backend.close().await {
                warn!("Failed to release {} handles: {e}", self.backend.kind());
            }
            Ok(())
        })
    }
}

/// Wrap `backend` in a connector configured by `config`.
pub fn build<B: BlobBackend>(backend: B, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    let mut connector = BlobConnector::new(backend);
    if let Some(max_blob_size) = config.max_blob_size {
        connector = connector.with_max_blob_size(max_blob_size)?;
    }
    if config.caching {
        Ok(Arc::new(CachingConnector::new(connector)))
    } else {
        Ok(Arc::new(connector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryObjectStore;
    use crate::storage::object::{ObjectStoreBlobs, DEFAULT_MAX_BLOB_SIZE};

    fn backend() -> ObjectStoreBlobs {
        ObjectStoreBlobs::new(Arc::new(MemoryObjectStore::new(0)))
    }

    #[test]
    fn test_max_blob_size_defaults_to_backend_limit() {
        let connector = BlobConnector::new(backend());
        assert_eq!(connector.max_blob_size(), DEFAULT_MAX_BLOB_SIZE);
    }

    #[test]
    fn test_max_blob_size_override_is_clamped() {
        let connector = BlobConnector::new(backend()).with_max_blob_size(3).unwrap();
        assert_eq!(connector.max_blob_size(), 3);

        let connector = BlobConnector::new(backend())
            .with_max_blob_size(DEFAULT_MAX_BLOB_SIZE * 2)
            .unwrap();
        assert_eq!(connector.max_blob_size(), DEFAULT_MAX_BLOB_SIZE);
    }

    #[test]
    fn test_zero_max_blob_size_rejected() {
        let err = BlobConnector::new(backend()).with_max_blob_size(0).err().unwrap();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[tokio::test]
    async fn test_build_applies_config() {
        let config = ConnectorConfig {
            caching: true,
            max_blob_size: Some(2),
        };
        let connector = build(backend(), &config).unwrap();
        let file = connector.resolve("data/a.bin").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"abcde")])
            .await
            .unwrap();
        let blobs = connector.blobs(&file).await.unwrap();
        assert_eq!(blobs.iter().map(Blob::size).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(connector.file_size(&file).await.unwrap(), 5);
    }

    fn held_locks<B>(connector: &BlobConnector<B>) -> usize {
        connector.write_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_write_locks_are_pruned_after_use() {
        let connector = Arc::new(BlobConnector::new(backend()).with_max_blob_size(2).unwrap());
        for i in 0..8 {
            let file = connector.resolve(&format!("data/tmp/file-{i}")).unwrap();
            connector
                .write_data(&file, vec![Bytes::from_static(b"abc")])
                .await
                .unwrap();
            connector.truncate_file(&file, 1).await.unwrap();
            connector.delete_file(&file).await.unwrap();
        }
        let source = connector.resolve("data/a").unwrap();
        let target = connector.resolve("data/b").unwrap();
        connector
            .write_data(&source, vec![Bytes::from_static(b"xyz")])
            .await
            .unwrap();
        connector.move_file(&source, &target).await.unwrap();
        connector.copy_file(&target, &source).await.unwrap();
        assert_eq!(held_locks(&connector), 0);

        // Contended writers share one entry until the last one finishes.
        let file = connector.resolve("data/shared").unwrap();
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let connector = Arc::clone(&connector);
                let file = file.clone();
                tokio::spawn(async move {
                    connector
                        .write_data(&file, vec![Bytes::from_static(b"ab")])
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(connector.file_size(&file).await.unwrap(), 8);
        assert_eq!(held_locks(&connector), 0);
    }

    /// Object-store backend that reports one blob fewer than it deleted.
    struct ShortDeletes {
        inner: ObjectStoreBlobs,
        mode: DeleteMode,
    }

    impl BlobBackend for ShortDeletes {
        fn kind(&self) -> &'static str {
            "short-deletes"
        }

        fn max_blob_size(&self) -> u64 {
            self.inner.max_blob_size()
        }

        fn validator(&self) -> &dyn PathValidator {
            self.inner.validator()
        }

        fn delete_mode(&self) -> DeleteMode {
            self.mode
        }

        fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<Vec<Blob>>> {
            self.inner.blobs(file)
        }

        fn files_below(
            &self,
            directory: &VirtualPath,
        ) -> BoxFuture<'_, anyhow::Result<Vec<VirtualPath>>> {
            self.inner.files_below(directory)
        }

        fn read_blob(
            &self,
            file: &VirtualPath,
            blob: &Blob,
            offset: u64,
            length: u64,
        ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
            self.inner.read_blob(file, blob, offset, length)
        }

        fn put_blob(
            &self,
            file: &VirtualPath,
            ordinal: u64,
            position: u64,
            data: Bytes,
        ) -> BoxFuture<'_, anyhow::Result<Blob>> {
            self.inner.put_blob(file, ordinal, position, data)
        }

        fn delete_blobs(
            &self,
            file: &VirtualPath,
            blobs: &[Blob],
        ) -> BoxFuture<'_, anyhow::Result<usize>> {
            let file = file.clone();
            let blobs = blobs.to_vec();
            Box::pin(async move {
                let deleted = self.inner.delete_blobs(&file, &blobs).await?;
                Ok(deleted.saturating_sub(1))
            })
        }

        fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.close()
        }
    }

    fn short_deletes(mode: DeleteMode) -> BlobConnector<ShortDeletes> {
        BlobConnector::new(ShortDeletes {
            inner: backend(),
            mode,
        })
        .with_max_blob_size(2)
        .unwrap()
    }

    fn assert_inconsistent(err: BlobError, expected: usize, deleted: usize) {
        match err {
            BlobError::InconsistentDelete {
                expected: e,
                deleted: d,
                ..
            } => assert_eq!((e, d), (expected, deleted)),
            other => panic!("expected InconsistentDelete, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_selective_delete_is_inconsistent() {
        let connector = short_deletes(DeleteMode::Selective);
        let file = connector.resolve("data/f").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"abcdef")])
            .await
            .unwrap();
        let blobs = connector.blobs(&file).await.unwrap();

        let err = connector.delete_blobs(&file, &blobs[1..]).await.unwrap_err();
        assert_inconsistent(err, 2, 1);
    }

    #[tokio::test]
    async fn test_short_file_delete_is_inconsistent() {
        let connector = short_deletes(DeleteMode::Selective);
        let file = connector.resolve("data/f").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"abcdef")])
            .await
            .unwrap();

        let err = connector.delete_file(&file).await.unwrap_err();
        assert_inconsistent(err, 3, 2);
    }

    #[tokio::test]
    async fn test_short_compaction_trim_is_inconsistent() {
        let connector = short_deletes(DeleteMode::Compacting);
        let file = connector.resolve("data/f").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"abcdef")])
            .await
            .unwrap();
        let blobs = connector.blobs(&file).await.unwrap();

        let err = connector.delete_blobs(&file, &blobs[..1]).await.unwrap_err();
        assert_inconsistent(err, 3, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = BlobConnector::new(backend());
        connector.close().await.unwrap();
        connector.close().await.unwrap();
        let file = connector.resolve("data/a.bin").unwrap();
        let err = connector.file_exists(&file).await.unwrap_err();
        assert!(matches!(err, BlobError::Closed));
    }
}
