//! Caching decorator.
//!
//! Memoizes existence, size and blob listings per path in front of another
//! [`Connector`].  Every mutating call evicts the paths it touched before
//! returning, whether it succeeded or not, so a caller never reads back
//! stale state after its own mutation.  A lookup that was already waiting
//! on the inner connector when an eviction happened does not store its
//! result.

use std::collections::HashMap;

use bytes::Bytes;
use metrics::counter;
use tokio::sync::RwLock;

use super::{Children, Connector};
use crate::blob::{self, Blob};
use crate::errors::Result;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use crate::path::VirtualPath;
use crate::BoxFuture;

#[derive(Default)]
struct Entries {
    exists: HashMap<VirtualPath, bool>,
    sizes: HashMap<VirtualPath, u64>,
    blobs: HashMap<VirtualPath, Vec<Blob>>,
    /// Bumped by every eviction.
    epoch: u64,
}

impl Entries {
    fn evict(&mut self, path: &VirtualPath) {
        self.exists.remove(path);
        self.sizes.remove(path);
        self.blobs.remove(path);
        self.epoch += 1;
    }
}

/// [`Connector`] wrapper that caches read-only queries.
pub struct CachingConnector<C> {
    inner: C,
    entries: RwLock<Entries>,
}

impl<C: Connector> CachingConnector<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn evict(&self, paths: &[&VirtualPath]) {
        let mut entries = self.entries.write().await;
        for path in paths {
            entries.evict(path);
        }
    }

    fn hit(query: &'static str) {
        counter!(CACHE_HITS_TOTAL, "query" => query).increment(1);
    }

    fn miss(query: &'static str) {
        counter!(CACHE_MISSES_TOTAL, "query" => query).increment(1);
    }
}

impl<C: Connector> Connector for CachingConnector<C> {
    fn resolve(&self, raw: &str) -> Result<VirtualPath> {
        self.inner.resolve(raw)
    }

    fn file_exists(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        Box::pin(async move {
            let epoch = {
                let entries = self.entries.read().await;
                let cached = entries
                    .exists
                    .get(&file)
                    .copied()
                    .or_else(|| entries.blobs.get(&file).map(|b| !b.is_empty()));
                if let Some(exists) = cached {
                    Self::hit("exists");
                    return Ok(exists);
                }
                entries.epoch
            };
            Self::miss("exists");
            let exists = self.inner.file_exists(&file).await?;
            let mut entries = self.entries.write().await;
            if entries.epoch == epoch {
                entries.exists.insert(file, exists);
            }
            Ok(exists)
        })
    }

    fn file_size(&self, file: &VirtualPath) -> BoxFuture<'_, Result<u64>> {
        let file = file.clone();
        Box::pin(async move {
            let epoch = {
                let entries = self.entries.read().await;
                let cached = entries
                    .sizes
                    .get(&file)
                    .copied()
                    .or_else(|| entries.blobs.get(&file).map(|b| blob::total_size(b)));
                if let Some(size) = cached {
                    Self::hit("size");
                    return Ok(size);
                }
                entries.epoch
            };
            Self::miss("size");
            let size = self.inner.file_size(&file).await?;
            let mut entries = self.entries.write().await;
            if entries.epoch == epoch {
                entries.sizes.insert(file, size);
            }
            Ok(size)
        })
    }

    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, Result<Vec<Blob>>> {
        let file = file.clone();
        Box::pin(async move {
            let epoch = {
                let entries = self.entries.read().await;
                if let Some(blobs) = entries.blobs.get(&file) {
                    Self::hit("blobs");
                    return Ok(blobs.clone());
                }
                entries.epoch
            };
            Self::miss("blobs");
            let blobs = self.inner.blobs(&file).await?;
            let mut entries = self.entries.write().await;
            if entries.epoch == epoch {
                entries.blobs.insert(file, blobs.clone());
            }
            Ok(blobs)
        })
    }

    fn read_data(
        &self,
        file: &VirtualPath,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, Result<Bytes>> {
        self.inner.read_data(file, offset, length)
    }

    fn write_data(&self, file: &VirtualPath, data: Vec<Bytes>) -> BoxFuture<'_, Result<u64>> {
        let file = file.clone();
        Box::pin(async move {
            let result = self.inner.write_data(&file, data).await;
            self.evict(&[&file]).await;
            result
        })
    }

    fn delete_file(&self, file: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        Box::pin(async move {
            let result = self.inner.delete_file(&file).await;
            self.evict(&[&file]).await;
            result
        })
    }

    fn delete_blobs(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, Result<bool>> {
        let file = file.clone();
        let blobs = blobs.to_vec();
        Box::pin(async move {
            let result = self.inner.delete_blobs(&file, &blobs).await;
            self.evict(&[&file]).await;
            result
        })
    }

    fn truncate_file(&self, file: &VirtualPath, new_length: u64) -> BoxFuture<'_, Result<()>> {
        let file = file.clone();
        Box::pin(async move {
            let result = self.inner.truncate_file(&file, new_length).await;
            self.evict(&[&file]).await;
            result
        })
    }

    fn move_file(&self, source: &VirtualPath, target: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            let result = self.inner.move_file(&source, &target).await;
            self.evict(&[&source, &target]).await;
            result
        })
    }

    fn copy_file(&self, source: &VirtualPath, target: &VirtualPath) -> BoxFuture<'_, Result<u64>> {
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            let result = self.inner.copy_file(&source, &target).await;
            self.evict(&[&source, &target]).await;
            result
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
            let result = self.inner.copy_range(&source, &target, offset, length).await;
            self.evict(&[&source, &target]).await;
            result
        })
    }

    fn list_children(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<Children>> {
        self.inner.list_children(directory)
    }

    fn directory_exists(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<bool>> {
        self.inner.directory_exists(directory)
    }

    fn create_file(&self, file: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        self.inner.create_file(file)
    }

    fn create_directory(&self, directory: &VirtualPath) -> BoxFuture<'_, Result<()>> {
        self.inner.create_directory(directory)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            {
                let mut entries = self.entries.write().await;
                let epoch = entries.epoch + 1;
                *entries = Entries {
                    epoch,
                    ..Entries::default()
                };
            }
            self.inner.close().await
        })
    }
}
