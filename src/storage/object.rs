//! Object store backend family.
//!
//! Every blob is one object keyed `<dir>/<file>/<ordinal>` inside the
//! bucket named by the path's container.  Listing by prefix plus the blob
//! key regex finds a file's blobs; deletes, copies and same-bucket moves
//! are per-object server-side calls.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::blob::{self, Blob};
use crate::connector::{BlobBackend, BlobConnector};
use crate::handles::HandleCache;
use crate::key::{self, KeyScope};
use crate::path::{BucketNameValidator, PathValidator, VirtualPath};
use crate::BoxFuture;

/// Default maximum object size used for one blob (64 MiB).
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 64 * 1024 * 1024;

/// Key and size of a listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Async object store client.
pub trait ObjectStore: Send + Sync + 'static {
    /// Create `bucket` if it does not exist yet.
    fn create_bucket(&self, bucket: &str) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Every object in `bucket` whose key starts with `prefix`.  A missing
    /// bucket lists as empty.
    fn list_objects(&self, bucket: &str, prefix: &str)
        -> BoxFuture<'_, anyhow::Result<Vec<ObjectInfo>>>;

    /// `length` bytes of the object starting at `offset`.
    fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>>;

    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Delete `keys`, returning how many objects were actually removed.
    fn delete_objects(&self, bucket: &str, keys: &[String]) -> BoxFuture<'_, anyhow::Result<usize>>;

    /// Server-side copy.
    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// A bucket known to exist.
struct BucketHandle {
    name: String,
}

/// [`BlobBackend`] over an [`ObjectStore`].
pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
    buckets: HandleCache<BucketHandle>,
    validator: BucketNameValidator,
}

/// Connector for object stores.
pub type ObjectStoreConnector = BlobConnector<ObjectStoreBlobs>;

impl ObjectStoreBlobs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            buckets: HandleCache::new("bucket"),
            validator: BucketNameValidator,
        }
    }

    /// Bucket handle for writes, creating the bucket on first use.
    async fn bucket(&self, name: &str) -> anyhow::Result<Arc<BucketHandle>> {
        self.buckets
            .get_or_create(name, || async {
                self.store.create_bucket(name).await?;
                Ok(BucketHandle {
                    name: name.to_string(),
                })
            })
            .await
    }
}

impl BlobBackend for ObjectStoreBlobs {
    fn kind(&self) -> &'static str {
        "object"
    }

    fn max_blob_size(&self) -> u64 {
        DEFAULT_MAX_BLOB_SIZE
    }

    fn validator(&self) -> &dyn PathValidator {
        &self.validator
    }

    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<Vec<Blob>>> {
        let file = file.clone();
        Box::pin(async move {
            let prefix = key::blob_key_prefix(&file, KeyScope::ContainerRelative);
            let pattern = key::blob_key_regex(&prefix)?;
            let objects = self.store.list_objects(file.container(), &prefix).await?;
            let mut blobs = Vec::new();
            for object in objects.into_iter().filter(|o| pattern.is_match(&o.key)) {
                blobs.push(Blob::keyed(object.key, object.size)?);
            }
            Ok(blobs)
        })
    }

    fn files_below(
        &self,
        directory: &VirtualPath,
    ) -> BoxFuture<'_, anyhow::Result<Vec<VirtualPath>>> {
        let directory = directory.clone();
        Box::pin(async move {
            let prefix = key::child_keys_prefix(&directory, KeyScope::ContainerRelative);
            let pattern = key::child_keys_regex(&directory, KeyScope::ContainerRelative)?;
            let container = directory.container();
            let files: BTreeSet<VirtualPath> = self
                .store
                .list_objects(container, &prefix)
                .await?
                .into_iter()
                .filter(|o| pattern.is_match(&o.key))
                .filter_map(|o| key::file_of_key(container, &o.key, KeyScope::ContainerRelative).ok())
                .collect();
            Ok(files.into_iter().collect())
        })
    }

    fn read_blob(
        &self,
        file: &VirtualPath,
        blob: &Blob,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let bucket = file.container().to_string();
        let key = blob.key().to_string();
        Box::pin(async move { self.store.get_range(&bucket, &key, offset, length).await })
    }

    fn put_blob(
        &self,
        file: &VirtualPath,
        ordinal: u64,
        _position: u64,
        data: Bytes,
    ) -> BoxFuture<'_, anyhow::Result<Blob>> {
        let file = file.clone();
        Box::pin(async move {
            let bucket = self.bucket(file.container()).await?;
            let key = key::blob_key(&file, ordinal, KeyScope::ContainerRelative);
            let size = data.len() as u64;
            self.store.put_object(&bucket.name, &key, data).await?;
            Ok(Blob::keyed(key, size)?)
        })
    }

    fn delete_blobs(
        &self,
        file: &VirtualPath,
        blobs: &[Blob],
    ) -> BoxFuture<'_, anyhow::Result<usize>> {
        let bucket = file.container().to_string();
        let keys: Vec<String> = blobs.iter().map(|b| b.key().to_string()).collect();
        Box::pin(async move { self.store.delete_objects(&bucket, &keys).await })
    }

    fn relabel_blobs(
        &self,
        source: &VirtualPath,
        target: &VirtualPath,
        blobs: &[Blob],
        first_ordinal: u64,
    ) -> BoxFuture<'_, anyhow::Result<bool>> {
        let source = source.clone();
        let target = target.clone();
        let blobs = blobs.to_vec();
        Box::pin(async move {
            let bucket = source.container();
            for (blob, ordinal) in blobs.iter().zip(first_ordinal..) {
                let new_key = key::blob_key(&target, ordinal, KeyScope::ContainerRelative);
                self.store
                    .copy_object(bucket, blob.key(), bucket, &new_key)
                    .await?;
            }
            let keys: Vec<String> = blobs.iter().map(|b| b.key().to_string()).collect();
            let deleted = self.store.delete_objects(bucket, &keys).await?;
            if deleted != keys.len() {
                anyhow::bail!(
                    "relabel of {source} removed {deleted} of {} source objects",
                    keys.len()
                );
            }
            debug!("relabel: {} -> {} objects={}", source, target, keys.len());
            Ok(true)
        })
    }

    fn copy_blobs(
        &self,
        source: &VirtualPath,
        target: &VirtualPath,
        blobs: &[Blob],
        first_ordinal: u64,
    ) -> BoxFuture<'_, anyhow::Result<Option<u64>>> {
        let source = source.clone();
        let target = target.clone();
        let blobs = blobs.to_vec();
        Box::pin(async move {
            let dst = self.bucket(target.container()).await?;
            for (blob, ordinal) in blobs.iter().zip(first_ordinal..) {
                let new_key = key::blob_key(&target, ordinal, KeyScope::ContainerRelative);
                self.store
                    .copy_object(source.container(), blob.key(), &dst.name, &new_key)
                    .await?;
            }
            Ok(Some(blob::total_size(&blobs)))
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let released = self.buckets.drain().await;
            debug!("Released {} bucket handles", released.len());
            Ok(())
        })
    }
}
