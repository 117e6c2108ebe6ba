//! In-memory object store.
//!
//! Buckets map to ordered key maps held in `tokio::sync::RwLock`s.  A
//! configurable limit (`max_size_bytes`) caps the total stored bytes; 0
//! means unlimited.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::debug;

use super::object::{ObjectInfo, ObjectStore};
use crate::config::ObjectStoreConfig;
use crate::BoxFuture;

/// [`ObjectStore`] held entirely in process memory.
pub struct MemoryObjectStore {
    /// bucket -> key -> data.
    buckets: tokio::sync::RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
    /// Current total bytes stored.
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryObjectStore {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            buckets: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
        }
    }

    /// A store capped at `config.memory_max_size_bytes`.
    pub fn from_config(config: &ObjectStoreConfig) -> Self {
        Self::new(config.memory_max_size_bytes)
    }

    /// Total bytes currently stored.
    pub async fn stored_bytes(&self) -> u64 {
        *self.current_size.read().await
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Fail if growing by `additional` bytes would pass the limit.
    async fn check_capacity(&self, additional: u64) -> anyhow::Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current = *self.current_size.read().await;
        if current + additional > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }

    async fn adjust_size(&self, delta: i64) {
        let mut size = self.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Store `data` under `key`, replacing any previous object.
    async fn store(&self, bucket: &str, key: &str, data: Bytes) -> anyhow::Result<()> {
        let new_len = data.len() as u64;
        let old_len = {
            let buckets = self.buckets.read().await;
            let Some(objects) = buckets.get(bucket) else {
                anyhow::bail!("NoSuchBucket: {bucket}");
            };
            objects.get(key).map_or(0, |d| d.len() as u64)
        };
        if new_len > old_len {
            self.check_capacity(new_len - old_len).await?;
        }

        let replaced = {
            let mut buckets = self.buckets.write().await;
            let Some(objects) = buckets.get_mut(bucket) else {
                anyhow::bail!("NoSuchBucket: {bucket}");
            };
            objects.insert(key.to_string(), data)
        };
        let old_len = replaced.map_or(0, |d| d.len() as i64);
        self.adjust_size(new_len as i64 - old_len).await;
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn create_bucket(&self, bucket: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            if !buckets.contains_key(&bucket) {
                debug!("memory create_bucket: bucket={}", bucket);
                buckets.insert(bucket, BTreeMap::new());
            }
            Ok(())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> BoxFuture<'_, anyhow::Result<Vec<ObjectInfo>>> {
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let Some(objects) = buckets.get(&bucket) else {
                return Ok(Vec::new());
            };
            Ok(objects
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, data)| ObjectInfo {
                    key: key.clone(),
                    size: data.len() as u64,
                })
                .collect())
        })
    }

    fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let data = buckets
                .get(&bucket)
                .and_then(|objects| objects.get(&key))
                .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {bucket}/{key}"))?;
            let len = data.len() as u64;
            let start = offset.min(len) as usize;
            let end = offset.saturating_add(length).min(len) as usize;
            Ok(data.slice(start..end))
        })
    }

    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("memory put_object: bucket={} key={} size={}", bucket, key, data.len());
            self.store(&bucket, &key, data).await
        })
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> BoxFuture<'_, anyhow::Result<usize>> {
        let bucket = bucket.to_string();
        let keys = keys.to_vec();
        Box::pin(async move {
            let (removed, freed) = {
                let mut buckets = self.buckets.write().await;
                let Some(objects) = buckets.get_mut(&bucket) else {
                    return Ok(0);
                };
                let mut removed = 0usize;
                let mut freed = 0i64;
                for key in &keys {
                    if let Some(data) = objects.remove(key) {
                        removed += 1;
                        freed += data.len() as i64;
                    }
                }
                (removed, freed)
            };
            self.adjust_size(-freed).await;
            debug!("memory delete_objects: bucket={} removed={}", bucket, removed);
            Ok(removed)
        })
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let src_bucket = src_bucket.to_string();
        let src_key = src_key.to_string();
        let dst_bucket = dst_bucket.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            let data = {
                let buckets = self.buckets.read().await;
                buckets
                    .get(&src_bucket)
                    .and_then(|objects| objects.get(&src_key))
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {src_bucket}/{src_key}"))?
            };
            self.store(&dst_bucket, &dst_key, data).await
        })
    }
}
