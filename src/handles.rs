//! Per-container backend handle cache.
//!
//! Each connector owns one [`HandleCache`] mapping a container name to a
//! lazily created backend handle (bucket reference, table, producer).  The
//! creation lock is held only around check-and-create; callers share the
//! returned `Arc` without further locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Lazily populated map of container name to handle.
pub struct HandleCache<H> {
    /// What the handles are, for log lines.
    kind: &'static str,
    handles: RwLock<HashMap<String, Arc<H>>>,
    creation: Mutex<()>,
}

impl<H: Send + Sync> HandleCache<H> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handles: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        }
    }

    /// Return the cached handle for `name`, if any.
    pub async fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handles.read().await.get(name).cloned()
    }

    /// Return the handle for `name`, creating it with `create` on first use.
    ///
    /// Concurrent callers for the same name run `create` at most once; a
    /// failed creation leaves nothing cached.
    pub async fn get_or_create<F, Fut>(&self, name: &str, create: F) -> anyhow::Result<Arc<H>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<H>>,
    {
        if let Some(handle) = self.get(name).await {
            return Ok(handle);
        }

        let _guard = self.creation.lock().await;
        if let Some(handle) = self.get(name).await {
            return Ok(handle);
        }

        let handle = Arc::new(create().await?);
        self.handles
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&handle));
        info!("Created {} handle for {}", self.kind, name);
        Ok(handle)
    }

    /// Forget the handle for `name`, returning it.
    pub async fn remove(&self, name: &str) -> Option<Arc<H>> {
        let _guard = self.creation.lock().await;
        self.handles.write().await.remove(name)
    }

    /// Remove and return every cached handle.
    pub async fn drain(&self) -> Vec<(String, Arc<H>)> {
        let _guard = self.creation.lock().await;
        self.handles.write().await.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
