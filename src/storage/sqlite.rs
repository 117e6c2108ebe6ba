//! SQLite document store backend.
//!
//! Each container is a collection, stored as its own table of
//! `(key, size, data)` documents; every blob is one document.
//!
//! Because `rusqlite::Connection` is `!Send`, it is wrapped in a
//! `std::sync::Mutex` behind an `Arc` and every statement runs on
//! `tokio::task::spawn_blocking`.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::blob::{self, Blob};
use crate::config::DocumentConfig;
use crate::connector::{BlobBackend, BlobConnector};
use crate::handles::HandleCache;
use crate::key::{self, KeyScope};
use crate::path::{CollectionNameValidator, PathValidator, VirtualPath};
use crate::BoxFuture;

/// Default document size limit (16 MiB) less room for the key and size
/// fields.
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 16 * 1024 * 1024 - 16 * 1024;

/// A collection whose table is known to exist.
struct CollectionHandle {
    /// Quoted table name, safe to splice into SQL.
    table: String,
}

/// Quoted table name for a collection.  Names are restricted by
/// [`CollectionNameValidator`], so they never contain a quote.
fn table_name(collection: &str) -> String {
    format!("\"blobs.{collection}\"")
}

/// [`BlobBackend`] over SQLite collections.
pub struct SqliteDocumentBlobs {
    conn: Arc<Mutex<Connection>>,
    collections: HandleCache<CollectionHandle>,
    validator: CollectionNameValidator,
}

/// Connector for the document store.
pub type SqliteDocumentConnector = BlobConnector<SqliteDocumentBlobs>;

impl SqliteDocumentBlobs {
    /// Open (or create) the database at `db_path`.
    ///
    /// Configures WAL journal mode and a 5-second busy timeout.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collections: HandleCache::new("collection"),
            validator: CollectionNameValidator,
        })
    }

    /// Open the database at `config.path`, creating its parent directory.
    pub fn from_config(config: &DocumentConfig) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let blobs = Self::new(&config.path)?;
        info!("SQLite document store opened at {}", config.path);
        Ok(blobs)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
            f(&mut conn)
        })
        .await?
    }

    /// Handle for `name`, creating the table on first use.
    async fn collection(&self, name: &str) -> anyhow::Result<Arc<CollectionHandle>> {
        self.collections
            .get_or_create(name, || async {
                let table = table_name(name);
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                         key  TEXT PRIMARY KEY,\
                         size INTEGER NOT NULL,\
                         data BLOB NOT NULL\
                     );"
                );
                self.run(move |conn| Ok(conn.execute_batch(&ddl)?)).await?;
                Ok(CollectionHandle { table })
            })
            .await
    }

    /// `(key, size)` of every document whose key starts with `prefix`.
    async fn keys_with_prefix(
        &self,
        collection: &str,
        prefix: String,
    ) -> anyhow::Result<Vec<(String, u64)>> {
        let handle = self.collection(collection).await?;
        let sql = format!(
            "SELECT key, size FROM {} WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            handle.table
        );
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

impl BlobBackend for SqliteDocumentBlobs {
    fn kind(&self) -> &'static str {
        "document"
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
            let rows = self.keys_with_prefix(file.container(), prefix).await?;
            let mut blobs = Vec::new();
            for (key, size) in rows.into_iter().filter(|(k, _)| pattern.is_match(k)) {
                blobs.push(Blob::keyed(key, size)?);
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
            let mut files: Vec<VirtualPath> = self
                .keys_with_prefix(container, prefix)
                .await?
                .into_iter()
                .filter(|(k, _)| pattern.is_match(k))
                .filter_map(|(k, _)| key::file_of_key(container, &k, KeyScope::ContainerRelative).ok())
                .collect();
            files.sort();
            files.dedup();
            Ok(files)
        })
    }

    fn read_blob(
        &self,
        file: &VirtualPath,
        blob: &Blob,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let file = file.clone();
        let key = blob.key().to_string();
        Box::pin(async move {
            let handle = self.collection(file.container()).await?;
            let sql = format!("SELECT substr(data, ?2, ?3) FROM {} WHERE key = ?1", handle.table);
            let found: Option<Vec<u8>> = self
                .run({
                    let key = key.clone();
                    move |conn| {
                        Ok(conn
                            .query_row(&sql, params![key, offset as i64 + 1, length as i64], |row| {
                                row.get(0)
                            })
                            .optional()?)
                    }
                })
                .await?;
            let data = found.ok_or_else(|| anyhow::anyhow!("document not found: {key}"))?;
            Ok(Bytes::from(data))
        })
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
            let handle = self.collection(file.container()).await?;
            let key = key::blob_key(&file, ordinal, KeyScope::ContainerRelative);
            let size = data.len() as u64;
            let sql = format!(
                "INSERT OR REPLACE INTO {} (key, size, data) VALUES (?1, ?2, ?3)",
                handle.table
            );
            let row_key = key.clone();
            self.run(move |conn| {
                conn.execute(&sql, params![row_key, size as i64, data.as_ref()])?;
                Ok(())
            })
            .await?;
            Ok(Blob::keyed(key, size)?)
        })
    }

    fn delete_blobs(
        &self,
        file: &VirtualPath,
        blobs: &[Blob],
    ) -> BoxFuture<'_, anyhow::Result<usize>> {
        let file = file.clone();
        let keys: Vec<String> = blobs.iter().map(|b| b.key().to_string()).collect();
        Box::pin(async move {
            let handle = self.collection(file.container()).await?;
            let sql = format!("DELETE FROM {} WHERE key = ?1", handle.table);
            self.run(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0usize;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for key in &keys {
                        deleted += stmt.execute(params![key])?;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await
        })
    }

    fn relabel_blobs(
        &self,
        source: &VirtualPath,
        target: &VirtualPath,
        blobs: &[Blob],
        first_ordinal: u64,
    ) -> BoxFuture<'_, anyhow::Result<bool>> {
        let source = source.clone();
        let renames: Vec<(String, String)> = blobs
            .iter()
            .zip(first_ordinal..)
            .map(|(b, ordinal)| {
                let new_key = key::blob_key(target, ordinal, KeyScope::ContainerRelative);
                (b.key().to_string(), new_key)
            })
            .collect();
        Box::pin(async move {
            let handle = self.collection(source.container()).await?;
            let sql = format!("UPDATE {} SET key = ?2 WHERE key = ?1", handle.table);
            let count = renames.len();
            let renamed = self
                .run(move |conn| {
                    let tx = conn.transaction()?;
                    let mut renamed = 0usize;
                    {
                        let mut stmt = tx.prepare(&sql)?;
                        for (old, new) in &renames {
                            renamed += stmt.execute(params![old, new])?;
                        }
                    }
                    if renamed != renames.len() {
                        anyhow::bail!("renamed {renamed} of {} documents", renames.len());
                    }
                    tx.commit()?;
                    Ok(renamed)
                })
                .await?;
            debug!("relabel: {} documents={} of {}", source, renamed, count);
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
        let total = blob::total_size(blobs);
        let copies: Vec<(String, String)> = blobs
            .iter()
            .zip(first_ordinal..)
            .map(|(b, ordinal)| {
                let new_key = key::blob_key(&target, ordinal, KeyScope::ContainerRelative);
                (b.key().to_string(), new_key)
            })
            .collect();
        Box::pin(async move {
            let src = self.collection(source.container()).await?;
            let dst = self.collection(target.container()).await?;
            let sql = format!(
                "INSERT OR REPLACE INTO {} (key, size, data) SELECT ?2, size, data FROM {} WHERE key = ?1",
                dst.table, src.table
            );
            self.run(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for (old, new) in &copies {
                        if stmt.execute(params![old, new])? != 1 {
                            anyhow::bail!("source document {old} vanished during copy");
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
            Ok(Some(total))
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let released = self.collections.drain().await;
            debug!("Released {} collection handles", released.len());
            Ok(())
        })
    }
}
