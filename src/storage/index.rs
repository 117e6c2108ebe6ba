//! Durable metadata indexes for log brokers.
//!
//! A broker cannot list a file's records, so every write also appends one
//! fixed-width record per blob to the file's index topic (`<topic>.index`).
//! The in-memory view is rebuilt by a full scan on first use and kept in
//! step with later appends.
//!
//! Index record layout, all big-endian:
//!
//! | bytes     | field       |
//! |-----------|-------------|
//! | `[0,4)`   | partition   |
//! | `[4,12)`  | offset      |
//! | `[12,20)` | range start |
//! | `[20,28)` | range end   |
//!
//! Directory listings come from a second log shared by all files, holding
//! one `present` or `deleted` marker per change.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{LogBroker, LogConsumer, LogProducer, PollPolicy, Record};
use crate::blob::{Blob, LogCoordinates};
use crate::key::{self, KeyScope};
use crate::metrics::INDEX_REBUILDS_TOTAL;
use crate::path::{topic_name, VirtualPath};

/// Encoded size of one index record.
pub const RECORD_LEN: usize = 28;

/// Index logs only ever use this partition, which keeps them totally ordered.
const INDEX_PARTITION: i32 = 0;

const PRESENT: u8 = 1;
const DELETED: u8 = 0;

pub fn encode_record(coords: &LogCoordinates) -> Bytes {
    let mut buf = BytesMut::with_capacity(RECORD_LEN);
    buf.put_i32(coords.partition);
    buf.put_i64(coords.offset);
    buf.put_i64(coords.range_start);
    buf.put_i64(coords.range_end);
    buf.freeze()
}

pub fn decode_record(mut data: &[u8]) -> anyhow::Result<LogCoordinates> {
    if data.len() != RECORD_LEN {
        anyhow::bail!(
            "index record is {} bytes, expected {}",
            data.len(),
            RECORD_LEN
        );
    }
    Ok(LogCoordinates {
        partition: data.get_i32(),
        offset: data.get_i64(),
        range_start: data.get_i64(),
        range_end: data.get_i64(),
    })
}

/// Topic holding the index of `file`.
pub fn index_topic(file: &VirtualPath) -> String {
    format!("{}.index", topic_name(file))
}

/// Read every record of partition 0 of `topic` that existed when the scan
/// started.
///
/// Uses a throwaway consumer group.  Fails if `policy.attempts` consecutive
/// polls return nothing before the captured end offset is reached.
pub async fn drain_topic(
    broker: &dyn LogBroker,
    topic: &str,
    policy: &PollPolicy,
) -> anyhow::Result<Vec<Record>> {
    let group = format!("chunkstore-scan-{}", Uuid::new_v4());
    let mut consumer = broker.consumer(&group).await?;
    let drained = drain(consumer.as_mut(), topic, policy).await;
    if let Err(e) = consumer.close().await {
        warn!("Failed to close scan consumer for {}: {e}", topic);
    }
    drained
}

async fn drain(
    consumer: &mut dyn LogConsumer,
    topic: &str,
    policy: &PollPolicy,
) -> anyhow::Result<Vec<Record>> {
    consumer.assign(topic, &[INDEX_PARTITION]).await?;
    let end = consumer
        .end_offsets()
        .await?
        .get(&INDEX_PARTITION)
        .copied()
        .unwrap_or(0);
    consumer.seek_to_beginning().await?;

    let mut records = Vec::new();
    let mut idle = 0;
    loop {
        let position = consumer.position(INDEX_PARTITION).await?;
        if position >= end {
            break;
        }
        let batch = consumer.poll(policy.timeout).await?;
        if batch.is_empty() {
            idle += 1;
            if idle >= policy.attempts {
                anyhow::bail!(
                    "log {topic} stalled at offset {position} of {end} after {idle} empty polls"
                );
            }
            continue;
        }
        idle = 0;
        records.extend(
            batch
                .into_iter()
                .filter(|r| r.partition == INDEX_PARTITION && r.offset < end),
        );
    }
    Ok(records)
}

/// Trim everything currently in partition 0 of `topic`.
async fn trim_topic(broker: &dyn LogBroker, topic: &str) -> anyhow::Result<()> {
    let group = format!("chunkstore-trim-{}", Uuid::new_v4());
    let mut consumer = broker.consumer(&group).await?;
    let end = async {
        consumer.assign(topic, &[INDEX_PARTITION]).await?;
        let offsets = consumer.end_offsets().await?;
        anyhow::Ok(offsets.get(&INDEX_PARTITION).copied().unwrap_or(0))
    }
    .await;
    if let Err(e) = consumer.close().await {
        warn!("Failed to close trim consumer for {}: {e}", topic);
    }
    let end = end?;
    if end > 0 {
        broker.delete_records(topic, &[(INDEX_PARTITION, end)]).await?;
    }
    Ok(())
}

// -- Per-file index -----------------------------------------------------------

/// Ordered, durable view of one file's blobs.
pub struct MetadataIndex {
    file: VirtualPath,
    topic: String,
    broker: Arc<dyn LogBroker>,
    producer: Arc<dyn LogProducer>,
    policy: PollPolicy,
    /// `None` until the first rebuild.
    blobs: Mutex<Option<Vec<Blob>>>,
}

impl MetadataIndex {
    pub async fn open(
        broker: Arc<dyn LogBroker>,
        file: VirtualPath,
        policy: PollPolicy,
    ) -> anyhow::Result<Self> {
        let producer = broker.producer().await?;
        Ok(Self {
            topic: index_topic(&file),
            file,
            broker,
            producer,
            policy,
            blobs: Mutex::new(None),
        })
    }

    /// Current blobs of the file in ordinal order.
    pub async fn get(&self) -> anyhow::Result<Vec<Blob>> {
        let mut cached = self.blobs.lock().await;
        if let Some(blobs) = cached.as_ref() {
            return Ok(blobs.clone());
        }
        let blobs = self.rebuild().await?;
        *cached = Some(blobs.clone());
        Ok(blobs)
    }

    async fn rebuild(&self) -> anyhow::Result<Vec<Blob>> {
        let records = drain_topic(self.broker.as_ref(), &self.topic, &self.policy).await?;
        let mut blobs = Vec::with_capacity(records.len());
        for (ordinal, record) in (0u64..).zip(&records) {
            let coords = decode_record(&record.value)?;
            let key = key::blob_key(&self.file, ordinal, KeyScope::Qualified);
            blobs.push(Blob::logged(key, coords)?);
        }
        counter!(INDEX_REBUILDS_TOTAL).increment(1);
        info!("Rebuilt index of {}: {} blobs", self.file, blobs.len());
        Ok(blobs)
    }

    /// Append `blobs`, waiting for each record to be acknowledged.
    pub async fn put(&self, blobs: &[Blob]) -> anyhow::Result<()> {
        let mut cached = self.blobs.lock().await;
        for blob in blobs {
            let coords = blob
                .log()
                .ok_or_else(|| anyhow::anyhow!("blob {} has no log coordinates", blob.key()))?;
            self.producer
                .send(&self.topic, Some(INDEX_PARTITION), None, encode_record(coords))
                .await?;
            if let Some(list) = cached.as_mut() {
                list.push(blob.clone());
            }
        }
        debug!("index put: topic={} blobs={}", self.topic, blobs.len());
        Ok(())
    }

    /// Drop every entry, durably.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut cached = self.blobs.lock().await;
        trim_topic(self.broker.as_ref(), &self.topic).await?;
        *cached = Some(Vec::new());
        debug!("index cleared: topic={}", self.topic);
        Ok(())
    }

    /// Forget the in-memory view and release the producer.  The log stays.
    pub async fn close(&self) -> anyhow::Result<()> {
        *self.blobs.lock().await = None;
        self.producer.close().await
    }
}

// -- File-system index --------------------------------------------------------

/// Set of existing files, kept as a log of presence markers keyed by the
/// file's qualified name.
pub struct FileSystemIndex {
    broker: Arc<dyn LogBroker>,
    topic: String,
    policy: PollPolicy,
    producer: Mutex<Option<Arc<dyn LogProducer>>>,
    files: Mutex<Option<BTreeSet<VirtualPath>>>,
}

impl FileSystemIndex {
    pub fn new(broker: Arc<dyn LogBroker>, topic: &str, policy: PollPolicy) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
            policy,
            producer: Mutex::new(None),
            files: Mutex::new(None),
        }
    }

    /// Every file currently marked present.
    pub async fn files(&self) -> anyhow::Result<Vec<VirtualPath>> {
        let mut files = self.files.lock().await;
        Ok(self.loaded(&mut files).await?.iter().cloned().collect())
    }

    /// Mark `file` present.  No-op if it already is.
    pub async fn add(&self, file: &VirtualPath) -> anyhow::Result<()> {
        let mut files = self.files.lock().await;
        if self.loaded(&mut files).await?.contains(file) {
            return Ok(());
        }
        self.mark(file, PRESENT).await?;
        self.loaded(&mut files).await?.insert(file.clone());
        Ok(())
    }

    /// Mark `file` deleted.  No-op if it is not present.
    pub async fn remove(&self, file: &VirtualPath) -> anyhow::Result<()> {
        let mut files = self.files.lock().await;
        if !self.loaded(&mut files).await?.contains(file) {
            return Ok(());
        }
        self.mark(file, DELETED).await?;
        self.loaded(&mut files).await?.remove(file);
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        *self.files.lock().await = None;
        if let Some(producer) = self.producer.lock().await.take() {
            producer.close().await?;
        }
        Ok(())
    }

    async fn loaded<'a>(
        &self,
        files: &'a mut Option<BTreeSet<VirtualPath>>,
    ) -> anyhow::Result<&'a mut BTreeSet<VirtualPath>> {
        if files.is_none() {
            *files = Some(self.rebuild().await?);
        }
        files
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("file index of {} not loaded", self.topic))
    }

    async fn rebuild(&self) -> anyhow::Result<BTreeSet<VirtualPath>> {
        let records = drain_topic(self.broker.as_ref(), &self.topic, &self.policy).await?;
        let mut files = BTreeSet::new();
        for record in &records {
            let Some(path) = record.key.as_deref().and_then(|k| VirtualPath::parse(k).ok()) else {
                warn!("Skipping malformed file index record at offset {}", record.offset);
                continue;
            };
            match record.value.first() {
                Some(&PRESENT) => files.insert(path),
                _ => files.remove(&path),
            };
        }
        counter!(INDEX_REBUILDS_TOTAL).increment(1);
        info!("Rebuilt file index {}: {} files", self.topic, files.len());
        Ok(files)
    }

    async fn mark(&self, file: &VirtualPath, marker: u8) -> anyhow::Result<()> {
        let producer = {
            let mut producer = self.producer.lock().await;
            match producer.as_ref() {
                Some(p) => Arc::clone(p),
                None => {
                    let created = self.broker.producer().await?;
                    *producer = Some(Arc::clone(&created));
                    created
                }
            }
        };
        producer
            .send(
                &self.topic,
                Some(INDEX_PARTITION),
                Some(file.full_qualified_name()),
                Bytes::copy_from_slice(&[marker]),
            )
            .await?;
        Ok(())
    }
}
