//! Log broker backend family.
//!
//! Every file is its own topic; each blob is one record whose value is the
//! chunk.  A broker cannot list or filter its records by key, so a file's
//! blobs come from its [`MetadataIndex`] and directory listings from the
//! shared [`FileSystemIndex`].  Records cannot be deleted one by one either:
//! the connector compacts instead, and this backend trims each partition
//! up to the superseded records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::index::{index_topic, FileSystemIndex, MetadataIndex};
use crate::blob::{Blob, LogCoordinates};
use crate::config::BrokerConfig;
use crate::connector::{BlobBackend, BlobConnector, DeleteMode};
use crate::handles::HandleCache;
use crate::key::{self, KeyScope};
use crate::path::{topic_name, PathValidator, TopicNameValidator, VirtualPath};
use crate::BoxFuture;

/// Default maximum record size used for one blob.
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 1_000_000;

// -- Client traits ------------------------------------------------------------

/// One record fetched from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Bounded retry policy for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Polls allowed before giving up.
    pub attempts: u32,
    /// Timeout of each poll.
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            attempts: config.poll_attempts.max(1),
            timeout: config.poll_timeout(),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

/// Async log broker client.
pub trait LogBroker: Send + Sync + 'static {
    fn producer(&self) -> BoxFuture<'_, anyhow::Result<Arc<dyn LogProducer>>>;

    /// A consumer in its own consumer `group`, with nothing assigned.
    fn consumer(&self, group: &str) -> BoxFuture<'_, anyhow::Result<Box<dyn LogConsumer>>>;

    fn delete_topics(&self, topics: &[String]) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Drop every record of `topic` before the given `(partition, offset)`
    /// pairs.
    fn delete_records(
        &self,
        topic: &str,
        before: &[(i32, i64)],
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub trait LogProducer: Send + Sync {
    /// Append a record and wait for the broker's acknowledgment.  `None`
    /// lets the broker pick the partition.
    fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<String>,
        value: Bytes,
    ) -> BoxFuture<'_, anyhow::Result<RecordMetadata>>;

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Consumer with manual partition assignment.
pub trait LogConsumer: Send {
    /// Assign `partitions` of `topic`, positioned at the earliest retained
    /// offsets.
    fn assign(&mut self, topic: &str, partitions: &[i32]) -> BoxFuture<'_, anyhow::Result<()>>;

    fn seek(&mut self, partition: i32, offset: i64) -> BoxFuture<'_, anyhow::Result<()>>;

    fn seek_to_beginning(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Offset one past the last record of each assigned partition.
    fn end_offsets(&mut self) -> BoxFuture<'_, anyhow::Result<HashMap<i32, i64>>>;

    /// Offset of the next record to be fetched from `partition`.
    fn position(&mut self, partition: i32) -> BoxFuture<'_, anyhow::Result<i64>>;

    /// Wait up to `timeout` for records; an empty batch means none arrived.
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<Record>>>;

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
}

// -- Backend ------------------------------------------------------------------

/// Producer and reader of one file topic.
struct TopicHandles {
    producer: Arc<dyn LogProducer>,
    reader: Mutex<Box<dyn LogConsumer>>,
}

impl TopicHandles {
    async fn close(&self, topic: &str) {
        if let Err(e) = self.producer.close().await {
            warn!("Failed to close producer for {}: {e}", topic);
        }
        if let Err(e) = self.reader.lock().await.close().await {
            warn!("Failed to close reader for {}: {e}", topic);
        }
    }
}

/// [`BlobBackend`] over a [`LogBroker`].
pub struct BrokerBlobs {
    broker: Arc<dyn LogBroker>,
    policy: PollPolicy,
    topics: HandleCache<TopicHandles>,
    indexes: HandleCache<MetadataIndex>,
    files: FileSystemIndex,
    validator: TopicNameValidator,
}

/// Connector for log brokers.
pub type BrokerConnector = BlobConnector<BrokerBlobs>;

impl BrokerBlobs {
    pub fn new(broker: Arc<dyn LogBroker>, config: &BrokerConfig) -> Self {
        let policy = PollPolicy::from_config(config);
        Self {
            files: FileSystemIndex::new(Arc::clone(&broker), &config.files_topic, policy),
            broker,
            policy,
            topics: HandleCache::new("topic"),
            indexes: HandleCache::new("index"),
            validator: TopicNameValidator,
        }
    }

    async fn topic(&self, topic: &str) -> anyhow::Result<Arc<TopicHandles>> {
        self.topics
            .get_or_create(topic, || async {
                let producer = self.broker.producer().await?;
                let reader = self.broker.consumer(&format!("chunkstore-reader-{topic}")).await?;
                Ok(TopicHandles {
                    producer,
                    reader: Mutex::new(reader),
                })
            })
            .await
    }

    async fn index(&self, file: &VirtualPath) -> anyhow::Result<Arc<MetadataIndex>> {
        self.indexes
            .get_or_create(&topic_name(file), || {
                MetadataIndex::open(Arc::clone(&self.broker), file.clone(), self.policy)
            })
            .await
    }
}

/// Per partition, the offset one past the highest offset among `blobs`.
fn trim_points(blobs: &[Blob]) -> anyhow::Result<Vec<(i32, i64)>> {
    let mut points: BTreeMap<i32, i64> = BTreeMap::new();
    for blob in blobs {
        let coords = blob
            .log()
            .ok_or_else(|| anyhow::anyhow!("blob {} has no log coordinates", blob.key()))?;
        let end = points.entry(coords.partition).or_insert(0);
        *end = (*end).max(coords.offset + 1);
    }
    Ok(points.into_iter().collect())
}

impl BlobBackend for BrokerBlobs {
    fn kind(&self) -> &'static str {
        "broker"
    }

    fn max_blob_size(&self) -> u64 {
        DEFAULT_MAX_BLOB_SIZE
    }

    fn validator(&self) -> &dyn PathValidator {
        &self.validator
    }

    fn delete_mode(&self) -> DeleteMode {
        DeleteMode::Compacting
    }

    fn blobs(&self, file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<Vec<Blob>>> {
        let file = file.clone();
        Box::pin(async move { self.index(&file).await?.get().await })
    }

    fn files_below(
        &self,
        directory: &VirtualPath,
    ) -> BoxFuture<'_, anyhow::Result<Vec<VirtualPath>>> {
        let directory = directory.clone();
        Box::pin(async move {
            let files = self.files.files().await?;
            Ok(files
                .into_iter()
                .filter(|f| directory.is_ancestor_of(f))
                .collect())
        })
    }

    fn read_blob(
        &self,
        file: &VirtualPath,
        blob: &Blob,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let topic = topic_name(file);
        let blob = blob.clone();
        Box::pin(async move {
            let coords = *blob
                .log()
                .ok_or_else(|| anyhow::anyhow!("blob {} has no log coordinates", blob.key()))?;
            let handles = self.topic(&topic).await?;
            let mut reader = handles.reader.lock().await;
            reader.assign(&topic, &[coords.partition]).await?;
            reader.seek(coords.partition, coords.offset).await?;

            for attempt in 1..=self.policy.attempts {
                let records = reader.poll(self.policy.timeout).await?;
                for record in records.into_iter().filter(|r| r.partition == coords.partition) {
                    if record.offset == coords.offset {
                        let len = record.value.len() as u64;
                        let start = offset.min(len) as usize;
                        let end = offset.saturating_add(length).min(len) as usize;
                        return Ok(record.value.slice(start..end));
                    }
                    if record.offset > coords.offset {
                        anyhow::bail!(
                            "record {}@{}:{} is no longer in the log",
                            topic,
                            coords.partition,
                            coords.offset
                        );
                    }
                }
                debug!(
                    "poll attempt {} of {} found nothing at {}@{}:{}",
                    attempt, self.policy.attempts, topic, coords.partition, coords.offset
                );
            }
            anyhow::bail!(
                "no record at {}@{}:{} after {} polls",
                topic,
                coords.partition,
                coords.offset,
                self.policy.attempts
            )
        })
    }

    fn put_blob(
        &self,
        file: &VirtualPath,
        ordinal: u64,
        position: u64,
        data: Bytes,
    ) -> BoxFuture<'_, anyhow::Result<Blob>> {
        let file = file.clone();
        Box::pin(async move {
            let topic = topic_name(&file);
            let handles = self.topic(&topic).await?;
            let key = key::blob_key(&file, ordinal, KeyScope::Qualified);
            let size = data.len() as i64;
            let meta = handles
                .producer
                .send(&topic, None, Some(key.clone()), data)
                .await?;
            let start = position as i64;
            Ok(Blob::logged(
                key,
                LogCoordinates {
                    partition: meta.partition,
                    offset: meta.offset,
                    range_start: start,
                    range_end: start + size - 1,
                },
            )?)
        })
    }

    fn commit_blobs(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, anyhow::Result<()>> {
        let file = file.clone();
        let blobs = blobs.to_vec();
        Box::pin(async move {
            self.index(&file).await?.put(&blobs).await?;
            self.files.add(&file).await
        })
    }

    fn delete_blobs(
        &self,
        file: &VirtualPath,
        blobs: &[Blob],
    ) -> BoxFuture<'_, anyhow::Result<usize>> {
        let topic = topic_name(file);
        let blobs = blobs.to_vec();
        Box::pin(async move {
            let points = trim_points(&blobs)?;
            debug!("delete_records: topic={} trims={:?}", topic, points);
            self.broker.delete_records(&topic, &points).await?;
            Ok(blobs.len())
        })
    }

    fn delete_file(&self, file: &VirtualPath, blobs: &[Blob]) -> BoxFuture<'_, anyhow::Result<usize>> {
        let file = file.clone();
        let count = blobs.len();
        Box::pin(async move {
            let topic = topic_name(&file);
            if let Some(handles) = self.topics.remove(&topic).await {
                handles.close(&topic).await;
            }
            self.broker
                .delete_topics(&[topic.clone(), index_topic(&file)])
                .await?;
            if let Some(index) = self.indexes.remove(&topic).await {
                if let Err(e) = index.close().await {
                    warn!("Failed to close index for {}: {e}", file);
                }
            }
            self.files.remove(&file).await?;
            debug!("delete_file: topic={} blobs={}", topic, count);
            Ok(count)
        })
    }

    fn reset_index(&self, file: &VirtualPath) -> BoxFuture<'_, anyhow::Result<()>> {
        let file = file.clone();
        Box::pin(async move { self.index(&file).await?.clear().await })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            for (topic, handles) in self.topics.drain().await {
                handles.close(&topic).await;
            }
            for (topic, index) in self.indexes.drain().await {
                if let Err(e) = index.close().await {
                    warn!("Failed to close index for {}: {e}", topic);
                }
            }
            self.files.close().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::connector::{self, contract, Connector};
    use crate::storage::broker_memory::MemoryBroker;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            poll_timeout_ms: 50,
            ..BrokerConfig::default()
        }
    }

    fn test_connector(broker: &Arc<MemoryBroker>) -> BrokerConnector {
        let broker: Arc<dyn LogBroker> = Arc::clone(broker) as Arc<dyn LogBroker>;
        BlobConnector::new(BrokerBlobs::new(broker, &test_config()))
            .with_max_blob_size(contract::MAX_BLOB)
            .unwrap()
    }

    #[tokio::test]
    async fn test_contract() {
        let broker = Arc::new(MemoryBroker::new(2));
        let connector = test_connector(&broker);
        contract::run_all(&connector, "stream", true).await;
        contract::move_across_containers(&connector, "stream", "other").await;
        contract::close_rejects_operations(&connector, "stream").await;
    }

    #[tokio::test]
    async fn test_contract_with_caching() {
        let broker: Arc<dyn LogBroker> = Arc::new(MemoryBroker::new(1));
        let config = ConnectorConfig {
            caching: true,
            max_blob_size: Some(contract::MAX_BLOB),
        };
        let connector =
            connector::build(BrokerBlobs::new(broker, &test_config()), &config).unwrap();
        contract::run_all(connector.as_ref(), "cached", true).await;
        contract::close_rejects_operations(connector.as_ref(), "cached").await;
    }

    #[tokio::test]
    async fn test_blobs_carry_contiguous_ranges() {
        let broker = Arc::new(MemoryBroker::new(2));
        let connector = test_connector(&broker);
        let file = connector.resolve("stream/dir/file").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"0123456789")])
            .await
            .unwrap();

        let blobs = connector.blobs(&file).await.unwrap();
        let ranges: Vec<(i64, i64)> = blobs
            .iter()
            .map(|b| {
                let c = b.log().unwrap();
                (c.range_start, c.range_end)
            })
            .collect();
        assert_eq!(ranges, vec![(0, 3), (4, 7), (8, 9)]);
        let partitions: Vec<i32> = blobs.iter().map(|b| b.log().unwrap().partition).collect();
        assert_eq!(partitions, vec![0, 1, 0]);
        assert_eq!(blobs[0].key(), "stream/dir/file/0");
    }

    #[tokio::test]
    async fn test_fresh_connector_rebuilds_from_the_log() {
        let broker = Arc::new(MemoryBroker::new(2));
        {
            let connector = test_connector(&broker);
            let file = connector.resolve("stream/dir/file").unwrap();
            connector
                .write_data(&file, vec![Bytes::from_static(b"first-")])
                .await
                .unwrap();
            connector
                .write_data(&file, vec![Bytes::from_static(b"second")])
                .await
                .unwrap();
            connector.close().await.unwrap();
        }

        let connector = test_connector(&broker);
        let file = connector.resolve("stream/dir/file").unwrap();
        assert_eq!(connector.file_size(&file).await.unwrap(), 12);
        let data = connector.read_data(&file, 0, 12).await.unwrap();
        assert_eq!(&data[..], b"first-second");
        let ordinals: Vec<u64> = connector
            .blobs(&file)
            .await
            .unwrap()
            .iter()
            .map(Blob::ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);

        let root = connector.resolve("stream").unwrap();
        let children = connector.list_children(&root).await.unwrap();
        assert_eq!(children.directories, vec!["dir".to_string()]);
    }

    #[tokio::test]
    async fn test_compaction_trims_superseded_records() {
        let broker = Arc::new(MemoryBroker::new(1));
        let connector = test_connector(&broker);
        let file = connector.resolve("stream/file").unwrap();
        let topic = topic_name(&file);
        connector
            .write_data(&file, vec![Bytes::from_static(b"AAAABBBBCCCCDDDDEEEE")])
            .await
            .unwrap();
        let blobs = connector.blobs(&file).await.unwrap();

        assert!(connector.delete_blobs(&file, &blobs[1..3]).await.unwrap());

        // Five original records trimmed, three rewritten survivors kept.
        assert_eq!(broker.log_start(&topic, 0).await, Some(5));
        assert_eq!(broker.record_count(&topic).await, 3);
        let data = connector.read_data(&file, 0, 12).await.unwrap();
        assert_eq!(&data[..], b"AAAADDDDEEEE");

        // The index log was trimmed too and still rebuilds to the survivors.
        let fresh = test_connector(&broker);
        let ordinals: Vec<u64> = fresh
            .blobs(&file)
            .await
            .unwrap()
            .iter()
            .map(Blob::ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_trimmed_record_is_a_read_failure() {
        let broker = Arc::new(MemoryBroker::new(1));
        let connector = test_connector(&broker);
        let file = connector.resolve("stream/file").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"12345678")])
            .await
            .unwrap();

        broker
            .delete_records(&topic_name(&file), &[(0, 1)])
            .await
            .unwrap();

        let err = connector.read_data(&file, 0, 8).await.unwrap_err();
        assert_eq!(err.code(), "ReadFailure");
        let tail = connector.read_data(&file, 4, 4).await.unwrap();
        assert_eq!(&tail[..], b"5678");
    }

    /// Broker whose per-file readers never receive anything.
    struct MutedReaders {
        inner: MemoryBroker,
    }

    struct MutedConsumer {
        inner: Box<dyn LogConsumer>,
    }

    impl LogBroker for MutedReaders {
        fn producer(&self) -> BoxFuture<'_, anyhow::Result<Arc<dyn LogProducer>>> {
            self.inner.producer()
        }

        fn consumer(&self, group: &str) -> BoxFuture<'_, anyhow::Result<Box<dyn LogConsumer>>> {
            let group = group.to_string();
            Box::pin(async move {
                let inner = self.inner.consumer(&group).await?;
                if group.starts_with("chunkstore-reader-") {
                    Ok(Box::new(MutedConsumer { inner }) as Box<dyn LogConsumer>)
                } else {
                    Ok(inner)
                }
            })
        }

        fn delete_topics(&self, topics: &[String]) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.delete_topics(topics)
        }

        fn delete_records(
            &self,
            topic: &str,
            before: &[(i32, i64)],
        ) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.delete_records(topic, before)
        }
    }

    impl LogConsumer for MutedConsumer {
        fn assign(&mut self, topic: &str, partitions: &[i32]) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.assign(topic, partitions)
        }

        fn seek(&mut self, partition: i32, offset: i64) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.seek(partition, offset)
        }

        fn seek_to_beginning(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.seek_to_beginning()
        }

        fn end_offsets(&mut self) -> BoxFuture<'_, anyhow::Result<HashMap<i32, i64>>> {
            self.inner.end_offsets()
        }

        fn position(&mut self, partition: i32) -> BoxFuture<'_, anyhow::Result<i64>> {
            self.inner.position(partition)
        }

        fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<Record>>> {
            Box::pin(async move {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            })
        }

        fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn test_read_gives_up_after_poll_attempts() {
        let broker: Arc<dyn LogBroker> = Arc::new(MutedReaders {
            inner: MemoryBroker::new(1),
        });
        let config = BrokerConfig {
            poll_attempts: 2,
            poll_timeout_ms: 10,
            ..BrokerConfig::default()
        };
        let connector = BlobConnector::new(BrokerBlobs::new(broker, &config))
            .with_max_blob_size(contract::MAX_BLOB)
            .unwrap();
        let file = connector.resolve("stream/silent").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"123456")])
            .await
            .unwrap();
        assert_eq!(connector.file_size(&file).await.unwrap(), 6);

        let err = connector.read_data(&file, 0, 6).await.unwrap_err();
        assert_eq!(err.code(), "ReadFailure");
        assert!(err.to_string().contains("after 2 polls"), "{err}");
    }

    #[tokio::test]
    async fn test_delete_file_drops_topics() {
        let broker = Arc::new(MemoryBroker::new(1));
        let connector = test_connector(&broker);
        let file = connector.resolve("stream/file").unwrap();
        connector
            .write_data(&file, vec![Bytes::from_static(b"payload")])
            .await
            .unwrap();
        let topic = topic_name(&file);
        assert!(broker.topics().await.contains(&topic));

        assert!(connector.delete_file(&file).await.unwrap());

        let topics = broker.topics().await;
        assert!(!topics.contains(&topic));
        assert!(!topics.contains(&format!("{topic}.index")));
        assert!(!connector.file_exists(&file).await.unwrap());
    }

    #[test]
    fn test_trim_points_take_highest_offset_per_partition() {
        let blob = |ordinal: u64, partition: i32, offset: i64| {
            let start = ordinal as i64 * 4;
            Blob::logged(
                format!("c/f/{ordinal}"),
                LogCoordinates {
                    partition,
                    offset,
                    range_start: start,
                    range_end: start + 3,
                },
            )
            .unwrap()
        };
        let blobs = vec![blob(0, 0, 0), blob(1, 1, 0), blob(2, 0, 1), blob(3, 1, 7)];
        assert_eq!(trim_points(&blobs).unwrap(), vec![(0, 2), (1, 8)]);
        assert!(trim_points(&[Blob::keyed("c/f/0", 1).unwrap()]).is_err());
    }
}
