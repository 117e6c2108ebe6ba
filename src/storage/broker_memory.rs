//! In-process log broker.
//!
//! Topics are created on first send with a fixed partition count.  Each
//! partition is an append-only run of records with a movable log start,
//! so trimming behaves like a real broker's delete-records call.
//! Consumers that fall behind the log start resume at the earliest
//! retained record.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::broker::{LogBroker, LogConsumer, LogProducer, Record, RecordMetadata};
use crate::config::BrokerConfig;
use crate::BoxFuture;

/// Most records one poll returns.
const MAX_POLL_RECORDS: usize = 500;

#[derive(Default)]
struct Partition {
    log_start: i64,
    next_offset: i64,
    records: VecDeque<Record>,
}

struct Topic {
    partitions: Vec<Partition>,
    /// Round-robin cursor for sends without an explicit partition.
    next_partition: usize,
}

struct Shared {
    partitions: usize,
    topics: RwLock<HashMap<String, Topic>>,
    arrivals: Notify,
}

/// [`LogBroker`] held in process memory.
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// A broker whose topics have `partitions` partitions each (at least 1).
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1) as usize,
                topics: RwLock::new(HashMap::new()),
                arrivals: Notify::new(),
            }),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.partitions)
    }

    /// Names of existing topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// First retained offset of a partition.
    pub async fn log_start(&self, topic: &str, partition: i32) -> Option<i64> {
        let topics = self.shared.topics.read().await;
        let topic = topics.get(topic)?;
        topic
            .partitions
            .get(usize::try_from(partition).ok()?)
            .map(|p| p.log_start)
    }

    /// Records retained across all partitions of `topic`.
    pub async fn record_count(&self, topic: &str) -> usize {
        let topics = self.shared.topics.read().await;
        topics
            .get(topic)
            .map_or(0, |t| t.partitions.iter().map(|p| p.records.len()).sum())
    }
}

impl LogBroker for MemoryBroker {
    fn producer(&self) -> BoxFuture<'_, anyhow::Result<Arc<dyn LogProducer>>> {
        Box::pin(async move {
            Ok(Arc::new(MemoryProducer {
                shared: Arc::clone(&self.shared),
                closed: AtomicBool::new(false),
            }) as Arc<dyn LogProducer>)
        })
    }

    fn consumer(&self, group: &str) -> BoxFuture<'_, anyhow::Result<Box<dyn LogConsumer>>> {
        let group = group.to_string();
        Box::pin(async move {
            debug!("memory broker consumer: group={}", group);
            Ok(Box::new(MemoryConsumer {
                shared: Arc::clone(&self.shared),
                topic: None,
                positions: BTreeMap::new(),
            }) as Box<dyn LogConsumer>)
        })
    }

    fn delete_topics(&self, topics: &[String]) -> BoxFuture<'_, anyhow::Result<()>> {
        let names = topics.to_vec();
        Box::pin(async move {
            let mut topics = self.shared.topics.write().await;
            for name in &names {
                if topics.remove(name).is_some() {
                    debug!("memory broker deleted topic {}", name);
                }
            }
            Ok(())
        })
    }

    fn delete_records(
        &self,
        topic: &str,
        before: &[(i32, i64)],
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let name = topic.to_string();
        let before = before.to_vec();
        Box::pin(async move {
            let mut topics = self.shared.topics.write().await;
            let topic = topics
                .get_mut(&name)
                .ok_or_else(|| anyhow::anyhow!("UnknownTopic: {name}"))?;
            for (partition, offset) in before {
                let p = usize::try_from(partition)
                    .ok()
                    .and_then(|i| topic.partitions.get_mut(i))
                    .ok_or_else(|| anyhow::anyhow!("UnknownPartition: {name}@{partition}"))?;
                let new_start = offset.min(p.next_offset);
                while p.records.front().is_some_and(|r| r.offset < new_start) {
                    p.records.pop_front();
                }
                p.log_start = p.log_start.max(new_start);
            }
            Ok(())
        })
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl LogProducer for MemoryProducer {
    fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<String>,
        value: Bytes,
    ) -> BoxFuture<'_, anyhow::Result<RecordMetadata>> {
        let name = topic.to_string();
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                anyhow::bail!("producer is closed");
            }
            let mut topics = self.shared.topics.write().await;
            let partitions = self.shared.partitions;
            let topic = topics.entry(name.clone()).or_insert_with(|| Topic {
                partitions: (0..partitions).map(|_| Partition::default()).collect(),
                next_partition: 0,
            });

            let index = match partition {
                Some(p) => usize::try_from(p)
                    .ok()
                    .filter(|&i| i < topic.partitions.len())
                    .ok_or_else(|| anyhow::anyhow!("UnknownPartition: {name}@{p}"))?,
                None => {
                    let i = topic.next_partition % topic.partitions.len();
                    topic.next_partition = i + 1;
                    i
                }
            };

            let p = &mut topic.partitions[index];
            let offset = p.next_offset;
            p.next_offset += 1;
            p.records.push_back(Record {
                topic: name,
                partition: index as i32,
                offset,
                key,
                value,
            });
            drop(topics);
            self.shared.arrivals.notify_waiters();
            Ok(RecordMetadata {
                partition: index as i32,
                offset,
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: Option<String>,
    positions: BTreeMap<i32, i64>,
}

impl MemoryConsumer {
    fn assigned(&self) -> anyhow::Result<&str> {
        self.topic
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("consumer has no assignment"))
    }

    /// `(log_start, next_offset)` of each assigned partition; unknown
    /// topics and partitions read as empty.
    async fn bounds(&self) -> anyhow::Result<BTreeMap<i32, (i64, i64)>> {
        let name = self.assigned()?;
        let topics = self.shared.topics.read().await;
        let topic = topics.get(name);
        Ok(self
            .positions
            .keys()
            .map(|&partition| {
                let bounds = topic
                    .and_then(|t| usize::try_from(partition).ok().and_then(|i| t.partitions.get(i)))
                    .map_or((0, 0), |p| (p.log_start, p.next_offset));
                (partition, bounds)
            })
            .collect())
    }

    /// Take up to [`MAX_POLL_RECORDS`] records at or after the current
    /// positions, advancing them.
    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>> {
        let shared = Arc::clone(&self.shared);
        let name = self.assigned()?.to_string();
        let topics = shared.topics.read().await;
        let Some(topic) = topics.get(&name) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (&partition, position) in self.positions.iter_mut() {
            let Some(p) = usize::try_from(partition)
                .ok()
                .and_then(|i| topic.partitions.get(i))
            else {
                continue;
            };
            if *position < p.log_start {
                *position = p.log_start;
            }
            let skip = (*position - p.log_start) as usize;
            for record in p.records.iter().skip(skip) {
                if batch.len() >= MAX_POLL_RECORDS {
                    return Ok(batch);
                }
                batch.push(record.clone());
                *position = record.offset + 1;
            }
        }
        Ok(batch)
    }
}

impl LogConsumer for MemoryConsumer {
    fn assign(&mut self, topic: &str, partitions: &[i32]) -> BoxFuture<'_, anyhow::Result<()>> {
        let name = topic.to_string();
        let partitions = partitions.to_vec();
        Box::pin(async move {
            self.topic = Some(name);
            self.positions = partitions.into_iter().map(|p| (p, 0)).collect();
            for (partition, (start, _)) in self.bounds().await? {
                self.positions.insert(partition, start);
            }
            Ok(())
        })
    }

    fn seek(&mut self, partition: i32, offset: i64) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let position = self
                .positions
                .get_mut(&partition)
                .ok_or_else(|| anyhow::anyhow!("partition {partition} is not assigned"))?;
            *position = offset;
            Ok(())
        })
    }

    fn seek_to_beginning(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            for (partition, (start, _)) in self.bounds().await? {
                self.positions.insert(partition, start);
            }
            Ok(())
        })
    }

    fn end_offsets(&mut self) -> BoxFuture<'_, anyhow::Result<HashMap<i32, i64>>> {
        Box::pin(async move {
            Ok(self
                .bounds()
                .await?
                .into_iter()
                .map(|(partition, (_, end))| (partition, end))
                .collect())
        })
    }

    fn position(&mut self, partition: i32) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            let position = *self
                .positions
                .get(&partition)
                .ok_or_else(|| anyhow::anyhow!("partition {partition} is not assigned"))?;
            let bounds = self.bounds().await?;
            let start = bounds.get(&partition).map_or(0, |&(start, _)| start);
            Ok(position.max(start))
        })
    }

    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<Record>>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            let shared = Arc::clone(&self.shared);
            loop {
                let notified = shared.arrivals.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = self.fetch().await?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
                if timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.topic = None;
            self.positions.clear();
            Ok(())
        })
    }
}
