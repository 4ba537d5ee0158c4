//! Broker checkpoints, advanced only behind durable warehouse writes.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use metrics::gauge;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    Offset, TopicPartitionList,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{batch::PartitionOffsets, metrics::LAST_COMMIT_TIMESTAMP};

const COMMIT_ATTEMPTS: u32 = 2;
const COMMIT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("offset commit failed: {0}")]
    Kafka(#[from] KafkaError),
    #[error("offset commit failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<CommitError>,
    },
}

/// Broker-native checkpoint storage.
#[async_trait]
pub trait OffsetCommitter: Send {
    /// Persists `offsets` as the last processed offset of each partition.
    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), CommitError>;
}

pub struct KafkaCommitter {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaCommitter {
    pub fn new(consumer: Arc<StreamConsumer>, topic: String) -> Self {
        KafkaCommitter { consumer, topic }
    }
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), CommitError> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for (partition, offset) in offsets.iter() {
            // kafka expects the offset of the *next* message to consume
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))?;
        }
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }
}

/// Owns the per-partition checkpoint of one ingester.
pub struct OffsetCommitCoordinator<C> {
    committer: C,
    committed: PartitionOffsets,
}

impl<C: OffsetCommitter> OffsetCommitCoordinator<C> {
    pub fn new(committer: C) -> Self {
        OffsetCommitCoordinator {
            committer,
            committed: PartitionOffsets::new(),
        }
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    /// Last offsets committed by this process.
    pub fn committed(&self) -> &PartitionOffsets {
        &self.committed
    }

    /// Commits the partitions of `offsets` that are ahead of the checkpoint.
    ///
    /// Callers must only pass offsets whose records are all written or
    /// dead-lettered. Returns the number of partitions advanced.
    pub async fn advance(&mut self, offsets: &PartitionOffsets) -> Result<usize, CommitError> {
        let ahead = offsets.ahead_of(&self.committed);
        if ahead.is_empty() {
            return Ok(0);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.committer.commit(&ahead).await {
                Ok(()) => break,
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    warn!("offset commit failed, retrying: {e}");
                    sleep(COMMIT_BACKOFF).await;
                }
                Err(e) => {
                    return Err(CommitError::Exhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
            }
        }

        self.committed.merge(&ahead);
        gauge!(LAST_COMMIT_TIMESTAMP).set(Utc::now().timestamp() as f64);
        for (partition, offset) in ahead.iter() {
            info!(partition, offset, "checkpoint committed");
        }
        Ok(ahead.len())
    }
}
