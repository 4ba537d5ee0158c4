//! Bounded polling of the input topic.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{consumer::StreamConsumer, error::KafkaError, message::BorrowedMessage, Message};
use thiserror::Error;
use tokio::time::{timeout, Instant};

use crate::event::{Envelope, Record};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("error receiving message: {0}")]
    Kafka(#[from] KafkaError),
}

/// Records returned by one poll, grouped by partition in offset order.
#[derive(Debug, Default)]
pub struct Polled {
    partitions: BTreeMap<i32, Vec<Record>>,
    len: usize,
}

impl Polled {
    pub fn push(&mut self, record: Record) {
        self.partitions
            .entry(record.envelope.source_partition())
            .or_default()
            .push(record);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, &[Record])> {
        self.partitions.iter().map(|(p, records)| (*p, records.as_slice()))
    }
}

impl IntoIterator for Polled {
    type Item = Record;
    type IntoIter = std::iter::Flatten<std::collections::btree_map::IntoValues<i32, Vec<Record>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_values().flatten()
    }
}

impl FromIterator<Record> for Polled {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut polled = Polled::default();
        for record in iter {
            polled.push(record);
        }
        polled
    }
}

#[async_trait]
pub trait Source: Send {
    /// Waits at most `max_wait` for up to `max_records` records.
    /// An empty result means the wait elapsed without data.
    async fn poll(&mut self, max_wait: Duration, max_records: usize) -> Result<Polled, ReaderError>;
}

pub struct KafkaReader {
    consumer: Arc<StreamConsumer>,
}

impl KafkaReader {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        KafkaReader { consumer }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        envelope: Envelope::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.timestamp().to_millis(),
            message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
        ),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

#[async_trait]
impl Source for KafkaReader {
    async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Polled, ReaderError> {
        let deadline = Instant::now() + max_wait;
        let mut polled = Polled::default();
        while polled.len() < max_records {
            match timeout(
                deadline.saturating_duration_since(Instant::now()),
                self.consumer.recv(),
            )
            .await
            {
                Err(_) => break,
                Ok(Err(e)) => return Err(ReaderError::Kafka(e)),
                Ok(Ok(message)) => polled.push(to_record(&message)),
            }
        }
        Ok(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> Record {
        Record {
            envelope: Envelope::new("sales", partition, offset, None, None),
            payload: Some(b"{}".to_vec()),
        }
    }

    #[test]
    fn groups_by_partition_preserving_order() {
        let polled: Polled = [record(1, 5), record(0, 9), record(1, 6), record(0, 10)]
            .into_iter()
            .collect();
        assert_eq!(polled.len(), 4);
        let groups: Vec<(i32, Vec<i64>)> = polled
            .partitions()
            .map(|(p, records)| {
                (
                    p,
                    records.iter().map(|r| r.envelope.source_offset()).collect(),
                )
            })
            .collect();
        assert_eq!(groups, vec![(0, vec![9, 10]), (1, vec![5, 6])]);

        let offsets: Vec<i64> = polled
            .into_iter()
            .map(|r| r.envelope.source_offset())
            .collect();
        assert_eq!(offsets, vec![9, 10, 5, 6]);
    }
}
