#![allow(dead_code)]
//! In-memory stand-ins for the broker, the warehouse and the dead-letter topic.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use eltpipe::{
    batch::PartitionOffsets,
    checkpoint::{CommitError, OffsetCommitter},
    dead_letter::{DeadLetter, DeadLetterError, DeadLetterRouter, DeadLetterSink},
    decoder::get_decoder,
    event::{Envelope, Record},
    ingester::{Ingester, Options},
    reader::{Polled, ReaderError, Source},
    sink::{SinkError, StagedRow, TransactionalSink},
};
use rdkafka::error::KafkaError;
use serde_json::Value;

pub const TOPIC: &str = "sales_events";

pub fn record(partition: i32, offset: i64, payload: &[u8]) -> Record {
    Record {
        envelope: Envelope::new(
            TOPIC,
            partition,
            offset,
            Some(1_700_000_000_000 + offset),
            Some(format!("key-{offset}")),
        ),
        payload: Some(payload.to_vec()),
    }
}

pub fn json_record(partition: i32, offset: i64, document: Value) -> Record {
    record(partition, offset, document.to_string().as_bytes())
}

pub fn tombstone(partition: i32, offset: i64) -> Record {
    Record {
        envelope: Envelope::new(TOPIC, partition, offset, None, None),
        payload: None,
    }
}

pub fn order(partition: i32, offset: i64) -> Record {
    json_record(
        partition,
        offset,
        serde_json::json!({
            "event_type": "order",
            "id": format!("O-{partition}-{offset}"),
            "customer": 1,
            "product": 1001,
            "quantity": 2,
        }),
    )
}

/// Broker stand-in: hands out queued records, honouring `max_records`.
#[derive(Clone, Default)]
pub struct FakeSource {
    queue: Arc<Mutex<VecDeque<Record>>>,
    requests: Arc<Mutex<Vec<usize>>>,
}

impl FakeSource {
    pub fn push(&self, records: impl IntoIterator<Item = Record>) {
        self.queue.lock().unwrap().extend(records);
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// `max_records` of every poll so far.
    pub fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Polled, ReaderError> {
        let polled: Polled = {
            self.requests.lock().unwrap().push(max_records);
            let mut queue = self.queue.lock().unwrap();
            let count = max_records.min(queue.len());
            queue.drain(..count).collect()
        };
        if polled.is_empty() {
            tokio::time::sleep(max_wait).await;
        }
        Ok(polled)
    }
}

/// Committed warehouse state shared with the test body.
#[derive(Debug, Default)]
pub struct Warehouse {
    pub raw: Vec<StagedRow>,
    pub staging: Vec<StagedRow>,
    /// Row count of every committed unit of work.
    pub committed_batches: Vec<usize>,
    pub rollbacks: u32,
    pub fail_next: u32,
    pub fail_always: bool,
    pub hang: bool,
    pub closed: bool,
}

impl Warehouse {
    pub fn raw_documents(&self) -> Vec<(Value, Value)> {
        self.raw
            .iter()
            .map(|row| {
                (
                    serde_json::from_str(&row.metadata).unwrap(),
                    serde_json::from_str(&row.content).unwrap(),
                )
            })
            .collect()
    }
}

#[derive(Default)]
struct Transaction {
    staged: Vec<StagedRow>,
    promoted: Vec<StagedRow>,
}

/// Transactional sink over [`Warehouse`]; nothing is visible before commit.
#[derive(Clone, Default)]
pub struct FakeSink {
    pub warehouse: Arc<Mutex<Warehouse>>,
    tx: Arc<Mutex<Option<Transaction>>>,
}

impl FakeSink {
    pub fn warehouse(&self) -> std::sync::MutexGuard<'_, Warehouse> {
        self.warehouse.lock().unwrap()
    }
}

#[async_trait]
impl TransactionalSink for FakeSink {
    async fn reconcile_staging(&mut self) -> Result<u64, SinkError> {
        let mut warehouse = self.warehouse.lock().unwrap();
        let stale = warehouse.staging.len() as u64;
        warehouse.staging.clear();
        Ok(stale)
    }

    async fn begin(&mut self) -> Result<(), SinkError> {
        *self.tx.lock().unwrap() = Some(Transaction::default());
        Ok(())
    }

    async fn stage(&mut self, rows: &[StagedRow]) -> Result<(), SinkError> {
        let mut tx = self.tx.lock().unwrap();
        let tx = tx.as_mut().ok_or(SinkError::NoTransaction)?;
        tx.staged.extend_from_slice(rows);
        Ok(())
    }

    async fn promote(&mut self) -> Result<u64, SinkError> {
        let hang = {
            let mut warehouse = self.warehouse.lock().unwrap();
            if warehouse.fail_always || warehouse.fail_next > 0 {
                warehouse.fail_next = warehouse.fail_next.saturating_sub(1);
                return Err(SinkError::Query {
                    command: "INSERT",
                    error: sqlx::Error::PoolTimedOut,
                });
            }
            warehouse.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut tx = self.tx.lock().unwrap();
        let tx = tx.as_mut().ok_or(SinkError::NoTransaction)?;
        // the `::jsonb` cast refuses \u0000
        let unstorable = |text: &str| text.contains("\\u0000");
        if tx
            .staged
            .iter()
            .any(|row| unstorable(&row.metadata) || unstorable(&row.content))
        {
            return Err(SinkError::Query {
                command: "INSERT",
                error: sqlx::Error::Protocol("unsupported Unicode escape sequence".to_owned()),
            });
        }
        let staged = std::mem::take(&mut tx.staged);
        let promoted = staged.len() as u64;
        tx.promoted.extend(staged);
        Ok(promoted)
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .take()
            .ok_or(SinkError::NoTransaction)?;
        let mut warehouse = self.warehouse.lock().unwrap();
        warehouse.committed_batches.push(tx.promoted.len());
        warehouse.raw.extend(tx.promoted);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SinkError> {
        self.tx.lock().unwrap().take();
        self.warehouse.lock().unwrap().rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.tx.lock().unwrap().take();
        self.warehouse.lock().unwrap().closed = true;
    }
}

/// Dead-letter topic stand-in; `broken` makes every publish fail, `hang`
/// makes it never complete.
#[derive(Clone, Default)]
pub struct FakeDeadLetters {
    pub published: Arc<Mutex<Vec<DeadLetter>>>,
    pub broken: Arc<AtomicBool>,
    pub hang: Arc<AtomicBool>,
}

impl FakeDeadLetters {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for FakeDeadLetters {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Publish(KafkaError::Canceled));
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.published.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeCommitter {
    commits: Arc<Mutex<Vec<PartitionOffsets>>>,
}

impl FakeCommitter {
    pub fn commits(&self) -> Vec<PartitionOffsets> {
        self.commits.lock().unwrap().clone()
    }

    /// Last processed offset committed for `partition`.
    pub fn checkpoint(&self, partition: i32) -> Option<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter_map(|offsets| offsets.get(partition))
            .max()
    }
}

#[async_trait]
impl OffsetCommitter for FakeCommitter {
    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<(), CommitError> {
        self.commits.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}

pub type TestIngester = Ingester<FakeSource, FakeSink, FakeDeadLetters, FakeCommitter>;

#[derive(Clone, Default)]
pub struct Harness {
    pub source: FakeSource,
    pub sink: FakeSink,
    pub dead_letters: FakeDeadLetters,
    pub committer: FakeCommitter,
}

impl Harness {
    pub fn ingester(&self, options: Options) -> TestIngester {
        Ingester::new(
            options,
            self.source.clone(),
            get_decoder("json", None).unwrap(),
            DeadLetterRouter::new(self.dead_letters.clone(), Duration::from_millis(100)),
            self.sink.clone(),
            self.committer.clone(),
        )
    }
}

/// Fast timings: short polls, size-driven flushes unless a test lowers the age threshold.
pub fn options(batch_size: usize) -> Options {
    let mut options = Options::new("test");
    options.batch_size = batch_size;
    options.batch_timeout = Duration::from_secs(60);
    options.poll_timeout = Duration::from_millis(10);
    options.sink_retry_backoff = Duration::from_millis(10);
    options.shutdown_timeout = Duration::from_secs(5);
    options
}
