//! The single-worker pipeline: poll, validate, accumulate, flush, checkpoint.
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    batch::{BatchAccumulator, BatchFull, BatchState, PartitionOffsets},
    checkpoint::{CommitError, KafkaCommitter, OffsetCommitCoordinator, OffsetCommitter},
    dead_letter::{
        dead_letter_topic, DeadLetterError, DeadLetterRouter, DeadLetterSink, KafkaDeadLetterSink,
        Rejection,
    },
    decoder::{get_decoder, Decoder},
    event::{contains_nul, document_contains_nul, Event, Record, UNKNOWN},
    kafka::{create_consumer, create_producer},
    metrics::{
        BATCH_PROCESSING_SECONDS, CONSECUTIVE_SINK_FAILURES, CURRENT_BATCH_SIZE, EVENTS_CONSUMED,
        EVENT_PROCESSING_SECONDS, SINK_FAILURE_ALERTS,
    },
    reader::{KafkaReader, ReaderError, Source},
    settings,
    shutdown::ShutdownSignal,
    sink::{postgres::PostgresSink, SinkError, SinkWriter, TransactionalSink, WriteSummary},
    validator::{validate, Validation},
};

pub type SharedDecoder = Arc<dyn Decoder + Send + Sync>;

/// Errors that stop an ingester. Anything recoverable is handled inside the loop.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("warehouse unavailable: {0}")]
    Sink(#[from] SinkError),
    #[error("giving up after {failures} consecutive failed writes: {last}")]
    SinkExhausted {
        failures: u32,
        #[source]
        last: SinkError,
    },
    #[error(transparent)]
    Overflow(#[from] BatchFull),
    #[error("kafka client setup failed: {0}")]
    Kafka(#[from] KafkaError),
    #[error("decoder setup failed: {0:#}")]
    Decoder(anyhow::Error),
}

/// Tunables of one ingester.
#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub poll_timeout: Duration,
    pub sink_retry_backoff: Duration,
    pub sink_failure_alert_after: u32,
    pub max_sink_failures: Option<u32>,
    pub shutdown_timeout: Duration,
}

impl Options {
    pub fn new(name: &str) -> Self {
        Options {
            name: name.to_owned(),
            batch_size: 100,
            batch_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(1),
            sink_retry_backoff: Duration::from_secs(1),
            sink_failure_alert_after: 5,
            max_sink_failures: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_settings(name: &str, cfg: &settings::Ingester) -> Self {
        Options {
            name: name.to_owned(),
            batch_size: cfg.batch_size,
            batch_timeout: cfg.batch_timeout(),
            poll_timeout: cfg.poll_timeout(),
            sink_retry_backoff: cfg.sink_retry_backoff(),
            sink_failure_alert_after: cfg.sink_failure_alert_after,
            max_sink_failures: cfg.max_sink_failures,
            shutdown_timeout: cfg.shutdown_timeout(),
        }
    }
}

/// What a single poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing pending.
    Idle,
    /// Records are buffered, no threshold reached yet.
    Filling,
    /// The window held only dead letters; this many partitions were checkpointed.
    Acknowledged(usize),
    /// The batch was written and its checkpoint advanced.
    Flushed(WriteSummary),
    /// The write rolled back; the batch is kept for the next cycle.
    WriteFailed,
}

/// Counters for the lifetime of one ingester.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub consumed: u64,
    pub inserted: BTreeMap<String, u64>,
    pub dead_lettered: BTreeMap<&'static str, u64>,
    pub batches: u64,
    pub sink_failures: u64,
}

impl SessionStats {
    pub fn inserted_total(&self) -> u64 {
        self.inserted.values().sum()
    }

    pub fn dead_lettered_total(&self) -> u64 {
        self.dead_lettered.values().sum()
    }

    fn record_write(&mut self, summary: &WriteSummary) {
        self.batches += 1;
        for (event_type, count) in &summary.by_type {
            *self.inserted.entry(event_type.clone()).or_default() += count;
        }
    }

    fn log(&self, ingester: &str) {
        info!(
            ingester,
            consumed = self.consumed,
            inserted = self.inserted_total(),
            dead_lettered = self.dead_lettered_total(),
            batches = self.batches,
            sink_failures = self.sink_failures,
            by_type = ?self.inserted,
            "session stats"
        );
    }
}

pub struct Ingester<S, W, P, C> {
    options: Options,
    source: S,
    decoder: SharedDecoder,
    dead_letters: DeadLetterRouter<P>,
    accumulator: BatchAccumulator,
    writer: SinkWriter<W>,
    checkpoints: OffsetCommitCoordinator<C>,
    consecutive_failures: u32,
    stats: SessionStats,
}

/// Production wiring: Kafka in, Postgres out, Kafka dead letters.
pub type KafkaIngester = Ingester<KafkaReader, PostgresSink, KafkaDeadLetterSink, KafkaCommitter>;

impl KafkaIngester {
    /// Connects every resource up front; any failure here is fatal.
    pub async fn from_settings(name: &str, cfg: &settings::Ingester) -> Result<Self, IngestError> {
        let decoder = get_decoder(&cfg.decoder, cfg.custom.clone())
            .map_err(IngestError::Decoder)?;
        let group = cfg.consumer_group.as_deref().unwrap_or(name);
        let consumer = create_consumer(
            &cfg.kafka_broker,
            group,
            &cfg.topic,
            cfg.max_poll_interval(),
        )?;
        let consumer = Arc::new(consumer);
        let producer = create_producer(&cfg.kafka_broker, cfg.dead_letter_timeout())?;
        let dead_letters = KafkaDeadLetterSink::new(
            producer,
            dead_letter_topic(&cfg.topic, &cfg.dead_letter_suffix),
        );
        let sink =
            PostgresSink::connect(&cfg.warehouse_url, cfg.tables(), cfg.promote_mode).await?;
        sink.setup().await?;
        info!(
            ingester = name,
            topic = cfg.topic.as_str(),
            dead_letter_topic = dead_letters.topic(),
            decoder = %decoder.get_name(),
            "ingester connected"
        );

        Ok(Ingester::new(
            Options::from_settings(name, cfg),
            KafkaReader::new(consumer.clone()),
            decoder,
            DeadLetterRouter::new(dead_letters, cfg.dead_letter_timeout()),
            sink,
            KafkaCommitter::new(consumer, cfg.topic.clone()),
        ))
    }
}

impl<S, W, P, C> Ingester<S, W, P, C>
where
    S: Source,
    W: TransactionalSink,
    P: DeadLetterSink,
    C: OffsetCommitter,
{
    pub fn new(
        options: Options,
        source: S,
        decoder: SharedDecoder,
        dead_letters: DeadLetterRouter<P>,
        sink: W,
        committer: C,
    ) -> Self {
        Ingester {
            accumulator: BatchAccumulator::new(options.batch_size, options.batch_timeout),
            options,
            source,
            decoder,
            dead_letters,
            writer: SinkWriter::new(sink),
            checkpoints: OffsetCommitCoordinator::new(committer),
            consecutive_failures: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    pub fn committed(&self) -> &PartitionOffsets {
        self.checkpoints.committed()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Runs until `shutdown` fires, then drains the current batch and
    /// releases the warehouse connection on every exit path.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<SessionStats, IngestError> {
        let result = self.process(&mut shutdown).await;
        self.writer.close().await;
        self.stats.log(&self.options.name);
        match result {
            Ok(()) => {
                info!(ingester = self.options.name.as_str(), "ingester stopped");
                Ok(self.stats)
            }
            Err(e) => {
                error!(
                    ingester = self.options.name.as_str(),
                    "ingester failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn process(&mut self, shutdown: &mut ShutdownSignal) -> Result<(), IngestError> {
        self.writer.prepare().await?;
        info!(ingester = self.options.name.as_str(), "ingester started");

        while !shutdown.is_triggered() {
            if let Cycle::WriteFailed = self.cycle().await? {
                tokio::select! {
                    _ = sleep(self.options.sink_retry_backoff) => {}
                    _ = shutdown.triggered() => {}
                }
            }
        }

        info!(ingester = self.options.name.as_str(), "shutdown requested");
        self.drain().await
    }

    /// One poll cycle: read up to the batch's remaining capacity, route every
    /// record, then flush if a threshold was reached.
    pub async fn cycle(&mut self) -> Result<Cycle, IngestError> {
        let capacity = self.accumulator.capacity();
        if capacity > 0 {
            let polled = self
                .source
                .poll(self.options.poll_timeout, capacity)
                .await?;
            if !polled.is_empty() {
                debug!(
                    ingester = self.options.name.as_str(),
                    records = polled.len(),
                    "polled records"
                );
            }
            for record in polled {
                let started = Instant::now();
                self.route(record).await?;
                let elapsed = started.elapsed().as_secs_f64();
                histogram!(EVENT_PROCESSING_SECONDS).record(elapsed);
            }
        }
        gauge!(CURRENT_BATCH_SIZE).set(self.accumulator.len() as f64);

        match self.accumulator.poll_completed(Instant::now()) {
            BatchState::Ready => self.flush().await,
            BatchState::Filling => Ok(Cycle::Filling),
            BatchState::Empty => {
                let acknowledged = self.accumulator.take_acknowledged();
                if acknowledged.is_empty() {
                    return Ok(Cycle::Idle);
                }
                let advanced = self.checkpoints.advance(&acknowledged).await?;
                Ok(Cycle::Acknowledged(advanced))
            }
        }
    }

    async fn route(&mut self, record: Record) -> Result<(), IngestError> {
        self.stats.consumed += 1;
        let Record { envelope, payload } = record;
        let Some(payload) = payload else {
            return self
                .reject(Rejection::malformed(
                    envelope,
                    None,
                    "message has no payload".to_owned(),
                ))
                .await;
        };

        let document = match self.decoder.decode(&payload) {
            Ok(document) => document,
            Err(e) => {
                return self
                    .reject(Rejection::malformed(
                        envelope,
                        Some(payload),
                        format!("{e:#}"),
                    ))
                    .await;
            }
        };
        if document_contains_nul(&document) || contains_nul(&envelope.metadata()) {
            return self
                .reject(Rejection::malformed(
                    envelope,
                    Some(payload),
                    "NUL character (U+0000) cannot be stored in jsonb".to_owned(),
                ))
                .await;
        }

        let event = Event::from_document(document);
        match validate(&event) {
            Validation::Valid => {
                counter!(
                    EVENTS_CONSUMED,
                    "event_type" => event.event_type().to_owned(),
                    "status" => "success"
                )
                .increment(1);
                let opening = self.accumulator.state() == BatchState::Empty;
                let state = self.accumulator.push(envelope, event)?;
                if opening {
                    info!(
                        ingester = self.options.name.as_str(),
                        batch_id = %self.accumulator.batch().id(),
                        "batch opened"
                    );
                }
                if state == BatchState::Ready {
                    debug!(
                        ingester = self.options.name.as_str(),
                        records = self.accumulator.len(),
                        "batch reached size threshold"
                    );
                }
                Ok(())
            }
            Validation::Invalid(missing) => {
                let event_type = event.event_type().to_owned();
                self.reject(Rejection::schema_violation(
                    envelope, payload, event_type, &missing,
                ))
                .await
            }
        }
    }

    /// Dead-letters a record and marks its offset as accounted for.
    async fn reject(&mut self, rejection: Rejection) -> Result<(), IngestError> {
        let partition = rejection.envelope.source_partition();
        let offset = rejection.envelope.source_offset();
        let kind = rejection.kind;
        counter!(
            EVENTS_CONSUMED,
            "event_type" => rejection.event_type.clone().unwrap_or_else(|| UNKNOWN.to_owned()),
            "status" => kind.as_str()
        )
        .increment(1);
        warn!(
            ingester = self.options.name.as_str(),
            partition,
            offset,
            error = kind.as_str(),
            "record rejected: {}",
            rejection.detail
        );

        self.dead_letters.reject(rejection).await?;
        self.accumulator.acknowledge(partition, offset);
        *self.stats.dead_lettered.entry(kind.as_str()).or_default() += 1;
        Ok(())
    }

    /// Writes the ready batch, then advances the checkpoint, then resets the
    /// accumulator. On failure the batch stays ready and nothing is committed.
    async fn flush(&mut self) -> Result<Cycle, IngestError> {
        let Some(batch) = self.accumulator.ready_batch() else {
            return Ok(Cycle::Filling);
        };
        let name = self.options.name.as_str();
        let started = Instant::now();
        info!(ingester = name, batch_id = %batch.id(), records = batch.len(), "batch ready");

        match self.writer.write(batch).await {
            Ok(summary) => {
                self.consecutive_failures = 0;
                gauge!(CONSECUTIVE_SINK_FAILURES).set(0.0);
                self.checkpoints.advance(batch.offsets()).await?;
                if let Some(age) = batch.age(Instant::now()) {
                    let age = age.as_secs_f64();
                    histogram!(BATCH_PROCESSING_SECONDS).record(age);
                }
                self.accumulator.reset();
                gauge!(CURRENT_BATCH_SIZE).set(0.0);

                info!(
                    ingester = name,
                    batch_id = %summary.batch_id,
                    records = summary.inserted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch flushed"
                );
                self.stats.record_write(&summary);
                self.stats.log(name);
                Ok(Cycle::Flushed(summary))
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.sink_failures += 1;
                let failures = self.consecutive_failures;
                gauge!(CONSECUTIVE_SINK_FAILURES).set(failures as f64);
                error!(
                    ingester = name,
                    batch_id = %batch.id(),
                    records = batch.len(),
                    failures,
                    "batch write failed, checkpoint unchanged: {e}"
                );

                if failures % self.options.sink_failure_alert_after.max(1) == 0 {
                    counter!(SINK_FAILURE_ALERTS).increment(1);
                    error!(
                        ingester = name,
                        failures,
                        "ALERT: warehouse writes keep failing, operator attention required"
                    );
                }
                if matches!(self.options.max_sink_failures, Some(max) if failures >= max) {
                    return Err(IngestError::SinkExhausted { failures, last: e });
                }
                Ok(Cycle::WriteFailed)
            }
        }
    }

    /// Flushes whatever is buffered, retrying until it lands or the shutdown
    /// timeout expires. An expired drain abandons the batch uncommitted.
    async fn drain(&mut self) -> Result<(), IngestError> {
        if self.accumulator.seal() != BatchState::Ready {
            return Ok(());
        }
        let name = self.options.name.clone();
        let records = self.accumulator.len();
        info!(ingester = name.as_str(), records, "draining current batch");

        let backoff = self.options.sink_retry_backoff;
        let deadline = self.options.shutdown_timeout;
        let drained = timeout(deadline, async {
            loop {
                if let Cycle::Flushed(summary) = self.flush().await? {
                    return Ok::<_, IngestError>(summary);
                }
                sleep(backoff).await;
            }
        })
        .await;

        match drained {
            Ok(Ok(summary)) => {
                info!(
                    ingester = name.as_str(),
                    batch_id = %summary.batch_id,
                    records = summary.inserted,
                    "batch drained"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    ingester = name.as_str(),
                    records,
                    timeout_secs = deadline.as_secs(),
                    "drain timed out, batch abandoned and checkpoint not advanced"
                );
                Ok(())
            }
        }
    }
}
