//! Staged, transactional writes of batches into the warehouse.
pub mod postgres;

use std::{collections::BTreeMap, time::Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    batch::Batch,
    metrics::{BATCH_SIZE, BATCH_WRITE_SECONDS, EVENTS_INSERTED, STALE_STAGING_ROWS},
};

/// Errors from sink operations. sqlx errors are wrapped with the command that failed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection failed with: {0}")]
    Connection(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("failed to encode event at partition {partition} offset {offset}: {error}")]
    Encode {
        partition: i32,
        offset: i64,
        error: serde_json::Error,
    },
    #[error("no open transaction")]
    NoTransaction,
    #[error("staged {staged} rows but promoted {promoted}")]
    StagingMismatch { staged: u64, promoted: u64 },
}

/// One row of the staging area: two text columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub metadata: String,
    pub content: String,
}

/// Transactional surface of the warehouse.
///
/// `begin` opens a unit of work over an empty staging area, `stage` appends
/// rows to it, `promote` moves staged rows into the permanent table and clears
/// the staging area. Nothing is visible until `commit`; `rollback` restores
/// both tables.
#[async_trait]
pub trait TransactionalSink: Send {
    /// Clears rows orphaned by a crash between staging and promotion.
    /// Returns how many were removed.
    async fn reconcile_staging(&mut self) -> Result<u64, SinkError>;
    async fn begin(&mut self) -> Result<(), SinkError>;
    async fn stage(&mut self, rows: &[StagedRow]) -> Result<(), SinkError>;
    async fn promote(&mut self) -> Result<u64, SinkError>;
    async fn commit(&mut self) -> Result<(), SinkError>;
    async fn rollback(&mut self) -> Result<(), SinkError>;
    /// Releases the underlying connections.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub batch_id: Uuid,
    pub inserted: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Serializes each event with its envelope metadata.
pub fn serialize(batch: &Batch) -> Result<Vec<StagedRow>, SinkError> {
    let batch_id = batch.id().to_string();
    batch
        .records()
        .iter()
        .map(|(envelope, event)| {
            let encode_error = |error| SinkError::Encode {
                partition: envelope.source_partition(),
                offset: envelope.source_offset(),
                error,
            };
            let mut metadata = envelope.metadata();
            if let Some(object) = metadata.as_object_mut() {
                object.insert("batch_id".to_owned(), batch_id.clone().into());
            }
            Ok(StagedRow {
                metadata: serde_json::to_string(&metadata).map_err(encode_error)?,
                content: event.content().map_err(encode_error)?,
            })
        })
        .collect()
}

pub struct SinkWriter<W> {
    sink: W,
}

impl<W: TransactionalSink> SinkWriter<W> {
    pub fn new(sink: W) -> Self {
        SinkWriter { sink }
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Startup check of the staging area.
    pub async fn prepare(&mut self) -> Result<(), SinkError> {
        let stale = self.sink.reconcile_staging().await?;
        if stale > 0 {
            counter!(STALE_STAGING_ROWS).increment(stale);
        }
        Ok(())
    }

    /// Writes the whole batch as one unit of work, or nothing at all.
    pub async fn write(&mut self, batch: &Batch) -> Result<WriteSummary, SinkError> {
        let start = Instant::now();
        let rows = serialize(batch)?;

        let mut by_type = BTreeMap::new();
        for (_, event) in batch.records() {
            *by_type.entry(event.event_type().to_owned()).or_insert(0u64) += 1;
        }

        match self.write_rows(&rows).await {
            Ok(inserted) => {
                histogram!(BATCH_SIZE).record(rows.len() as f64);
                let elapsed = start.elapsed().as_secs_f64();
                histogram!(BATCH_WRITE_SECONDS).record(elapsed);
                for (event_type, count) in &by_type {
                    counter!(EVENTS_INSERTED, "event_type" => event_type.clone()).increment(*count);
                    info!(
                        batch_id = %batch.id(),
                        event_type = event_type.as_str(),
                        count = *count,
                        "events inserted"
                    );
                }
                Ok(WriteSummary {
                    batch_id: batch.id(),
                    inserted,
                    by_type,
                })
            }
            Err(e) => {
                if let Err(rollback_error) = self.sink.rollback().await {
                    error!(batch_id = %batch.id(), "rollback failed: {rollback_error}");
                } else {
                    info!(batch_id = %batch.id(), "write rolled back");
                }
                Err(e)
            }
        }
    }

    async fn write_rows(&mut self, rows: &[StagedRow]) -> Result<u64, SinkError> {
        self.sink.begin().await?;
        self.sink.stage(rows).await?;
        let promoted = self.sink.promote().await?;
        let staged = rows.len() as u64;
        if promoted != staged {
            return Err(SinkError::StagingMismatch { staged, promoted });
        }
        self.sink.commit().await?;
        Ok(promoted)
    }

    pub async fn close(&mut self) {
        self.sink.close().await
    }
}
