//! ## eltpipe
//! At-least-once ELT ingestion of business events from Kafka into a Postgres warehouse.
//!
//! Raw events land as semi-structured documents in a permanent raw-event table;
//! transformation is left to downstream warehouse queries.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! metrics_bind = "0.0.0.0:9100"
//!
//! [ingesters.sales]
//! decoder = "json"
//! kafka_broker = "localhost:9092"
//! topic = "sales_events"                  # dead letters go to sales_events_dlq
//! batch_size = 100
//! batch_timeout_seconds = 10
//! warehouse_url = "postgres://eltpipe@localhost:5432/warehouse"
//! warehouse_schema = "raw_data"
//! raw_table = "raw_events_stream"
//! staging_table = "stg_raw_events_stream"
//! ```
//! Any key can be overridden from the environment, e.g.
//! `ELTPIPE__INGESTERS__SALES__WAREHOUSE_URL`.
//!
//! ## Pipeline
//! Each configured ingester runs one sequential loop:
//! [reader] polls a bounded window of records, every record is decoded by a
//! [decoder] and checked by the [validator], valid events are buffered by the
//! [batch] accumulator and invalid ones go to the [dead_letter] topic.
//! Once the batch reaches its size or age threshold, the [sink] writer stages it
//! and promotes it into the raw table in one transaction, and only then the
//! [checkpoint] coordinator commits the consumer group offsets.
//!
//! A failed write rolls back and leaves the checkpoint where it was, so nothing
//! is lost; a crash after the warehouse commit but before the offset commit
//! re-delivers the batch, so duplicates are possible.
//!
//! ## Extending
//! Payload formats are pluggable through the [Decoder] trait, the warehouse
//! through [TransactionalSink].
//!
//! [Decoder]: decoder::Decoder
//! [TransactionalSink]: sink::TransactionalSink

pub mod batch;
pub mod checkpoint;
pub mod dead_letter;
pub mod decoder;
pub mod event;
pub mod ingester;
pub mod kafka;
pub mod metrics;
pub mod reader;
pub mod settings;
pub mod shutdown;
pub mod sink;
pub mod validator;
