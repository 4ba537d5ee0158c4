//! Dead-letter routing for records that cannot be ingested.
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use metrics::counter;
use rdkafka::{
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{event::Envelope, kafka::KafkaContext, metrics::DEAD_LETTERS};

/// Publish attempts before a dead letter is considered lost.
const PUBLISH_ATTEMPTS: u32 = 2;

/// Dead-letter topic for `topic`.
pub fn dead_letter_topic(topic: &str, suffix: &str) -> String {
    format!("{topic}{suffix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaViolation,
    MalformedPayload,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::MalformedPayload => "malformed_payload",
        }
    }
}

/// A record that failed decoding or validation, with its original bytes.
#[derive(Debug)]
pub struct Rejection {
    pub envelope: Envelope,
    pub payload: Option<Vec<u8>>,
    pub kind: ErrorKind,
    pub event_type: Option<String>,
    pub detail: String,
}

impl Rejection {
    pub fn malformed(envelope: Envelope, payload: Option<Vec<u8>>, detail: String) -> Self {
        Rejection {
            envelope,
            payload,
            kind: ErrorKind::MalformedPayload,
            event_type: None,
            detail,
        }
    }

    pub fn schema_violation(
        envelope: Envelope,
        payload: Vec<u8>,
        event_type: String,
        missing: &[&str],
    ) -> Self {
        Rejection {
            envelope,
            payload: Some(payload),
            kind: ErrorKind::SchemaViolation,
            event_type: Some(event_type),
            detail: format!("missing required fields: {}", missing.join(", ")),
        }
    }
}

/// Message published on the dead-letter topic.
///
/// `raw_message` carries the payload verbatim when it is UTF-8; otherwise
/// `raw_message_base64` holds the exact bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message_base64: Option<String>,
    pub error: ErrorKind,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Exact bytes of the rejected payload, if it had one.
    pub fn raw_bytes(&self) -> Option<Vec<u8>> {
        match (&self.raw_message, &self.raw_message_base64) {
            (Some(raw), _) => Some(raw.clone().into_bytes()),
            (None, Some(encoded)) => STANDARD.decode(encoded).ok(),
            (None, None) => None,
        }
    }
}

impl From<Rejection> for DeadLetter {
    fn from(rejection: Rejection) -> Self {
        let (raw_message, raw_message_base64) = match rejection.payload {
            None => (None, None),
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(text) => (Some(text), None),
                Err(e) => (None, Some(STANDARD.encode(e.into_bytes()))),
            },
        };
        DeadLetter {
            raw_message,
            raw_message_base64,
            error: rejection.kind,
            detail: rejection.detail,
            event_type: rejection.event_type,
            topic: rejection.envelope.topic().to_owned(),
            partition: rejection.envelope.source_partition(),
            offset: rejection.envelope.source_offset(),
            key: rejection.envelope.routing_key().map(str::to_owned),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to produce dead letter: {0}")]
    Publish(#[from] KafkaError),
    #[error("dead-letter publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("dead letter for partition {partition} offset {offset} lost after {attempts} attempts: {source}")]
    Exhausted {
        partition: i32,
        offset: i64,
        attempts: u32,
        #[source]
        source: Box<DeadLetterError>,
    },
}

/// Output channel for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        KafkaDeadLetterSink { producer, topic }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(letter)?;
        let mut record = FutureRecord::<str, str>::to(&self.topic).payload(payload.as_str());
        if let Some(key) = letter.key.as_deref() {
            record = record.key(key);
        }
        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map(|_| ())
            .map_err(|(e, _)| DeadLetterError::Publish(e))
    }
}

/// Publishes rejections with a bounded wait and a single retry.
///
/// An error from [`DeadLetterRouter::reject`] means the record could not be
/// preserved and must stop the pipeline.
pub struct DeadLetterRouter<P> {
    publisher: P,
    timeout: Duration,
}

impl<P: DeadLetterSink> DeadLetterRouter<P> {
    pub fn new(publisher: P, timeout: Duration) -> Self {
        DeadLetterRouter { publisher, timeout }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub async fn reject(&self, rejection: Rejection) -> Result<(), DeadLetterError> {
        let letter = DeadLetter::from(rejection);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.timeout, self.publisher.publish(&letter)).await {
                Ok(result) => result,
                Err(_) => Err(DeadLetterError::Timeout(self.timeout)),
            };
            match result {
                Ok(()) => {
                    counter!(DEAD_LETTERS, "error" => letter.error.as_str()).increment(1);
                    info!(
                        partition = letter.partition,
                        offset = letter.offset,
                        error = letter.error.as_str(),
                        "record dead-lettered"
                    );
                    return Ok(());
                }
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(
                        partition = letter.partition,
                        offset = letter.offset,
                        "dead-letter publish failed, retrying: {e}"
                    );
                }
                Err(e) => {
                    return Err(DeadLetterError::Exhausted {
                        partition: letter.partition,
                        offset: letter.offset,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }
}
