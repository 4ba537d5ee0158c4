//! rdkafka client construction
use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    producer::FutureProducer,
    util::Timeout,
    ClientConfig,
};
use tracing::{debug, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {}

/// Consumer settings with manual offset management: nothing is committed
/// unless the offset commit coordinator asks for it.
///
/// While a failed batch is retried the consumer is not polled, so
/// `max_poll_interval` bounds how long a warehouse outage can last before the
/// consumer leaves its group.
pub fn consumer_config(brokers: &str, group: &str, max_poll_interval: Duration) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set(
            "max.poll.interval.ms",
            max_poll_interval.as_millis().to_string(),
        );
    client_config
}

pub fn create_consumer(
    brokers: &str,
    group: &str,
    topic: &str,
    max_poll_interval: Duration,
) -> Result<StreamConsumer, KafkaError> {
    let client_config = consumer_config(brokers, group, max_poll_interval);

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let consumer: StreamConsumer = client_config.create()?;

    // fail fast when brokers are unreachable
    consumer.fetch_metadata(Some(topic), Timeout::After(METADATA_TIMEOUT))?;
    consumer.subscribe(&[topic])?;
    info!(topic, group, "subscribed to kafka topic");
    Ok(consumer)
}

pub fn create_producer(
    brokers: &str,
    message_timeout: Duration,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", brokers)
        .set("linger.ms", "0")
        .set(
            "message.timeout.ms",
            message_timeout.as_millis().to_string(),
        )
        .set("acks", "all");

    debug!("rdkafka producer configuration: {:?}", client_config);
    client_config.create_with_context(KafkaContext {})
}
