//! Manages decoders
pub mod avro;
pub mod json;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::event::Document;

/// Confluent [header](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format) length
pub const CONFLUENT_HEADER_LEN: usize = 5;

/// Decoder converts binary message from Kafka into a structured document.
/// Any error it returns classifies the message as a malformed payload.
pub trait Decoder {
    fn get_name(&self) -> String;
    fn decode(&self, message: &[u8]) -> Result<Document, anyhow::Error>;
}

/// Creates decoder of specified name.
pub fn get_decoder(
    name: &str,
    decoder_settings: Option<toml::Value>,
) -> Result<Arc<dyn Decoder + Send + Sync>, anyhow::Error> {
    match name {
        "json" => Ok(Arc::new(json::Decoder)),
        "avro" => match decoder_settings {
            Some(s) => Ok(Arc::new(avro::new(s.try_into()?)?)),
            None => Err(anyhow!("avro config missing")),
        },
        _ => Err(anyhow!("unknown decoder {}", name)),
    }
}
