//! Generic decoder for single-datum Avro records.
//!
//! ```toml
//! custom.schema_file = "./sales_event.avsc"
//! custom.confluent_header = true   # strip the 5-byte schema registry header
//! ```
use std::{fs, time::Duration};

use anyhow::{anyhow, Context};
use apache_avro::{from_avro_datum, types::Value, Schema};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::{Map, Number, Value as JsonValue};

use super::CONFLUENT_HEADER_LEN;
use crate::event::Document;

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// path to the writer schema
    pub schema_file: String,
    /// messages are framed with the Confluent wire-format header (default: false)
    #[serde(default)]
    pub confluent_header: bool,
}

pub struct Decoder {
    schema: Schema,
    confluent_header: bool,
}

pub fn new(settings: Settings) -> Result<Decoder, anyhow::Error> {
    let schema = fs::read_to_string(&settings.schema_file)
        .with_context(|| format!("reading avro schema {}", settings.schema_file))?;
    from_schema(&schema, settings.confluent_header)
}

pub fn from_schema(schema: &str, confluent_header: bool) -> Result<Decoder, anyhow::Error> {
    Ok(Decoder {
        schema: Schema::parse_str(schema)?,
        confluent_header,
    })
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("avro")
    }

    fn decode(&self, message: &[u8]) -> Result<Document, anyhow::Error> {
        let mut datum = if self.confluent_header {
            match message {
                [0, ..] if message.len() >= CONFLUENT_HEADER_LEN => {
                    &message[CONFLUENT_HEADER_LEN..]
                }
                _ => return Err(anyhow!("missing confluent wire-format header")),
            }
        } else {
            message
        };
        let value = from_avro_datum(&self.schema, &mut datum, None)
            .map_err(|e| anyhow!("avro unmarshalling: {e}"))?;
        match avro2json(value)? {
            JsonValue::Object(document) => Ok(document),
            _ => Err(anyhow!("avro message must be a record")),
        }
    }
}

fn avro2json(v: Value) -> Result<JsonValue, anyhow::Error> {
    match v {
        Value::Null => Ok(JsonValue::Null),
        Value::Boolean(x) => Ok(JsonValue::Bool(x)),
        Value::Int(x) => Ok(JsonValue::from(x)),
        Value::Long(x) => Ok(JsonValue::from(x)),
        Value::Float(x) => Ok(float(f64::from(x))),
        Value::Double(x) => Ok(float(x)),
        Value::Bytes(x) => Ok(JsonValue::String(STANDARD.encode(x))),
        Value::Fixed(_, x) => Ok(JsonValue::String(STANDARD.encode(x))),
        Value::String(x) => Ok(JsonValue::String(x)),
        Value::Enum(_, symbol) => Ok(JsonValue::String(symbol)),
        Value::Union(_, inner) => avro2json(*inner),
        Value::Array(items) => items
            .into_iter()
            .map(avro2json)
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        Value::Map(entries) => {
            let mut m = Map::new();
            for (k, v) in entries {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Record(fields) => {
            let mut m = Map::new();
            for (k, v) in fields {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Date(x) => Ok(JsonValue::from(x)),
        Value::TimeMillis(x) => Ok(JsonValue::from(x)),
        Value::TimeMicros(x) => Ok(JsonValue::from(x)),
        Value::TimestampMillis(x) => Ok(JsonValue::from(x)),
        Value::TimestampMicros(x) => Ok(JsonValue::from(x)),
        Value::LocalTimestampMillis(x) => Ok(JsonValue::from(x)),
        Value::LocalTimestampMicros(x) => Ok(JsonValue::from(x)),
        Value::Duration(x) => {
            // months are taken as 30 days
            let duration = Duration::from_millis(u32::from(x.millis()) as u64)
                + Duration::from_secs(86400 * u32::from(x.days()) as u64)
                + Duration::from_secs(30 * 86400 * u32::from(x.months()) as u64);
            Ok(JsonValue::from(duration.as_millis() as u64))
        }
        Value::Uuid(x) => Ok(JsonValue::String(x.to_string())),
        Value::Decimal(_) => Err(anyhow!("unsupported decimal type")),
        #[allow(unreachable_patterns)]
        other => Err(anyhow!("unsupported avro value {:?}", other)),
    }
}

fn float(x: f64) -> JsonValue {
    Number::from_f64(x).map_or(JsonValue::Null, JsonValue::Number)
}
