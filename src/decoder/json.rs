use anyhow::anyhow;
use serde_json::Value;

use crate::event::Document;

pub struct Decoder;

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("json")
    }

    fn decode(&self, message: &[u8]) -> Result<Document, anyhow::Error> {
        match serde_json::from_slice(message)? {
            Value::Object(document) => Ok(document),
            other => Err(anyhow!("expected a JSON object, got {}", kind(&other))),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
