use bytes::Bytes;
use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::shared::errors::DecodeError;

/// One delivery from the transport, consumed once by the pipeline.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Top-level JSON object of a sensor message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload(Map<String, Value>);

impl DecodedPayload {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(map) => Ok(DecodedPayload(map)),
            other => Err(DecodeError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn as_section(&self) -> Section<'_> {
        Section(&self.0)
    }

    /// Value under `key`; `None` when absent or null.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_section().get(key)
    }

    pub fn section(&self, key: &str) -> Lookup<'_> {
        self.as_section().section(key)
    }
}

impl From<Map<String, Value>> for DecodedPayload {
    fn from(map: Map<String, Value>) -> Self {
        DecodedPayload(map)
    }
}

/// Borrowed view of a nested JSON object.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a>(&'a Map<String, Value>);

impl<'a> Section<'a> {
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        match self.0.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value),
        }
    }

    pub fn section(&self, key: &str) -> Lookup<'a> {
        match self.get(key) {
            None => Lookup::Absent,
            Some(Value::Object(map)) => Lookup::Found(Section(map)),
            Some(other) => Lookup::WrongType(json_kind(other)),
        }
    }
}

/// Result of looking up a nested object.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Found(Section<'a>),
    Absent,
    /// Key present but holds a non-object value of the named JSON kind.
    WrongType(&'static str),
}

pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
