//! Record → line encoding
//!
//! Every record becomes one JSON object tagged with its stream name:
//!
//! ```text
//! {"table":"audit_event","row":{"id":54321,"eventName":"pageview"}}\n
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::common::EncodeError;

/// One encoded, newline-terminated record
///
/// Immutable once produced; clones share the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(Bytes);

impl Line {
    /// Wrap already-encoded bytes (must end with `\n`)
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Length in bytes, including the trailing newline
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the line is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the underlying buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    table: &'a str,
    row: &'a Map<String, Value>,
}

/// Encodes records for one stream
#[derive(Debug, Clone)]
pub struct RowEncoder {
    stream: Arc<str>,
}

impl RowEncoder {
    /// Create an encoder tagging lines with `stream`
    pub fn new(stream: impl Into<Arc<str>>) -> Self {
        Self {
            stream: stream.into(),
        }
    }

    /// Stream name written into every line
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Encode a JSON record
    ///
    /// # Errors
    ///
    /// `InvalidShape` unless `record` is an object.
    pub fn encode(&self, record: &Value) -> Result<Line, EncodeError> {
        let Value::Object(row) = record else {
            return Err(EncodeError::invalid_shape(value_kind(record)));
        };

        let mut buf = serde_json::to_vec(&Envelope {
            table: &self.stream,
            row,
        })?;
        buf.push(b'\n');
        Ok(Line(Bytes::from(buf)))
    }

    /// Encode any serializable record
    ///
    /// # Errors
    ///
    /// `Serialization` if the value has no JSON form, `InvalidShape` if it is
    /// not a map or struct.
    pub fn encode_serialize<T: Serialize + ?Sized>(&self, record: &T) -> Result<Line, EncodeError> {
        let value = serde_json::to_value(record)?;
        self.encode(&value)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "row_encoder_test.rs"]
mod row_encoder_test;
