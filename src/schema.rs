//! Value decoding
//!
//! The value type of a table view is fixed at construction. A
//! `ValueDecoder<V>` turns a raw payload into a `V` and reports which wire
//! schema it understands, so the view can check it against its configuration
//! once instead of inspecting every message.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::SchemaType;

/// Error returned when a payload does not decode into the value type
#[derive(Debug)]
pub enum DecodeError {
    /// Payload is not valid UTF-8
    Utf8(std::str::Utf8Error),
    /// Payload is not a valid JSON document for the value type
    Json(serde_json::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Utf8(e) => write!(f, "payload is not valid UTF-8: {}", e),
            DecodeError::Json(e) => write!(f, "payload is not valid JSON: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Utf8(e) => Some(e),
            DecodeError::Json(e) => Some(e),
        }
    }
}

/// Decodes raw payloads into values of type `V`
pub trait ValueDecoder<V>: Send + Sync + 'static {
    /// Wire schema this decoder reads
    fn schema_type(&self) -> SchemaType;

    fn decode(&self, payload: &[u8]) -> Result<V, DecodeError>;
}

/// A type that can be stored in a table view.
///
/// `raw_decoder` supplies the decoder used when the view is configured with
/// neither a schema nor a decoder. Types without a natural raw form keep the
/// default and must be given a schema.
pub trait TableValue: Clone + Send + Sync + 'static {
    fn raw_decoder() -> Option<Arc<dyn ValueDecoder<Self>>> {
        None
    }
}

impl TableValue for Bytes {
    fn raw_decoder() -> Option<Arc<dyn ValueDecoder<Self>>> {
        Some(Arc::new(BytesDecoder))
    }
}

impl TableValue for String {
    fn raw_decoder() -> Option<Arc<dyn ValueDecoder<Self>>> {
        Some(Arc::new(StringDecoder))
    }
}

impl TableValue for i64 {}
impl TableValue for u64 {}
impl TableValue for f64 {}
impl TableValue for bool {}
impl TableValue for serde_json::Value {}

/// Passes payloads through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl ValueDecoder<Bytes> for BytesDecoder {
    fn schema_type(&self) -> SchemaType {
        SchemaType::Bytes
    }

    fn decode(&self, payload: &[u8]) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// Decodes UTF-8 payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDecoder;

impl ValueDecoder<String> for StringDecoder {
    fn schema_type(&self) -> SchemaType {
        SchemaType::String
    }

    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError> {
        std::str::from_utf8(payload)
            .map(str::to_owned)
            .map_err(DecodeError::Utf8)
    }
}

/// Decodes JSON payloads into any deserializable `T`
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        JsonDecoder {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonDecoder")
    }
}

impl<T: DeserializeOwned + 'static> ValueDecoder<T> for JsonDecoder<T> {
    fn schema_type(&self) -> SchemaType {
        SchemaType::Json
    }

    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(payload).map_err(DecodeError::Json)
    }
}
