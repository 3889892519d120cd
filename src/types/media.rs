//! Media types and payload serializers
//!
//! Outbound payloads are rendered to text by a [`PayloadSerializer`]
//! looked up by media type in a [`SerializerRegistry`]. The registry is
//! captured by value when an outbound connection is created, so writes never
//! consult ambient state.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{SseError, SseResult};

/// Media type of an event stream response
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// Plain text payloads (the default for outbound events)
pub const TEXT_PLAIN: &str = "text/plain";

/// JSON payloads
pub const APPLICATION_JSON: &str = "application/json";

/// Payload carried in the `data` field of an outbound event
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
    Json(Value),
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Strip parameters and normalize case: `Text/Plain; charset=utf-8` -> `text/plain`
pub fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Renders a payload to the text placed in `data:` lines
pub trait PayloadSerializer: Send + Sync {
    /// Serialize the payload for the wire
    fn serialize(&self, payload: &Payload) -> SseResult<String>;
}

/// `text/plain` serializer
pub struct PlainTextSerializer;

impl PayloadSerializer for PlainTextSerializer {
    fn serialize(&self, payload: &Payload) -> SseResult<String> {
        match payload {
            Payload::Text(text) => Ok(text.clone()),
            Payload::Binary(bytes) => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| SseError::serialization(format!("payload is not UTF-8: {}", e))),
            Payload::Json(Value::String(text)) => Ok(text.clone()),
            Payload::Json(value) => Ok(value.to_string()),
        }
    }
}

/// `application/json` serializer
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize(&self, payload: &Payload) -> SseResult<String> {
        match payload {
            Payload::Json(value) => Ok(serde_json::to_string(value)?),
            Payload::Text(text) => Ok(serde_json::to_string(text)?),
            Payload::Binary(bytes) => {
                // Binary JSON must already be a valid document
                let value: Value = serde_json::from_slice(bytes)?;
                Ok(serde_json::to_string(&value)?)
            }
        }
    }
}

/// Registry mapping media type -> serializer
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn PayloadSerializer>>,
}

impl SerializerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `text/plain` and `application/json` serializers
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(TEXT_PLAIN, Arc::new(PlainTextSerializer));
        registry.register(APPLICATION_JSON, Arc::new(JsonSerializer));
        registry
    }

    /// Register (or replace) the serializer for a media type
    pub fn register(&mut self, media_type: &str, serializer: Arc<dyn PayloadSerializer>) -> &mut Self {
        self.serializers.insert(essence(media_type), serializer);
        self
    }

    /// Look up the serializer for a media type
    pub fn resolve(&self, media_type: &str) -> SseResult<Arc<dyn PayloadSerializer>> {
        self.serializers
            .get(&essence(media_type))
            .cloned()
            .ok_or_else(|| {
                SseError::serialization(format!("no serializer registered for '{}'", media_type))
            })
    }

    /// Number of registered media types
    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.serializers.keys().collect();
        keys.sort();
        f.debug_struct("SerializerRegistry").field("media_types", &keys).finish()
    }
}
