//! Outbound and inbound event records

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::media::{Payload, APPLICATION_JSON, TEXT_PLAIN};
use crate::error::{SseError, SseResult};

/// Event produced by a server endpoint and pushed to subscribers
///
/// Immutable once built. At least one of `comment` and `data` is present.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    name: Option<String>,
    id: Option<String>,
    comment: Option<String>,
    media_type: String,
    retry: Option<Duration>,
    data: Option<Payload>,
}

impl OutboundEvent {
    /// Start building an event
    pub fn builder() -> OutboundEventBuilder {
        OutboundEventBuilder::default()
    }

    /// Plain text data event without name or id
    pub fn with_data(data: impl Into<Payload>) -> Self {
        Self {
            name: None,
            id: None,
            comment: None,
            media_type: TEXT_PLAIN.to_string(),
            retry: None,
            data: Some(data.into()),
        }
    }

    /// Comment-only event, used for heartbeats and acknowledgements
    pub fn with_comment(comment: impl Into<String>) -> Self {
        Self {
            name: None,
            id: None,
            comment: Some(comment.into()),
            media_type: TEXT_PLAIN.to_string(),
            retry: None,
            data: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Media type the data is serialized with
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Reconnect delay advertised to the client
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    pub fn data(&self) -> Option<&Payload> {
        self.data.as_ref()
    }
}

/// Builder for [`OutboundEvent`]
#[derive(Debug, Default)]
pub struct OutboundEventBuilder {
    name: Option<String>,
    id: Option<String>,
    comment: Option<String>,
    media_type: Option<String>,
    retry: Option<Duration>,
    data: Option<Payload>,
    error: Option<SseError>,
}

impl OutboundEventBuilder {
    /// Set the event name (`event:` field)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the event id (`id:` field)
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the comment; multi-line comments are allowed
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the media type used to serialize `data`
    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Set the reconnect delay (`retry:` field)
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the data payload
    pub fn data(mut self, data: impl Into<Payload>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set a JSON payload; defaults the media type to `application/json`
    pub fn json_data<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.data = Some(Payload::Json(value));
                if self.media_type.is_none() {
                    self.media_type = Some(APPLICATION_JSON.to_string());
                }
            }
            Err(e) => self.error = Some(e.into()),
        }
        self
    }

    /// Validate and build the event
    pub fn build(self) -> SseResult<OutboundEvent> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.comment.is_none() && self.data.is_none() {
            return Err(SseError::InvalidEvent(
                "an event needs a comment or data".to_string(),
            ));
        }
        if let Some(name) = &self.name {
            ensure_single_line("name", name)?;
        }
        if let Some(id) = &self.id {
            ensure_single_line("id", id)?;
            if id.contains('\0') {
                return Err(SseError::InvalidEvent("id must not contain NUL".to_string()));
            }
        }

        Ok(OutboundEvent {
            name: self.name,
            id: self.id,
            comment: self.comment,
            media_type: self.media_type.unwrap_or_else(|| TEXT_PLAIN.to_string()),
            retry: self.retry,
            data: self.data,
        })
    }
}

fn ensure_single_line(field: &str, value: &str) -> SseResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(SseError::InvalidEvent(format!(
            "{} must not contain line breaks",
            field
        )));
    }
    Ok(())
}

/// Event reconstructed by the client from wire bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEvent {
    pub(crate) id: Option<String>,
    pub(crate) name: Option<String>,
    pub(crate) comment: Option<String>,
    pub(crate) data: String,
    pub(crate) reconnect_delay: Option<Duration>,
}

impl InboundEvent {
    /// Id carried by this frame, if any
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Event name; `None` means the default `message` type
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Joined `data:` lines
    pub fn read_data(&self) -> &str {
        &self.data
    }

    /// Decode the data as JSON
    pub fn read_data_as<T: DeserializeOwned>(&self) -> SseResult<T> {
        Ok(serde_json::from_str(&self.data)?)
    }

    /// Reconnect delay advertised by this frame's `retry:` field
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay
    }

    /// Whether the frame carried only a comment
    pub fn is_comment_only(&self) -> bool {
        self.comment.is_some() && self.data.is_empty() && self.name.is_none()
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InboundEvent{{")?;
        if let Some(name) = &self.name {
            write!(f, "name={}, ", name)?;
        }
        if let Some(id) = &self.id {
            write!(f, "id={}, ", id)?;
        }
        if let Some(comment) = &self.comment {
            write!(f, "comment={}, ", comment)?;
        }
        write!(f, "data={}}}", self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_requires_comment_or_data() {
        let err = OutboundEvent::builder().name("update").build().unwrap_err();
        assert!(matches!(err, SseError::InvalidEvent(_)));

        assert!(OutboundEvent::builder().comment("ack").build().is_ok());
        assert!(OutboundEvent::builder().data("x").build().is_ok());
    }

    #[test]
    fn test_builder_rejects_multiline_id_and_name() {
        let err = OutboundEvent::builder().id("1\n2").data("x").build().unwrap_err();
        assert!(matches!(err, SseError::InvalidEvent(_)));

        let err = OutboundEvent::builder().name("a\rb").data("x").build().unwrap_err();
        assert!(matches!(err, SseError::InvalidEvent(_)));
    }

    #[test]
    fn test_json_data_sets_media_type() {
        let event = OutboundEvent::builder()
            .json_data(&json!({"temp": 21}))
            .build()
            .unwrap();
        assert_eq!(event.media_type(), APPLICATION_JSON);
        assert_eq!(event.data(), Some(&Payload::Json(json!({"temp": 21}))));

        let event = OutboundEvent::builder()
            .media_type("application/vnd.custom+json")
            .json_data(&json!([1, 2]))
            .build()
            .unwrap();
        assert_eq!(event.media_type(), "application/vnd.custom+json");
    }

    #[test]
    fn test_default_media_type_is_text() {
        let event = OutboundEvent::with_data("hello");
        assert_eq!(event.media_type(), TEXT_PLAIN);
        assert!(event.comment().is_none());
    }

    #[test]
    fn test_inbound_read_data_as() {
        let event = InboundEvent {
            data: r#"{"status":"Done"}"#.to_string(),
            ..Default::default()
        };
        let value: serde_json::Value = event.read_data_as().unwrap();
        assert_eq!(value["status"], "Done");
    }

    #[test]
    fn test_inbound_display() {
        let event = InboundEvent {
            name: Some("update".to_string()),
            id: Some("7".to_string()),
            data: "hello".to_string(),
            ..Default::default()
        };
        assert_eq!(event.to_string(), "InboundEvent{name=update, id=7, data=hello}");
    }
}
