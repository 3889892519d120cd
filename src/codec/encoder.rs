//! Frame encoder for outbound events
//!
//! Field order on the wire: comment lines, `event`, `id`, `retry`, `data`
//! lines, then exactly one blank line.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::SseResult;
use crate::types::{OutboundEvent, PayloadSerializer, SerializerRegistry};

/// Encode an event with an already resolved serializer
pub fn encode(event: &OutboundEvent, serializer: &dyn PayloadSerializer) -> SseResult<Bytes> {
    let data = match event.data() {
        Some(payload) => Some(serializer.serialize(payload)?),
        None => None,
    };

    let mut buf = BytesMut::with_capacity(64 + data.as_ref().map_or(0, String::len));

    if let Some(comment) = event.comment() {
        for line in split_lines(comment) {
            put_field(&mut buf, "", line);
        }
    }
    if let Some(name) = event.name() {
        put_field(&mut buf, "event", name);
    }
    if let Some(id) = event.id() {
        put_field(&mut buf, "id", id);
    }
    if let Some(retry) = event.retry() {
        put_field(&mut buf, "retry", &retry.as_millis().to_string());
    }
    if let Some(data) = &data {
        for line in split_lines(data) {
            put_field(&mut buf, "data", line);
        }
    }

    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Encode an event, resolving its serializer from the registry
pub fn encode_with(event: &OutboundEvent, registry: &SerializerRegistry) -> SseResult<Bytes> {
    let serializer = registry.resolve(event.media_type())?;
    encode(event, serializer.as_ref())
}

fn put_field(buf: &mut BytesMut, field: &str, value: &str) {
    buf.put_slice(field.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_u8(b'\n');
}

// `split('\n')` keeps an empty trailing piece, so "" still yields one line
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonSerializer, PlainTextSerializer};
    use serde_json::json;
    use std::time::Duration;

    fn encode_text(event: &OutboundEvent) -> String {
        let bytes = encode(event, &PlainTextSerializer).unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_full_event() {
        let event = OutboundEvent::builder()
            .comment("greenhouse")
            .name("update")
            .id("7")
            .retry(Duration::from_millis(1500))
            .data("hello\nworld")
            .build()
            .unwrap();

        assert_eq!(
            encode_text(&event),
            ": greenhouse\nevent: update\nid: 7\nretry: 1500\ndata: hello\ndata: world\n\n"
        );
    }

    #[test]
    fn test_encode_comment_only() {
        let event = OutboundEvent::with_comment("ping");
        assert_eq!(encode_text(&event), ": ping\n\n");
    }

    #[test]
    fn test_encode_multiline_comment_and_crlf_data() {
        let event = OutboundEvent::builder()
            .comment("line one\nline two")
            .data("a\r\nb")
            .build()
            .unwrap();
        assert_eq!(
            encode_text(&event),
            ": line one\n: line two\ndata: a\ndata: b\n\n"
        );
    }

    #[test]
    fn test_encode_empty_data() {
        let event = OutboundEvent::with_data("");
        assert_eq!(encode_text(&event), "data: \n\n");
    }

    #[test]
    fn test_encode_json_payload() {
        let event = OutboundEvent::builder()
            .json_data(&json!({"temp": 21}))
            .build()
            .unwrap();
        let bytes = encode(&event, &JsonSerializer).unwrap();
        assert_eq!(&bytes[..], b"data: {\"temp\":21}\n\n");
    }

    #[test]
    fn test_encode_with_registry_resolves_media_type() {
        let registry = SerializerRegistry::standard();
        let event = OutboundEvent::builder()
            .media_type("application/xml")
            .data("<a/>")
            .build()
            .unwrap();
        assert!(encode_with(&event, &registry).is_err());

        let event = OutboundEvent::with_data("plain");
        assert_eq!(&encode_with(&event, &registry).unwrap()[..], b"data: plain\n\n");
    }
}
