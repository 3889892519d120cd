//! Core data structures for the SSE engine
//!
//! This module contains the event records exchanged over the wire and the
//! media-type machinery used to serialize outbound payloads.

pub mod event;
pub mod media;

pub use event::{InboundEvent, OutboundEvent, OutboundEventBuilder};
pub use media::{
    JsonSerializer, Payload, PayloadSerializer, PlainTextSerializer, SerializerRegistry,
    APPLICATION_JSON, TEXT_EVENT_STREAM, TEXT_PLAIN,
};
