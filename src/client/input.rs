//! Pull-based reading of a single event stream
//!
//! For consumers that want the next event when they ask for it and have no
//! use for listeners or reconnection. When the stream ends, it stays ended.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;

use super::connect::open_stream;
use crate::codec::EventParser;
use crate::error::SseResult;
use crate::types::InboundEvent;

type Body = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// One open event stream read event by event
pub struct EventInput {
    body: Option<Body>,
    parser: EventParser,
    pending: VecDeque<InboundEvent>,
}

impl EventInput {
    /// Issue the streaming GET and wait for the response headers
    pub async fn connect(client: &Client, url: &str) -> SseResult<Self> {
        let response = open_stream(client, url, &HeaderMap::new(), None).await?;
        debug!(url, "Event input connected");
        Ok(Self {
            body: Some(Box::pin(response.bytes_stream())),
            parser: EventParser::new(),
            pending: VecDeque::new(),
        })
    }

    /// Next event, or `None` once the stream has ended
    pub async fn read(&mut self) -> SseResult<Option<InboundEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            match body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.feed(&chunk)),
                Some(Err(e)) => {
                    self.body = None;
                    return Err(e.into());
                }
                None => {
                    self.body = None;
                }
            }
        }
    }

    /// Whether the underlying connection has ended
    ///
    /// Events already received may still be waiting in `read`.
    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    /// Drop the connection and anything not read yet
    pub fn close(&mut self) {
        self.body = None;
        self.pending.clear();
    }

    /// Consume the input as a stream; a read error is yielded last
    pub fn into_stream(mut self) -> impl Stream<Item = SseResult<InboundEvent>> + Send {
        async_stream::stream! {
            loop {
                match self.read().await {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventInput")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}
