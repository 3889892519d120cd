//! Outbound SSE connection
//!
//! An endpoint turns its request into a stream by extracting an
//! [`SseContext`] and calling [`SseContext::obtain_outbound_connection`].
//! That yields the [`OutboundConnection`] the endpoint writes events to and
//! the [`SseResponse`] it returns to axum. The two are joined by a bounded
//! channel: writes wait when the client is slow, up to the write timeout,
//! and fail once the client has gone away and the response body was dropped.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    async_trait,
    body::Body,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::codec::encode;
use crate::error::{SseError, SseResult};
use crate::types::media::essence;
use crate::types::{OutboundEvent, PayloadSerializer, SerializerRegistry, TEXT_EVENT_STREAM, TEXT_PLAIN};

/// Header carrying the id of the last event a reconnecting client saw
pub const LAST_EVENT_ID: &str = "last-event-id";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Frame = Result<Bytes, Infallible>;

/// Marshalling context and buffering for new connections
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Serializers available to the connection, captured at creation
    pub registry: Arc<SerializerRegistry>,
    /// Media type resolved up front; most events use it
    pub default_media_type: String,
    /// Frames buffered before `write` waits on the client
    pub channel_capacity: usize,
    /// Longest a `write` waits for buffer space before the client is
    /// considered stalled and the connection is closed
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            registry: Arc::new(SerializerRegistry::standard()),
            default_media_type: TEXT_PLAIN.to_string(),
            channel_capacity: 64,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    /// Options with a custom channel capacity
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            ..Default::default()
        }
    }
}

/// Request context an endpoint can suspend into an event stream
#[derive(Debug, Clone)]
pub struct SseContext {
    method: Method,
    accepts_event_stream: bool,
    last_event_id: Option<String>,
}

impl SseContext {
    /// Build the context from request parts
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            accepts_event_stream: accepts_event_stream(&parts.headers),
            last_event_id: parts
                .headers
                .get(LAST_EVENT_ID)
                .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
                .map(str::to_string),
        }
    }

    /// `Last-Event-ID` sent by a reconnecting client
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Whether the request can carry a streaming response body
    pub fn is_suspendable(&self) -> bool {
        self.method != Method::HEAD && self.accepts_event_stream
    }

    /// Take the request out of the normal response cycle
    ///
    /// Consumes the context: a request is suspended at most once.
    pub fn obtain_outbound_connection(
        self,
        options: &ConnectionOptions,
    ) -> SseResult<(Arc<OutboundConnection>, SseResponse)> {
        if self.method == Method::HEAD {
            return Err(SseError::precondition("HEAD requests cannot stream events"));
        }
        if !self.accepts_event_stream {
            return Err(SseError::precondition(format!(
                "client does not accept {}",
                TEXT_EVENT_STREAM
            )));
        }
        OutboundConnection::channel(options)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SseContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept.split(',').map(essence).any(|media| {
        media == TEXT_EVENT_STREAM || media == "text/*" || media == "*/*"
    })
}

/// Server end of one subscriber's event stream
///
/// Writes are serialized by an internal lock, so the connection can be
/// shared between producer tasks. `close` does not wait for a write in
/// progress; that write fails with `ClosedConnection`.
pub struct OutboundConnection {
    id: u64,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    write_lock: tokio::sync::Mutex<()>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
    default_media_type: String,
    default_serializer: Arc<dyn PayloadSerializer>,
    registry: Arc<SerializerRegistry>,
}

impl OutboundConnection {
    /// Create a connection and the response body it feeds
    ///
    /// Endpoints normally go through [`SseContext::obtain_outbound_connection`].
    pub fn channel(options: &ConnectionOptions) -> SseResult<(Arc<Self>, SseResponse)> {
        let default_serializer = options.registry.resolve(&options.default_media_type)?;
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender: Mutex::new(Some(tx)),
            write_lock: tokio::sync::Mutex::new(()),
            write_timeout: options.write_timeout,
            closed: watch::Sender::new(false),
            default_media_type: essence(&options.default_media_type),
            default_serializer,
            registry: Arc::clone(&options.registry),
        });
        info!(connection = connection.id, "Opened outbound SSE connection");

        Ok((connection, SseResponse { stream: ReceiverStream::new(rx) }))
    }

    /// Process-unique id, used in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Encode and send one event
    ///
    /// Waits while the client is not draining the stream, at most the write
    /// timeout. Fails with `ClosedConnection` after `close()` and with
    /// `TransportFailure` once the client has disconnected or stalled; the
    /// latter also closes the connection.
    pub async fn write(&self, event: &OutboundEvent) -> SseResult<()> {
        let _serial = self.write_lock.lock().await;
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(SseError::ClosedConnection);
        };

        let frame = self.encode(event)?;
        let sent = tokio::select! {
            biased;
            sent = sender.send_timeout(Ok(frame), self.write_timeout) => sent,
            _ = self.closed() => return Err(SseError::ClosedConnection),
        };
        match sent {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => {
                self.mark_closed();
                debug!(connection = self.id, "Client went away during write");
                Err(SseError::transport("client disconnected"))
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.mark_closed();
                debug!(connection = self.id, timeout = ?self.write_timeout, "Client stalled during write");
                Err(SseError::transport(format!(
                    "client did not drain the stream within {:?}",
                    self.write_timeout
                )))
            }
        }
    }

    /// End the response; later writes fail, later closes do nothing
    pub async fn close(&self) {
        if self.mark_closed() {
            info!(connection = self.id, "Closed outbound SSE connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed
    ///
    /// That is an explicit `close()`, a failed write, or the response body
    /// being dropped because the client went away.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return;
        };
        tokio::select! {
            // The watch sender lives in `self`, so the channel cannot close under us
            _ = rx.wait_for(|closed| *closed) => {}
            _ = sender.closed() => {
                if self.mark_closed() {
                    debug!(connection = self.id, "Response body dropped");
                }
            }
        }
    }

    /// Drop the frame sender; true if this call did the closing
    fn mark_closed(&self) -> bool {
        let sender = self.sender.lock().take();
        self.closed.send_replace(true);
        sender.is_some()
    }

    fn encode(&self, event: &OutboundEvent) -> SseResult<Bytes> {
        if essence(event.media_type()) == self.default_media_type {
            encode(event, self.default_serializer.as_ref())
        } else {
            let serializer = self.registry.resolve(event.media_type())?;
            encode(event, serializer.as_ref())
        }
    }
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Streaming `text/event-stream` response fed by an [`OutboundConnection`]
///
/// Also a [`Stream`] of encoded frames, which is how tests read it.
pub struct SseResponse {
    stream: ReceiverStream<Frame>,
}

impl Stream for SseResponse {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(frame)),
            Poll::Ready(Some(Err(never))) => match never {},
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.stream));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_EVENT_STREAM));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use futures::StreamExt;

    fn context(method: Method, accept: Option<&str>) -> SseContext {
        let mut builder = Request::builder().method(method).uri("/events");
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        SseContext::from_parts(&parts)
    }

    #[test]
    fn test_context_suspendable() {
        assert!(context(Method::GET, None).is_suspendable());
        assert!(context(Method::GET, Some("text/event-stream")).is_suspendable());
        assert!(context(Method::GET, Some("text/html, */*;q=0.1")).is_suspendable());
        assert!(!context(Method::GET, Some("application/json")).is_suspendable());
        assert!(!context(Method::HEAD, None).is_suspendable());
    }

    #[test]
    fn test_obtain_requires_suspendable_context() {
        let err = context(Method::HEAD, None)
            .obtain_outbound_connection(&ConnectionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, SseError::PreconditionFailure(_)));

        let err = context(Method::GET, Some("application/json"))
            .obtain_outbound_connection(&ConnectionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, SseError::PreconditionFailure(_)));
    }

    #[test]
    fn test_context_reads_last_event_id() {
        let (parts, _) = Request::builder()
            .uri("/events")
            .header("Last-Event-ID", "41")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(SseContext::from_parts(&parts).last_event_id(), Some("41"));
    }

    #[test]
    fn test_context_reads_utf8_last_event_id() {
        let (parts, _) = Request::builder()
            .uri("/events")
            .header("Last-Event-ID", HeaderValue::from_bytes("évt-5".as_bytes()).unwrap())
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(SseContext::from_parts(&parts).last_event_id(), Some("évt-5"));
    }

    #[tokio::test]
    async fn test_write_then_read_frames() {
        let (connection, mut body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();

        connection.write(&OutboundEvent::with_data("one")).await.unwrap();
        connection.write(&OutboundEvent::with_comment("ping")).await.unwrap();

        assert_eq!(&body.next().await.unwrap()[..], b"data: one\n\n");
        assert_eq!(&body.next().await.unwrap()[..], b": ping\n\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_body() {
        let (connection, mut body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        assert!(!connection.is_closed());

        connection.close().await;
        connection.close().await;
        assert!(connection.is_closed());
        assert!(body.next().await.is_none());

        let err = connection.write(&OutboundEvent::with_data("late")).await.unwrap_err();
        assert_eq!(err, SseError::ClosedConnection);
    }

    #[tokio::test]
    async fn test_dropped_body_is_transport_failure() {
        let (connection, body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        drop(body);

        let err = connection.write(&OutboundEvent::with_data("x")).await.unwrap_err();
        assert!(err.is_transport());
        assert!(connection.is_closed());

        // Once failed, the connection reports closed
        let err = connection.write(&OutboundEvent::with_data("y")).await.unwrap_err();
        assert_eq!(err, SseError::ClosedConnection);
    }

    #[tokio::test]
    async fn test_stalled_client_times_out_write() {
        let options = ConnectionOptions {
            channel_capacity: 1,
            write_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (connection, _body) = OutboundConnection::channel(&options).unwrap();

        connection.write(&OutboundEvent::with_data("fills the buffer")).await.unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            connection.write(&OutboundEvent::with_data("never drained")),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.is_transport());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_blocked_write() {
        let options = ConnectionOptions {
            channel_capacity: 1,
            write_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (connection, _body) = OutboundConnection::channel(&options).unwrap();
        connection.write(&OutboundEvent::with_data("fills the buffer")).await.unwrap();

        let blocked = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.write(&OutboundEvent::with_data("blocked")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), connection.close())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SseError::ClosedConnection));
    }

    #[tokio::test]
    async fn test_closed_resolves_when_body_dropped() {
        let (connection, body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        let waiter = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.closed().await })
        };

        drop(body);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (connection, _body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        let waiter = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.closed().await })
        };

        connection.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already closed: resolves immediately
        connection.closed().await;
    }

    #[tokio::test]
    async fn test_non_default_media_type_uses_registry() {
        let (connection, mut body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        let event = OutboundEvent::builder()
            .json_data(&serde_json::json!({"ok": true}))
            .build()
            .unwrap();
        connection.write(&event).await.unwrap();
        assert_eq!(&body.next().await.unwrap()[..], b"data: {\"ok\":true}\n\n");

        let event = OutboundEvent::builder()
            .media_type("application/xml")
            .data("<a/>")
            .build()
            .unwrap();
        let err = connection.write(&event).await.unwrap_err();
        assert!(matches!(err, SseError::Serialization(_)));
        assert!(!connection.is_closed());
    }

    #[test]
    fn test_response_headers() {
        let (_connection, body) = OutboundConnection::channel(&ConnectionOptions::default()).unwrap();
        let response = body.into_response();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TEXT_EVENT_STREAM
        );
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
    }
}
