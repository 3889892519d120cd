//! Reconnecting event source
//!
//! # Lifecycle
//!
//! ```text
//! IDLE --open()--> OPEN --close()--> CLOSED
//!                    |
//!                    +--fatal failure--> CLOSED
//! ```
//!
//! While OPEN a background task owns the parser. It connects, dispatches
//! every event to the listeners in order, and when the stream ends or fails
//! it reports the error once, waits the reconnect delay and connects again
//! with `Last-Event-ID`. Only `close()` dispatches `on_complete`, and it
//! returns after the task has stopped, so no callback fires afterwards.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connect::{is_fatal, open_stream};
use super::listener::{Listener, ListenerId, ListenerRegistry};
use crate::codec::EventParser;
use crate::error::{SseError, SseResult};
use crate::types::InboundEvent;

/// Default delay before reconnecting
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default longest silence on an open stream; above common 30 s heartbeats
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(45);

/// Lifecycle state of an [`EventSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, not opened yet
    Idle,
    /// Streaming or reconnecting
    Open,
    /// Closed by the user or by a fatal failure
    Closed,
}

/// Reconnect policy and request settings
#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    /// Delay before reconnecting until the server sends `retry:`
    pub reconnect_delay: Duration,
    /// Delay after an error status; `None` uses the current reconnect delay
    pub error_status_delay: Option<Duration>,
    /// Longest silence tolerated on an open stream; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Connect timeout of the default HTTP client
    pub connect_timeout: Duration,
    /// Extra headers sent with every request
    pub headers: HeaderMap,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            error_status_delay: None,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            connect_timeout: Duration::from_secs(10),
            headers: HeaderMap::new(),
        }
    }
}

impl EventSourceConfig {
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn error_status_delay(mut self, delay: Duration) -> Self {
        self.error_status_delay = Some(delay);
        self
    }

    /// Treat a stream that stays silent this long as failed
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Never treat a silent stream as failed
    #[must_use]
    pub fn without_read_timeout(mut self) -> Self {
        self.read_timeout = None;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// State shared between the handle and its read loop
#[derive(Debug)]
struct Shared {
    state: Mutex<ReadyState>,
    last_event_id: Mutex<Option<String>>,
    reconnect_delay: Mutex<Duration>,
}

/// Client end of a reconnecting event stream
pub struct EventSource {
    url: String,
    client: Client,
    config: EventSourceConfig,
    listeners: Arc<ListenerRegistry>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventSource {
    /// Source for `url` with its own HTTP client
    pub fn new(url: impl Into<String>, config: EventSourceConfig) -> SseResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SseError::Config(format!("failed to build HTTP client: {}", e)))?;
        Self::with_client(client, url, config)
    }

    /// Source sharing an existing HTTP client
    pub fn with_client(client: Client, url: impl Into<String>, config: EventSourceConfig) -> SseResult<Self> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| SseError::Config(format!("invalid URL '{}': {}", url, e)))?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ReadyState::Idle),
            last_event_id: Mutex::new(None),
            reconnect_delay: Mutex::new(config.reconnect_delay),
        });
        Ok(Self {
            url,
            client,
            config,
            listeners: Arc::new(ListenerRegistry::new()),
            shared,
            shutdown: watch::Sender::new(false),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state.lock()
    }

    /// Id of the last event received, sent as `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.last_event_id.lock().clone()
    }

    /// Delay used before the next reconnect
    pub fn reconnect_delay(&self) -> Duration {
        *self.shared.reconnect_delay.lock()
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Start streaming; only valid once, from IDLE
    pub async fn open(&self) -> SseResult<()> {
        let mut task = self.task.lock().await;
        {
            let mut state = self.shared.state.lock();
            if *state != ReadyState::Idle {
                return Err(SseError::invalid_state(format!(
                    "open() called on a {:?} event source",
                    *state
                )));
            }
            *state = ReadyState::Open;
        }

        let read_loop = ReadLoop {
            url: self.url.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            listeners: Arc::clone(&self.listeners),
            shared: Arc::clone(&self.shared),
        };
        *task = Some(tokio::spawn(read_loop.run(self.shutdown.subscribe())));
        info!(url = %self.url, "Event source opened");
        Ok(())
    }

    /// Stop streaming and wait for the read loop to finish
    ///
    /// Dispatches `on_complete` if the source was OPEN. Calling it again, or
    /// on a source that was never opened, does nothing.
    pub async fn close(&self) {
        let mut task = self.task.lock().await;
        let was_open = {
            let mut state = self.shared.state.lock();
            let was_open = *state == ReadyState::Open;
            if was_open {
                *state = ReadyState::Closed;
            }
            was_open
        };

        if let Some(handle) = task.take() {
            self.shutdown.send_replace(true);
            if let Err(e) = handle.await {
                error!(url = %self.url, error = %e, "Event source read loop failed");
            }
        }

        if was_open {
            info!(url = %self.url, "Event source closed");
            self.listeners.dispatch_complete();
        }
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("url", &self.url)
            .field("state", &self.ready_state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        // The read loop exits on its next await; no completion is dispatched
        self.shutdown.send_replace(true);
    }
}

struct ReadLoop {
    url: String,
    client: Client,
    config: EventSourceConfig,
    listeners: Arc<ListenerRegistry>,
    shared: Arc<Shared>,
}

impl ReadLoop {
    async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut cancel = shutdown.clone();
        let mut parser = EventParser::new();

        loop {
            let ended = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                ended = self.stream_once(&mut parser, &shutdown) => ended,
            };
            if is_shutting_down(&shutdown) {
                break;
            }

            if is_fatal(&ended) {
                error!(url = %self.url, error = %ended, "Event source failed permanently");
                self.listeners.dispatch_error(&ended);
                *self.shared.state.lock() = ReadyState::Closed;
                break;
            }

            let delay = match (&ended, self.config.error_status_delay) {
                (SseError::Status(_), Some(delay)) => delay,
                _ => *self.shared.reconnect_delay.lock(),
            };
            warn!(url = %self.url, error = %ended, ?delay, "Event stream ended, reconnecting");
            self.listeners.dispatch_error(&ended);

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            parser.reset();
        }
        debug!(url = %self.url, "Event source read loop stopped");
    }

    /// Run one connection to its end; the returned error says how it ended
    async fn stream_once(&self, parser: &mut EventParser, shutdown: &watch::Receiver<bool>) -> SseError {
        let last_event_id = self.shared.last_event_id.lock().clone();
        let response = match open_stream(
            &self.client,
            &self.url,
            &self.config.headers,
            last_event_id.as_deref(),
        )
        .await
        {
            Ok(response) => response,
            Err(e) => return e,
        };
        debug!(url = %self.url, last_event_id = ?last_event_id, "Event stream connected");

        let mut body = response.bytes_stream();
        loop {
            let next = match self.config.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                    Ok(next) => next,
                    Err(_) => return SseError::transport(format!("no data received for {:?}", limit)),
                },
                None => body.next().await,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return e.into(),
                None => return SseError::transport("server closed the stream"),
            };

            let events: Vec<InboundEvent> = parser.feed(&chunk).collect();
            self.remember(parser);
            for event in &events {
                if is_shutting_down(shutdown) {
                    return SseError::ClosedConnection;
                }
                self.listeners.dispatch_event(event);
            }
        }
    }

    fn remember(&self, parser: &EventParser) {
        if let Some(id) = parser.last_event_id() {
            let mut last = self.shared.last_event_id.lock();
            if last.as_deref() != Some(id) {
                *last = Some(id.to_string());
            }
        }
        if let Some(delay) = parser.reconnect_delay() {
            *self.shared.reconnect_delay.lock() = delay;
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the EventSource is gone
    let _ = rx.wait_for(|stop| *stop).await;
}

fn is_shutting_down(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}
