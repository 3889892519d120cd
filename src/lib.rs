//! SSE Engine
//!
//! Server-Sent Events for both ends of the connection: servers suspend a
//! request into a `text/event-stream` response and push events to one
//! subscriber or many; clients consume a stream, reconnecting with
//! `Last-Event-ID` when it drops.
//!
//! # Modules
//!
//! - `types`: Event records and payload serializers
//! - `codec`: Wire encoder and incremental parser
//! - `server`: Outbound connections, broadcaster, demo routes
//! - `client`: Reconnecting event source, listeners, pull-based input
//! - `config`: Environment configuration for the demo server
//! - `error`: Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use sse_engine::client::{EventSource, EventSourceConfig, Listener};
//!
//! # async fn run() -> sse_engine::SseResult<()> {
//! let source = EventSource::new("http://localhost:8080/events", EventSourceConfig::default())?;
//! source.subscribe(Listener::new().on_event(|event| println!("{}", event.read_data())));
//! source.open().await?;
//! // ...
//! source.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod server;
pub mod types;

// Re-export commonly used items at crate root
pub use client::{EventInput, EventSource, EventSourceConfig, Listener, ReadyState};
pub use config::ServerConfig;
pub use error::{SseError, SseResult};
pub use server::{Broadcaster, OutboundConnection, SseContext};
pub use types::{InboundEvent, OutboundEvent, Payload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
