//! Server half of the engine
//!
//! - `connection`: suspend a request into an outbound event stream
//! - `broadcaster`: fan events out to many connections
//! - `routes`: demo endpoints used by the `sse-server` binary

pub mod broadcaster;
pub mod connection;
pub mod routes;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use connection::{ConnectionOptions, OutboundConnection, SseContext, SseResponse, LAST_EVENT_ID};
pub use routes::{create_router, spawn_heartbeat, AppState};
