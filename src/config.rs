//! Environment-driven configuration for the demo server
//!
//! Environment:
//! - SSE_BIND_ADDR: listen address (optional, default 0.0.0.0:8080)
//! - SSE_CHANNEL_CAPACITY: frames buffered per connection (optional, default 64)
//! - SSE_KEEP_ALIVE_SECS: heartbeat interval, 0 disables (optional, default 30)
//! - SSE_WRITE_TIMEOUT_SECS: how long a stalled client may block a write (optional, default 10)
//! - RUST_LOG: log filter (optional, default info)

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{SseError, SseResult};

/// Configuration for the `sse-server` binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Frames buffered per outbound connection
    pub channel_capacity: usize,
    /// Interval of `: ping` heartbeats, `None` to disable
    pub keep_alive: Option<Duration>,
    /// Longest a write waits on a client that is not reading
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            channel_capacity: 64,
            keep_alive: Some(Duration::from_secs(30)),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> SseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> SseResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("SSE_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|e| SseError::Config(format!("SSE_BIND_ADDR '{}': {}", addr, e)))?;
        }

        if let Some(capacity) = lookup("SSE_CHANNEL_CAPACITY") {
            let capacity: usize = capacity.parse().map_err(|e| {
                SseError::Config(format!("SSE_CHANNEL_CAPACITY '{}': {}", capacity, e))
            })?;
            if capacity == 0 {
                return Err(SseError::Config(
                    "SSE_CHANNEL_CAPACITY must be greater than 0".to_string(),
                ));
            }
            config.channel_capacity = capacity;
        }

        if let Some(secs) = lookup("SSE_KEEP_ALIVE_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                SseError::Config(format!("SSE_KEEP_ALIVE_SECS '{}': {}", secs, e))
            })?;
            config.keep_alive = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = lookup("SSE_WRITE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                SseError::Config(format!("SSE_WRITE_TIMEOUT_SECS '{}': {}", secs, e))
            })?;
            if secs == 0 {
                return Err(SseError::Config(
                    "SSE_WRITE_TIMEOUT_SECS must be greater than 0".to_string(),
                ));
            }
            config.write_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
