//! Demo endpoints that produce events
//!
//! ## Endpoints
//! - `GET /health` - liveness
//! - `GET /events` - subscribe to the message broadcaster
//! - `POST /events` - broadcast the text body as a `message` event
//! - `DELETE /events` - close all subscribers; later subscriptions get 204
//! - `GET /events/single` - one comment event, then close
//! - `GET /events/domains/:id` - six progress events ending with `Done`
//! - `POST /events/error` - drop all subscribers so clients reconnect

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use super::broadcaster::{BroadcastReport, Broadcaster};
use super::connection::{ConnectionOptions, OutboundConnection, SseContext};
use crate::config::ServerConfig;
use crate::error::SseResult;
use crate::types::OutboundEvent;

/// Steps emitted by the domain progress endpoint before `Done`
const DOMAIN_STEPS: u64 = 5;

/// Shared state for the demo endpoints
pub struct AppState {
    /// Subscribers of `GET /events`
    pub messages: Broadcaster,
    /// Options for every new outbound connection
    pub options: ConnectionOptions,
    /// Delay between domain progress events
    pub step_delay: Duration,
    /// Id of the next broadcast message
    sequence_counter: AtomicU64,
    /// Cleared by `DELETE /events`
    accepting: AtomicBool,
}

impl AppState {
    /// Create a new AppState from the server configuration
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_options(ConnectionOptions {
            channel_capacity: config.channel_capacity,
            write_timeout: config.write_timeout,
            ..Default::default()
        })
    }

    pub fn with_options(options: ConnectionOptions) -> Self {
        Self {
            messages: Broadcaster::new(),
            options,
            step_delay: Duration::from_millis(100),
            sequence_counter: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        }
    }

    /// Broadcast a text message with the next sequence id
    pub async fn publish(&self, text: String) -> SseResult<BroadcastReport> {
        let id = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let event = OutboundEvent::builder()
            .name("message")
            .id(id.to_string())
            .data(text)
            .build()?;
        Ok(self.messages.broadcast(&event).await)
    }
}

/// Create the Axum router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/events",
            get(subscribe).post(post_message).delete(close_subscribers),
        )
        .route("/events/single", get(single_event))
        .route("/events/domains/:id", get(domain_progress))
        .route("/events/error", post(drop_subscribers))
        .layer(cors)
        .with_state(state)
}

/// Broadcast a `: ping` comment every `interval`
///
/// Keeps intermediaries from timing out idle streams and prunes
/// subscribers that disconnected without a write failing yet.
pub fn spawn_heartbeat(state: Arc<AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = state.messages.broadcast(&OutboundEvent::with_comment("ping")).await;
            if report.pruned > 0 {
                debug!(pruned = report.pruned, "Heartbeat pruned subscribers");
            }
        }
    })
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// GET /events - register a new subscriber
async fn subscribe(State(state): State<Arc<AppState>>, ctx: SseContext) -> SseResult<Response> {
    if !state.accepting.load(Ordering::SeqCst) {
        // 204 tells event sources to stop reconnecting
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    if let Some(id) = ctx.last_event_id() {
        info!(last_event_id = id, "Subscriber resuming");
    }

    let (connection, response) = ctx.obtain_outbound_connection(&state.options)?;
    state.messages.register(&connection);
    hold_until_closed(connection);
    Ok(response.into_response())
}

/// POST /events - broadcast a message
async fn post_message(State(state): State<Arc<AppState>>, body: String) -> SseResult<Json<BroadcastReport>> {
    Ok(Json(state.publish(body).await?))
}

/// DELETE /events - close all subscribers and stop accepting new ones
async fn close_subscribers(State(state): State<Arc<AppState>>) -> StatusCode {
    state.accepting.store(false, Ordering::SeqCst);
    state.messages.close_all().await;
    StatusCode::NO_CONTENT
}

/// POST /events/error - drop all subscribers; they are expected to reconnect
async fn drop_subscribers(State(state): State<Arc<AppState>>) -> StatusCode {
    warn!(subscribers = state.messages.len(), "Dropping all subscribers");
    state.messages.close_all().await;
    StatusCode::ACCEPTED
}

/// GET /events/single - a single comment event
async fn single_event(State(state): State<Arc<AppState>>, ctx: SseContext) -> SseResult<Response> {
    let (connection, response) = ctx.obtain_outbound_connection(&state.options)?;
    tokio::spawn(async move {
        if let Err(e) = connection
            .write(&OutboundEvent::with_comment("single event is added"))
            .await
        {
            debug!(error = %e, "Single event not delivered");
        }
        connection.close().await;
    });
    Ok(response.into_response())
}

/// GET /events/domains/:id - progress events for one domain
async fn domain_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ctx: SseContext,
) -> SseResult<Response> {
    let (connection, response) = ctx.obtain_outbound_connection(&state.options)?;
    let delay = state.step_delay;
    tokio::spawn(async move {
        if let Err(e) = stream_domain_progress(&connection, &id, delay).await {
            debug!(domain = %id, error = %e, "Domain progress aborted");
        }
        connection.close().await;
    });
    Ok(response.into_response())
}

async fn stream_domain_progress(
    connection: &OutboundConnection,
    domain: &str,
    delay: Duration,
) -> SseResult<()> {
    for step in 1..=DOMAIN_STEPS {
        let event = OutboundEvent::builder()
            .name("domain-progress")
            .id(step.to_string())
            .json_data(&json!({
                "domain": domain,
                "step": step,
                "percent": step * 100 / (DOMAIN_STEPS + 1),
                "at": chrono::Utc::now().to_rfc3339(),
            }))
            .build()?;
        connection.write(&event).await?;
        tokio::time::sleep(delay).await;
    }

    let done = OutboundEvent::builder()
        .name("domain-progress")
        .id((DOMAIN_STEPS + 1).to_string())
        .data("Done")
        .build()?;
    connection.write(&done).await
}

/// Own the connection until it closes; the broadcaster only holds a weak reference
///
/// A client that disconnects drops the response body, which also ends the wait.
fn hold_until_closed(connection: Arc<OutboundConnection>) {
    tokio::spawn(async move {
        connection.closed().await;
        debug!(connection = connection.id(), "Subscriber released");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::util::ServiceExt;

    fn app() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::with_options(ConnectionOptions::default()));
        (create_router(Arc::clone(&state)), state)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_subscribe_returns_event_stream() {
        let (app, state) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header(header::ACCEPT, "text/event-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_released() {
        let (app, state) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header(header::ACCEPT, "text/event-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(state.messages.len(), 1);

        drop(response);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !state.messages.is_empty() {
            assert!(std::time::Instant::now() < deadline, "subscriber was never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_subscribe_rejects_non_streaming_accept() {
        let (app, state) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header(header::ACCEPT, "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_stops_new_subscriptions() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let (_, state) = app();
        let report = state.publish("nobody listens".to_string()).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }
}
