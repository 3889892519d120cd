//! Opening a streaming GET and validating the answer

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use crate::error::{SseError, SseResult};
use crate::server::LAST_EVENT_ID;
use crate::types::media::essence;
use crate::types::TEXT_EVENT_STREAM;

/// Issue the request and return the response once it is a usable event stream
///
/// `204 No Content` and a non event-stream body are reported as errors that
/// [`is_fatal`] recognizes; other error statuses come back as
/// [`SseError::Status`] and may be retried.
pub(crate) async fn open_stream(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    last_event_id: Option<&str>,
) -> SseResult<Response> {
    let mut request_headers = headers.clone();
    request_headers.insert(ACCEPT, HeaderValue::from_static(TEXT_EVENT_STREAM));
    request_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(id) = last_event_id.filter(|id| !id.is_empty()) {
        match HeaderValue::from_str(id) {
            Ok(value) => {
                request_headers.insert(LAST_EVENT_ID, value);
            }
            Err(_) => debug!(last_event_id = id, "Last event id is not a valid header value"),
        }
    }

    let response = client.get(url).headers(request_headers).send().await?;
    let status = response.status();
    if status == StatusCode::NO_CONTENT || !status.is_success() {
        return Err(SseError::Status(status));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(essence)
        .unwrap_or_default();
    if content_type != TEXT_EVENT_STREAM {
        return Err(SseError::ContentType(content_type));
    }

    Ok(response)
}

/// Failures that end an event source for good instead of triggering a reconnect
pub(crate) fn is_fatal(err: &SseError) -> bool {
    match err {
        SseError::Status(status) => *status == StatusCode::NO_CONTENT,
        SseError::ContentType(_) | SseError::Config(_) => true,
        _ => false,
    }
}
