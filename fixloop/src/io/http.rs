//! Shared HTTP plumbing for the hosted and gateway backends.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::io::transport::{TransportError, TransportErrorKind};

/// Error bodies are cut to this many characters in messages.
const ERROR_BODY_LIMIT: usize = 500;

/// Build a client whose requests are abandoned after `timeout`.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("build http client")
}

/// Join an endpoint base and a path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// Map a non-success HTTP status onto the transport taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> TransportErrorKind {
    match status.as_u16() {
        429 => TransportErrorKind::RateLimited,
        408 | 504 => TransportErrorKind::Timeout,
        529 => TransportErrorKind::Overloaded,
        401 | 403 => TransportErrorKind::Auth,
        400 if mentions_content_filter(body) => TransportErrorKind::ContentFiltered,
        _ if status.is_server_error() => TransportErrorKind::Overloaded,
        _ if status.is_client_error() => TransportErrorKind::MalformedRequest,
        _ => TransportErrorKind::Unknown,
    }
}

fn mentions_content_filter(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    ["content_filter", "content filter", "content_policy", "content policy"]
        .iter()
        .any(|needle| body.contains(needle))
}

/// Map a request-level failure (no status received) onto the taxonomy.
pub fn classify_request_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        TransportErrorKind::Network
    } else if err.is_builder() {
        TransportErrorKind::MalformedRequest
    } else {
        TransportErrorKind::Unknown
    }
}

pub fn request_error(backend: &str, err: &reqwest::Error) -> TransportError {
    TransportError::new(classify_request_error(err), backend, err.to_string())
}

pub fn status_error(backend: &str, status: StatusCode, body: &str) -> TransportError {
    let kind = classify_status(status, body);
    let body: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    TransportError::new(kind, backend, format!("status {status}: {body}"))
}

/// Send a prepared JSON request and decode the JSON response body.
pub async fn send_json(backend: &str, request: RequestBuilder) -> Result<Value, TransportError> {
    let response = request
        .send()
        .await
        .map_err(|err| request_error(backend, &err))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| request_error(backend, &err))?;

    if !status.is_success() {
        let err = status_error(backend, status, &body);
        warn!(%status, kind = %err.kind, "backend returned error status");
        return Err(err);
    }

    debug!(%status, bytes = body.len(), "backend responded");
    serde_json::from_str(&body).map_err(|err| {
        TransportError::new(
            TransportErrorKind::Unknown,
            backend,
            format!("undecodable response body: {err}"),
        )
    })
}
