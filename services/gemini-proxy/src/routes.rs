//! Route adapter
//!
//! Turns inbound HTTP requests into upstream calls: select a credential,
//! forward once, feed a 429 back into the pool as a cooldown, and hand the
//! result to the client. The credential's lease is dropped as soon as the
//! forward outcome has been evaluated, so time spent streaming to the
//! client does not count as in-flight.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, Uri};
use axum::response::Response;
use key_pool::{Dispatcher, Selection};
use tracing::{Instrument, Span, debug, field, info, instrument, warn};
use upstream::{
    ChannelSink, ChunkStream, ForwardOutcome, Forwarder, RelayEnd, UnaryResponse,
    UpstreamFailure, UpstreamRequest, relay,
};

use crate::error::ApiError;
use crate::metrics;

/// Largest request body accepted from a client.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Undelivered chunks buffered between the relay task and the response body.
const RELAY_BUFFER: usize = 1;

/// Everything a proxied request needs, shared across handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub forwarder: Forwarder,
    pub cooldown: Duration,
    pub max_attempts: u32,
}

/// The `{model}:{action}` segment of a native route, still percent-encoded.
///
/// Path extractors decode `%2F`, `%3F` and `%23`, which would change the
/// resource the upstream sees.
pub fn native_target(uri: &Uri) -> &str {
    uri.path()
        .rsplit_once('/')
        .map_or("", |(_, target)| target)
}

/// The path below the OpenAI-compatible prefix, still percent-encoded.
pub fn passthrough_path<'a>(uri: &'a Uri, prefix: &str) -> &'a str {
    uri.path().strip_prefix(prefix).unwrap_or(uri.path())
}

/// Split `{model}:{action}`; the colon may arrive percent-encoded.
fn split_target(target: &str) -> Option<(&str, &str)> {
    if let Some(split) = target.split_once(':') {
        return Some(split);
    }
    let at = target.find("%3A").or_else(|| target.find("%3a"))?;
    Some((&target[..at], &target[at + 3..]))
}

/// Handle `POST /{api_version}/models/{model}:{action}`.
#[instrument(skip_all, fields(request_id = %request_id, target = %target))]
pub async fn native(
    state: &ProxyState,
    target: &str,
    request: Request<Body>,
    request_id: &str,
) -> Response {
    let Some((model, action)) = split_target(target) else {
        return ApiError::invalid_request(format!(
            "expected models/{{model}}:{{action}}, got models/{target}"
        ))
        .into_response(request_id);
    };
    if model.is_empty() || action.is_empty() {
        return ApiError::invalid_request("model and action must not be empty")
            .into_response(request_id);
    }

    let body = match read_body(request.into_body()).await {
        Ok(body) => body,
        Err(err) => return err.into_response(request_id),
    };

    let upstream_request = UpstreamRequest::Native {
        model: model.to_string(),
        action: action.to_string(),
        body,
    };
    dispatch(state, upstream_request, request_id).await
}

/// Handle `ANY /v1/{*path}` on the OpenAI-compatible surface.
#[instrument(skip_all, fields(request_id = %request_id, path = %path))]
pub async fn openai(
    state: &ProxyState,
    path: &str,
    request: Request<Body>,
    request_id: &str,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match read_body(body).await {
        Ok(body) => body,
        Err(err) => return err.into_response(request_id),
    };

    let mut path_and_query = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = parts.uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let stream = wants_stream(&parts.method, &parts.headers, &body);
    let upstream_request = UpstreamRequest::Passthrough {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
        stream,
    };
    dispatch(state, upstream_request, request_id).await
}

/// Select, forward, and translate the outcome, re-dispatching after a 429
/// while attempts remain.
#[instrument(skip_all, fields(operation = %request.operation(), credential = field::Empty, attempt = field::Empty))]
async fn dispatch(state: &ProxyState, request: UpstreamRequest, request_id: &str) -> Response {
    let attempts = state.max_attempts.max(1);
    let mut attempt = 0;
    let mut last_rate_limit: Option<UpstreamFailure> = None;

    loop {
        attempt += 1;
        let lease = match state.dispatcher.select() {
            Selection::Acquired(lease) => lease,
            Selection::Unavailable(reason) => {
                if let Some(failure) = last_rate_limit {
                    // Re-dispatch found nothing eligible; report the 429 already seen.
                    return failure_response(&failure, request_id);
                }
                warn!(reason = reason.label(), "no eligible credential");
                return ApiError::unavailable(reason).into_response(request_id);
            }
        };

        let span = Span::current();
        span.record("credential", lease.label());
        span.record("attempt", attempt);

        let outcome = state.forwarder.forward(lease.secret(), request.clone()).await;
        if outcome.is_rate_limit() {
            lease.cool_down(state.cooldown);
        }
        drop(lease);

        match outcome {
            ForwardOutcome::Unary(response) => return unary_response(response),
            ForwardOutcome::Stream(stream) => return stream_response(stream),
            ForwardOutcome::Failure(failure) => {
                metrics::record_upstream_error(failure.kind.label());
                if failure.is_rate_limit() && attempt < attempts {
                    info!(attempt, attempts, "rate limited, re-dispatching");
                    last_rate_limit = Some(failure);
                    continue;
                }
                return failure_response(&failure, request_id);
            }
        }
    }
}

fn failure_response(failure: &UpstreamFailure, request_id: &str) -> Response {
    ApiError::from(failure).into_response(request_id)
}

fn unary_response(upstream: UnaryResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

/// Spawn the relay and stream its channel as the response body.
fn stream_response(stream: ChunkStream) -> Response {
    let ChunkStream {
        status,
        headers,
        chunks,
    } = stream;
    let (sink, receiver) = ChannelSink::channel(RELAY_BUFFER);

    tokio::spawn(
        async move {
            match relay(chunks, sink).await {
                RelayEnd::Completed { chunks } => debug!(chunks, "stream relayed"),
                RelayEnd::UpstreamFailed { failure, chunks } => {
                    metrics::record_upstream_error(failure.kind.label());
                    warn!(chunks, error = %failure, "stream cut after upstream failure");
                }
                RelayEnd::ClientGone { chunks } => info!(chunks, "client left mid-stream"),
            }
        }
        .in_current_span(),
    );

    let mut response = Response::new(Body::from_stream(receiver));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn read_body(body: Body) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}")))
}

/// OpenAI-dialect requests ask for streaming with `"stream": true` in the JSON
/// body. GETs and non-JSON bodies never stream.
fn wants_stream(method: &Method, headers: &HeaderMap, body: &Bytes) -> bool {
    if *method == Method::GET || body.is_empty() {
        return false;
    }
    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|ct| ct.starts_with("application/json"));
    is_json
        && serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
            .unwrap_or(false)
}
