//! Single upstream call with a caller-chosen API key

use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, Url};
use tracing::{debug, warn};

use crate::classify::{
    failure_from_status, failure_from_transport, timeout_failure, unsupported_operation,
};
use crate::error::{Error, Result};
use crate::headers::{self, GOOG_API_KEY, HeaderInjection};
use crate::outcome::{ChunkStream, FailureKind, ForwardOutcome, UnaryResponse, UpstreamFailure};
use crate::request::{NativeAction, UpstreamRequest};

/// Upstream location and per-call settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Scheme and host of the upstream API, e.g.
    /// `https://generativelanguage.googleapis.com`.
    pub upstream_url: String,
    /// Version segment of native calls (`v1beta`).
    pub api_version: String,
    /// Prefix of the OpenAI-compatible surface (`/v1beta/openai`).
    pub openai_base_path: String,
    /// Deadline for a unary call, or for the response head of a streamed one.
    pub timeout: Duration,
    /// Extra headers added to every upstream request.
    pub headers: Vec<HeaderInjection>,
}

/// Performs one upstream call per `forward` and reports it as a `ForwardOutcome`.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    config: ForwarderConfig,
}

/// A request resolved to its wire form.
struct Prepared {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    stream: bool,
}

impl Forwarder {
    /// Validate `config` and build a forwarder around `client`.
    pub fn new(client: reqwest::Client, mut config: ForwarderConfig) -> Result<Self> {
        let url = Url::parse(&config.upstream_url).map_err(|e| Error::InvalidUpstreamUrl {
            url: config.upstream_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUpstreamUrl {
                url: config.upstream_url.clone(),
                reason: "scheme must be http or https".into(),
            });
        }
        if config.api_version.is_empty() || config.api_version.contains('/') {
            return Err(Error::InvalidPath {
                name: "api_version",
                value: config.api_version.clone(),
            });
        }
        if !config.openai_base_path.starts_with('/') {
            return Err(Error::InvalidPath {
                name: "openai_base_path",
                value: config.openai_base_path.clone(),
            });
        }
        if config.timeout.is_zero() {
            return Err(Error::ZeroTimeout);
        }

        config.upstream_url = config.upstream_url.trim_end_matches('/').to_string();
        config.openai_base_path = config.openai_base_path.trim_end_matches('/').to_string();
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Execute `request` once with `api_key`.
    ///
    /// Never retries and never touches pool state. Non-2xx responses,
    /// transport errors and timeouts all come back as `ForwardOutcome::Failure`.
    pub async fn forward(
        &self,
        api_key: &Secret<String>,
        request: UpstreamRequest,
    ) -> ForwardOutcome {
        let operation = request.operation().to_string();
        let prepared = match self.prepare(api_key, request) {
            Ok(prepared) => prepared,
            Err(failure) => {
                warn!(operation = %operation, error = %failure, "request rejected before sending");
                return ForwardOutcome::Failure(failure);
            }
        };

        debug!(
            operation = %operation,
            method = %prepared.method,
            stream = prepared.stream,
            "forwarding upstream"
        );

        if prepared.stream {
            self.send_streaming(prepared).await
        } else {
            self.send_unary(prepared).await
        }
    }

    fn prepare(
        &self,
        api_key: &Secret<String>,
        request: UpstreamRequest,
    ) -> std::result::Result<Prepared, UpstreamFailure> {
        let mut prepared = match request {
            UpstreamRequest::Native {
                model,
                action,
                body,
            } => {
                let action = NativeAction::parse(&action)
                    .ok_or_else(|| unsupported_operation(&action))?;
                let mut url = format!(
                    "{}/{}/models/{}:{}",
                    self.config.upstream_url,
                    self.config.api_version,
                    model,
                    action.as_str()
                );
                if action.is_streaming() {
                    url.push_str("?alt=sse");
                }

                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert(
                    HeaderName::from_static(GOOG_API_KEY),
                    credential_value(api_key.expose())?,
                );

                Prepared {
                    method: Method::POST,
                    url,
                    headers,
                    body,
                    stream: action.is_streaming(),
                }
            }
            UpstreamRequest::Passthrough {
                method,
                path_and_query,
                headers: inbound,
                body,
                stream,
            } => {
                let separator = if path_and_query.starts_with('/') { "" } else { "/" };
                let url = format!(
                    "{}{}{}{}",
                    self.config.upstream_url,
                    self.config.openai_base_path,
                    separator,
                    path_and_query
                );

                let mut headers = headers::sanitize_request_headers(&inbound);
                let bearer = Secret::new(format!("Bearer {}", api_key.expose()));
                headers.insert(AUTHORIZATION, credential_value(bearer.expose())?);

                Prepared {
                    method,
                    url,
                    headers,
                    body,
                    stream,
                }
            }
        };

        headers::apply_injections(&mut prepared.headers, &self.config.headers);
        Ok(prepared)
    }

    async fn send_unary(&self, prepared: Prepared) -> ForwardOutcome {
        let sent = self
            .client
            .request(prepared.method, &prepared.url)
            .headers(prepared.headers)
            .timeout(self.config.timeout)
            .body(prepared.body)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => return transport_failure(&e),
        };

        let status = response.status();
        if !status.is_success() {
            return self.status_failure(response).await;
        }

        let headers = headers::sanitize_response_headers(response.headers());
        match response.bytes().await {
            Ok(body) => {
                debug!(status = status.as_u16(), bytes = body.len(), "upstream unary response");
                ForwardOutcome::Unary(UnaryResponse {
                    status,
                    headers,
                    body,
                })
            }
            Err(e) => transport_failure(&e),
        }
    }

    /// The deadline covers the response head only; the body streams for as
    /// long as the upstream keeps it open.
    async fn send_streaming(&self, prepared: Prepared) -> ForwardOutcome {
        let send = self
            .client
            .request(prepared.method, &prepared.url)
            .headers(prepared.headers)
            .body(prepared.body)
            .send();
        let response = match tokio::time::timeout(self.config.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return transport_failure(&e),
            Err(_) => {
                let failure = timeout_failure(self.config.timeout);
                warn!(error = %failure, "upstream stream did not start in time");
                return ForwardOutcome::Failure(failure);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return self.status_failure(response).await;
        }

        debug!(status = status.as_u16(), "upstream stream opened");
        let headers = headers::sanitize_response_headers(response.headers());
        let chunks = response
            .bytes_stream()
            .map(|item| item.map_err(|e| failure_from_transport(&e)))
            .boxed();
        ForwardOutcome::Stream(ChunkStream {
            status,
            headers,
            chunks,
        })
    }

    async fn status_failure(&self, response: Response) -> ForwardOutcome {
        let status = response.status().as_u16();
        let body = match tokio::time::timeout(self.config.timeout, response.text()).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };
        let failure = failure_from_status(status, &body);
        warn!(status, kind = failure.kind.label(), message = %failure.message, "upstream returned error");
        ForwardOutcome::Failure(failure)
    }
}

fn transport_failure(error: &reqwest::Error) -> ForwardOutcome {
    let failure = failure_from_transport(error);
    warn!(status = failure.status, kind = failure.kind.label(), error = %error, "upstream request failed");
    ForwardOutcome::Failure(failure)
}

fn credential_value(raw: &str) -> std::result::Result<HeaderValue, UpstreamFailure> {
    let mut value = HeaderValue::from_str(raw).map_err(|_| {
        UpstreamFailure::new(
            500,
            "credential is not a valid header value",
            FailureKind::Transport,
        )
    })?;
    value.set_sensitive(true);
    Ok(value)
}
