//! Forward outcomes

use std::fmt;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

/// What kind of failure an `UpstreamFailure` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Upstream answered 429.
    RateLimited,
    /// Upstream answered with any other non-2xx status.
    Upstream,
    /// No response within the configured timeout.
    Timeout,
    /// Connection, TLS or body read error.
    Transport,
    /// The request named an operation the forwarder does not implement.
    UnsupportedOperation,
}

impl FailureKind {
    /// Metric/log label.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Upstream => "upstream_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::UnsupportedOperation => "unsupported_operation",
        }
    }
}

/// Normalized failure of one forwarded call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} ({status}): {message}", .kind.label())]
pub struct UpstreamFailure {
    /// HTTP-like status to report to the caller.
    pub status: u16,
    pub message: String,
    pub kind: FailureKind,
}

impl UpstreamFailure {
    pub fn new(status: u16, message: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            status,
            message: message.into(),
            kind,
        }
    }

    /// The signal the pool keys its cooldown on.
    pub fn is_rate_limit(&self) -> bool {
        self.status == 429
    }
}

/// Fully buffered upstream response.
#[derive(Debug)]
pub struct UnaryResponse {
    pub status: StatusCode,
    /// Response headers with hop-by-hop and framing headers removed.
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One item of a streamed response: raw bytes, or the failure that ended it.
pub type ChunkItem = Result<Bytes, UpstreamFailure>;

/// Streamed upstream response.
///
/// `chunks` is lazy, finite and can be driven only once. Chunk boundaries are
/// whatever the transport delivered and carry no message framing.
pub struct ChunkStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: BoxStream<'static, ChunkItem>,
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Result of `Forwarder::forward`.
#[derive(Debug)]
pub enum ForwardOutcome {
    Unary(UnaryResponse),
    Stream(ChunkStream),
    Failure(UpstreamFailure),
}

impl ForwardOutcome {
    /// The failure, if this outcome is one.
    pub fn failure(&self) -> Option<&UpstreamFailure> {
        match self {
            ForwardOutcome::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.failure().is_some_and(UpstreamFailure::is_rate_limit)
    }
}
