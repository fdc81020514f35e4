//! Error types for forwarder construction

/// Errors raised while building a `Forwarder`.
///
/// Failures of individual calls are not errors; see
/// [`ForwardOutcome::Failure`](crate::ForwardOutcome::Failure).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid upstream url {url}: {reason}")]
    InvalidUpstreamUrl { url: String, reason: String },

    #[error("invalid path setting {name}: {value}")]
    InvalidPath { name: &'static str, value: String },

    #[error("timeout must be non-zero")]
    ZeroTimeout,
}

/// Result alias for forwarder construction.
pub type Result<T> = std::result::Result<T, Error>;
