//! Translation of upstream errors into `UpstreamFailure`
//!
//! Gemini reports errors as `{"error":{"code":429,"message":"...","status":"RESOURCE_EXHAUSTED"}}`;
//! the OpenAI-compatible surface sometimes wraps the same object in a
//! one-element array. Anything else is reported as raw text.

use std::time::Duration;

use crate::outcome::{FailureKind, UpstreamFailure};

/// Longest raw-text error body carried into a failure message.
const MAX_RAW_MESSAGE: usize = 512;

/// Status used when a transport error carries none.
const GENERIC_SERVER_ERROR: u16 = 500;

/// Status used when the upstream did not answer in time.
const TIMEOUT_STATUS: u16 = 504;

/// Build a failure from a non-2xx upstream response.
pub fn failure_from_status(status: u16, body: &str) -> UpstreamFailure {
    let kind = if status == 429 {
        FailureKind::RateLimited
    } else {
        FailureKind::Upstream
    };
    UpstreamFailure::new(status, extract_message(status, body), kind)
}

/// Build a failure from a transport-level error.
pub fn failure_from_transport(error: &reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        return UpstreamFailure::new(
            TIMEOUT_STATUS,
            format!("upstream timeout: {error}"),
            FailureKind::Timeout,
        );
    }
    match error.status() {
        Some(status) => failure_from_status(status.as_u16(), &error.to_string()),
        None => UpstreamFailure::new(
            GENERIC_SERVER_ERROR,
            format!("upstream request failed: {error}"),
            FailureKind::Transport,
        ),
    }
}

/// Failure for a request whose deadline elapsed before any response arrived.
pub fn timeout_failure(after: Duration) -> UpstreamFailure {
    UpstreamFailure::new(
        TIMEOUT_STATUS,
        format!("upstream timeout after {after:?}"),
        FailureKind::Timeout,
    )
}

/// Failure for an unknown native action. Never reaches the network.
pub fn unsupported_operation(action: &str) -> UpstreamFailure {
    UpstreamFailure::new(
        400,
        format!("unsupported operation: {action}"),
        FailureKind::UnsupportedOperation,
    )
}

/// Pull a human-readable message out of an upstream error body.
pub fn extract_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let error = match &value {
            serde_json::Value::Array(items) => items.first().and_then(|v| v.get("error")),
            other => other.get("error"),
        };
        if let Some(message) = error.and_then(|e| e.get("message")).and_then(|m| m.as_str()) {
            return message.to_string();
        }
        if let Some(message) = error.and_then(|e| e.as_str()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("upstream returned status {status}");
    }
    let mut message: String = trimmed.chars().take(MAX_RAW_MESSAGE).collect();
    if trimmed.chars().count() > MAX_RAW_MESSAGE {
        message.push_str("...");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        let body = r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#;
        let failure = failure_from_status(429, body);
        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert!(failure.is_rate_limit());
        assert_eq!(
            failure.message,
            "Resource has been exhausted (e.g. check quota)."
        );
    }

    #[test]
    fn other_statuses_are_upstream_errors() {
        for status in [400, 401, 403, 404, 500, 503] {
            let failure = failure_from_status(status, "");
            assert_eq!(failure.kind, FailureKind::Upstream, "status {status}");
            assert_eq!(failure.status, status);
            assert!(!failure.is_rate_limit());
        }
    }

    #[test]
    fn message_from_array_wrapped_error() {
        let body = r#"[{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT"}}]"#;
        assert_eq!(extract_message(400, body), "API key not valid.");
    }

    #[test]
    fn message_from_string_error_field() {
        assert_eq!(extract_message(502, r#"{"error":"bad gateway"}"#), "bad gateway");
    }

    #[test]
    fn message_falls_back_to_raw_text() {
        assert_eq!(extract_message(503, "  service unavailable \n"), "service unavailable");
    }

    #[test]
    fn empty_body_mentions_status() {
        assert_eq!(extract_message(500, ""), "upstream returned status 500");
    }

    #[test]
    fn long_raw_body_is_truncated() {
        let body = "x".repeat(MAX_RAW_MESSAGE + 100);
        let message = extract_message(500, &body);
        assert_eq!(message.len(), MAX_RAW_MESSAGE + 3);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn unsupported_operation_is_400() {
        let failure = unsupported_operation("embedContent");
        assert_eq!(failure.status, 400);
        assert_eq!(failure.kind, FailureKind::UnsupportedOperation);
        assert!(failure.message.contains("embedContent"));
    }

    #[test]
    fn timeout_failure_is_504() {
        let failure = timeout_failure(Duration::from_secs(60));
        assert_eq!(failure.status, 504);
        assert_eq!(failure.message, "upstream timeout after 60s");
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(!failure.is_rate_limit());
    }

    #[tokio::test]
    async fn connection_refused_is_generic_server_error() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        let failure = failure_from_transport(&err);
        assert_eq!(failure.status, GENERIC_SERVER_ERROR);
        assert_eq!(failure.kind, FailureKind::Transport);
    }
}
