//! Client-facing error envelope
//!
//! Every error the proxy produces itself is a JSON body of the form
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::Unavailable;
use upstream::{FailureKind, UpstreamFailure};

/// Value of the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Unavailable,
    RateLimited,
    UpstreamError,
    UnsupportedOperation,
    InvalidRequest,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Unavailable => "unavailable",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::UpstreamError => "upstream_error",
            ErrorType::UnsupportedOperation => "unsupported_operation",
            ErrorType::InvalidRequest => "invalid_request",
        }
    }
}

/// An error response waiting for its request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorType,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorType::InvalidRequest, message)
    }

    /// Both unavailability reasons look the same to the caller.
    pub fn unavailable(reason: Unavailable) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Unavailable,
            reason.to_string(),
        )
    }

    pub fn into_response(self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
                "request_id": request_id,
            }
        });
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<&UpstreamFailure> for ApiError {
    fn from(failure: &UpstreamFailure) -> Self {
        let kind = match failure.kind {
            FailureKind::RateLimited => ErrorType::RateLimited,
            FailureKind::UnsupportedOperation => ErrorType::UnsupportedOperation,
            FailureKind::Upstream | FailureKind::Timeout | FailureKind::Transport => {
                ErrorType::UpstreamError
            }
        };
        let status =
            StatusCode::from_u16(failure.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, kind, failure.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn envelope_includes_all_fields() {
        let response = ApiError::invalid_request("bad body").into_response("req_abc");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request");
        assert_eq!(json["error"]["message"], "bad body");
        assert_eq!(json["error"]["request_id"], "req_abc");
    }

    #[test]
    fn unavailability_is_503_for_both_reasons() {
        for reason in [Unavailable::EmptyPool, Unavailable::AllCoolingDown] {
            let err = ApiError::unavailable(reason);
            assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(err.kind, ErrorType::Unavailable);
        }
    }

    #[test]
    fn failures_map_to_types_and_statuses() {
        let cases = [
            (429, FailureKind::RateLimited, ErrorType::RateLimited),
            (
                400,
                FailureKind::UnsupportedOperation,
                ErrorType::UnsupportedOperation,
            ),
            (403, FailureKind::Upstream, ErrorType::UpstreamError),
            (504, FailureKind::Timeout, ErrorType::UpstreamError),
            (500, FailureKind::Transport, ErrorType::UpstreamError),
        ];
        for (status, kind, expected) in cases {
            let err = ApiError::from(&UpstreamFailure::new(status, "m", kind));
            assert_eq!(err.status.as_u16(), status);
            assert_eq!(err.kind, expected);
        }
    }

    #[test]
    fn out_of_range_status_falls_back_to_500() {
        let err = ApiError::from(&UpstreamFailure::new(42, "odd", FailureKind::Upstream));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
