//! Request descriptors accepted by the forwarder

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;

/// Native Gemini model methods the forwarder knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeAction {
    /// Unary content generation.
    GenerateContent,
    /// Streamed content generation (server-sent events).
    StreamGenerateContent,
    /// Token count metadata call.
    CountTokens,
}

impl NativeAction {
    /// Parse the method suffix of `models/{model}:{action}`.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "generateContent" => Some(Self::GenerateContent),
            "streamGenerateContent" => Some(Self::StreamGenerateContent),
            "countTokens" => Some(Self::CountTokens),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateContent => "generateContent",
            Self::StreamGenerateContent => "streamGenerateContent",
            Self::CountTokens => "countTokens",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::StreamGenerateContent)
    }
}

/// One logical upstream call.
#[derive(Debug, Clone)]
pub enum UpstreamRequest {
    /// `POST {api_version}/models/{model}:{action}` with a JSON body.
    ///
    /// `action` is kept as received; unknown actions come back as an
    /// `UnsupportedOperation` failure.
    Native {
        model: String,
        action: String,
        body: Bytes,
    },
    /// Arbitrary method/path forwarded under the OpenAI-compatible base path.
    Passthrough {
        method: Method,
        /// Path (and query) relative to the OpenAI-compatible base, e.g.
        /// `/chat/completions`.
        path_and_query: String,
        headers: HeaderMap,
        body: Bytes,
        /// Whether the response should be relayed as a stream.
        stream: bool,
    },
}

impl UpstreamRequest {
    /// Short operation name for logs and metrics.
    pub fn operation(&self) -> &str {
        match self {
            UpstreamRequest::Native { action, .. } => action,
            UpstreamRequest::Passthrough { .. } => "passthrough",
        }
    }

    /// Whether a successful response will be a `Stream` outcome.
    pub fn is_streaming(&self) -> bool {
        match self {
            UpstreamRequest::Native { action, .. } => {
                NativeAction::parse(action).is_some_and(|a| a.is_streaming())
            }
            UpstreamRequest::Passthrough { stream, .. } => *stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_actions() {
        assert_eq!(
            NativeAction::parse("generateContent"),
            Some(NativeAction::GenerateContent)
        );
        assert_eq!(
            NativeAction::parse("streamGenerateContent"),
            Some(NativeAction::StreamGenerateContent)
        );
        assert_eq!(
            NativeAction::parse("countTokens"),
            Some(NativeAction::CountTokens)
        );
    }

    #[test]
    fn unknown_and_miscased_actions_are_rejected() {
        assert_eq!(NativeAction::parse("embedContent"), None);
        assert_eq!(NativeAction::parse("GenerateContent"), None);
        assert_eq!(NativeAction::parse(""), None);
    }

    #[test]
    fn only_stream_generate_content_streams() {
        assert!(NativeAction::StreamGenerateContent.is_streaming());
        assert!(!NativeAction::GenerateContent.is_streaming());
        assert!(!NativeAction::CountTokens.is_streaming());
    }

    #[test]
    fn request_reports_operation_and_streaming() {
        let native = UpstreamRequest::Native {
            model: "gemini-2.0-flash".into(),
            action: "streamGenerateContent".into(),
            body: Bytes::new(),
        };
        assert_eq!(native.operation(), "streamGenerateContent");
        assert!(native.is_streaming());

        let passthrough = UpstreamRequest::Passthrough {
            method: Method::POST,
            path_and_query: "/chat/completions".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            stream: false,
        };
        assert_eq!(passthrough.operation(), "passthrough");
        assert!(!passthrough.is_streaming());
    }
}
