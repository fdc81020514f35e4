//! Header handling for forwarded requests and responses

use std::str::FromStr;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::warn;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers that are recomputed or replaced on the way upstream.
const REPLACED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-goog-api-key",
];

/// Header carrying the API key on native Gemini calls.
pub const GOOG_API_KEY: &str = "x-goog-api-key";

/// Extra header added to every upstream request (from config).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a header carries upstream credentials.
pub fn is_credential_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case(GOOG_API_KEY)
}

/// Copy inbound headers for an upstream request, dropping hop-by-hop headers
/// and anything the forwarder sets itself (host, length, credentials).
pub fn sanitize_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || REPLACED_REQUEST_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Copy upstream response headers for the client, dropping hop-by-hop and
/// framing headers (the proxy re-frames the body).
pub fn sanitize_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || name_str.eq_ignore_ascii_case("content-length") {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Apply configured injections (add if absent, replace if present).
///
/// Credential headers are never overwritten; invalid names or values are
/// skipped with a warning.
pub fn apply_injections(headers: &mut HeaderMap, injections: &[HeaderInjection]) {
    for injection in injections {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        if is_credential_header(name.as_str()) {
            warn!(header = %injection.name, "refusing to overwrite credential header");
            continue;
        }
        let value = match HeaderValue::from_str(&injection.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        headers.insert(name, value);
    }
}
