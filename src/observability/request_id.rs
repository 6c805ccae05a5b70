//! Request correlation IDs: accept well-formed inbound values, generate
//! otherwise, echo on the response, forward upstream.

use axum::http::HeaderMap;
use rand::RngCore;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A compact, URL-safe correlation ID: `req-` + 96 random bits, hex-encoded.
pub fn new_request_id() -> String {
    let mut buf = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut id = String::with_capacity(4 + buf.len() * 2);
    id.push_str("req-");
    for b in buf {
        id.push_str(&format!("{b:02x}"));
    }
    id
}

fn is_safe(v: &str) -> bool {
    let v = v.trim();
    if v.is_empty() || v.len() > 128 {
        return false;
    }
    v.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
}

/// The normalized inbound request id, if present and well-formed.
pub fn from_headers(headers: &HeaderMap) -> Option<String> {
    let v = headers.get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    if is_safe(v) {
        Some(v.to_string())
    } else {
        None
    }
}

/// Inbound id when valid, a fresh one otherwise.
pub fn ensure(headers: &HeaderMap) -> String {
    from_headers(headers).unwrap_or_else(new_request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn generated_ids_are_well_formed() {
        let id = new_request_id();
        assert!(id.starts_with("req-"));
        assert_eq!(id.len(), 4 + 24);
        assert!(is_safe(&id));
        assert_ne!(id, new_request_id());
    }

    #[test]
    fn valid_inbound_id_passes_through_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_static("trace-1.2:3/abc_DEF"),
        );
        assert_eq!(ensure(&headers), "trace-1.2:3/abc_DEF");
    }

    #[test]
    fn invalid_inbound_id_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("has space"));
        assert!(ensure(&headers).starts_with("req-"));

        let long = "x".repeat(129);
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(&long).unwrap());
        assert!(ensure(&headers).starts_with("req-"));
    }

    #[test]
    fn missing_header_generates() {
        let headers = HeaderMap::new();
        assert!(ensure(&headers).starts_with("req-"));
    }
}
