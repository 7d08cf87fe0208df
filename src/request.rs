//! Per-request view consumed by the bucket controller.
//!
//! Handlers strip the hyper request down to the parts the controller and
//! the auth check need; the body travels separately as `Bytes`.

use hyper::header::HeaderMap;
use hyper::{Method, Uri};

use crate::error::{Error, Result};

/// Request metadata handed from the HTTP boundary to the controller.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self { method, uri, headers }
    }

    /// Full request URL as reported in errors and logs.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Query pairs in order of appearance, percent-decoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match self.uri.query() {
            Some(q) => url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// First value of the given query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// `offset` and `size` query parameters, both defaulting to 0.
    pub fn offset_size(&self) -> Result<(u64, u64)> {
        let mut offset = 0;
        let mut size = 0;

        if let Some(s) = self.query_param("offset") {
            offset = parse_u64_prefixed(&s).ok_or_else(|| {
                Error::bad_request(self.url(), format!("could not parse offset URI: {}", s))
            })?;
        }

        if let Some(s) = self.query_param("size") {
            size = parse_u64_prefixed(&s).ok_or_else(|| {
                Error::bad_request(self.url(), format!("could not parse size URI: {}", s))
            })?;
        }

        Ok((offset, size))
    }

    /// Parsed Content-Length header; `None` when absent or malformed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_u64_prefixed)
    }
}

/// Parse an unsigned 64-bit integer, accepting decimal or C-style
/// prefixed forms: `0x`/`0X` hex, `0o`/`0O` octal, `0b`/`0B` binary, and
/// a bare leading zero for octal.
pub fn parse_u64_prefixed(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, radix) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (rest, 2)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    u64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(uri: &str) -> ProxyRequest {
        ProxyRequest::new(Method::GET, uri.parse().unwrap(), HeaderMap::new())
    }

    #[test]
    fn test_parse_u64_prefixed() {
        assert_eq!(parse_u64_prefixed("12345"), Some(12345));
        assert_eq!(parse_u64_prefixed("0x10"), Some(16));
        assert_eq!(parse_u64_prefixed("0X10"), Some(16));
        assert_eq!(parse_u64_prefixed("0o17"), Some(15));
        assert_eq!(parse_u64_prefixed("017"), Some(15));
        assert_eq!(parse_u64_prefixed("0b101"), Some(5));
        assert_eq!(parse_u64_prefixed("0"), Some(0));
        assert_eq!(parse_u64_prefixed(""), None);
        assert_eq!(parse_u64_prefixed("nope"), None);
        assert_eq!(parse_u64_prefixed("-1"), None);
    }

    #[test]
    fn test_offset_size_defaults() {
        let (offset, size) = req("/get/b/k").offset_size().unwrap();
        assert_eq!(offset, 0);
        assert_eq!(size, 0);
    }

    #[test]
    fn test_offset_size_parsed() {
        let (offset, size) = req("/get/b/k?offset=0x100&size=4096").offset_size().unwrap();
        assert_eq!(offset, 256);
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_offset_malformed() {
        let err = req("/get/b/k?offset=abc").offset_size().unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONTENT_LENGTH, "1024".parse().unwrap());
        let r = ProxyRequest::new(Method::POST, "/upload/b/k".parse().unwrap(), headers);
        assert_eq!(r.content_length(), Some(1024));
        assert_eq!(req("/upload/b/k").content_length(), None);
    }
}
