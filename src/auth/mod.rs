//! Request signatures.
//!
//! `Authorization: <scheme> <user>:<hmac>` where the hmac is SHA-512
//! HMAC of the canonical request string, keyed by the user's ACL token,
//! hex-lowercase. A missing or malformed header degrades to the wildcard
//! user `*` with an empty signature rather than an error; the ACL decides
//! what the wildcard may do.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use hyper::header::HeaderMap;
use hyper::Uri;
use sha2::Sha512;

use crate::request::ProxyRequest;

type HmacSha512 = Hmac<Sha512>;

pub const AUTH_HEADER: &str = "authorization";

/// Wildcard user consulted when no credentials are presented.
pub const WILDCARD_USER: &str = "*";

/// Signed header prefix; everything else is ignored by the signature.
const SIGNED_HEADER_PREFIX: &str = "x-ell-";

/// Extract `(user, received_hmac)` from the Authorization header.
///
/// Any shape problem (no header, wrong token count) yields the wildcard
/// user with an empty signature.
pub fn auth_info(req: &ProxyRequest) -> (String, String) {
    let header = match req.headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok()) {
        Some(h) => h,
        None => return (WILDCARD_USER.to_string(), String::new()),
    };

    let mut parts = header.splitn(2, ' ');
    let _scheme = parts.next();
    let credentials = match parts.next() {
        Some(c) => c,
        None => return (WILDCARD_USER.to_string(), String::new()),
    };

    match credentials.split_once(':') {
        Some((user, hmac)) if !user.is_empty() => (user.to_string(), hmac.to_string()),
        _ => (WILDCARD_USER.to_string(), String::new()),
    }
}

/// Canonical string covered by the signature:
///
/// ```text
/// METHOD\n
/// PATH[?sorted_filtered_query]\n
/// [x-ell-header:value\n ...]   (names lowercased, sorted)
/// ```
///
/// Query parameters with empty values are omitted; for repeated keys the
/// first value wins.
pub fn canonical_request(method: &str, uri: &Uri, headers: &HeaderMap) -> String {
    let mut text = String::with_capacity(128);
    text.push_str(method);
    text.push('\n');
    text.push_str(uri.path());

    if let Some(query) = uri.query() {
        let mut sorted: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            if !v.is_empty() && !sorted.contains_key(k.as_ref()) {
                sorted.insert(k.into_owned(), v.into_owned());
            }
        }

        let mut encoder = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &sorted {
            encoder.append_pair(k, v);
        }

        text.push('?');
        text.push_str(&encoder.finish());
    }
    text.push('\n');

    let mut signed: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower.starts_with(SIGNED_HEADER_PREFIX) && !signed.contains_key(&lower) {
            if let Ok(v) = value.to_str() {
                signed.insert(lower, v.to_string());
            }
        }
    }

    for (k, v) in &signed {
        text.push_str(k);
        text.push(':');
        text.push_str(v);
        text.push('\n');
    }

    text
}

/// Compute the hex-lowercase HMAC-SHA512 signature for a request.
pub fn generate_signature(token: &str, method: &str, uri: &Uri, headers: &HeaderMap) -> String {
    let text = canonical_request(method, uri, headers);

    let mut mac = HmacSha512::new_from_slice(token.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(text.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}
