//! Request error taxonomy.
//!
//! Every error carries the request URL and a message, and maps to an HTTP
//! status decided at construction time. Transient per-group backend errors
//! never surface here; they are absorbed into the per-group reply rows.

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced to the HTTP caller
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("{url}: {message}")]
    BadRequest { url: String, message: String },

    #[error("{url}: {message}")]
    Unauthorized { url: String, message: String },

    #[error("{url}: {message}")]
    Forbidden { url: String, message: String },

    #[error("{url}: {message}")]
    NotFound { url: String, message: String },

    #[error("{url}: {message}")]
    ServiceUnavailable { url: String, message: String },

    #[error("{url}: backend error {code}: {message}")]
    Backend { url: String, code: i32, message: String },
}

impl Error {
    pub fn bad_request(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadRequest { url: url.into(), message: message.into() }
    }

    pub fn unauthorized(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Unauthorized { url: url.into(), message: message.into() }
    }

    pub fn forbidden(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Forbidden { url: url.into(), message: message.into() }
    }

    pub fn not_found(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::NotFound { url: url.into(), message: message.into() }
    }

    pub fn service_unavailable(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ServiceUnavailable { url: url.into(), message: message.into() }
    }

    pub fn backend(url: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Error::Backend { url: url.into(), code, message: message.into() }
    }

    /// HTTP status this error renders as.
    ///
    /// Backend codes follow errno conventions: -2 (ENOENT) is a missing
    /// key, -110 (ETIMEDOUT) a backend timeout, everything else a bad
    /// gateway.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Backend { code, .. } => match code {
                -2 => StatusCode::NOT_FOUND,
                -110 => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Message body sent to the client.
    pub fn data(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
