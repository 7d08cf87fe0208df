//! blobpool - bucket-aware HTTP proxy for a replicated blob store

pub mod auth;
pub mod bucket;
pub mod config;
pub mod ctl;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod reply;
pub mod request;
pub mod stat;
pub mod transport;

pub use config::ProxyConfig;
pub use ctl::BucketCtl;
pub use error::Error;
