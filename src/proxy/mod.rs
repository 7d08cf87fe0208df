//! HTTP frontend.
//!
//! Thin dispatch layer: splits the path into handler/bucket/key, hands
//! the request to the controller, and renders replies and errors as
//! JSON or raw bytes.

pub mod server;

pub use server::ProxyServer;
