//! Transport seam between the controller and the backend store.
//!
//! The controller only ever talks to [`Transport`] and [`Session`];
//! `HttpTransport` speaks the storage-node HTTP protocol, `MemTransport`
//! backs the integration tests.

pub mod http;
pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::bucket::BucketMeta;
use crate::reply::LookupServerResult;
use crate::stat::Snapshot;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no route to key in group {group}")]
    NoRoute { group: u32 },

    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },

    #[error("metadata for bucket '{0}' could not be read")]
    MetaNotFound(String),

    #[error("transport I/O: {0}")]
    Io(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Parameters pinned to one session before any operation runs.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Bucket namespace the keys live under
    pub namespace: String,
    /// Replica groups the operation fans out to
    pub groups: Vec<u32>,
    /// Per-operation deadline
    pub timeout: Duration,
    /// Random id correlating this session's log lines
    pub trace_id: u64,
    /// Include failed replicas in write replies
    pub filter_all: bool,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            groups: Vec::new(),
            timeout: Duration::from_secs(100),
            trace_id: rand::random(),
            filter_all: false,
        }
    }
}

impl SessionSpec {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn filter_all(mut self, filter_all: bool) -> Self {
        self.filter_all = filter_all;
        self
    }
}

/// One scoped conversation with the backend store. Dropping the session
/// releases whatever it holds.
#[async_trait]
pub trait Session: Send + Sync {
    fn spec(&self) -> &SessionSpec;

    /// Routing id of a key within this session's namespace; used for
    /// trace logging.
    fn transform(&self, key: &str) -> u64;

    /// Write `body` to every group; one reply row per group, errors
    /// included when the spec asks for them.
    async fn write_data(
        &self,
        key: &str,
        body: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Result<Vec<LookupServerResult>>;

    /// Read from the first group that has the data.
    async fn read_data(&self, key: &str, offset: u64, size: u64) -> Result<Bytes>;

    /// Ask every group where the key lives.
    async fn parallel_lookup(&self, key: &str) -> Result<Vec<LookupServerResult>>;

    /// Remove the key from every group; last error wins.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove many keys; returns per-key error messages for the failures.
    async fn bulk_remove(&self, keys: &[String]) -> Result<HashMap<String, String>>;
}

/// Factory for sessions plus the cluster-wide queries that need no
/// session state.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Pull a fresh telemetry snapshot of every backend.
    async fn stat(&self) -> Result<Arc<Snapshot>>;

    /// Read bucket metadata by name.
    async fn read_bucket_meta(&self, name: &str) -> Result<BucketMeta>;

    /// Session for data-plane operations.
    fn data_session(&self, spec: SessionSpec) -> Result<Self::Session>;

    /// Session for metadata-plane operations.
    fn metadata_session(&self) -> Result<Self::Session>;
}
