//! HTTP transport to the storage nodes.
//!
//! Every node exposes a small plain-HTTP surface:
//! `GET /stat` (telemetry for the node's backends), `GET /meta/<bucket>`
//! (bucket metadata), blob operations under `/blob/<namespace>/<key>`,
//! and lookups under `/lookup/<namespace>/<key>`. The transport merges
//! per-node telemetry into one [`Snapshot`] and routes each key to the
//! backend claiming it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bucket::BucketMeta;
use crate::reply::{LookupServerResult, ReplyError};
use crate::stat::{routing_id, BackendAddr, BackendStat, Snapshot, StatGroup, VfsStat};
use crate::transport::{Result, Session, SessionSpec, Transport, TransportError};

type Client = HyperClient<HttpConnector, Full<Bytes>>;

/// Timeout for the telemetry and metadata queries, which are not bound
/// to any session.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Telemetry for one backend as reported by its node.
#[derive(Debug, Deserialize)]
struct NodeBackendStat {
    group: u32,
    backend: i32,
    #[serde(default)]
    ro: bool,
    #[serde(default)]
    error_code: i32,
    vfs: VfsStat,
}

/// `GET /stat` payload.
#[derive(Debug, Deserialize)]
struct NodeStatReply {
    backends: Vec<NodeBackendStat>,
}

/// Blob operation reply row as sent by a node.
#[derive(Debug, Default, Deserialize)]
struct WireRow {
    #[serde(default)]
    id: String,
    #[serde(default)]
    csum: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    mtime: String,
}

fn status_to_code(status: StatusCode) -> i32 {
    match status {
        StatusCode::NOT_FOUND => -2,
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => -110,
        _ => -5,
    }
}

fn error_row(group: u32, code: i32, message: String) -> LookupServerResult {
    LookupServerResult {
        group,
        backend: -1,
        id: String::new(),
        csum: String::new(),
        filename: String::new(),
        size: 0,
        offset: 0,
        mtime: String::new(),
        server: String::new(),
        error: Some(ReplyError { code, message }),
        addr: String::new(),
    }
}

pub struct HttpTransport {
    client: Client,
    remotes: Vec<String>,
    /// Routing view: the most recent snapshot this transport produced.
    routing: RwLock<Arc<Snapshot>>,
}

impl HttpTransport {
    pub fn new(remotes: Vec<String>) -> Self {
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .build(HttpConnector::new());

        Self { client, remotes, routing: RwLock::new(Arc::new(Snapshot::empty())) }
    }

    fn routing(&self) -> Arc<Snapshot> {
        Arc::clone(&self.routing.read().expect("routing lock poisoned"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        client: &Client,
        url: &str,
        timeout: Duration,
    ) -> Result<T> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let resp = tokio::time::timeout(timeout, client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(TransportError::Backend {
                code: status_to_code(status),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    type Session = HttpSession;

    async fn stat(&self) -> Result<Arc<Snapshot>> {
        let mut by_group: BTreeMap<u32, Vec<Arc<BackendStat>>> = BTreeMap::new();
        let mut reached = 0usize;

        for remote in &self.remotes {
            let url = format!("http://{}/stat", remote);
            let reply: NodeStatReply =
                match Self::get_json(&self.client, &url, CONTROL_TIMEOUT).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(remote = remote.as_str(), error = %e, "stat: node unreachable");
                        continue;
                    }
                };
            reached += 1;

            for b in reply.backends {
                let addr =
                    BackendAddr { group: b.group, addr: remote.clone(), backend: b.backend };
                by_group
                    .entry(b.group)
                    .or_default()
                    .push(Arc::new(BackendStat::new(addr, b.ro, b.error_code, b.vfs)));
            }
        }

        if reached == 0 {
            return Err(TransportError::Io("no storage node answered the stat query".into()));
        }

        let groups: BTreeMap<u32, Arc<StatGroup>> = by_group
            .into_iter()
            .map(|(g, backends)| (g, Arc::new(StatGroup::new(backends))))
            .collect();

        let snapshot = Arc::new(Snapshot::new(groups));

        // the new view routes all sessions created from now on; PID
        // carry-over happens in the controller before publication
        *self.routing.write().expect("routing lock poisoned") = Arc::clone(&snapshot);

        Ok(snapshot)
    }

    async fn read_bucket_meta(&self, name: &str) -> Result<BucketMeta> {
        for remote in &self.remotes {
            let url = format!("http://{}/meta/{}", remote, name);
            match Self::get_json::<BucketMeta>(&self.client, &url, CONTROL_TIMEOUT).await {
                Ok(meta) => return Ok(meta),
                Err(e) => {
                    debug!(remote = remote.as_str(), bucket = name, error = %e,
                        "read-bucket-meta: retrying on next remote");
                }
            }
        }

        Err(TransportError::MetaNotFound(name.to_string()))
    }

    fn data_session(&self, spec: SessionSpec) -> Result<Self::Session> {
        Ok(HttpSession { client: self.client.clone(), spec, routing: self.routing() })
    }

    fn metadata_session(&self) -> Result<Self::Session> {
        Ok(HttpSession {
            client: self.client.clone(),
            spec: SessionSpec::default(),
            routing: self.routing(),
        })
    }
}

pub struct HttpSession {
    client: Client,
    spec: SessionSpec,
    routing: Arc<Snapshot>,
}

impl HttpSession {
    fn resolve(&self, group: u32, key: &str) -> Result<BackendAddr> {
        self.routing
            .find_by_key(group, key)
            .map(|st| st.addr.clone())
            .ok_or(TransportError::NoRoute { group })
    }

    fn url(&self, addr: &BackendAddr, prefix: &str, key: &str, query: &str) -> String {
        format!("http://{}/{}/{}/{}{}", addr.addr, prefix, self.spec.namespace, key, query)
    }

    async fn request_row(
        client: Client,
        method: Method,
        url: String,
        body: Bytes,
        timeout: Duration,
        addr: BackendAddr,
    ) -> LookupServerResult {
        let mut row = LookupServerResult {
            group: addr.group,
            backend: addr.backend,
            id: String::new(),
            csum: String::new(),
            filename: String::new(),
            size: 0,
            offset: 0,
            mtime: String::new(),
            server: addr.addr.clone(),
            error: None,
            addr: addr.addr.clone(),
        };

        let req = match Request::builder().method(method).uri(&url).body(Full::new(body)) {
            Ok(r) => r,
            Err(e) => {
                row.error = Some(ReplyError { code: -22, message: e.to_string() });
                return row;
            }
        };

        let resp = match tokio::time::timeout(timeout, client.request(req)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                row.error = Some(ReplyError { code: -5, message: e.to_string() });
                return row;
            }
            Err(_) => {
                row.error = Some(ReplyError {
                    code: -110,
                    message: format!("timeout after {:?}", timeout),
                });
                return row;
            }
        };

        let status = resp.status();
        let bytes = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                row.error = Some(ReplyError { code: -5, message: e.to_string() });
                return row;
            }
        };

        if !status.is_success() {
            row.error = Some(ReplyError {
                code: status_to_code(status),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
            return row;
        }

        let wire: WireRow = serde_json::from_slice(&bytes).unwrap_or_default();
        row.id = wire.id;
        row.csum = wire.csum;
        row.filename = wire.filename;
        row.size = wire.size;
        row.offset = wire.offset;
        row.mtime = wire.mtime;

        row
    }

    /// Fan one operation out to every group of the session, one reply
    /// row per group.
    async fn fan_out(
        &self,
        method: Method,
        prefix: &str,
        key: &str,
        query: &str,
        body: Bytes,
    ) -> Vec<LookupServerResult> {
        let mut pending = Vec::with_capacity(self.spec.groups.len());

        for group in &self.spec.groups {
            match self.resolve(*group, key) {
                Ok(addr) => {
                    let url = self.url(&addr, prefix, key, query);
                    pending.push((
                        *group,
                        Ok(tokio::spawn(Self::request_row(
                            self.client.clone(),
                            method.clone(),
                            url,
                            body.clone(),
                            self.spec.timeout,
                            addr,
                        ))),
                    ));
                }
                Err(e) => pending.push((*group, Err(e))),
            }
        }

        let mut rows = Vec::with_capacity(pending.len());
        for (group, entry) in pending {
            match entry {
                Ok(handle) => match handle.await {
                    Ok(row) => rows.push(row),
                    Err(e) => rows.push(error_row(group, -5, e.to_string())),
                },
                Err(e) => rows.push(error_row(group, -6, e.to_string())),
            }
        }

        rows
    }
}

#[async_trait]
impl Session for HttpSession {
    fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    fn transform(&self, key: &str) -> u64 {
        routing_id(key)
    }

    async fn write_data(
        &self,
        key: &str,
        body: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Result<Vec<LookupServerResult>> {
        let query = format!("?offset={}&size={}", offset, total_size);
        let mut rows = self.fan_out(Method::POST, "blob", key, &query, body).await;

        if !self.spec.filter_all {
            rows.retain(|r| r.is_success());
        }
        Ok(rows)
    }

    async fn read_data(&self, key: &str, offset: u64, size: u64) -> Result<Bytes> {
        let query = format!("?offset={}&size={}", offset, size);
        let mut last_err =
            TransportError::Backend { code: -2, message: "no group holds the key".into() };

        for group in &self.spec.groups {
            let addr = match self.resolve(*group, key) {
                Ok(a) => a,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };

            let url = self.url(&addr, "blob", key, &query);
            let req = Request::builder()
                .method(Method::GET)
                .uri(&url)
                .body(Full::new(Bytes::new()))
                .map_err(|e| TransportError::Io(e.to_string()))?;

            let resp =
                match tokio::time::timeout(self.spec.timeout, self.client.request(req)).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        last_err = TransportError::Io(e.to_string());
                        continue;
                    }
                    Err(_) => {
                        last_err = TransportError::Timeout(self.spec.timeout);
                        continue;
                    }
                };

            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?
                .to_bytes();

            if status.is_success() {
                return Ok(bytes);
            }

            last_err = TransportError::Backend {
                code: status_to_code(status),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            };
        }

        Err(last_err)
    }

    async fn parallel_lookup(&self, key: &str) -> Result<Vec<LookupServerResult>> {
        Ok(self.fan_out(Method::GET, "lookup", key, "", Bytes::new()).await)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let rows = self.fan_out(Method::DELETE, "blob", key, "", Bytes::new()).await;

        if rows.iter().any(|r| r.is_success()) {
            return Ok(());
        }

        match rows.into_iter().filter_map(|r| r.error).last() {
            Some(e) => Err(TransportError::Backend { code: e.code, message: e.message }),
            None => Ok(()),
        }
    }

    async fn bulk_remove(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let mut failed: HashMap<String, String> = HashMap::new();

        for key in keys {
            if let Err(e) = self.remove(key).await {
                failed.insert(key.clone(), e.to_string());
            }
        }

        Ok(failed)
    }
}
