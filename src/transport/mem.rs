//! In-memory transport.
//!
//! Backs the integration tests: deterministic telemetry, blob storage in
//! a map, and per-group failure injection. Behaves like the HTTP
//! transport from the controller's point of view.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::bucket::BucketMeta;
use crate::reply::{LookupServerResult, ReplyError};
use crate::stat::{route_index, routing_id, BackendAddr, BackendStat, Snapshot, StatGroup, VfsStat};
use crate::transport::{Result, Session, SessionSpec, Transport, TransportError};

/// Configured state of one in-memory backend.
#[derive(Debug, Clone)]
pub struct MemBackend {
    pub addr: BackendAddr,
    pub read_only: bool,
    pub error_code: i32,
    pub vfs: VfsStat,
}

#[derive(Default)]
struct MemState {
    groups: BTreeMap<u32, Vec<MemBackend>>,
    meta: HashMap<String, BucketMeta>,
    blobs: HashMap<(String, String), Bytes>,
    fail_write_groups: HashSet<u32>,
    fail_stat: bool,
    fail_metadata_session: bool,
    stat_calls: usize,
    meta_reads: usize,
}

#[derive(Clone, Default)]
pub struct MemTransport {
    state: Arc<Mutex<MemState>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("mem transport lock poisoned")
    }

    /// Register one backend in a group.
    pub fn add_backend(&self, group: u32, addr: &str, backend: i32, vfs: VfsStat) {
        self.lock().groups.entry(group).or_default().push(MemBackend {
            addr: BackendAddr { group, addr: addr.to_string(), backend },
            read_only: false,
            error_code: 0,
            vfs,
        });
    }

    /// Register a single-backend group with plenty of healthy space.
    pub fn add_healthy_group(&self, group: u32) {
        let limit = 100u64 << 20;
        self.add_backend(
            group,
            &format!("node-{}:1025", group),
            0,
            VfsStat {
                total_size_limit: limit,
                total: limit,
                avail: limit * 9 / 10,
                backend_used_size: limit / 10,
                records_total: 1000,
                records_removed: 0,
            },
        );
    }

    pub fn set_read_only(&self, group: u32, read_only: bool) {
        if let Some(backends) = self.lock().groups.get_mut(&group) {
            for b in backends {
                b.read_only = read_only;
            }
        }
    }

    pub fn set_error_code(&self, group: u32, error_code: i32) {
        if let Some(backends) = self.lock().groups.get_mut(&group) {
            for b in backends {
                b.error_code = error_code;
            }
        }
    }

    pub fn set_records(&self, group: u32, total: u64, removed: u64) {
        if let Some(backends) = self.lock().groups.get_mut(&group) {
            for b in backends {
                b.vfs.records_total = total;
                b.vfs.records_removed = removed;
            }
        }
    }

    /// Drop a group from the telemetry without touching its blobs.
    pub fn drop_group(&self, group: u32) {
        self.lock().groups.remove(&group);
    }

    pub fn put_meta(&self, meta: BucketMeta) {
        self.lock().meta.insert(meta.name.clone(), meta);
    }

    pub fn remove_meta(&self, name: &str) {
        self.lock().meta.remove(name);
    }

    /// Make writes to the given group fail with an I/O error row.
    pub fn fail_writes(&self, group: u32, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.fail_write_groups.insert(group);
        } else {
            state.fail_write_groups.remove(&group);
        }
    }

    /// Make the next stat queries fail outright.
    pub fn fail_stat(&self, fail: bool) {
        self.lock().fail_stat = fail;
    }

    /// Make metadata session creation fail.
    pub fn fail_metadata_session(&self, fail: bool) {
        self.lock().fail_metadata_session = fail;
    }

    pub fn stat_calls(&self) -> usize {
        self.lock().stat_calls
    }

    pub fn meta_reads(&self) -> usize {
        self.lock().meta_reads
    }

    pub fn blob(&self, namespace: &str, key: &str) -> Option<Bytes> {
        self.lock().blobs.get(&(namespace.to_string(), key.to_string())).cloned()
    }
}

fn success_row(addr: &BackendAddr, key: &str, size: u64, offset: u64) -> LookupServerResult {
    LookupServerResult {
        group: addr.group,
        backend: addr.backend,
        id: format!("{:016x}", routing_id(key)),
        csum: String::new(),
        filename: key.to_string(),
        size,
        offset,
        mtime: String::new(),
        server: addr.addr.clone(),
        error: None,
        addr: addr.addr.clone(),
    }
}

fn failure_row(addr: &BackendAddr, key: &str, code: i32, message: &str) -> LookupServerResult {
    LookupServerResult {
        group: addr.group,
        backend: addr.backend,
        id: format!("{:016x}", routing_id(key)),
        csum: String::new(),
        filename: key.to_string(),
        size: 0,
        offset: 0,
        mtime: String::new(),
        server: addr.addr.clone(),
        error: Some(ReplyError { code, message: message.to_string() }),
        addr: addr.addr.clone(),
    }
}

#[async_trait]
impl Transport for MemTransport {
    type Session = MemSession;

    async fn stat(&self) -> Result<Arc<Snapshot>> {
        let mut state = self.lock();
        state.stat_calls += 1;

        if state.fail_stat {
            return Err(TransportError::Io("stat injection: transport down".into()));
        }

        let groups: BTreeMap<u32, Arc<StatGroup>> = state
            .groups
            .iter()
            .map(|(g, backends)| {
                let stats = backends
                    .iter()
                    .map(|b| {
                        Arc::new(BackendStat::new(
                            b.addr.clone(),
                            b.read_only,
                            b.error_code,
                            b.vfs,
                        ))
                    })
                    .collect();
                (*g, Arc::new(StatGroup::new(stats)))
            })
            .collect();

        Ok(Arc::new(Snapshot::new(groups)))
    }

    async fn read_bucket_meta(&self, name: &str) -> Result<BucketMeta> {
        let mut state = self.lock();
        state.meta_reads += 1;
        state
            .meta
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::MetaNotFound(name.to_string()))
    }

    fn data_session(&self, spec: SessionSpec) -> Result<Self::Session> {
        Ok(MemSession { transport: self.clone(), spec })
    }

    fn metadata_session(&self) -> Result<Self::Session> {
        if self.lock().fail_metadata_session {
            return Err(TransportError::Io(
                "metadata session injection: transport down".into(),
            ));
        }
        Ok(MemSession { transport: self.clone(), spec: SessionSpec::default() })
    }
}

pub struct MemSession {
    transport: MemTransport,
    spec: SessionSpec,
}

impl MemSession {
    fn route(state: &MemState, group: u32, key: &str) -> Option<BackendAddr> {
        let backends = state.groups.get(&group)?;
        if backends.is_empty() {
            return None;
        }
        let mut sorted: Vec<&MemBackend> = backends.iter().collect();
        sorted.sort_by(|a, b| (&a.addr.addr, a.addr.backend).cmp(&(&b.addr.addr, b.addr.backend)));
        let idx = route_index(routing_id(key), sorted.len());
        Some(sorted[idx].addr.clone())
    }
}

#[async_trait]
impl Session for MemSession {
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
        let mut state = self.transport.lock();
        let mut rows = Vec::with_capacity(self.spec.groups.len());

        for group in &self.spec.groups {
            let addr = match Self::route(&state, *group, key) {
                Some(a) => a,
                None => {
                    rows.push(failure_row(
                        &BackendAddr { group: *group, addr: String::new(), backend: -1 },
                        key,
                        -6,
                        "no route to key",
                    ));
                    continue;
                }
            };

            if state.fail_write_groups.contains(group) {
                rows.push(failure_row(&addr, key, -5, "write injection: i/o error"));
                continue;
            }

            rows.push(success_row(&addr, key, total_size, offset));
        }

        if rows.iter().any(|r| r.is_success()) {
            state
                .blobs
                .insert((self.spec.namespace.clone(), key.to_string()), body);
        }

        if !self.spec.filter_all {
            rows.retain(|r| r.is_success());
        }
        Ok(rows)
    }

    async fn read_data(&self, key: &str, offset: u64, size: u64) -> Result<Bytes> {
        let state = self.transport.lock();
        let blob = state
            .blobs
            .get(&(self.spec.namespace.clone(), key.to_string()))
            .ok_or(TransportError::Backend { code: -2, message: "no such key".into() })?;

        let start = (offset as usize).min(blob.len());
        let end = if size == 0 { blob.len() } else { (start + size as usize).min(blob.len()) };
        Ok(blob.slice(start..end))
    }

    async fn parallel_lookup(&self, key: &str) -> Result<Vec<LookupServerResult>> {
        let state = self.transport.lock();
        let exists = state
            .blobs
            .contains_key(&(self.spec.namespace.clone(), key.to_string()));
        let size = state
            .blobs
            .get(&(self.spec.namespace.clone(), key.to_string()))
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        let mut rows = Vec::with_capacity(self.spec.groups.len());
        for group in &self.spec.groups {
            let addr = match Self::route(&state, *group, key) {
                Some(a) => a,
                None => {
                    rows.push(failure_row(
                        &BackendAddr { group: *group, addr: String::new(), backend: -1 },
                        key,
                        -6,
                        "no route to key",
                    ));
                    continue;
                }
            };

            if exists {
                rows.push(success_row(&addr, key, size, 0));
            } else {
                rows.push(failure_row(&addr, key, -2, "no such key"));
            }
        }

        Ok(rows)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.transport.lock();
        match state.blobs.remove(&(self.spec.namespace.clone(), key.to_string())) {
            Some(_) => Ok(()),
            None => Err(TransportError::Backend { code: -2, message: "no such key".into() }),
        }
    }

    async fn bulk_remove(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let mut failed = HashMap::new();
        let mut state = self.transport.lock();

        for key in keys {
            if state
                .blobs
                .remove(&(self.spec.namespace.clone(), key.clone()))
                .is_none()
            {
                failed.insert(key.clone(), "no such key".to_string());
            }
        }

        Ok(failed)
    }
}
