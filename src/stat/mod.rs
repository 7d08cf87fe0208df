//! Backend telemetry snapshots.
//!
//! One [`Snapshot`] per stat refresh: an immutable view of every
//! (group, address, backend) in the cluster. Everything in a snapshot is
//! replaced wholesale by the next refresh except the PID pain score,
//! which is carried forward when the same backend identity reappears.

pub mod pid;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

pub use pid::PidPain;

/// One data-holding endpoint: (group, address, backend index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendAddr {
    pub group: u32,
    pub addr: String,
    pub backend: i32,
}

impl std::fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.addr, self.backend)
    }
}

/// VFS counters reported by one backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VfsStat {
    pub total_size_limit: u64,
    pub total: u64,
    pub avail: u64,
    pub backend_used_size: u64,
    pub records_total: u64,
    pub records_removed: u64,
}

impl VfsStat {
    pub fn live_records(&self) -> u64 {
        self.records_total.saturating_sub(self.records_removed)
    }

    /// Fraction of records already removed; defrag candidate signal.
    pub fn removed_ratio(&self) -> f64 {
        if self.records_total == 0 {
            return 0.0;
        }
        self.records_removed as f64 / self.records_total as f64
    }
}

/// Telemetry for one backend. Immutable after snapshot publication,
/// except the PID pain which is fed by the upload path.
#[derive(Debug)]
pub struct BackendStat {
    pub addr: BackendAddr,
    pub read_only: bool,
    pub error_code: i32,
    pub vfs: VfsStat,
    pub pid: PidPain,
}

impl BackendStat {
    pub fn new(addr: BackendAddr, read_only: bool, error_code: i32, vfs: VfsStat) -> Self {
        Self { addr, read_only, error_code, vfs, pid: PidPain::new() }
    }

    pub fn pid_pain(&self) -> f64 {
        self.pid.pain()
    }

    pub fn pid_update(&self, observation: f64) {
        self.pid.update(observation)
    }
}

/// Serializable projection of one backend for /stat and state dumps.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatData {
    pub addr: String,
    pub backend: i32,
    pub ro: bool,
    pub error_code: i32,
    pub vfs: VfsStat,
    pub pain: f64,
}

/// Routing id of a key: first 8 big-endian bytes of SHA-512(key).
pub fn routing_id(key: &str) -> u64 {
    let digest = Sha512::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha512 digest is 64 bytes"))
}

/// Index of the backend claiming `id` among `len` backends: the id space
/// splits into `len` equal contiguous ranges in sorted-backend order.
pub fn route_index(id: u64, len: usize) -> usize {
    debug_assert!(len > 0);
    ((id as u128 * len as u128) >> 64) as usize
}

/// All backends of one group, sorted by (address, backend index).
#[derive(Debug, Default)]
pub struct StatGroup {
    backends: Vec<Arc<BackendStat>>,
}

impl StatGroup {
    pub fn new(mut backends: Vec<Arc<BackendStat>>) -> Self {
        backends.sort_by(|a, b| {
            (&a.addr.addr, a.addr.backend).cmp(&(&b.addr.addr, b.addr.backend))
        });
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<BackendStat>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend that would host `key`, or `None` when the group claims
    /// nothing (no route).
    pub fn find_by_key(&self, key: &str) -> Option<&Arc<BackendStat>> {
        if self.backends.is_empty() {
            return None;
        }
        let idx = route_index(routing_id(key), self.backends.len());
        self.backends.get(idx)
    }

    /// Direct lookup by (address, backend index); write-feedback path.
    pub fn find_by_addr(&self, addr: &str, backend: i32) -> Option<&Arc<BackendStat>> {
        self.backends
            .iter()
            .find(|st| st.addr.addr == addr && st.addr.backend == backend)
    }

    /// Live records across all backends of this group.
    pub fn live_records(&self) -> u64 {
        self.backends.iter().map(|st| st.vfs.live_records()).sum()
    }

    pub fn stat_data(&self) -> Vec<BackendStatData> {
        self.backends
            .iter()
            .map(|st| BackendStatData {
                addr: st.addr.addr.clone(),
                backend: st.addr.backend,
                ro: st.read_only,
                error_code: st.error_code,
                vfs: st.vfs,
                pain: st.pid_pain(),
            })
            .collect()
    }
}

/// One refresh cycle's view of the whole cluster.
#[derive(Debug)]
pub struct Snapshot {
    pub groups: BTreeMap<u32, Arc<StatGroup>>,
    pub time: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(groups: BTreeMap<u32, Arc<StatGroup>>) -> Self {
        Self { groups, time: Utc::now() }
    }

    pub fn empty() -> Self {
        Self { groups: BTreeMap::new(), time: Utc::now() }
    }

    pub fn group(&self, group: u32) -> Option<&Arc<StatGroup>> {
        self.groups.get(&group)
    }

    pub fn find_by_key(&self, group: u32, key: &str) -> Option<&Arc<BackendStat>> {
        self.group(group)?.find_by_key(key)
    }

    pub fn find_by_addr(&self, group: u32, addr: &str, backend: i32) -> Option<&Arc<BackendStat>> {
        self.group(group)?.find_by_addr(addr, backend)
    }

    /// Carry PID pain forward from the previous snapshot for every
    /// backend identity that reappears; new identities start at zero.
    pub fn inherit_pain(&self, prev: &Snapshot) {
        for (group, sg) in &self.groups {
            let prev_group = match prev.group(*group) {
                Some(g) => g,
                None => continue,
            };
            for st in sg.backends() {
                if let Some(old) = prev_group.find_by_addr(&st.addr.addr, st.addr.backend) {
                    st.pid.store(old.pid_pain());
                }
            }
        }
    }
}
