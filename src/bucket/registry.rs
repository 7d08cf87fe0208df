//! Bucket registry: the shared model behind every request.
//!
//! Two lists: *writable* buckets (placement candidates, replaced wholesale
//! by config reloads) and *adopted* buckets (resolved lazily by name,
//! cleared on reload signal). One readers-writer lock covers both lists
//! and the published snapshot; it is never held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::bucket::Bucket;
use crate::stat::{Snapshot, StatGroup};

struct Inner {
    writable: Vec<Arc<Bucket>>,
    adopted: Vec<Arc<Bucket>>,
    snapshot: Arc<Snapshot>,
}

pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                writable: Vec::new(),
                adopted: Vec::new(),
                snapshot: Arc::new(Snapshot::empty()),
            }),
        }
    }

    /// First bucket with the given name, writable list first.
    pub fn find(&self, name: &str) -> Option<Arc<Bucket>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .writable
            .iter()
            .chain(inner.adopted.iter())
            .find(|b| b.name() == name)
            .cloned()
    }

    /// Append a lazily resolved bucket to the adopted list.
    ///
    /// Concurrent resolution of the same missing name may append
    /// duplicates; `find` returns the first match, so they are benign
    /// and live only until the next reload signal.
    pub fn adopt(&self, bucket: Arc<Bucket>) -> Arc<Bucket> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.adopted.push(Arc::clone(&bucket));
        bucket
    }

    /// Replace the writable list in one step.
    pub fn replace_writable(&self, buckets: Vec<Arc<Bucket>>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.writable = buckets;
    }

    /// Config reload path: swap the writable list and publish a snapshot
    /// under one exclusive lock acquisition.
    pub fn install(&self, buckets: Vec<Arc<Bucket>>, snapshot: Arc<Snapshot>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.writable = buckets;
        Self::apply_snapshot_locked(&mut inner, snapshot);
    }

    /// Drop every adopted bucket.
    pub fn clear_adopted(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.adopted.clear();
    }

    pub fn writable(&self) -> Vec<Arc<Bucket>> {
        self.inner.read().expect("registry lock poisoned").writable.clone()
    }

    /// Every known bucket, writable first.
    pub fn all_buckets(&self) -> Vec<Arc<Bucket>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.writable.iter().chain(inner.adopted.iter()).cloned().collect()
    }

    /// Most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read().expect("registry lock poisoned").snapshot)
    }

    pub fn stat_time(&self) -> DateTime<Utc> {
        self.inner.read().expect("registry lock poisoned").snapshot.time
    }

    /// Publish a fresh snapshot: under the exclusive lock, reassign every
    /// bucket's per-group stat pointers from it. Groups missing from the
    /// snapshot keep their previous entry.
    pub fn apply_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        Self::apply_snapshot_locked(&mut inner, snapshot);
    }

    fn apply_snapshot_locked(inner: &mut Inner, snapshot: Arc<Snapshot>) {
        for bucket in inner.writable.iter().chain(inner.adopted.iter()) {
            let mut groups: HashMap<u32, Arc<StatGroup>> = bucket.group_map();
            for group in &bucket.meta.groups {
                match snapshot.group(*group) {
                    Some(sg) => {
                        groups.insert(*group, Arc::clone(sg));
                    }
                    None => {
                        warn!(
                            bucket = bucket.name(),
                            group, "no stat for group, keeping old values (if any)"
                        );
                    }
                }
            }
            bucket.replace_groups(groups);
        }

        inner.snapshot = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketMeta;
    use crate::stat::{BackendAddr, BackendStat, VfsStat};
    use std::collections::BTreeMap;

    fn bucket(name: &str, groups: Vec<u32>) -> Arc<Bucket> {
        Arc::new(Bucket::new(BucketMeta::new(name, groups)))
    }

    fn snapshot_with_groups(groups: &[u32]) -> Arc<Snapshot> {
        let mut map = BTreeMap::new();
        for g in groups {
            let st = Arc::new(BackendStat::new(
                BackendAddr { group: *g, addr: format!("node-{}:1025", g), backend: 0 },
                false,
                0,
                VfsStat::default(),
            ));
            map.insert(*g, Arc::new(StatGroup::new(vec![st])));
        }
        Arc::new(Snapshot::new(map))
    }

    #[test]
    fn test_find_prefers_writable() {
        let registry = Registry::new();
        let w = bucket("same", vec![1]);
        let a = bucket("same", vec![2]);
        registry.replace_writable(vec![Arc::clone(&w)]);
        registry.adopt(a);

        let found = registry.find("same").unwrap();
        assert_eq!(found.meta.groups, vec![1]);
    }

    #[test]
    fn test_find_missing_is_none() {
        let registry = Registry::new();
        assert!(registry.find("nope").is_none());
    }

    #[test]
    fn test_clear_adopted_keeps_writable() {
        let registry = Registry::new();
        registry.replace_writable(vec![bucket("w", vec![1])]);
        registry.adopt(bucket("a", vec![2]));

        registry.clear_adopted();
        assert!(registry.find("w").is_some());
        assert!(registry.find("a").is_none());
    }

    #[test]
    fn test_all_buckets_writable_first() {
        let registry = Registry::new();
        registry.replace_writable(vec![bucket("w1", vec![1]), bucket("w2", vec![2])]);
        registry.adopt(bucket("a1", vec![3]));

        let names: Vec<String> =
            registry.all_buckets().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["w1", "w2", "a1"]);
    }

    #[test]
    fn test_apply_snapshot_assigns_groups() {
        let registry = Registry::new();
        let b = bucket("b", vec![1, 2, 3]);
        registry.replace_writable(vec![Arc::clone(&b)]);

        registry.apply_snapshot(snapshot_with_groups(&[1, 2]));

        assert!(b.group(1).is_some());
        assert!(b.group(2).is_some());
        // group 3 absent from the snapshot: no stat at all yet
        assert!(b.group(3).is_none());
    }

    #[test]
    fn test_apply_snapshot_keeps_old_entry_for_missing_group() {
        let registry = Registry::new();
        let b = bucket("b", vec![1]);
        registry.replace_writable(vec![Arc::clone(&b)]);

        registry.apply_snapshot(snapshot_with_groups(&[1]));
        let old = b.group(1).unwrap();

        // next refresh lost group 1 entirely
        registry.apply_snapshot(snapshot_with_groups(&[]));
        let kept = b.group(1).unwrap();
        assert!(Arc::ptr_eq(&old, &kept));
    }

    #[test]
    fn test_snapshot_timestamp_updates() {
        let registry = Registry::new();
        let t0 = registry.stat_time();
        registry.apply_snapshot(snapshot_with_groups(&[1]));
        assert!(registry.stat_time() >= t0);
    }
}
