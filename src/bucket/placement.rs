//! Write placement: score every writable bucket, then draw one at random
//! weighted by inverse pain.

use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::bucket::Bucket;
use crate::stat::VfsStat;

pub const PAIN_NO_FREE_SPACE_SOFT: f64 = 5_000_000_000.0;
pub const PAIN_NO_FREE_SPACE_HARD: f64 = 50_000_000_000_000.0;

/// Pain for read-only groups
pub const PAIN_STAT_RO: f64 = PAIN_NO_FREE_SPACE_HARD / 2.0;

/// Pain fed into the PID tracker when an upload replica fails
pub const WRITE_ERROR_PAIN: f64 = PAIN_NO_FREE_SPACE_HARD / 2.0;

/// Pain for a backend without statistics
pub const PAIN_NO_STATS: f64 = PAIN_NO_FREE_SPACE_HARD / 2.0;

/// Pain for a group whose statistics carry an error field
pub const PAIN_STAT_ERROR: f64 = PAIN_NO_FREE_SPACE_HARD / 2.0;

/// Pain for a bucket group absent from the snapshot entirely
pub const PAIN_NO_GROUP: f64 = PAIN_NO_FREE_SPACE_HARD / 2.0;

pub const PAIN_DISCREPANCY: f64 = 1000.0;

/// Free-space ratio left on a backend after writing `content_length`
/// more bytes.
pub fn free_space_ratio(vfs: &VfsStat, content_length: u64) -> f64 {
    let mut rate = 1.0
        - (vfs.backend_used_size + content_length) as f64 / vfs.total_size_limit as f64;

    if vfs.avail <= vfs.total_size_limit {
        if vfs.avail < content_length {
            rate = 0.0;
        } else {
            rate = (vfs.avail - content_length) as f64 / vfs.total_size_limit as f64;
        }
    }

    rate
}

/// Score of one writable bucket for one upload.
#[derive(Debug)]
pub struct BucketScore {
    pub bucket: Arc<Bucket>,
    pub pain: f64,
    pub range: f64,
    pub success_groups: Vec<u32>,
    pub error_groups: Vec<u32>,
    pub pains: Vec<f64>,
    pub free_rates: Vec<f64>,
}

impl BucketScore {
    /// A bucket at or above the hard limit can never win.
    pub fn eligible(&self) -> bool {
        self.pain < PAIN_NO_FREE_SPACE_HARD
    }

    fn describe(&self) -> String {
        format!(
            "{{bucket: {}, success-groups: {:?}, error-groups: {:?}, groups: {:?}, pain: {}, free-rates: {:?}}}",
            self.bucket.name(),
            self.success_groups,
            self.error_groups,
            self.bucket.meta.groups,
            self.pain,
            self.free_rates
        )
    }
}

/// Score one bucket: per-group stat penalties, space policy, PID pain,
/// missing-group pain, and record-count discrepancy.
pub fn score_bucket(
    bucket: &Arc<Bucket>,
    key: &str,
    content_length: u64,
    ratio_hard: f64,
    ratio_soft: f64,
) -> BucketScore {
    let mut bs = BucketScore {
        bucket: Arc::clone(bucket),
        pain: 0.0,
        range: 0.0,
        success_groups: Vec::new(),
        error_groups: Vec::new(),
        pains: Vec::new(),
        free_rates: Vec::new(),
    };

    let group_map = bucket.group_map();
    let mut missing_groups = 0u32;

    for group in &bucket.meta.groups {
        let sg = match group_map.get(group) {
            Some(sg) => sg,
            None => {
                missing_groups += 1;
                continue;
            }
        };

        let st = match sg.find_by_key(key) {
            Some(st) => st,
            None => {
                // no statistics for the backend which would host this
                // key; never write into such a bucket group
                bs.error_groups.push(*group);
                bs.pain += PAIN_NO_STATS;
                continue;
            }
        };

        if st.read_only {
            bs.error_groups.push(*group);
            bs.pain += PAIN_STAT_RO;
            continue;
        }

        if st.error_code != 0 {
            bs.error_groups.push(*group);
            bs.pain += PAIN_STAT_ERROR;
            continue;
        }

        // empty stat structure
        if st.vfs.total_size_limit == 0 || st.vfs.total == 0 {
            bs.error_groups.push(*group);
            bs.pain += PAIN_NO_STATS;
            continue;
        }

        let rate = free_space_ratio(&st.vfs, content_length);
        if rate <= ratio_hard {
            bs.error_groups.push(*group);
            bs.pain += PAIN_NO_FREE_SPACE_HARD;
        } else if rate <= ratio_soft {
            bs.error_groups.push(*group);
            let free_space_pain = 1000.0 / (rate - ratio_hard);
            bs.pain += PAIN_NO_FREE_SPACE_SOFT + free_space_pain * 5.0;
        } else {
            bs.success_groups.push(*group);
            let mut free_space_pain = 1000.0 / (rate - ratio_soft);
            if free_space_pain >= PAIN_NO_FREE_SPACE_SOFT {
                free_space_pain = PAIN_NO_FREE_SPACE_SOFT * 0.8;
            }
            bs.pain += free_space_pain;
        }

        let pp = st.pid_pain();
        bs.pain += pp;
        bs.pains.push(pp);
        bs.free_rates.push(rate);
    }

    bs.pain += missing_groups as f64 * PAIN_NO_GROUP;

    // discrepancy pain: the maximum difference in live record counts
    // among this bucket's groups
    let records: Vec<u64> = group_map.values().map(|sg| sg.live_records()).collect();
    if let (Some(min), Some(max)) = (records.iter().min(), records.iter().max()) {
        bs.pain += (max - min) as f64 * PAIN_DISCREPANCY;
    }

    bs
}

/// Choose a writable bucket for one upload, or `None` when no bucket can
/// take it.
pub fn select_bucket(
    buckets: &[Arc<Bucket>],
    key: &str,
    content_length: u64,
    ratio_hard: f64,
    ratio_soft: f64,
    url: &str,
) -> Option<Arc<Bucket>> {
    let mut stat: Vec<BucketScore> = Vec::new();
    let mut failed: Vec<BucketScore> = Vec::new();

    for bucket in buckets {
        let mut bs = score_bucket(bucket, key, content_length, ratio_hard, ratio_soft);

        if !bs.eligible() {
            failed.push(bs);
            continue;
        }

        bs.range = if bs.pain != 0.0 { 1.0 / bs.pain } else { 1.0 };
        stat.push(bs);
    }

    if stat.is_empty() {
        let descr: Vec<String> = failed.iter().map(|bs| bs.describe()).collect();
        info!(
            url,
            content_length, "find-bucket: there are no suitable buckets: {:?}", descr
        );
        return None;
    }

    // prefer buckets with real free space when any exist
    let ok_buckets = stat.iter().filter(|bs| bs.pain < PAIN_NO_FREE_SPACE_SOFT).count();
    if ok_buckets != 0 && ok_buckets != stat.len() {
        stat.retain(|bs| bs.pain < PAIN_NO_FREE_SPACE_SOFT);
    }

    let descr: Vec<String> = stat.iter().map(|bs| bs.describe()).collect();
    info!(url, content_length, "find-bucket: candidates: {:?}", descr);

    // scale ranges up until their integer sum is drawable
    let mut sum: i64;
    loop {
        sum = stat.iter().map(|bs| bs.range as i64).sum();
        if sum >= 10 {
            break;
        }
        for bs in &mut stat {
            bs.range *= 10.0;
        }
    }

    let mut r = rand::thread_rng().gen_range(0..sum);
    for bs in &stat {
        r -= bs.range as i64;
        if r <= 0 {
            info!(
                url,
                bucket = bs.bucket.name(),
                content_length,
                pain = bs.pain,
                success_groups = ?bs.success_groups,
                error_groups = ?bs.error_groups,
                pains = ?bs.pains,
                free_rates = ?bs.free_rates,
                "find-bucket: selected bucket"
            );
            return Some(Arc::clone(&bs.bucket));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketMeta;
    use crate::stat::{BackendAddr, BackendStat, StatGroup};
    use std::collections::HashMap;

    const MIB: u64 = 1 << 20;

    fn healthy_vfs(limit: u64, avail: u64) -> VfsStat {
        VfsStat {
            total_size_limit: limit,
            total: limit,
            avail,
            backend_used_size: limit - avail,
            records_total: 1000,
            records_removed: 0,
        }
    }

    struct GroupSpec {
        group: u32,
        vfs: VfsStat,
        read_only: bool,
        error_code: i32,
        pid_pain: f64,
    }

    impl GroupSpec {
        fn healthy(group: u32, limit: u64, avail: u64) -> Self {
            Self {
                group,
                vfs: healthy_vfs(limit, avail),
                read_only: false,
                error_code: 0,
                pid_pain: 0.0,
            }
        }
    }

    fn build_bucket(name: &str, meta_groups: Vec<u32>, specs: Vec<GroupSpec>) -> Arc<Bucket> {
        let bucket = Arc::new(Bucket::new(BucketMeta::new(name, meta_groups)));
        let mut map = HashMap::new();
        for spec in specs {
            let st = Arc::new(BackendStat::new(
                BackendAddr {
                    group: spec.group,
                    addr: format!("node-{}:1025", spec.group),
                    backend: 0,
                },
                spec.read_only,
                spec.error_code,
                spec.vfs,
            ));
            st.pid.store(spec.pid_pain);
            map.insert(spec.group, Arc::new(StatGroup::new(vec![st])));
        }
        bucket.replace_groups(map);
        bucket
    }

    #[test]
    fn test_free_space_ratio_avail_above_limit() {
        // avail > limit: derived from used size
        let vfs = VfsStat {
            total_size_limit: 100,
            total: 100,
            avail: 200,
            backend_used_size: 40,
            ..Default::default()
        };
        assert!((free_space_ratio(&vfs, 10) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_free_space_ratio_avail_below_content_length() {
        let vfs = healthy_vfs(100, 5);
        assert_eq!(free_space_ratio(&vfs, 10), 0.0);
    }

    #[test]
    fn test_free_space_ratio_exact_fit_is_zero() {
        // available == content_length leaves a ratio of exactly 0
        let vfs = healthy_vfs(100, 10);
        assert_eq!(free_space_ratio(&vfs, 10), 0.0);
    }

    #[test]
    fn test_free_space_ratio_normal() {
        let vfs = healthy_vfs(100, 60);
        assert!((free_space_ratio(&vfs, 10) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_healthy_bucket_is_eligible() {
        let b = build_bucket(
            "a",
            vec![1, 2, 3],
            vec![
                GroupSpec::healthy(1, 100 * MIB, 90 * MIB),
                GroupSpec::healthy(2, 100 * MIB, 90 * MIB),
                GroupSpec::healthy(3, 100 * MIB, 90 * MIB),
            ],
        );
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.eligible());
        assert_eq!(bs.success_groups, vec![1, 2, 3]);
        assert!(bs.error_groups.is_empty());
    }

    #[test]
    fn test_read_only_group_pain() {
        let mut ro = GroupSpec::healthy(2, 100 * MIB, 90 * MIB);
        ro.read_only = true;
        let b = build_bucket(
            "b",
            vec![1, 2],
            vec![GroupSpec::healthy(1, 100 * MIB, 90 * MIB), ro],
        );
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= PAIN_STAT_RO);
        assert_eq!(bs.error_groups, vec![2]);
        // one RO group is heavy but still below the hard cutoff
        assert!(bs.eligible());
    }

    #[test]
    fn test_stat_error_group_pain() {
        let mut bad = GroupSpec::healthy(1, 100 * MIB, 90 * MIB);
        bad.error_code = -5;
        let b = build_bucket("b", vec![1], vec![bad]);
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= PAIN_STAT_ERROR);
        assert_eq!(bs.error_groups, vec![1]);
    }

    #[test]
    fn test_empty_vfs_counts_as_no_stats() {
        let mut empty = GroupSpec::healthy(1, 100 * MIB, 90 * MIB);
        empty.vfs.total_size_limit = 0;
        let b = build_bucket("b", vec![1], vec![empty]);
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= PAIN_NO_STATS);
    }

    #[test]
    fn test_two_missing_groups_equal_hard_fail() {
        let b = build_bucket(
            "b",
            vec![1, 2, 3],
            vec![GroupSpec::healthy(1, 100 * MIB, 90 * MIB)],
        );
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= 2.0 * PAIN_NO_GROUP);
        assert!(!bs.eligible());
    }

    #[test]
    fn test_soft_band_pain_arithmetic() {
        // avail = 10*cl, limit = 100*cl: ratio lands at 0.09, inside the
        // (0.05, 0.2] soft band
        let cl = MIB;
        let b = build_bucket(
            "b",
            vec![1],
            vec![GroupSpec::healthy(1, 100 * cl, 10 * cl)],
        );
        let bs = score_bucket(&b, "key", cl, 0.05, 0.2);

        let rate = 9.0 * cl as f64 / (100.0 * cl as f64);
        let expected = PAIN_NO_FREE_SPACE_SOFT + 5.0 * (1000.0 / (rate - 0.05));
        assert!((bs.pain - expected).abs() / expected < 1e-9, "pain {}", bs.pain);
        assert_eq!(bs.error_groups, vec![1]);
    }

    #[test]
    fn test_hard_equals_soft_leaves_no_soft_band() {
        let cl = MIB;
        // ratio 0.09 with hard == soft == 0.05: accepted outright
        let b = build_bucket(
            "b",
            vec![1],
            vec![GroupSpec::healthy(1, 100 * cl, 10 * cl)],
        );
        let bs = score_bucket(&b, "key", cl, 0.05, 0.05);
        assert_eq!(bs.success_groups, vec![1]);
        assert!(bs.pain < PAIN_NO_FREE_SPACE_SOFT);

        // ratio 0 with hard == soft: hard fail
        let b2 = build_bucket("b2", vec![1], vec![GroupSpec::healthy(1, 100 * cl, 0)]);
        let bs2 = score_bucket(&b2, "key", cl, 0.05, 0.05);
        assert_eq!(bs2.error_groups, vec![1]);
        assert!(!bs2.eligible());
    }

    #[test]
    fn test_discrepancy_pain() {
        let mut g1 = GroupSpec::healthy(1, 100 * MIB, 90 * MIB);
        g1.vfs.records_total = 1000;
        let mut g2 = GroupSpec::healthy(2, 100 * MIB, 90 * MIB);
        g2.vfs.records_total = 995;
        let b = build_bucket("b", vec![1, 2], vec![g1, g2]);

        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= 5.0 * PAIN_DISCREPANCY);
    }

    #[test]
    fn test_pid_pain_feeds_score() {
        let mut g = GroupSpec::healthy(1, 100 * MIB, 90 * MIB);
        g.pid_pain = 12345.0;
        let b = build_bucket("b", vec![1], vec![g]);
        let bs = score_bucket(&b, "key", MIB, 0.05, 0.2);
        assert!(bs.pain >= 12345.0);
        assert_eq!(bs.pains, vec![12345.0]);
    }

    #[test]
    fn test_select_no_buckets_is_none() {
        assert!(select_bucket(&[], "key", MIB, 0.05, 0.2, "/u").is_none());
    }

    #[test]
    fn test_select_all_failed_is_none() {
        let b = build_bucket("b", vec![1], vec![GroupSpec::healthy(1, 100 * MIB, 0)]);
        let selected = select_bucket(&[b], "key", MIB, 0.05, 0.2, "/u");
        assert!(selected.is_none());
    }

    #[test]
    fn test_select_prefers_bucket_without_ro_group() {
        let a = build_bucket(
            "a",
            vec![1, 2, 3],
            vec![
                GroupSpec::healthy(1, 100 * MIB, 90 * MIB),
                GroupSpec::healthy(2, 100 * MIB, 90 * MIB),
                GroupSpec::healthy(3, 100 * MIB, 90 * MIB),
            ],
        );
        let mut ro = GroupSpec::healthy(6, 100 * MIB, 90 * MIB);
        ro.read_only = true;
        let b = build_bucket(
            "b",
            vec![4, 5, 6],
            vec![
                GroupSpec::healthy(4, 100 * MIB, 90 * MIB),
                GroupSpec::healthy(5, 100 * MIB, 90 * MIB),
                ro,
            ],
        );

        // the RO penalty pushes b past the soft cutoff, so a wins every
        // draw while it stays healthy
        for _ in 0..1000 {
            let selected =
                select_bucket(&[Arc::clone(&a), Arc::clone(&b)], "key", MIB, 0.05, 0.2, "/u")
                    .unwrap();
            assert_eq!(selected.name(), "a");
        }
    }

    #[test]
    fn test_select_spreads_across_equal_buckets() {
        let a = build_bucket("a", vec![1], vec![GroupSpec::healthy(1, 100 * MIB, 90 * MIB)]);
        let b = build_bucket("b", vec![2], vec![GroupSpec::healthy(2, 100 * MIB, 90 * MIB)]);

        let mut wins = HashMap::new();
        for _ in 0..500 {
            let selected =
                select_bucket(&[Arc::clone(&a), Arc::clone(&b)], "key", MIB, 0.05, 0.2, "/u")
                    .unwrap();
            *wins.entry(selected.name().to_string()).or_insert(0u32) += 1;
        }
        assert!(wins.get("a").copied().unwrap_or(0) > 0);
        assert!(wins.get("b").copied().unwrap_or(0) > 0);
    }
}
