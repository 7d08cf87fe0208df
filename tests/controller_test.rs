//! End-to-end controller scenarios over the in-memory transport.

use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::Method;
use tempfile::TempDir;

use blobpool::bucket::{acl, AclEntry, BucketMeta};
use blobpool::ctl::BucketCtl;
use blobpool::error::Error;
use blobpool::logging::LogSink;
use blobpool::request::ProxyRequest;
use blobpool::transport::mem::MemTransport;

const MIB: u64 = 1 << 20;

fn open_meta(name: &str, groups: Vec<u32>) -> BucketMeta {
    BucketMeta::new(name, groups).with_acl(AclEntry {
        user: "*".to_string(),
        token: String::new(),
        flags: acl::NO_TOKEN | acl::WRITE,
    })
}

fn upload_request(url: &str, content_length: u64) -> ProxyRequest {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, content_length.to_string().parse().unwrap());
    ProxyRequest::new(Method::POST, url.parse().unwrap(), headers)
}

fn get_request(url: &str) -> ProxyRequest {
    ProxyRequest::new(Method::GET, url.parse().unwrap(), HeaderMap::new())
}

/// Write the bucket list + proxy config files and build the controller.
async fn make_ctl(
    transport: &Arc<MemTransport>,
    bucket_names: &[&str],
) -> (Arc<BucketCtl<MemTransport>>, TempDir) {
    let dir = TempDir::new().unwrap();

    let bucket_path = dir.path().join("buckets");
    fs::write(&bucket_path, bucket_names.join("\n")).unwrap();

    let config_path = dir.path().join("proxy.yaml");
    fs::write(&config_path, "listen: \"127.0.0.1:0\"\n").unwrap();

    let ctl = BucketCtl::new(
        Arc::clone(transport),
        &bucket_path,
        &config_path,
        LogSink::stderr(),
    )
    .await
    .unwrap();

    (ctl, dir)
}

#[tokio::test]
async fn test_startup_builds_writable_set() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("b1", vec![1, 2]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let bucket = ctl.find_bucket("b1").unwrap();
    assert_eq!(bucket.meta.groups, vec![1, 2]);
    assert!(bucket.group(1).is_some());
    assert!(bucket.group(2).is_some());
}

#[tokio::test]
async fn test_upload_get_lookup_delete_roundtrip() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("b1", vec![1, 2]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let body = Bytes::from_static(b"hello blob");
    let req = upload_request("/upload/b1/key.txt", body.len() as u64);
    let (reply, bucket) = ctl
        .bucket_upload_named("b1", "key.txt", &req, body.clone())
        .await
        .unwrap();
    assert_eq!(bucket.name(), "b1");
    assert_eq!(reply.success_groups, vec![1, 2]);
    assert!(reply.error_groups.is_empty());
    assert_eq!(transport.blob("b1", "key.txt").unwrap(), body);

    let data = ctl
        .get("b1", "key.txt", &get_request("/get/b1/key.txt"))
        .await
        .unwrap();
    assert_eq!(data, body);

    let lookup = ctl
        .lookup("b1", "key.txt", &get_request("/lookup/b1/key.txt"))
        .await
        .unwrap();
    assert_eq!(lookup.success_groups, vec![1, 2]);

    ctl.remove("b1", "key.txt", &upload_request("/delete/b1/key.txt", 0))
        .await
        .unwrap();

    let err = ctl
        .get("b1", "key.txt", &get_request("/get/b1/key.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { code: -2, .. }));
}

#[tokio::test]
async fn test_zero_length_upload_is_bad_request() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.put_meta(open_meta("b1", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let err = ctl
        .bucket_upload_named("b1", "k", &upload_request("/upload/b1/k", 0), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));

    // no Content-Length header at all
    let req = ProxyRequest::new(Method::POST, "/upload/b1/k".parse().unwrap(), HeaderMap::new());
    let err = ctl.bucket_upload_named("b1", "k", &req, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));
}

/// Upload succeeding on 2 of 3 groups reports both sides and feeds the
/// failed replica's PID tracker the error constant.
#[tokio::test]
async fn test_partial_group_failure_feeds_pid() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.add_healthy_group(3);
    transport.put_meta(open_meta("b1", vec![1, 2, 3]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;
    transport.fail_writes(3, true);

    let body = Bytes::from_static(b"payload");
    let req = upload_request("/upload/b1/k", body.len() as u64);
    let (reply, _) = ctl.bucket_upload_named("b1", "k", &req, body).await.unwrap();

    assert_eq!(reply.success_groups, vec![1, 2]);
    assert_eq!(reply.error_groups, vec![3]);
    assert_eq!(reply.servers.len(), 3);

    // the failed replica took the error-pain observation
    let bucket = ctl.find_bucket("b1").unwrap();
    let failed = bucket.group(3).unwrap();
    let st = failed.find_by_key("k").unwrap();
    assert!(st.pid_pain() > 1e12, "pain {}", st.pid_pain());

    // healthy replicas stay far below the error constant
    let ok = bucket.group(1).unwrap();
    let st_ok = ok.find_by_key("k").unwrap();
    assert!(st_ok.pid_pain() < 1e6);
}

#[tokio::test]
async fn test_all_groups_failing_is_service_unavailable() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("b1", vec![1, 2]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;
    transport.fail_writes(1, true);
    transport.fail_writes(2, true);

    let err = ctl
        .bucket_upload_named("b1", "k", &upload_request("/upload/b1/k", 4), Bytes::from_static(b"data"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable { .. }));
}

/// Placement always lands on the bucket without a read-only group.
#[tokio::test]
async fn test_placement_avoids_read_only_bucket() {
    let transport = Arc::new(MemTransport::new());
    for g in 1..=6 {
        transport.add_healthy_group(g);
    }
    transport.set_read_only(6, true);
    transport.put_meta(open_meta("a", vec![1, 2, 3]));
    transport.put_meta(open_meta("b", vec![4, 5, 6]));

    let (ctl, _dir) = make_ctl(&transport, &["a", "b"]).await;

    let req = upload_request("/nobucket_upload/k", MIB);
    for _ in 0..200 {
        let bucket = ctl.get_bucket("k", &req).unwrap();
        assert_eq!(bucket.name(), "a");
    }
}

/// When the transport cannot hand out a metadata session, placement
/// degrades to a uniform pick among the writable buckets instead of
/// refusing uploads, so even a bucket scoring would never choose still
/// gets drawn.
#[tokio::test]
async fn test_metadata_session_failure_falls_back_to_uniform_pick() {
    let transport = Arc::new(MemTransport::new());
    for g in 1..=2 {
        transport.add_healthy_group(g);
    }
    // scoring would always avoid b (read-only group)
    transport.set_read_only(2, true);
    transport.put_meta(open_meta("a", vec![1]));
    transport.put_meta(open_meta("b", vec![2]));

    let (ctl, _dir) = make_ctl(&transport, &["a", "b"]).await;
    transport.fail_metadata_session(true);

    let req = upload_request("/nobucket_upload/k", MIB);
    let mut wins = std::collections::HashMap::new();
    for _ in 0..500 {
        let bucket = ctl.get_bucket("k", &req).unwrap();
        assert!(matches!(bucket.name(), "a" | "b"));
        *wins.entry(bucket.name().to_string()).or_insert(0u32) += 1;
    }

    // uniform fallback draws both, including the one scoring never picks
    assert!(wins.get("a").copied().unwrap_or(0) > 0);
    assert!(wins.get("b").copied().unwrap_or(0) > 0);

    // with the session back, scoring takes over again
    transport.fail_metadata_session(false);
    for _ in 0..100 {
        assert_eq!(ctl.get_bucket("k", &req).unwrap().name(), "a");
    }
}

/// A bucket whose groups are mostly absent from telemetry cannot win
/// placement; with no alternative the upload is refused.
#[tokio::test]
async fn test_missing_groups_disqualify_bucket() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    // groups 2 and 3 exist in metadata only
    transport.put_meta(open_meta("m", vec![1, 2, 3]));

    let (ctl, _dir) = make_ctl(&transport, &["m"]).await;

    let req = upload_request("/nobucket_upload/k", MIB);
    assert!(ctl.get_bucket("k", &req).is_none());

    let err = ctl.upload("k", &req, Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable { .. }));
}

/// Reload signal: adopted buckets vanish, writable set survives.
#[tokio::test]
async fn test_reload_signal_clears_adopted() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("w", vec![1]));
    transport.put_meta(open_meta("adopted", vec![2]));

    let (ctl, _dir) = make_ctl(&transport, &["w"]).await;

    // lazily resolved by name, not part of the writable set
    ctl.resolve_bucket("adopted", "/lookup/adopted/k").await.unwrap();
    assert!(ctl.find_bucket("adopted").is_some());

    ctl.reload_signal().await;
    assert!(ctl.find_bucket("adopted").is_none());
    assert!(ctl.find_bucket("w").is_some());

    // a second signal with unchanged files settles to the same state
    ctl.reload_signal().await;
    let names: Vec<String> =
        ctl.registry().all_buckets().iter().map(|b| b.name().to_string()).collect();
    assert_eq!(names, vec!["w"]);
}

/// Repeated resolution of a known name reuses the adopted entry.
#[tokio::test]
async fn test_resolve_is_cached_after_first_read() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.put_meta(open_meta("w", vec![1]));
    transport.put_meta(open_meta("lazy", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["w"]).await;
    let reads_before = transport.meta_reads();

    for _ in 0..5 {
        let b = ctl.resolve_bucket("lazy", "/get/lazy/k").await.unwrap();
        assert_eq!(b.name(), "lazy");
    }

    assert_eq!(transport.meta_reads(), reads_before + 1);
    assert_eq!(
        ctl.registry().all_buckets().iter().filter(|b| b.name() == "lazy").count(),
        1
    );
}

#[tokio::test]
async fn test_resolve_unknown_bucket_is_not_found() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.put_meta(open_meta("w", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["w"]).await;

    let err = ctl.resolve_bucket("ghost", "/get/ghost/k").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

/// A failed stat refresh leaves the published snapshot untouched and the
/// data path keeps working from the previous view.
#[tokio::test]
async fn test_stat_refresh_failure_keeps_snapshot() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.put_meta(open_meta("b1", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let before = ctl.registry().snapshot();
    transport.fail_stat(true);
    ctl.stat_update().await;

    let after = ctl.registry().snapshot();
    assert!(Arc::ptr_eq(&before, &after));

    // placement still answers from the retained snapshot
    let req = upload_request("/nobucket_upload/k", MIB);
    assert!(ctl.get_bucket("k", &req).is_some());
}

/// PID pain survives a stat refresh when the backend identity persists.
#[tokio::test]
async fn test_pid_pain_survives_stat_refresh() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("b1", vec![1, 2]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;
    transport.fail_writes(2, true);

    let body = Bytes::from_static(b"data");
    let req = upload_request("/upload/b1/k", body.len() as u64);
    ctl.bucket_upload_named("b1", "k", &req, body).await.unwrap();

    let bucket = ctl.find_bucket("b1").unwrap();
    let pain_before = bucket.group(2).unwrap().find_by_key("k").unwrap().pid_pain();
    assert!(pain_before > 0.0);

    ctl.stat_update().await;

    let bucket = ctl.find_bucket("b1").unwrap();
    let pain_after = bucket.group(2).unwrap().find_by_key("k").unwrap().pid_pain();
    assert_eq!(pain_after, pain_before);
}

/// Stat refresh keeps a bucket's old group entry when a group disappears
/// from the telemetry.
#[tokio::test]
async fn test_stat_refresh_keeps_entry_for_vanished_group() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.add_healthy_group(2);
    transport.put_meta(open_meta("b1", vec![1, 2]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let bucket = ctl.find_bucket("b1").unwrap();
    let old = bucket.group(2).unwrap();

    transport.drop_group(2);
    ctl.stat_update().await;

    let bucket = ctl.find_bucket("b1").unwrap();
    let kept = bucket.group(2).unwrap();
    assert!(Arc::ptr_eq(&old, &kept));
}

/// Bulk delete reports per-key failures without failing the request.
#[tokio::test]
async fn test_bulk_remove_reports_per_key_errors() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.put_meta(open_meta("b1", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let body = Bytes::from_static(b"x");
    let req = upload_request("/upload/b1/k1", 1);
    ctl.bucket_upload_named("b1", "k1", &req, body).await.unwrap();

    let keys = vec!["k1".to_string(), "ghost".to_string()];
    let failed = ctl
        .bulk_remove("b1", &keys, &upload_request("/bulk_delete/b1", 0))
        .await
        .unwrap();

    assert!(!failed.contains_key("k1"));
    assert!(failed.contains_key("ghost"));
}

/// The stat reply lists every bucket with its per-group telemetry.
#[tokio::test]
async fn test_stat_reply_projection() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    transport.set_records(1, 500, 100);
    transport.put_meta(open_meta("b1", vec![1]));

    let (ctl, _dir) = make_ctl(&transport, &["b1"]).await;

    let reply = ctl.stat_reply();
    let bucket = reply.buckets.get("b1").unwrap();
    let group = bucket.group.get("1").unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].vfs.records_total, 500);
    assert_eq!(group[0].vfs.records_removed, 100);
    assert_eq!(bucket.meta.groups, vec![1]);
}

/// Auth failures surface with the right taxonomy through the controller.
#[tokio::test]
async fn test_upload_requires_write_permission() {
    let transport = Arc::new(MemTransport::new());
    transport.add_healthy_group(1);
    // wildcard may read but not write
    transport.put_meta(BucketMeta::new("ro", vec![1]).with_acl(AclEntry {
        user: "*".to_string(),
        token: String::new(),
        flags: acl::NO_TOKEN,
    }));

    let (ctl, _dir) = make_ctl(&transport, &["ro"]).await;

    let err = ctl
        .bucket_upload_named("ro", "k", &upload_request("/upload/ro/k", 4), Bytes::from_static(b"data"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden { .. }));

    // reads stay open to the wildcard
    assert!(matches!(
        ctl.get("ro", "missing", &get_request("/get/ro/missing")).await.unwrap_err(),
        Error::Backend { .. }
    ));
}
