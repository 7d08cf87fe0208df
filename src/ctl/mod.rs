//! Bucket controller: the shared model behind every request.
//!
//! One instance per process, shared through `Arc`. Request handlers call
//! the operation methods; three background tasks (stat refresh timer,
//! config refresh timer, SIGHUP listener) keep the model current without
//! blocking the data path. No lock is ever held across transport or file
//! I/O.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tracing::{error, info, warn};

use crate::bucket::placement::{self, WRITE_ERROR_PAIN};
use crate::bucket::registry::Registry;
use crate::bucket::{acl, Bucket};
use crate::config::{self, ProxyConfig};
use crate::error::{Error, Result};
use crate::logging::LogSink;
use crate::reply::{BucketStatReply, CtlStatReply, LookupResult};
use crate::request::ProxyRequest;
use crate::transport::{Session, SessionSpec, Transport, TransportError};

/// File written under the configured `root` by the state dump loop
pub const PROFILE_PATH: &str = "blobpool.profile";

/// Chunk size used by streaming reads
const STREAM_CHUNK: u64 = 4 << 20;

/// Cadence of the state dump loop
const PROFILE_DUMP_INTERVAL: Duration = Duration::from_secs(30);

fn transport_error(url: &str, prefix: &str, e: TransportError) -> Error {
    match e {
        TransportError::Backend { code, message } => {
            Error::backend(url, code, format!("{}: {}", prefix, message))
        }
        TransportError::MetaNotFound(name) => {
            Error::not_found(url, format!("{}: could not read bucket metadata: {}", prefix, name))
        }
        TransportError::NoRoute { group } => {
            Error::service_unavailable(url, format!("{}: no route to key in group {}", prefix, group))
        }
        TransportError::Timeout(d) => {
            Error::backend(url, -110, format!("{}: timeout after {:?}", prefix, d))
        }
        TransportError::Io(m) => Error::service_unavailable(url, format!("{}: {}", prefix, m)),
    }
}

pub struct BucketCtl<T: Transport> {
    transport: Arc<T>,
    registry: Registry,
    config: RwLock<Arc<ProxyConfig>>,
    bucket_path: PathBuf,
    config_path: PathBuf,
    log_sink: LogSink,
    /// Time of the previous defragmentation candidate scan
    defrag_time: Mutex<Instant>,
}

impl<T: Transport> BucketCtl<T> {
    /// Build the controller: load both config files, read every writable
    /// bucket's metadata and pull the first telemetry snapshot.
    pub async fn new(
        transport: Arc<T>,
        bucket_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        log_sink: LogSink,
    ) -> anyhow::Result<Arc<Self>> {
        let ctl = Arc::new(Self {
            transport,
            registry: Registry::new(),
            config: RwLock::new(Arc::new(ProxyConfig::default())),
            bucket_path: bucket_path.into(),
            config_path: config_path.into(),
            log_sink,
            defrag_time: Mutex::new(Instant::now()),
        });

        ctl.read_config().await?;
        Ok(ctl)
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.config().request_timeout)
    }

    fn data_session(&self, bucket: &Bucket, url: &str, filter_all: bool) -> Result<T::Session> {
        let spec = SessionSpec::default()
            .namespace(bucket.name())
            .groups(bucket.meta.groups.clone())
            .timeout(self.session_timeout())
            .filter_all(filter_all);

        self.transport
            .data_session(spec)
            .map_err(|e| transport_error(url, "could not create data session", e))
    }

    /// Look a bucket up by name without touching the transport.
    pub fn find_bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        self.registry.find(name)
    }

    /// Resolve a bucket by name, reading metadata through the transport
    /// and adopting it when unknown. The metadata read happens outside
    /// any lock.
    pub async fn resolve_bucket(&self, name: &str, url: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.registry.find(name) {
            return Ok(bucket);
        }

        let meta = self
            .transport
            .read_bucket_meta(name)
            .await
            .map_err(|e| {
                Error::not_found(url, format!("{}: could not find and read bucket: {}", name, e))
            })?;

        let bucket = Arc::new(Bucket::new(meta));

        // attach whatever telemetry we already have
        let snapshot = self.registry.snapshot();
        let mut groups = std::collections::HashMap::new();
        for group in &bucket.meta.groups {
            if let Some(sg) = snapshot.group(*group) {
                groups.insert(*group, Arc::clone(sg));
            }
        }
        bucket.replace_groups(groups);

        Ok(self.registry.adopt(bucket))
    }

    /// Pick a writable bucket for an anonymous upload.
    pub fn get_bucket(&self, key: &str, req: &ProxyRequest) -> Option<Arc<Bucket>> {
        let writable = self.registry.writable();
        if writable.is_empty() {
            return None;
        }

        // a transport that cannot even hand out a metadata session has no
        // usable telemetry; degrade to a uniform pick instead of refusing
        if self.transport.metadata_session().is_err() {
            warn!(url = %req.url(), "get-bucket: no metadata session, picking at random");
            let idx = rand::thread_rng().gen_range(0..writable.len());
            return Some(Arc::clone(&writable[idx]));
        }

        let cfg = self.config();
        placement::select_bucket(
            &writable,
            key,
            req.content_length().unwrap_or(0),
            cfg.free_space_ratio_hard,
            cfg.free_space_ratio_soft,
            &req.url(),
        )
    }

    /// Anonymous upload: placement picks the bucket.
    pub async fn upload(
        &self,
        key: &str,
        req: &ProxyRequest,
        body: Bytes,
    ) -> Result<(LookupResult, Arc<Bucket>)> {
        let bucket = self.get_bucket(key, req).ok_or_else(|| {
            Error::service_unavailable(req.url(), "there are no buckets with free space available")
        })?;

        let reply = self.bucket_upload(&bucket, key, req, body).await?;
        Ok((reply, bucket))
    }

    /// Upload into an explicitly named bucket.
    pub async fn bucket_upload_named(
        &self,
        bucket_name: &str,
        key: &str,
        req: &ProxyRequest,
        body: Bytes,
    ) -> Result<(LookupResult, Arc<Bucket>)> {
        let bucket = self.resolve_bucket(bucket_name, &req.url()).await?;
        let reply = self.bucket_upload(&bucket, key, req, body).await?;
        Ok((reply, bucket))
    }

    async fn bucket_upload(
        &self,
        bucket: &Arc<Bucket>,
        key: &str,
        req: &ProxyRequest,
        body: Bytes,
    ) -> Result<LookupResult> {
        let url = req.url();

        bucket.check_auth(req, acl::WRITE)?;

        let total_size = req
            .content_length()
            .ok_or_else(|| Error::bad_request(&url, "upload: there is no Content-Length header"))?;
        if total_size == 0 {
            return Err(Error::bad_request(
                &url,
                "upload: attempting to perform invalid zero-length upload",
            ));
        }

        let (offset, _) = req.offset_size()?;

        let session = self.data_session(bucket, &url, true)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            key,
            id = %format!("{:x}", session.transform(key)),
            "upload"
        );

        let start = Instant::now();
        let rows = session
            .write_data(key, body, offset, total_size)
            .await
            .map_err(|e| transport_error(&url, "upload", e))?;
        let reply = LookupResult::from_rows(rows);

        // feed observed microseconds-per-byte back into each replica's
        // pressure score; failed replicas get the error constant
        let time_us = start.elapsed().as_micros() as u64;
        let e = time_us as f64 / total_size as f64;

        let mut feedback: Vec<String> = Vec::with_capacity(reply.servers.len());
        for row in &reply.servers {
            let sg = match bucket.group(row.group) {
                Some(sg) => sg,
                None => {
                    feedback.push(format!("{{group: {}, error: no group stat}}", row.group));
                    continue;
                }
            };

            match sg.find_by_addr(&row.addr, row.backend) {
                Some(st) => {
                    let old_pain = st.pid_pain();
                    let observation = if row.is_success() { e } else { WRITE_ERROR_PAIN };
                    st.pid_update(observation);
                    feedback.push(format!(
                        "{{group: {}, time: {} us, e: {}, pain: {} -> {}}}",
                        row.group,
                        time_us,
                        e,
                        old_pain,
                        st.pid_pain()
                    ));
                }
                None => {
                    feedback.push(format!("{{group: {}, error: no backend stat}}", row.group));
                }
            }
        }

        info!(
            bucket = bucket.name(),
            key,
            size = total_size,
            "bucket-upload: {}",
            feedback.join(", ")
        );

        if reply.success_groups.is_empty() {
            return Err(Error::service_unavailable(
                &url,
                format!("upload: all {} replica groups failed", bucket.meta.groups.len()),
            ));
        }

        Ok(reply)
    }

    /// Read the object body.
    pub async fn get(&self, bucket_name: &str, key: &str, req: &ProxyRequest) -> Result<Bytes> {
        let url = req.url();
        let bucket = self.resolve_bucket(bucket_name, &url).await?;
        bucket.check_auth(req, acl::EMPTY)?;

        let (offset, size) = req.offset_size()?;
        let session = self.data_session(&bucket, &url, false)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            key,
            id = %format!("{:x}", session.transform(key)),
            "get"
        );

        session.read_data(key, offset, size).await.map_err(|e| transport_error(&url, "get", e))
    }

    /// Read the object body in transport-sized chunks.
    pub async fn stream(&self, bucket_name: &str, key: &str, req: &ProxyRequest) -> Result<Bytes> {
        let url = req.url();
        let bucket = self.resolve_bucket(bucket_name, &url).await?;
        bucket.check_auth(req, acl::EMPTY)?;

        let (offset, size) = req.offset_size()?;
        let session = self.data_session(&bucket, &url, false)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            key,
            id = %format!("{:x}", session.transform(key)),
            "stream"
        );

        let mut out = BytesMut::new();
        let mut cursor = offset;
        let mut remaining = size;

        loop {
            let want = if remaining == 0 { STREAM_CHUNK } else { remaining.min(STREAM_CHUNK) };
            let chunk = session
                .read_data(key, cursor, want)
                .await
                .map_err(|e| transport_error(&url, "stream", e))?;

            let got = chunk.len() as u64;
            out.extend_from_slice(&chunk);
            cursor += got;

            if remaining != 0 {
                remaining -= got.min(remaining);
                if remaining == 0 {
                    break;
                }
            }
            if got < want {
                break;
            }
        }

        Ok(out.freeze())
    }

    /// Ask every replica group where the key lives.
    pub async fn lookup(
        &self,
        bucket_name: &str,
        key: &str,
        req: &ProxyRequest,
    ) -> Result<LookupResult> {
        let url = req.url();
        let bucket = self.resolve_bucket(bucket_name, &url).await?;
        bucket.check_auth(req, acl::EMPTY)?;

        let session = self.data_session(&bucket, &url, true)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            key,
            id = %format!("{:x}", session.transform(key)),
            "lookup"
        );

        let rows = session
            .parallel_lookup(key)
            .await
            .map_err(|e| transport_error(&url, "lookup", e))?;
        Ok(LookupResult::from_rows(rows))
    }

    /// Remove the key from every replica group.
    pub async fn remove(&self, bucket_name: &str, key: &str, req: &ProxyRequest) -> Result<()> {
        let url = req.url();
        let bucket = self.resolve_bucket(bucket_name, &url).await?;
        bucket.check_auth(req, acl::WRITE)?;

        let session = self.data_session(&bucket, &url, false)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            key,
            id = %format!("{:x}", session.transform(key)),
            "delete"
        );

        session.remove(key).await.map_err(|e| transport_error(&url, "delete", e))
    }

    /// Remove many keys; per-key failures are reported, not fatal.
    pub async fn bulk_remove(
        &self,
        bucket_name: &str,
        keys: &[String],
        req: &ProxyRequest,
    ) -> Result<std::collections::HashMap<String, String>> {
        let url = req.url();
        let bucket = self.resolve_bucket(bucket_name, &url).await?;
        bucket.check_auth(req, acl::WRITE)?;

        let session = self.data_session(&bucket, &url, false)?;

        info!(
            trace_id = %format!("{:x}", session.spec().trace_id),
            url = url.as_str(),
            bucket = bucket.name(),
            ?keys,
            "bulk-delete"
        );

        session.bulk_remove(keys).await.map_err(|e| transport_error(&url, "bulk_delete", e))
    }

    /// Telemetry projection of every known bucket.
    pub fn stat_reply(&self) -> CtlStatReply {
        let mut buckets = BTreeMap::new();

        for bucket in self.registry.all_buckets() {
            let mut group = BTreeMap::new();
            for (gid, sg) in bucket.group_map() {
                group.insert(gid.to_string(), sg.stat_data());
            }
            buckets.insert(
                bucket.name().to_string(),
                BucketStatReply { group, meta: bucket.meta.clone() },
            );
        }

        CtlStatReply { buckets, stat_time: self.registry.stat_time().to_rfc3339() }
    }

    /// Pull a telemetry snapshot and publish it. A failed pull keeps the
    /// previous snapshot untouched.
    pub async fn stat_update(&self) {
        let snapshot = match self.transport.stat().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "bucket-stat-update: keeping previous snapshot");
                return;
            }
        };

        snapshot.inherit_pain(&self.registry.snapshot());
        self.registry.apply_snapshot(snapshot);

        self.scan_buckets();
    }

    /// Defragmentation candidate scan, rate-limited by
    /// `defrag_scan_interval`.
    fn scan_buckets(&self) {
        let cfg = self.config();

        {
            let mut last = self.defrag_time.lock().expect("defrag time lock poisoned");
            if last.elapsed() < Duration::from_secs(cfg.defrag_scan_interval) {
                return;
            }
            *last = Instant::now();
        }

        for bucket in self.registry.all_buckets() {
            for (gid, sg) in bucket.group_map() {
                for st in sg.backends() {
                    let ratio = st.vfs.removed_ratio();
                    if ratio > cfg.defrag_removed_ratio {
                        info!(
                            bucket = bucket.name(),
                            group = gid,
                            backend = %st.addr,
                            removed_ratio = ratio,
                            "defrag-scan: backend is a defragmentation candidate"
                        );
                    }
                }
            }
        }
    }

    /// Reload the bucket list and rebuild the writable set, then pull a
    /// snapshot so the new buckets carry telemetry immediately.
    pub async fn read_bucket_config(&self) -> anyhow::Result<()> {
        let names = config::read_bucket_list(&self.bucket_path)?;

        let mut new_buckets: Vec<Arc<Bucket>> = Vec::with_capacity(names.len());
        for name in &names {
            match self.transport.read_bucket_meta(name).await {
                Ok(meta) => {
                    info!(bucket = name.as_str(), "config: new bucket");
                    new_buckets.push(Arc::new(Bucket::new(meta)));
                }
                Err(e) => {
                    warn!(bucket = name.as_str(), error = %e, "config: could not read bucket");
                }
            }
        }

        if new_buckets.is_empty() {
            anyhow::bail!("no buckets found in bucket file {:?}", self.bucket_path);
        }

        let snapshot = self.transport.stat().await?;
        snapshot.inherit_pain(&self.registry.snapshot());

        let count = new_buckets.len();
        self.registry.install(new_buckets, snapshot);

        info!(writable = count, "bucket config has been updated");
        Ok(())
    }

    /// Reload the proxy config file and reopen the log sink.
    pub fn read_proxy_config(&self) -> anyhow::Result<()> {
        let conf = ProxyConfig::load(&self.config_path)?;

        if let Err(e) = self.log_sink.reopen(&conf.log_file, &conf.log_prefix) {
            warn!(log_file = conf.log_file.as_str(), error = %e,
                "config: could not reopen log file, logging to stderr");
        }

        *self.config.write().expect("config lock poisoned") = Arc::new(conf);

        info!("proxy config has been updated");
        Ok(())
    }

    /// Full reload: bucket list first, then proxy config.
    pub async fn read_config(&self) -> anyhow::Result<()> {
        self.read_bucket_config()
            .await
            .map_err(|e| anyhow::anyhow!("failed to update bucket config: {}", e))?;
        self.read_proxy_config()
            .map_err(|e| anyhow::anyhow!("failed to update proxy config: {}", e))?;
        Ok(())
    }

    /// SIGHUP semantics: full reload plus dropping every adopted bucket.
    pub async fn reload_signal(&self) {
        if let Err(e) = self.read_config().await {
            error!(error = %e, "reload: keeping previous configuration");
        }
        self.registry.clear_adopted();
    }

    /// Spawn the stat refresh timer, the config refresh timer, the
    /// SIGHUP listener and the state dump loop. Each timer re-arms with
    /// the currently loaded interval after every fire.
    pub fn spawn_background(self: &Arc<Self>) {
        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = ctl.config().bucket_stat_update_interval.max(1);
                tokio::time::sleep(Duration::from_secs(interval)).await;
                ctl.stat_update().await;
            }
        });

        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = ctl.config().bucket_update_interval.max(1);
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if let Err(e) = ctl.read_config().await {
                    error!(error = %e, "config refresh: keeping previous configuration");
                }
            }
        });

        #[cfg(unix)]
        {
            let ctl = Arc::clone(self);
            tokio::spawn(async move {
                let mut hup = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::hangup(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "could not install SIGHUP handler");
                        return;
                    }
                };

                loop {
                    hup.recv().await;
                    info!("received SIGHUP, reloading configuration");
                    ctl.reload_signal().await;
                }
            });
        }

        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let root = ctl.config().root.clone();
                if !root.is_empty() {
                    let path = std::path::Path::new(&root).join(PROFILE_PATH);
                    match serde_json::to_vec_pretty(&ctl.stat_reply()) {
                        Ok(data) => {
                            if let Err(e) = std::fs::write(&path, data) {
                                warn!(path = %path.display(), error = %e,
                                    "state dump failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "state dump serialization failed"),
                    }
                }
                tokio::time::sleep(PROFILE_DUMP_INTERVAL).await;
            }
        });
    }
}
