use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Proxy configuration loaded from a YAML file.
///
/// Reloaded periodically and on SIGHUP; a failed reload keeps the
/// previously loaded values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address for the HTTP frontend
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Storage node addresses polled for telemetry and metadata
    #[serde(default)]
    pub remotes: Vec<String>,

    /// Free-space ratio below which a group hard-fails placement
    #[serde(default = "default_free_space_ratio_hard")]
    pub free_space_ratio_hard: f64,

    /// Free-space ratio below which a group is penalized but scored
    #[serde(default = "default_free_space_ratio_soft")]
    pub free_space_ratio_soft: f64,

    /// Seconds between bucket list / proxy config reloads
    #[serde(default = "default_bucket_update_interval")]
    pub bucket_update_interval: u64,

    /// Seconds between backend stat refreshes
    #[serde(default = "default_bucket_stat_update_interval")]
    pub bucket_stat_update_interval: u64,

    /// Directory for periodic controller state dumps (empty = disabled)
    #[serde(default)]
    pub root: String,

    /// Log file path (empty = stderr)
    #[serde(default)]
    pub log_file: String,

    /// Prefix prepended to every log line
    #[serde(default)]
    pub log_prefix: String,

    /// Per-session backend timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Server-level read/write timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Minimum seconds between defrag candidate scans
    #[serde(default = "default_defrag_scan_interval")]
    pub defrag_scan_interval: u64,

    /// Removed-records ratio above which a backend is flagged for defrag
    #[serde(default = "default_defrag_removed_ratio")]
    pub defrag_removed_ratio: f64,
}

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_free_space_ratio_hard() -> f64 {
    0.05
}

fn default_free_space_ratio_soft() -> f64 {
    0.2
}

fn default_bucket_update_interval() -> u64 {
    30
}

fn default_bucket_stat_update_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    100
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_defrag_scan_interval() -> u64 {
    3600
}

fn default_defrag_removed_ratio() -> f64 {
    0.3
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            remotes: Vec::new(),
            free_space_ratio_hard: default_free_space_ratio_hard(),
            free_space_ratio_soft: default_free_space_ratio_soft(),
            bucket_update_interval: default_bucket_update_interval(),
            bucket_stat_update_interval: default_bucket_stat_update_interval(),
            root: String::new(),
            log_file: String::new(),
            log_prefix: String::new(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            defrag_scan_interval: default_defrag_scan_interval(),
            defrag_removed_ratio: default_defrag_removed_ratio(),
        }
    }
}

impl ProxyConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let content = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ProxyConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// The free-space band is `0 < hard <= soft < 1`. Equal thresholds
    /// collapse the soft band, leaving hard-fail or full acceptance.
    pub fn validate(&self) -> Result<()> {
        if !(self.free_space_ratio_hard > 0.0 && self.free_space_ratio_hard < 1.0) {
            anyhow::bail!(
                "free_space_ratio_hard must be in (0, 1), got {}",
                self.free_space_ratio_hard
            );
        }
        if !(self.free_space_ratio_soft > 0.0 && self.free_space_ratio_soft < 1.0) {
            anyhow::bail!(
                "free_space_ratio_soft must be in (0, 1), got {}",
                self.free_space_ratio_soft
            );
        }
        if self.free_space_ratio_hard > self.free_space_ratio_soft {
            anyhow::bail!(
                "free_space_ratio_hard ({}) must not exceed free_space_ratio_soft ({})",
                self.free_space_ratio_hard,
                self.free_space_ratio_soft
            );
        }
        Ok(())
    }
}

/// Read the bucket list file: newline-separated bucket names, empty
/// lines ignored.
pub fn read_bucket_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Could not read bucket file: {:?}", path.as_ref()))?;

    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}
