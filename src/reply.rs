//! Wire reply envelopes.
//!
//! JSON field names match the historical proxy wire format
//! (`info`, `success-groups`, `error-groups`,
//! `offset-within-data-file`), so existing clients keep working.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::bucket::BucketMeta;
use crate::stat::BackendStatData;

/// Error attached to one per-group reply row.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyError {
    pub code: i32,
    pub message: String,
}

/// One per-replica reply row for write and lookup operations.
#[derive(Debug, Clone, Serialize)]
pub struct LookupServerResult {
    pub group: u32,
    pub backend: i32,
    pub id: String,
    pub csum: String,
    pub filename: String,
    pub size: u64,
    #[serde(rename = "offset-within-data-file")]
    pub offset: u64,
    pub mtime: String,
    pub server: String,
    pub error: Option<ReplyError>,

    /// Address the reply was received from; feedback path only.
    #[serde(skip)]
    pub addr: String,
}

impl LookupServerResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Assembled reply for one write or lookup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LookupResult {
    #[serde(rename = "info")]
    pub servers: Vec<LookupServerResult>,
    #[serde(rename = "success-groups")]
    pub success_groups: Vec<u32>,
    #[serde(rename = "error-groups")]
    pub error_groups: Vec<u32>,
}

impl LookupResult {
    /// Split rows into success and error groups. Row order is preserved.
    pub fn from_rows(servers: Vec<LookupServerResult>) -> Self {
        let mut success_groups = Vec::new();
        let mut error_groups = Vec::new();

        for row in &servers {
            if row.is_success() {
                if !success_groups.contains(&row.group) {
                    success_groups.push(row.group);
                }
            } else if !error_groups.contains(&row.group) {
                error_groups.push(row.group);
            }
        }

        Self { servers, success_groups, error_groups }
    }
}

/// Links to the uploaded key in the upload envelope.
#[derive(Debug, Clone, Serialize)]
pub struct UploadEntReply {
    pub get: String,
    pub update: String,
    pub delete: String,
    pub key: String,
}

/// Envelope returned by the upload handlers.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReply {
    pub bucket: String,
    pub primary: UploadEntReply,
    pub reply: LookupResult,
}

/// Per-bucket section of the controller stat reply.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatReply {
    pub group: BTreeMap<String, Vec<BackendStatData>>,
    pub meta: BucketMeta,
}

/// Controller stat reply: every known bucket with its latest telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct CtlStatReply {
    pub buckets: BTreeMap<String, BucketStatReply>,
    pub stat_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(group: u32, error: Option<ReplyError>) -> LookupServerResult {
        LookupServerResult {
            group,
            backend: 0,
            id: "aabb".to_string(),
            csum: String::new(),
            filename: "key".to_string(),
            size: 10,
            offset: 0,
            mtime: String::new(),
            server: format!("node-{}:1025", group),
            error,
            addr: format!("node-{}:1025", group),
        }
    }

    #[test]
    fn test_from_rows_splits_groups() {
        let result = LookupResult::from_rows(vec![
            row(1, None),
            row(2, Some(ReplyError { code: -5, message: "io".to_string() })),
            row(3, None),
        ]);
        assert_eq!(result.success_groups, vec![1, 3]);
        assert_eq!(result.error_groups, vec![2]);
        assert_eq!(result.servers.len(), 3);
    }

    #[test]
    fn test_wire_field_names() {
        let result = LookupResult::from_rows(vec![row(1, None)]);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("info").is_some());
        assert!(json.get("success-groups").is_some());
        assert!(json.get("error-groups").is_some());
        assert!(json["info"][0].get("offset-within-data-file").is_some());
        // feedback-only address never leaks to the wire
        assert!(json["info"][0].get("addr").is_none());
    }
}
