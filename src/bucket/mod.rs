//! Bucket model: metadata, ACLs, and per-group telemetry references.

pub mod placement;
pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::auth;
use crate::error::{Error, Result};
use crate::request::ProxyRequest;
use crate::stat::StatGroup;

/// ACL permission bits.
pub mod acl {
    /// Read-class operations; any known user qualifies.
    pub const EMPTY: u64 = 0;
    /// Entry's requests are accepted without a signature.
    pub const NO_TOKEN: u64 = 1;
    /// Upload/delete operations.
    pub const WRITE: u64 = 1 << 1;
    /// Implies every other bit.
    pub const ADMIN: u64 = 1 << 2;
}

/// One ACL row: user, signing token, permission mask.
///
/// Tokens are secrets; they never serialize into stat or ping replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub user: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub flags: u64,
}

impl AclEntry {
    fn allows(&self, required: u64) -> bool {
        required == acl::EMPTY || self.flags & (required | acl::ADMIN) != 0
    }
}

fn default_meta_version() -> u32 {
    1
}

/// Bucket metadata as stored in the backend. `flags` and `version` are
/// opaque here and preserved verbatim on read-back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketMeta {
    pub name: String,
    #[serde(default)]
    pub acl: HashMap<String, AclEntry>,
    pub groups: Vec<u32>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default = "default_meta_version")]
    pub version: u32,
}

impl BucketMeta {
    pub fn new(name: impl Into<String>, groups: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            acl: HashMap::new(),
            groups,
            flags: 0,
            version: default_meta_version(),
        }
    }

    pub fn with_acl(mut self, entry: AclEntry) -> Self {
        self.acl.insert(entry.user.clone(), entry);
        self
    }
}

/// Bucket: metadata plus the most recent stat group per replica group.
///
/// The group map is swapped wholesale under the registry write lock on
/// each stat refresh; readers see either the old or the new mapping in
/// its entirety.
#[derive(Debug)]
pub struct Bucket {
    pub meta: BucketMeta,
    groups: RwLock<HashMap<u32, Arc<StatGroup>>>,
}

impl Bucket {
    pub fn new(meta: BucketMeta) -> Self {
        Self { meta, groups: RwLock::new(HashMap::new()) }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Stat group for one replica group, if the last refresh had it.
    pub fn group(&self, group: u32) -> Option<Arc<StatGroup>> {
        self.groups.read().expect("bucket group lock poisoned").get(&group).cloned()
    }

    /// Snapshot of the whole group map.
    pub fn group_map(&self) -> HashMap<u32, Arc<StatGroup>> {
        self.groups.read().expect("bucket group lock poisoned").clone()
    }

    /// Install a new group map in one step.
    pub fn replace_groups(&self, groups: HashMap<u32, Arc<StatGroup>>) {
        *self.groups.write().expect("bucket group lock poisoned") = groups;
    }

    /// Verify the request against this bucket's ACL.
    ///
    /// The declared user's entry is used when present, otherwise the
    /// wildcard entry. Unknown user: NotFound. Known user lacking the
    /// required bit: Forbidden. Signature mismatch: Unauthorized.
    pub fn check_auth(&self, req: &ProxyRequest, required: u64) -> Result<()> {
        let url = req.url();
        let (user, recv_auth) = auth::auth_info(req);

        let entry = self
            .meta
            .acl
            .get(&user)
            .or_else(|| self.meta.acl.get(auth::WILDCARD_USER))
            .ok_or_else(|| {
                Error::not_found(
                    &url,
                    format!("bucket: {}: there is no user '{}' in ACL", self.meta.name, user),
                )
            })?;

        if !entry.allows(required) {
            return Err(Error::forbidden(
                &url,
                format!(
                    "bucket: {}: user '{}' lacks permission {:#x} (mask {:#x})",
                    self.meta.name, entry.user, required, entry.flags
                ),
            ));
        }

        if entry.flags & acl::NO_TOKEN != 0 {
            return Ok(());
        }

        let want = auth::generate_signature(&entry.token, req.method.as_str(), &req.uri, &req.headers);
        if want != recv_auth {
            return Err(Error::unauthorized(
                &url,
                format!("bucket: {}: user '{}': signature mismatch", self.meta.name, entry.user),
            ));
        }

        Ok(())
    }
}
