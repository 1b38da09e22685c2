//! Observed state (what the store reports) and the persisted state record.

use crate::{
    models::{
        desired::{ObjectHeaders, ServerSideEncryption},
        identity::ObjectId,
        lock::LockState,
    },
    reconcile::tags::IgnoreTags,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Remote state of the current version of an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObservedState {
    pub etag: String,
    /// `None` when the bucket was unversioned at write time.
    pub version_id: Option<String>,
    pub content_length: u64,
    pub headers: ObjectHeaders,
    pub storage_class: String,
    pub server_side_encryption: Option<ServerSideEncryption>,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: bool,
    pub lock: LockState,
    pub metadata: BTreeMap<String, String>,
    /// Full remote tag set, including tags the reconciler ignores.
    pub tags: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

impl ObservedState {
    /// True when the ETag is a plain MD5 of the body and can stand in for content.
    pub fn etag_is_content_md5(&self) -> bool {
        !self
            .server_side_encryption
            .is_some_and(|sse| sse.is_kms())
            && is_md5_hex(&self.etag)
    }
}

/// Persisted record of the last successful cycle for one resource.
///
/// Holds the values the store cannot report back: the content hash as written,
/// the change-trigger hash, the applied ACL and the force-destroy flag.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectState {
    pub name: String,
    pub id: ObjectId,
    pub observed: ObservedState,
    pub content_hash: String,
    pub source_hash: Option<String>,
    pub acl: Option<String>,
    pub force_destroy: bool,
}

impl ObjectState {
    /// Tags as reported to the operator; ignored tags never show up as drift.
    pub fn reported_tags(&self, ignore: &IgnoreTags) -> BTreeMap<String, String> {
        ignore.filter(&self.observed.tags)
    }
}

/// Lowercase or uppercase 32-digit hex, optionally quoted.
pub fn is_md5_hex(etag: &str) -> bool {
    let etag = etag.trim_matches('"');
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}
