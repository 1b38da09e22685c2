//! Represents one stored version of an object (or a delete marker).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single object version within a bucket.
///
/// Every write to a versioned bucket adds a row; unversioned buckets keep one
/// row per key. The row stores metadata only; the body lives on disk under
/// the row id.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectVersion {
    /// Internal UUID; also names the payload file.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Version identifier, `None` for writes to an unversioned bucket.
    pub version_id: Option<String>,

    /// Whether this is the current version for the key.
    pub is_latest: bool,

    /// Delete markers have no body and hide older versions.
    pub is_delete_marker: bool,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the body as lowercase hex, opaque for KMS-encrypted versions.
    pub etag: String,

    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub website_redirect: Option<String>,

    /// Storage class (e.g., STANDARD, GLACIER).
    pub storage_class: String,

    pub server_side_encryption: Option<String>,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: bool,

    pub lock_mode: Option<String>,
    pub lock_retain_until: Option<DateTime<Utc>>,
    pub legal_hold: Option<String>,

    /// Canned ACL applied to this version.
    pub acl: Option<String>,

    /// User metadata as a JSON object.
    pub metadata_json: String,

    /// Tag set as a JSON object.
    pub tags_json: String,

    /// Timestamp when this version was written.
    pub last_modified: DateTime<Utc>,
}
