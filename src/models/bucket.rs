//! Represents a logical bucket, the top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket in the local store.
///
/// Buckets act as namespaces for objects. Versioning and object lock are
/// bucket-level switches that decide how writes and deletes behave.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Region where the bucket is hosted (e.g. "us-west-2").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// Writes produce a new version id instead of overwriting.
    pub versioning_enabled: bool,

    /// Legal hold and retention may be set on objects in this bucket.
    pub object_lock_enabled: bool,
}
