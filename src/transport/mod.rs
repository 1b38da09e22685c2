//! Storage transport: the remote object store as the reconciler sees it.
//!
//! The reconciler owns no wire format. Everything it needs from a store is
//! the [`StorageTransport`] trait below; `memory` and `sqlite` are the two
//! local implementations.

pub mod memory;
pub mod sqlite;

use crate::models::{
    desired::{ObjectHeaders, ServerSideEncryption},
    identity::ObjectId,
    lock::{LegalHoldStatus, LockMode, LockState, Retention},
    observed::ObservedState,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use std::{collections::BTreeMap, io, path::PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("object locked: {0}")]
    ObjectLocked(String),
    #[error("{0} is not supported by this store")]
    Unsupported(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl TransportError {
    pub fn not_found(id: &ObjectId) -> Self {
        Self::NotFound {
            bucket: id.bucket.to_string(),
            key: id.key.clone(),
        }
    }

    /// Network-ish failures may succeed on a later attempt; rejections will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Sqlx(_) | Self::Cancelled)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// An object body that has not been read yet.
#[derive(Clone, Debug)]
pub enum Body {
    Bytes(Bytes),
    /// Opened and streamed only when the transport consumes it.
    File(PathBuf),
}

impl Body {
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    pub async fn into_stream(self) -> io::Result<BodyStream> {
        match self {
            Self::Bytes(bytes) if bytes.is_empty() => Ok(futures::stream::empty().boxed()),
            Self::Bytes(bytes) => {
                Ok(futures::stream::iter([Ok::<_, io::Error>(bytes)]).boxed())
            }
            Self::File(path) => {
                let file = File::open(&path).await?;
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }

    /// Buffer the whole body. Only for stores that keep bodies in memory.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            body => {
                let chunks: Vec<Bytes> = body.into_stream().await?.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

/// Everything set atomically with a write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteAttributes {
    pub headers: ObjectHeaders,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<ServerSideEncryption>,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: Option<bool>,
    pub lock: LockState,
    pub acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutput {
    pub etag: String,
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOutput {
    /// Version removed, or the id of the delete marker that was created.
    pub version_id: Option<String>,
    pub delete_marker: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionEntry {
    pub version_id: Option<String>,
    pub is_delete_marker: bool,
    pub is_latest: bool,
}

/// Why a store would reject deleting a version with this lock state, if it would.
pub(crate) fn delete_violation(
    lock: &LockState,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> Option<String> {
    if LegalHoldStatus::is_on(lock.legal_hold) {
        return Some("legal hold is ON".into());
    }
    match lock.retention {
        Some(r) if r.is_active_at(now) => match r.mode {
            LockMode::Compliance => Some("COMPLIANCE retention is active".into()),
            LockMode::Governance if !bypass_governance => {
                Some("GOVERNANCE retention is active".into())
            }
            LockMode::Governance => None,
        },
        _ => None,
    }
}

/// Why a store would reject replacing `current` retention with `next`, if it would.
///
/// Extending is always allowed. Shortening, removing or changing the mode of
/// active retention needs governance bypass, and is never allowed for COMPLIANCE.
pub(crate) fn retention_violation(
    current: Option<Retention>,
    next: Option<Retention>,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> Option<String> {
    let current = current.filter(|r| r.is_active_at(now))?;
    let weakened = match next {
        None => true,
        Some(next) => next.retain_until < current.retain_until || next.mode != current.mode,
    };
    let allowed = match current.mode {
        LockMode::Compliance => !weakened,
        LockMode::Governance => !weakened || bypass_governance,
    };
    (!allowed).then(|| format!("cannot shorten or remove {} retention", current.mode))
}

/// Operations the reconciler needs from an object store.
///
/// `version_id: None` addresses the current version of the key.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// Object attributes without the body. Tags are not included; see [`Self::get_tags`].
    /// Returns `None` when the key (or version) does not exist or is a delete marker.
    async fn head(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<Option<ObservedState>>;

    /// Write a full object. Returns once the store has acknowledged the write.
    async fn put(
        &self,
        id: &ObjectId,
        body: Body,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput>;

    /// Server-side copy of the current version onto itself with new attributes.
    async fn copy_in_place(
        &self,
        id: &ObjectId,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput>;

    /// Delete a version, or the key when `version_id` is `None` (a delete
    /// marker in versioned buckets).
    async fn delete(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> TransportResult<DeleteOutput>;

    /// All versions and delete markers for exactly this key.
    async fn list_versions(&self, id: &ObjectId) -> TransportResult<Vec<VersionEntry>>;

    async fn get_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<BTreeMap<String, String>>;

    /// Replace the whole tag set of a version.
    async fn put_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> TransportResult<()>;

    async fn get_acl(&self, id: &ObjectId) -> TransportResult<Option<String>>;

    async fn put_acl(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        acl: &str,
    ) -> TransportResult<()>;

    async fn put_legal_hold(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        status: LegalHoldStatus,
    ) -> TransportResult<()>;

    /// Set or clear retention. Shortening or clearing GOVERNANCE retention needs `bypass_governance`.
    async fn put_retention(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> TransportResult<()>;
}
