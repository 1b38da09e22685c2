//! In-process versioned object store.
//!
//! Behaves like the remote store where the reconciler cares: versioned
//! buckets mint a fresh version id per write, delete markers hide older
//! versions, lock state is enforced at delete time, and KMS-encrypted
//! objects get an ETag unrelated to their content. Individual operations
//! can be made to fail once via [`MemoryTransport::fail_next`].

use super::{
    Body, DeleteOutput, PutOutput, StorageTransport, TransportError, TransportResult,
    VersionEntry, WriteAttributes, delete_violation, retention_violation,
};
use crate::models::{
    desired::ServerSideEncryption,
    identity::{ContainerRef, ObjectId},
    lock::{LegalHoldStatus, LockState, Retention},
    observed::ObservedState,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";
pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Transport operations, used for fault injection and call recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Head,
    Put,
    CopyInPlace,
    Delete,
    ListVersions,
    GetTags,
    PutTags,
    GetAcl,
    PutAcl,
    PutLegalHold,
    PutRetention,
}

#[derive(Clone, Debug)]
struct StoredVersion {
    version_id: Option<String>,
    is_delete_marker: bool,
    body: Bytes,
    etag: String,
    attrs: WriteAttributes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryBucket {
    versioning: bool,
    object_lock: bool,
    default_encryption: Option<ServerSideEncryption>,
    /// Oldest first; the last entry is the current version.
    objects: BTreeMap<String, Vec<StoredVersion>>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, MemoryBucket>,
    faults: HashMap<Operation, TransportError>,
    calls: Vec<Operation>,
}

#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a bucket.
    pub fn create_bucket(&self, name: &str, versioning: bool, object_lock: bool) {
        let mut inner = self.lock();
        inner.buckets.insert(
            name.to_string(),
            MemoryBucket {
                versioning: versioning || object_lock,
                object_lock,
                ..Default::default()
            },
        );
    }

    /// Encryption the store applies when a write does not ask for one.
    pub fn set_default_encryption(&self, bucket: &str, sse: Option<ServerSideEncryption>) {
        if let Some(b) = self.lock().buckets.get_mut(bucket) {
            b.default_encryption = sse;
        }
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Operation, err: TransportError) {
        self.lock().faults.insert(op, err);
    }

    /// Every operation issued so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    /// Body of the current version, if any.
    pub fn body(&self, id: &ObjectId) -> Option<Bytes> {
        let inner = self.lock();
        let bucket = inner.buckets.get(id.bucket.as_str())?;
        let current = bucket.objects.get(&id.key)?.last()?;
        (!current.is_delete_marker).then(|| current.body.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and return the injected fault, if one is armed.
    fn enter(&self, op: Operation) -> TransportResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(op);
        match inner.faults.remove(&op) {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }
}

fn bucket_name(id: &ObjectId) -> &str {
    match &id.bucket {
        ContainerRef::Bucket(name) => name,
        // Access points resolve to the bucket named after the last ARN segment.
        ContainerRef::AccessPoint(arn) => arn.rsplit('/').next().unwrap_or(arn),
    }
}

impl Inner {
    fn bucket(&self, id: &ObjectId) -> TransportResult<&MemoryBucket> {
        let name = bucket_name(id);
        self.buckets
            .get(name)
            .ok_or_else(|| TransportError::BucketNotFound(name.to_string()))
    }

    fn bucket_mut(&mut self, id: &ObjectId) -> TransportResult<&mut MemoryBucket> {
        let name = bucket_name(id);
        self.buckets
            .get_mut(name)
            .ok_or_else(|| TransportError::BucketNotFound(name.to_string()))
    }
}

impl MemoryBucket {
    fn version(&self, key: &str, version_id: Option<&str>) -> Option<&StoredVersion> {
        let versions = self.objects.get(key)?;
        match version_id {
            None => versions.last(),
            Some(v) => versions
                .iter()
                .find(|sv| sv.version_id.as_deref() == Some(v)),
        }
    }

    fn version_mut(&mut self, key: &str, version_id: Option<&str>) -> Option<&mut StoredVersion> {
        let versions = self.objects.get_mut(key)?;
        match version_id {
            None => versions.last_mut(),
            Some(v) => versions
                .iter_mut()
                .find(|sv| sv.version_id.as_deref() == Some(v)),
        }
    }

    /// Current or named version, excluding delete markers.
    fn live_version_mut(
        &mut self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<&mut StoredVersion> {
        match self.version_mut(&id.key, version_id) {
            Some(v) if !v.is_delete_marker => Ok(v),
            _ => Err(TransportError::not_found(id)),
        }
    }

    fn check_lock_allowed(&self, id: &ObjectId, lock: &LockState) -> TransportResult<()> {
        if !self.object_lock && (lock.retention.is_some() || lock.legal_hold.is_some()) {
            return Err(TransportError::Unsupported(format!(
                "object lock on bucket `{}`",
                id.bucket
            )));
        }
        Ok(())
    }

    /// Add a version: appended in versioned buckets, replacing the null version otherwise.
    fn store(&mut self, key: &str, mut version: StoredVersion) -> Option<String> {
        let versions = self.objects.entry(key.to_string()).or_default();
        if self.versioning {
            version.version_id = Some(Uuid::new_v4().simple().to_string());
        } else {
            version.version_id = None;
            versions.retain(|v| v.version_id.is_some());
        }
        let version_id = version.version_id.clone();
        versions.push(version);
        version_id
    }

    fn resolve_attrs(&self, attrs: &WriteAttributes) -> WriteAttributes {
        let mut resolved = attrs.clone();
        if resolved.storage_class.is_none() {
            resolved.storage_class = Some(DEFAULT_STORAGE_CLASS.to_string());
        }
        if resolved.headers.content_type.is_none() {
            resolved.headers.content_type = Some(DEFAULT_CONTENT_TYPE.to_string());
        }
        if resolved.server_side_encryption.is_none() {
            resolved.server_side_encryption = self.default_encryption;
        }
        resolved
    }
}

fn etag_for(body: &[u8], attrs: &WriteAttributes) -> String {
    if attrs.server_side_encryption.is_some_and(|sse| sse.is_kms()) {
        // KMS ETags are opaque: same shape as MD5, unrelated to the content.
        format!("{:x}", md5::compute(Uuid::new_v4().as_bytes()))
    } else {
        format!("{:x}", md5::compute(body))
    }
}

fn observed_from(version: &StoredVersion) -> ObservedState {
    let attrs = &version.attrs;
    ObservedState {
        etag: version.etag.clone(),
        version_id: version.version_id.clone(),
        content_length: version.body.len() as u64,
        headers: attrs.headers.clone(),
        storage_class: attrs
            .storage_class
            .clone()
            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        server_side_encryption: attrs.server_side_encryption,
        kms_key_id: attrs.kms_key_id.clone(),
        bucket_key_enabled: attrs.bucket_key_enabled.unwrap_or(false),
        lock: attrs.lock,
        metadata: attrs.metadata.clone(),
        tags: BTreeMap::new(),
        last_modified: version.last_modified,
    }
}

#[async_trait]
impl StorageTransport for MemoryTransport {
    async fn head(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<Option<ObservedState>> {
        let inner = self.enter(Operation::Head)?;
        let bucket = inner.bucket(id)?;
        Ok(bucket
            .version(&id.key, version_id)
            .filter(|v| !v.is_delete_marker)
            .map(observed_from))
    }

    async fn put(
        &self,
        id: &ObjectId,
        body: Body,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput> {
        {
            let inner = self.enter(Operation::Put)?;
            inner.bucket(id)?.check_lock_allowed(id, &attrs.lock)?;
        }
        let body = body.collect().await?;

        let mut inner = self.lock();
        let bucket = inner.bucket_mut(id)?;
        let attrs = bucket.resolve_attrs(attrs);
        let etag = etag_for(&body, &attrs);
        let version_id = bucket.store(
            &id.key,
            StoredVersion {
                version_id: None,
                is_delete_marker: false,
                body,
                etag: etag.clone(),
                attrs,
                last_modified: Utc::now(),
            },
        );
        debug!(%id, ?version_id, "memory put");
        Ok(PutOutput { etag, version_id })
    }

    async fn copy_in_place(
        &self,
        id: &ObjectId,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput> {
        let mut inner = self.enter(Operation::CopyInPlace)?;
        let bucket = inner.bucket_mut(id)?;
        bucket.check_lock_allowed(id, &attrs.lock)?;
        let body = bucket.live_version_mut(id, None)?.body.clone();
        let attrs = bucket.resolve_attrs(attrs);
        let etag = etag_for(&body, &attrs);
        let version_id = bucket.store(
            &id.key,
            StoredVersion {
                version_id: None,
                is_delete_marker: false,
                body,
                etag: etag.clone(),
                attrs,
                last_modified: Utc::now(),
            },
        );
        Ok(PutOutput { etag, version_id })
    }

    async fn delete(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> TransportResult<DeleteOutput> {
        let mut inner = self.enter(Operation::Delete)?;
        let bucket = inner.bucket_mut(id)?;

        if version_id.is_none() && bucket.versioning {
            let marker = bucket.store(
                &id.key,
                StoredVersion {
                    version_id: None,
                    is_delete_marker: true,
                    body: Bytes::new(),
                    etag: String::new(),
                    attrs: WriteAttributes::default(),
                    last_modified: Utc::now(),
                },
            );
            return Ok(DeleteOutput {
                version_id: marker,
                delete_marker: true,
            });
        }

        let Some(target) = bucket.version(&id.key, version_id) else {
            return Err(TransportError::not_found(id));
        };
        if let Some(reason) = delete_violation(&target.attrs.lock, bypass_governance, Utc::now()) {
            return Err(TransportError::ObjectLocked(format!("{}: {}", id, reason)));
        }
        let removed_marker = target.is_delete_marker;
        let removed_id = target.version_id.clone();

        if let Some(versions) = bucket.objects.get_mut(&id.key) {
            versions.retain(|v| v.version_id != removed_id);
            if versions.is_empty() {
                bucket.objects.remove(&id.key);
            }
        }
        Ok(DeleteOutput {
            version_id: removed_id,
            delete_marker: removed_marker,
        })
    }

    async fn list_versions(&self, id: &ObjectId) -> TransportResult<Vec<VersionEntry>> {
        let inner = self.enter(Operation::ListVersions)?;
        let bucket = inner.bucket(id)?;
        let Some(versions) = bucket.objects.get(&id.key) else {
            return Ok(Vec::new());
        };
        let last = versions.len().saturating_sub(1);
        Ok(versions
            .iter()
            .enumerate()
            .rev()
            .map(|(i, v)| VersionEntry {
                version_id: v.version_id.clone(),
                is_delete_marker: v.is_delete_marker,
                is_latest: i == last,
            })
            .collect())
    }

    async fn get_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<BTreeMap<String, String>> {
        let mut inner = self.enter(Operation::GetTags)?;
        let version = inner.bucket_mut(id)?.live_version_mut(id, version_id)?;
        Ok(version.attrs.tags.clone())
    }

    async fn put_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> TransportResult<()> {
        let mut inner = self.enter(Operation::PutTags)?;
        let version = inner.bucket_mut(id)?.live_version_mut(id, version_id)?;
        version.attrs.tags = tags.clone();
        Ok(())
    }

    async fn get_acl(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let mut inner = self.enter(Operation::GetAcl)?;
        let version = inner.bucket_mut(id)?.live_version_mut(id, None)?;
        Ok(version.attrs.acl.clone())
    }

    async fn put_acl(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        acl: &str,
    ) -> TransportResult<()> {
        let mut inner = self.enter(Operation::PutAcl)?;
        let version = inner.bucket_mut(id)?.live_version_mut(id, version_id)?;
        version.attrs.acl = Some(acl.to_string());
        Ok(())
    }

    async fn put_legal_hold(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        status: LegalHoldStatus,
    ) -> TransportResult<()> {
        let mut inner = self.enter(Operation::PutLegalHold)?;
        let bucket = inner.bucket_mut(id)?;
        bucket.check_lock_allowed(
            id,
            &LockState {
                retention: None,
                legal_hold: Some(status),
            },
        )?;
        let version = bucket.live_version_mut(id, version_id)?;
        version.attrs.lock.legal_hold = Some(status);
        Ok(())
    }

    async fn put_retention(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> TransportResult<()> {
        let mut inner = self.enter(Operation::PutRetention)?;
        let bucket = inner.bucket_mut(id)?;
        bucket.check_lock_allowed(
            id,
            &LockState {
                retention,
                legal_hold: None,
            },
        )?;
        let version = bucket.live_version_mut(id, version_id)?;

        let current = version.attrs.lock.retention;
        if let Some(reason) = retention_violation(current, retention, bypass_governance, Utc::now())
        {
            return Err(TransportError::ObjectLocked(format!("{}: {}", id, reason)));
        }
        version.attrs.lock.retention = retention;
        Ok(())
    }
}
