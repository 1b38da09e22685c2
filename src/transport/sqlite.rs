//! src/transport/sqlite.rs
//!
//! SqliteTransport: a versioned local object store backed by SQLite for
//! metadata and local disk for object payloads. Each stored version (delete
//! markers included) is one row in `objects`; payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{row-id}`.

use super::{
    Body, DeleteOutput, PutOutput, StorageTransport, TransportError, TransportResult,
    VersionEntry, WriteAttributes, delete_violation, retention_violation,
};
use crate::models::{
    bucket::Bucket,
    desired::{ObjectHeaders, ServerSideEncryption},
    identity::{ContainerRef, ObjectId},
    lock::{LegalHoldStatus, LockMode, LockState, Retention},
    object::ObjectVersion,
    observed::ObservedState,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";
const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

const OBJECT_COLUMNS: &str = "id, bucket_id, key, version_id, is_latest, is_delete_marker, \
     size_bytes, etag, content_type, content_language, content_disposition, content_encoding, \
     cache_control, website_redirect, storage_class, server_side_encryption, kms_key_id, \
     bucket_key_enabled, lock_mode, lock_retain_until, legal_hold, acl, metadata_json, \
     tags_json, last_modified";

/// Run the embedded schema migration statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> TransportResult<()> {
    let statements = MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// SqliteTransport implements [`StorageTransport`] on local durable storage.
///
/// - Writes stream the body to a temp file, hashing as they go, then rename
///   it into place and insert the version row.
/// - Versioned buckets keep every row; unversioned buckets keep one null
///   version per key.
/// - Deletes enforce legal hold and retention the way a remote store would.
#[derive(Clone)]
pub struct SqliteTransport {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl SqliteTransport {
    /// Create a transport backed by the provided SQLite pool, using
    /// `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Reject keys the store cannot hold.
    ///
    /// Payload paths are derived from row ids, so separators and dots in keys
    /// are harmless; only length and control bytes matter.
    fn ensure_key_safe(&self, key: &str) -> TransportResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(TransportError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\0') {
            return Err(TransportError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3 to 63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> TransportResult<()> {
        let invalid = |reason: &str| TransportError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        if name.trim() != name {
            return Err(invalid("cannot begin or end with whitespace"));
        }

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Validate region string against SUPPORTED_REGIONS (case-insensitive).
    fn ensure_region_valid(&self, region: &str) -> TransportResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(TransportError::UnsupportedRegion(region.to_string()))
        }
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key) as hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload path for one version row: base_path/bucket/{shard}/{shard}/{row-id}.
    fn payload_path(&self, bucket_name: &str, key: &str, row_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(row_id.to_string());
        path
    }

    /// Access points are opaque to this store; only plain buckets resolve.
    fn bucket_name<'a>(&self, id: &'a ObjectId) -> TransportResult<&'a str> {
        match &id.bucket {
            ContainerRef::Bucket(name) => Ok(name),
            ContainerRef::AccessPoint(arn) => {
                Err(TransportError::Unsupported(format!("access point `{}`", arn)))
            }
        }
    }

    /// Fetch bucket metadata from SQLite.
    async fn fetch_bucket(&self, bucket: &str) -> TransportResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, region, created_at, versioning_enabled, object_lock_enabled
             FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => TransportError::BucketNotFound(bucket.to_string()),
            other => TransportError::Sqlx(other),
        })
    }

    /// Validate the id and load its bucket.
    async fn resolve(&self, id: &ObjectId) -> TransportResult<Bucket> {
        self.ensure_key_safe(&id.key)?;
        let name = self.bucket_name(id)?;
        self.fetch_bucket(name).await
    }

    /// Fetch the current row (`None`) or a named version, delete markers included.
    async fn fetch_version(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: Option<&str>,
    ) -> TransportResult<Option<ObjectVersion>> {
        let row = match version_id {
            None => {
                let sql = format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket_id = ? AND key = ? AND is_latest = 1"
                );
                sqlx::query_as::<_, ObjectVersion>(&sql)
                    .bind(bucket.id)
                    .bind(key)
                    .fetch_optional(&*self.db)
                    .await?
            }
            Some(version_id) => {
                let sql = format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket_id = ? AND key = ? AND version_id = ?"
                );
                sqlx::query_as::<_, ObjectVersion>(&sql)
                    .bind(bucket.id)
                    .bind(key)
                    .bind(version_id)
                    .fetch_optional(&*self.db)
                    .await?
            }
        };
        Ok(row)
    }

    /// Like [`Self::fetch_version`] but NotFound for missing rows and delete markers.
    async fn fetch_live(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<(Bucket, ObjectVersion)> {
        let bucket = self.resolve(id).await?;
        match self.fetch_version(&bucket, &id.key, version_id).await? {
            Some(row) if !row.is_delete_marker => Ok((bucket, row)),
            _ => Err(TransportError::not_found(id)),
        }
    }

    /// Stream `body` into a fresh payload file, returning its MD5 and size.
    ///
    /// Writes to a temp file, fsyncs, then renames into place. The temp file
    /// is removed on any error.
    async fn write_payload(&self, final_path: &Path, body: Body) -> TransportResult<(String, i64)> {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            TransportError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        match Self::stream_to(&tmp_path, body).await {
            Ok(written) => {
                if let Err(err) = fs::rename(&tmp_path, final_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(TransportError::Io(err));
                }
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(TransportError::Io(err))
            }
        }
    }

    async fn stream_to(path: &Path, body: Body) -> io::Result<(String, i64)> {
        let mut file = File::create(path).await?;
        let mut stream = body.into_stream().await?;
        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((format!("{:x}", digest.compute()), size_bytes))
    }

    /// Insert a version row, demoting the previous current version.
    ///
    /// In unversioned buckets the previous null version is replaced; its
    /// payload is removed once the transaction commits.
    async fn insert_version(&self, bucket: &Bucket, row: &ObjectVersion) -> TransportResult<()> {
        let mut tx = self.db.begin().await?;

        let replaced: Vec<Uuid> = if bucket.versioning_enabled {
            Vec::new()
        } else {
            let ids = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM objects WHERE bucket_id = ? AND key = ? AND version_id IS NULL",
            )
            .bind(bucket.id)
            .bind(&row.key)
            .fetch_all(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM objects WHERE bucket_id = ? AND key = ? AND version_id IS NULL")
                .bind(bucket.id)
                .bind(&row.key)
                .execute(&mut *tx)
                .await?;
            ids
        };

        sqlx::query("UPDATE objects SET is_latest = 0 WHERE bucket_id = ? AND key = ?")
            .bind(bucket.id)
            .bind(&row.key)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO objects ({OBJECT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(row.id)
            .bind(row.bucket_id)
            .bind(&row.key)
            .bind(&row.version_id)
            .bind(row.is_latest)
            .bind(row.is_delete_marker)
            .bind(row.size_bytes)
            .bind(&row.etag)
            .bind(&row.content_type)
            .bind(&row.content_language)
            .bind(&row.content_disposition)
            .bind(&row.content_encoding)
            .bind(&row.cache_control)
            .bind(&row.website_redirect)
            .bind(&row.storage_class)
            .bind(&row.server_side_encryption)
            .bind(&row.kms_key_id)
            .bind(row.bucket_key_enabled)
            .bind(&row.lock_mode)
            .bind(row.lock_retain_until)
            .bind(&row.legal_hold)
            .bind(&row.acl)
            .bind(&row.metadata_json)
            .bind(&row.tags_json)
            .bind(row.last_modified)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        for old in replaced {
            self.remove_payload(&bucket.name, &row.key, old).await;
        }
        Ok(())
    }

    /// Best-effort payload removal followed by pruning of empty shard directories.
    async fn remove_payload(&self, bucket_name: &str, key: &str, row_id: Uuid) {
        let path = self.payload_path(bucket_name, key, row_id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => debug!("failed to remove {}: {}", path.display(), err),
        }
        if let Some(parent) = path.parent() {
            let bucket_root = self.bucket_root(bucket_name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
    }

    /// Build a new version row for `bucket/key` with resolved attributes.
    fn new_row(
        &self,
        bucket: &Bucket,
        key: &str,
        attrs: &WriteAttributes,
    ) -> TransportResult<ObjectVersion> {
        check_lock_allowed(bucket, &attrs.lock)?;
        let sse = attrs.server_side_encryption;
        Ok(ObjectVersion {
            id: Uuid::new_v4(),
            bucket_id: bucket.id,
            key: key.to_string(),
            version_id: bucket
                .versioning_enabled
                .then(|| Uuid::new_v4().simple().to_string()),
            is_latest: true,
            is_delete_marker: false,
            size_bytes: 0,
            etag: String::new(),
            content_type: attrs
                .headers
                .content_type
                .clone()
                .or_else(|| Some(DEFAULT_CONTENT_TYPE.to_string())),
            content_language: attrs.headers.content_language.clone(),
            content_disposition: attrs.headers.content_disposition.clone(),
            content_encoding: attrs.headers.content_encoding.clone(),
            cache_control: attrs.headers.cache_control.clone(),
            website_redirect: attrs.headers.website_redirect.clone(),
            storage_class: attrs
                .storage_class
                .clone()
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            server_side_encryption: sse.map(|s| s.as_str().to_string()),
            kms_key_id: attrs.kms_key_id.clone(),
            bucket_key_enabled: attrs.bucket_key_enabled.unwrap_or(false),
            lock_mode: attrs.lock.retention.map(|r| r.mode.as_str().to_string()),
            lock_retain_until: attrs.lock.retention.map(|r| r.retain_until),
            legal_hold: attrs.lock.legal_hold.map(|s| s.as_str().to_string()),
            acl: attrs.acl.clone(),
            metadata_json: encode_map(&attrs.metadata)?,
            tags_json: encode_map(&attrs.tags)?,
            last_modified: Utc::now(),
        })
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Object lock implies versioning, as it does on the remote store.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: String,
        versioning: bool,
        object_lock: bool,
    ) -> TransportResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: normalized_region,
            created_at: Utc::now(),
            versioning_enabled: versioning || object_lock,
            object_lock_enabled: object_lock,
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, region, created_at, versioning_enabled, object_lock_enabled)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .bind(bucket.versioning_enabled)
        .bind(bucket.object_lock_enabled)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(TransportError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(TransportError::Sqlx(err)),
        }
    }

    /// Delete a bucket row and its payload directory.
    pub async fn delete_bucket(&self, name: &str) -> TransportResult<()> {
        self.ensure_bucket_name_safe(name)?;
        let bucket = self.fetch_bucket(name).await?;
        sqlx::query("DELETE FROM objects WHERE bucket_id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Recursively remove empty directories up to bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn update_column<T>(&self, row_id: Uuid, column: &str, value: T) -> TransportResult<()>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + 'static,
    {
        let sql = format!("UPDATE objects SET {column} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(value)
            .bind(row_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

fn check_lock_allowed(bucket: &Bucket, lock: &LockState) -> TransportResult<()> {
    if !bucket.object_lock_enabled && (lock.retention.is_some() || lock.legal_hold.is_some()) {
        return Err(TransportError::Unsupported(format!(
            "object lock on bucket `{}`",
            bucket.name
        )));
    }
    Ok(())
}

fn encode_map(map: &BTreeMap<String, String>) -> TransportResult<String> {
    serde_json::to_string(map).map_err(|err| TransportError::Corrupt(err.to_string()))
}

fn decode_map(json: &str) -> TransportResult<BTreeMap<String, String>> {
    serde_json::from_str(json).map_err(|err| TransportError::Corrupt(err.to_string()))
}

fn parse_column<T: FromStr<Err = String>>(value: Option<&str>) -> TransportResult<Option<T>> {
    value
        .map(T::from_str)
        .transpose()
        .map_err(TransportError::Corrupt)
}

fn lock_state(row: &ObjectVersion) -> TransportResult<LockState> {
    let mode: Option<LockMode> = parse_column(row.lock_mode.as_deref())?;
    let retention = match (mode, row.lock_retain_until) {
        (Some(mode), Some(retain_until)) => Some(Retention { mode, retain_until }),
        (None, None) => None,
        _ => {
            return Err(TransportError::Corrupt(format!(
                "row {} has a partial retention",
                row.id
            )));
        }
    };
    Ok(LockState {
        retention,
        legal_hold: parse_column::<LegalHoldStatus>(row.legal_hold.as_deref())?,
    })
}

fn observed_from_row(row: &ObjectVersion) -> TransportResult<ObservedState> {
    Ok(ObservedState {
        etag: row.etag.clone(),
        version_id: row.version_id.clone(),
        content_length: row.size_bytes.max(0) as u64,
        headers: ObjectHeaders {
            content_type: row.content_type.clone(),
            content_language: row.content_language.clone(),
            content_disposition: row.content_disposition.clone(),
            content_encoding: row.content_encoding.clone(),
            cache_control: row.cache_control.clone(),
            website_redirect: row.website_redirect.clone(),
        },
        storage_class: row.storage_class.clone(),
        server_side_encryption: parse_column::<ServerSideEncryption>(
            row.server_side_encryption.as_deref(),
        )?,
        kms_key_id: row.kms_key_id.clone(),
        bucket_key_enabled: row.bucket_key_enabled,
        lock: lock_state(row)?,
        metadata: decode_map(&row.metadata_json)?,
        tags: BTreeMap::new(),
        last_modified: row.last_modified,
    })
}

/// KMS objects get an opaque ETag; everything else carries the body MD5.
fn etag_for(content_md5: String, row: &ObjectVersion) -> String {
    let kms = row
        .server_side_encryption
        .as_deref()
        .is_some_and(|sse| sse.starts_with("aws:kms"));
    if kms {
        format!("{:x}", md5::compute(row.id.as_bytes()))
    } else {
        content_md5
    }
}

#[async_trait]
impl StorageTransport for SqliteTransport {
    async fn head(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<Option<ObservedState>> {
        let bucket = self.resolve(id).await?;
        match self.fetch_version(&bucket, &id.key, version_id).await? {
            Some(row) if !row.is_delete_marker => Ok(Some(observed_from_row(&row)?)),
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        id: &ObjectId,
        body: Body,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput> {
        let bucket = self.resolve(id).await?;
        let mut row = self.new_row(&bucket, &id.key, attrs)?;

        let path = self.payload_path(&bucket.name, &id.key, row.id);
        let (content_md5, size_bytes) = self.write_payload(&path, body).await?;
        row.size_bytes = size_bytes;
        row.etag = etag_for(content_md5, &row);

        if let Err(err) = self.insert_version(&bucket, &row).await {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }
        debug!(%id, version_id = ?row.version_id, "stored object version");
        Ok(PutOutput {
            etag: row.etag,
            version_id: row.version_id,
        })
    }

    async fn copy_in_place(
        &self,
        id: &ObjectId,
        attrs: &WriteAttributes,
    ) -> TransportResult<PutOutput> {
        let (bucket, current) = self.fetch_live(id, None).await?;
        let mut row = self.new_row(&bucket, &id.key, attrs)?;

        let source = self.payload_path(&bucket.name, &id.key, current.id);
        let path = self.payload_path(&bucket.name, &id.key, row.id);
        let (content_md5, size_bytes) = self.write_payload(&path, Body::File(source)).await?;
        row.size_bytes = size_bytes;
        row.etag = etag_for(content_md5, &row);

        if let Err(err) = self.insert_version(&bucket, &row).await {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }
        Ok(PutOutput {
            etag: row.etag,
            version_id: row.version_id,
        })
    }

    async fn delete(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> TransportResult<DeleteOutput> {
        let bucket = self.resolve(id).await?;

        if version_id.is_none() && bucket.versioning_enabled {
            let mut marker = self.new_row(&bucket, &id.key, &WriteAttributes::default())?;
            marker.is_delete_marker = true;
            marker.content_type = None;
            self.insert_version(&bucket, &marker).await?;
            return Ok(DeleteOutput {
                version_id: marker.version_id,
                delete_marker: true,
            });
        }

        let Some(target) = self.fetch_version(&bucket, &id.key, version_id).await? else {
            return Err(TransportError::not_found(id));
        };
        if let Some(reason) = delete_violation(&lock_state(&target)?, bypass_governance, Utc::now())
        {
            return Err(TransportError::ObjectLocked(format!("{}: {}", id, reason)));
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(target.id)
            .execute(&mut *tx)
            .await?;
        if target.is_latest {
            sqlx::query(
                "UPDATE objects SET is_latest = 1 WHERE id = (
                     SELECT id FROM objects WHERE bucket_id = ? AND key = ?
                     ORDER BY rowid DESC LIMIT 1)",
            )
            .bind(bucket.id)
            .bind(&id.key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if !target.is_delete_marker {
            self.remove_payload(&bucket.name, &id.key, target.id).await;
        }
        Ok(DeleteOutput {
            version_id: target.version_id,
            delete_marker: target.is_delete_marker,
        })
    }

    async fn list_versions(&self, id: &ObjectId) -> TransportResult<Vec<VersionEntry>> {
        let bucket = self.resolve(id).await?;
        let rows = sqlx::query_as::<_, (Option<String>, bool, bool)>(
            "SELECT version_id, is_delete_marker, is_latest FROM objects
             WHERE bucket_id = ? AND key = ? ORDER BY rowid DESC",
        )
        .bind(bucket.id)
        .bind(&id.key)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(version_id, is_delete_marker, is_latest)| VersionEntry {
                version_id,
                is_delete_marker,
                is_latest,
            })
            .collect())
    }

    async fn get_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
    ) -> TransportResult<BTreeMap<String, String>> {
        let (_, row) = self.fetch_live(id, version_id).await?;
        decode_map(&row.tags_json)
    }

    async fn put_tags(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> TransportResult<()> {
        let (_, row) = self.fetch_live(id, version_id).await?;
        self.update_column(row.id, "tags_json", encode_map(tags)?)
            .await
    }

    async fn get_acl(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let (_, row) = self.fetch_live(id, None).await?;
        Ok(row.acl)
    }

    async fn put_acl(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        acl: &str,
    ) -> TransportResult<()> {
        let (_, row) = self.fetch_live(id, version_id).await?;
        self.update_column(row.id, "acl", acl.to_string()).await
    }

    async fn put_legal_hold(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        status: LegalHoldStatus,
    ) -> TransportResult<()> {
        let (bucket, row) = self.fetch_live(id, version_id).await?;
        check_lock_allowed(
            &bucket,
            &LockState {
                retention: None,
                legal_hold: Some(status),
            },
        )?;
        self.update_column(row.id, "legal_hold", status.as_str().to_string())
            .await
    }

    async fn put_retention(
        &self,
        id: &ObjectId,
        version_id: Option<&str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> TransportResult<()> {
        let (bucket, row) = self.fetch_live(id, version_id).await?;
        check_lock_allowed(
            &bucket,
            &LockState {
                retention,
                legal_hold: None,
            },
        )?;
        let current = lock_state(&row)?.retention;
        if let Some(reason) = retention_violation(current, retention, bypass_governance, Utc::now())
        {
            return Err(TransportError::ObjectLocked(format!("{}: {}", id, reason)));
        }

        sqlx::query("UPDATE objects SET lock_mode = ?, lock_retain_until = ? WHERE id = ?")
            .bind(retention.map(|r| r.mode.as_str().to_string()))
            .bind(retention.map(|r| r.retain_until))
            .bind(row.id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
