//! Desired state: the attribute bag configuration supplies, and its validated form.
//!
//! [`ObjectConfig`] is what the config evaluator hands over. It still allows
//! invalid combinations (two content sources, a lock mode without a date).
//! [`DesiredState`] is the validated shape the reconciler works on; those
//! combinations are not representable there.

use crate::{
    errors::ReconcileError,
    models::{
        identity::{ContainerRef, ObjectId, normalize_key},
        lock::{LegalHoldStatus, LockMode, Retention},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

/// Raw configuration for one object resource.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectConfig {
    /// Resource address; names the persisted state record.
    pub name: Option<String>,
    pub bucket: String,
    pub key: String,
    pub content: Option<String>,
    pub content_base64: Option<String>,
    pub source: Option<PathBuf>,
    pub source_hash: Option<String>,
    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub website_redirect: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: Option<bool>,
    pub object_lock_mode: Option<String>,
    pub object_lock_retain_until_date: Option<String>,
    pub object_lock_legal_hold_status: Option<String>,
    pub acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub force_destroy: bool,
}

/// Exactly one place the object body comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    /// Explicitly empty body.
    None,
    Raw(Bytes),
    Base64(String),
    SourcePath(PathBuf),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerSideEncryption {
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
    #[serde(rename = "aws:kms:dsse")]
    AwsKmsDsse,
}

impl ServerSideEncryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256 => "AES256",
            Self::AwsKms => "aws:kms",
            Self::AwsKmsDsse => "aws:kms:dsse",
        }
    }

    /// KMS-encrypted objects do not carry an MD5 ETag.
    pub fn is_kms(&self) -> bool {
        matches!(self, Self::AwsKms | Self::AwsKmsDsse)
    }
}

impl FromStr for ServerSideEncryption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES256" => Ok(Self::Aes256),
            "aws:kms" => Ok(Self::AwsKms),
            "aws:kms:dsse" => Ok(Self::AwsKmsDsse),
            other => Err(format!("unknown server-side encryption `{}`", other)),
        }
    }
}

impl fmt::Display for ServerSideEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-style headers stored with the object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub website_redirect: Option<String>,
}

/// Validated desired state for one reconciliation cycle.
#[derive(Clone, Debug)]
pub struct DesiredState {
    pub id: ObjectId,
    pub content: Content,
    pub source_hash: Option<String>,
    pub headers: ObjectHeaders,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<ServerSideEncryption>,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: Option<bool>,
    pub retention: Option<Retention>,
    pub legal_hold: Option<LegalHoldStatus>,
    pub acl: Option<String>,
    /// Keys are lower-cased; the store treats metadata keys case-insensitively.
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub force_destroy: bool,
}

impl TryFrom<ObjectConfig> for DesiredState {
    type Error = ReconcileError;

    fn try_from(cfg: ObjectConfig) -> Result<Self, Self::Error> {
        if cfg.bucket.is_empty() {
            return Err(ReconcileError::validation("bucket must not be empty"));
        }
        if normalize_key(&cfg.key).is_empty() {
            return Err(ReconcileError::validation("key must not be empty"));
        }

        let content = match (cfg.content, cfg.content_base64, cfg.source) {
            (None, None, None) => Content::None,
            (Some(raw), None, None) => Content::Raw(Bytes::from(raw)),
            (None, Some(encoded), None) => Content::Base64(encoded),
            (None, None, Some(path)) => Content::SourcePath(path),
            _ => {
                return Err(ReconcileError::validation(
                    "only one of content, content_base64, source may be set",
                ));
            }
        };

        let retention = match (cfg.object_lock_mode, cfg.object_lock_retain_until_date) {
            (None, None) => None,
            (Some(mode), Some(until)) => Some(Retention {
                mode: mode.parse::<LockMode>().map_err(ReconcileError::Validation)?,
                retain_until: parse_timestamp(&until)?,
            }),
            _ => {
                return Err(ReconcileError::validation(
                    "object_lock_mode and object_lock_retain_until_date must be set together",
                ));
            }
        };

        let legal_hold = cfg
            .object_lock_legal_hold_status
            .map(|s| s.parse::<LegalHoldStatus>())
            .transpose()
            .map_err(ReconcileError::Validation)?;

        let mut server_side_encryption = cfg
            .server_side_encryption
            .map(|s| s.parse::<ServerSideEncryption>())
            .transpose()
            .map_err(ReconcileError::Validation)?;

        // A KMS key alone implies aws:kms.
        if cfg.kms_key_id.is_some() {
            match server_side_encryption {
                None => server_side_encryption = Some(ServerSideEncryption::AwsKms),
                Some(sse) if sse.is_kms() => {}
                Some(sse) => {
                    return Err(ReconcileError::Validation(format!(
                        "kms_key_id cannot be used with server_side_encryption {}",
                        sse
                    )));
                }
            }
        }

        let mut metadata = BTreeMap::new();
        for (key, value) in cfg.metadata {
            let lowered = key.to_ascii_lowercase();
            if metadata.insert(lowered.clone(), value).is_some() {
                return Err(ReconcileError::Validation(format!(
                    "metadata key `{}` differs from another key only by case",
                    lowered
                )));
            }
        }

        Ok(Self {
            id: ObjectId::new(ContainerRef::parse(cfg.bucket), &cfg.key),
            content,
            source_hash: cfg.source_hash,
            headers: ObjectHeaders {
                content_type: cfg.content_type,
                content_language: cfg.content_language,
                content_disposition: cfg.content_disposition,
                content_encoding: cfg.content_encoding,
                cache_control: cfg.cache_control,
                website_redirect: cfg.website_redirect,
            },
            storage_class: cfg.storage_class,
            server_side_encryption,
            kms_key_id: cfg.kms_key_id,
            bucket_key_enabled: cfg.bucket_key_enabled,
            retention,
            legal_hold,
            acl: cfg.acl,
            metadata,
            tags: cfg.tags,
            force_destroy: cfg.force_destroy,
        })
    }
}

/// Parse an RFC 3339 timestamp into UTC so equal instants compare equal
/// regardless of offset notation.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ReconcileError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            ReconcileError::Validation(format!("invalid timestamp `{}`: {}", value, err))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bucket: &str, key: &str) -> ObjectConfig {
        ObjectConfig {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    fn validation_message(err: ReconcileError) -> String {
        match err {
            ReconcileError::Validation(msg) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let err = DesiredState::try_from(config("", "a key")).unwrap_err();
        assert_eq!(validation_message(err), "bucket must not be empty");
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = DesiredState::try_from(config("a name", "")).unwrap_err();
        assert_eq!(validation_message(err), "key must not be empty");

        let err = DesiredState::try_from(config("a name", "///")).unwrap_err();
        assert_eq!(validation_message(err), "key must not be empty");
    }

    #[test]
    fn no_content_source_means_empty_body() {
        let desired = DesiredState::try_from(config("b", "k")).unwrap();
        assert_eq!(desired.content, Content::None);
    }

    #[test]
    fn two_content_sources_are_rejected() {
        let mut cfg = config("b", "k");
        cfg.content = Some("x".into());
        cfg.source = Some(PathBuf::from("/tmp/x"));
        let err = DesiredState::try_from(cfg).unwrap_err();
        assert!(validation_message(err).contains("only one of"));
    }

    #[test]
    fn lock_mode_requires_date() {
        let mut cfg = config("b", "k");
        cfg.object_lock_mode = Some("GOVERNANCE".into());
        let err = DesiredState::try_from(cfg).unwrap_err();
        assert!(validation_message(err).contains("set together"));
    }

    #[test]
    fn retain_until_tolerates_offset_notation() {
        let mut a = config("b", "k");
        a.object_lock_mode = Some("GOVERNANCE".into());
        a.object_lock_retain_until_date = Some("2030-01-01T00:00:00Z".into());
        let mut b = a.clone();
        b.object_lock_retain_until_date = Some("2030-01-01T02:00:00+02:00".into());

        let a = DesiredState::try_from(a).unwrap();
        let b = DesiredState::try_from(b).unwrap();
        assert_eq!(a.retention, b.retention);
    }

    #[test]
    fn metadata_keys_are_lowercased() {
        let mut cfg = config("b", "k");
        cfg.metadata.insert("Key1".into(), "value1".into());
        let desired = DesiredState::try_from(cfg).unwrap();
        assert_eq!(desired.metadata.get("key1").map(String::as_str), Some("value1"));
    }

    #[test]
    fn kms_key_implies_kms_mode() {
        let mut cfg = config("b", "k");
        cfg.kms_key_id = Some("arn:aws:kms:us-east-1:1:key/abc".into());
        let desired = DesiredState::try_from(cfg.clone()).unwrap();
        assert_eq!(desired.server_side_encryption, Some(ServerSideEncryption::AwsKms));

        cfg.server_side_encryption = Some("aws:kms:dsse".into());
        let desired = DesiredState::try_from(cfg.clone()).unwrap();
        assert_eq!(
            desired.server_side_encryption,
            Some(ServerSideEncryption::AwsKmsDsse)
        );

        cfg.server_side_encryption = Some("AES256".into());
        let err = DesiredState::try_from(cfg).unwrap_err();
        assert!(validation_message(err).contains("AES256"));
    }

    #[test]
    fn metadata_keys_differing_only_by_case_are_rejected() {
        let mut cfg = config("b", "k");
        cfg.metadata.insert("Key1".into(), "a".into());
        cfg.metadata.insert("key1".into(), "b".into());
        let err = DesiredState::try_from(cfg).unwrap_err();
        assert!(validation_message(err).contains("only by case"));
    }

    #[test]
    fn config_deserializes_from_json() {
        let cfg: ObjectConfig = serde_json::from_str(
            r#"{"bucket":"b","key":"/k","content":"stuff","tags":{"Key1":"A@AA"}}"#,
        )
        .unwrap();
        let desired = DesiredState::try_from(cfg).unwrap();
        assert_eq!(desired.id.key, "k");
        assert_eq!(desired.content, Content::Raw(Bytes::from_static(b"stuff")));
        assert_eq!(desired.tags.len(), 1);
    }
}
