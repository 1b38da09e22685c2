//! Attribute differ: desired configuration against the refreshed remote state.
//!
//! The remote body is never downloaded. Content is compared by fingerprint:
//! the ETag when it is a plain MD5, otherwise the hash recorded at the last
//! apply. Computed attributes left out of configuration take whatever the
//! store assigned and diff as unchanged. ACL is compared against the value
//! last applied, since a canned ACL cannot be read back as one value.

use crate::{
    models::{
        desired::DesiredState,
        lock::{LegalHoldStatus, Retention},
        observed::{ObjectState, ObservedState},
    },
    reconcile::tags::{IgnoreTags, TagPlan, reconcile_tags},
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Placeholder for a remote value the differ cannot determine.
const UNKNOWN: &str = "(unknown)";

static UNCHANGED: Change = Change::Unchanged;

/// How a change to an attribute has to be carried out.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Different remote object: delete the old key, create the new one.
    Identity,
    /// New body write.
    Content,
    /// Stored headers and user metadata.
    Header,
    Lock,
    Acl,
    Tags,
    /// Lives only in the state record.
    StateOnly,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Bucket,
    Key,
    Content,
    SourceHash,
    ContentType,
    ContentLanguage,
    ContentDisposition,
    ContentEncoding,
    CacheControl,
    WebsiteRedirect,
    StorageClass,
    ServerSideEncryption,
    KmsKeyId,
    BucketKeyEnabled,
    Metadata,
    ObjectLockMode,
    ObjectLockRetainUntilDate,
    ObjectLockLegalHoldStatus,
    Acl,
    Tags,
    ForceDestroy,
}

impl Attribute {
    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Bucket | Self::Key => Strategy::Identity,
            Self::Content | Self::SourceHash => Strategy::Content,
            Self::ContentType
            | Self::ContentLanguage
            | Self::ContentDisposition
            | Self::ContentEncoding
            | Self::CacheControl
            | Self::WebsiteRedirect
            | Self::StorageClass
            | Self::ServerSideEncryption
            | Self::KmsKeyId
            | Self::BucketKeyEnabled
            | Self::Metadata => Strategy::Header,
            Self::ObjectLockMode
            | Self::ObjectLockRetainUntilDate
            | Self::ObjectLockLegalHoldStatus => Strategy::Lock,
            Self::Acl => Strategy::Acl,
            Self::Tags => Strategy::Tags,
            Self::ForceDestroy => Strategy::StateOnly,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    Unchanged,
    Added { new: String },
    Removed { old: String },
    Modified { old: String, new: String },
}

impl Change {
    pub fn is_changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    fn between(desired: Option<&str>, observed: Option<&str>) -> Self {
        match (desired, observed) {
            (None, None) => Self::Unchanged,
            (Some(new), None) => Self::Added { new: new.into() },
            (None, Some(old)) => Self::Removed { old: old.into() },
            (Some(new), Some(old)) if new == old => Self::Unchanged,
            (Some(new), Some(old)) => Self::Modified {
                old: old.into(),
                new: new.into(),
            },
        }
    }

    /// Optional+computed: leaving it out of configuration accepts the remote value.
    fn computed(desired: Option<&str>, observed: Option<&str>) -> Self {
        match desired {
            None => Self::Unchanged,
            Some(_) => Self::between(desired, observed),
        }
    }
}

/// Per-attribute comparison result.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Every scalar attribute, unchanged ones included.
    pub attributes: BTreeMap<Attribute, Change>,
    /// User metadata by (lower-cased) key.
    pub metadata: BTreeMap<String, Change>,
    pub tags: TagPlan,
}

impl ChangeSet {
    pub fn get(&self, attribute: Attribute) -> &Change {
        self.attributes
            .get(&attribute)
            .unwrap_or(&UNCHANGED)
    }

    pub fn is_changed(&self, attribute: Attribute) -> bool {
        match attribute {
            Attribute::Metadata => self.metadata.values().any(Change::is_changed),
            Attribute::Tags => !self.tags.is_empty(),
            other => self.get(other).is_changed(),
        }
    }

    /// Changed attributes in a stable order.
    pub fn changed(&self) -> Vec<Attribute> {
        let mut changed: Vec<Attribute> = self
            .attributes
            .iter()
            .filter(|(_, change)| change.is_changed())
            .map(|(attribute, _)| *attribute)
            .collect();
        if self.is_changed(Attribute::Metadata) {
            changed.push(Attribute::Metadata);
        }
        if self.is_changed(Attribute::Tags) {
            changed.push(Attribute::Tags);
        }
        changed.sort();
        changed
    }

    pub fn touches(&self, strategy: Strategy) -> bool {
        self.changed().iter().any(|a| a.strategy() == strategy)
    }
}

/// Compare `desired` (with its resolved `content_hash`) against `prior`.
///
/// `prior` must carry the observed state refreshed in this cycle; `None` means
/// the object does not exist yet. Never fails: a remote value that cannot be
/// determined counts as modified.
pub fn diff(
    desired: &DesiredState,
    content_hash: &str,
    prior: Option<&ObjectState>,
    ignore: &IgnoreTags,
) -> ChangeSet {
    let observed = prior.map(|p| &p.observed);
    let mut attributes = BTreeMap::new();
    let mut set = |attribute: Attribute, change: Change| {
        attributes.insert(attribute, change);
    };

    let prior_bucket = prior.map(|p| p.id.bucket.as_str());
    let prior_key = prior.map(|p| p.id.key.as_str());
    set(
        Attribute::Bucket,
        identity(desired.id.bucket.as_str(), prior_bucket),
    );
    set(Attribute::Key, identity(&desired.id.key, prior_key));

    set(Attribute::Content, content(content_hash, prior));
    set(
        Attribute::SourceHash,
        Change::between(
            desired.source_hash.as_deref(),
            prior.and_then(|p| p.source_hash.as_deref()),
        ),
    );

    let headers = &desired.headers;
    let remote = observed.map(|o| &o.headers);
    set(
        Attribute::ContentType,
        Change::computed(
            headers.content_type.as_deref(),
            remote.and_then(|h| h.content_type.as_deref()),
        ),
    );
    set(
        Attribute::ContentLanguage,
        Change::between(
            headers.content_language.as_deref(),
            remote.and_then(|h| h.content_language.as_deref()),
        ),
    );
    set(
        Attribute::ContentDisposition,
        Change::between(
            headers.content_disposition.as_deref(),
            remote.and_then(|h| h.content_disposition.as_deref()),
        ),
    );
    set(
        Attribute::ContentEncoding,
        Change::between(
            headers.content_encoding.as_deref(),
            remote.and_then(|h| h.content_encoding.as_deref()),
        ),
    );
    set(
        Attribute::CacheControl,
        Change::between(
            headers.cache_control.as_deref(),
            remote.and_then(|h| h.cache_control.as_deref()),
        ),
    );
    set(
        Attribute::WebsiteRedirect,
        Change::between(
            headers.website_redirect.as_deref(),
            remote.and_then(|h| h.website_redirect.as_deref()),
        ),
    );

    set(
        Attribute::StorageClass,
        Change::computed(
            desired.storage_class.as_deref(),
            observed.map(|o| o.storage_class.as_str()),
        ),
    );
    set(
        Attribute::ServerSideEncryption,
        Change::computed(
            desired.server_side_encryption.map(|s| s.as_str()),
            observed.and_then(|o| o.server_side_encryption.map(|s| s.as_str())),
        ),
    );
    set(
        Attribute::KmsKeyId,
        Change::computed(
            desired.kms_key_id.as_deref(),
            observed.and_then(|o| o.kms_key_id.as_deref()),
        ),
    );
    let bucket_key = observed.map(|o| bool_str(o.bucket_key_enabled));
    set(
        Attribute::BucketKeyEnabled,
        Change::computed(desired.bucket_key_enabled.map(bool_str), bucket_key),
    );

    let remote_retention = observed.and_then(|o| o.lock.retention);
    let (mode, until) = retention(desired.retention, remote_retention);
    set(Attribute::ObjectLockMode, mode);
    set(Attribute::ObjectLockRetainUntilDate, until);
    set(
        Attribute::ObjectLockLegalHoldStatus,
        legal_hold(desired.legal_hold, observed.and_then(|o| o.lock.legal_hold)),
    );

    // Only managed when configured.
    set(
        Attribute::Acl,
        match desired.acl.as_deref() {
            None => Change::Unchanged,
            Some(acl) => Change::between(Some(acl), prior.and_then(|p| p.acl.as_deref())),
        },
    );

    let prior_force = prior.is_some_and(|p| p.force_destroy);
    set(
        Attribute::ForceDestroy,
        if desired.force_destroy == prior_force {
            Change::Unchanged
        } else {
            Change::Modified {
                old: bool_str(prior_force).into(),
                new: bool_str(desired.force_destroy).into(),
            }
        },
    );

    let empty = BTreeMap::new();
    let remote_tags = observed.map_or(&empty, |o| &o.tags);

    ChangeSet {
        attributes,
        metadata: metadata(&desired.metadata, observed.map(|o| &o.metadata)),
        tags: reconcile_tags(&desired.tags, remote_tags, ignore),
    }
}

fn identity(desired: &str, prior: Option<&str>) -> Change {
    match prior {
        // Nothing exists yet; creating is a content write, not a replace.
        None => Change::Unchanged,
        Some(prior) => Change::between(Some(desired), Some(prior)),
    }
}

fn content(content_hash: &str, prior: Option<&ObjectState>) -> Change {
    let Some(prior) = prior else {
        return Change::Added {
            new: content_hash.into(),
        };
    };
    match remote_content_hash(prior) {
        Some(remote) if remote == content_hash => Change::Unchanged,
        Some(remote) => Change::Modified {
            old: remote,
            new: content_hash.into(),
        },
        None => Change::Modified {
            old: UNKNOWN.into(),
            new: content_hash.into(),
        },
    }
}

/// Best available fingerprint of the remote body.
pub fn remote_content_hash(prior: &ObjectState) -> Option<String> {
    let observed: &ObservedState = &prior.observed;
    if observed.etag_is_content_md5() {
        return Some(observed.etag.trim_matches('"').to_ascii_lowercase());
    }
    (!prior.content_hash.is_empty()).then(|| prior.content_hash.clone())
}

fn retention(desired: Option<Retention>, observed: Option<Retention>) -> (Change, Change) {
    let mode = Change::between(
        desired.map(|r| r.mode.as_str()),
        observed.map(|r| r.mode.as_str()),
    );
    // Instants, not strings: the same time in another offset is unchanged.
    let until = match (desired, observed) {
        (Some(d), Some(o)) if d.retain_until == o.retain_until => Change::Unchanged,
        _ => Change::between(
            desired.map(|r| r.retain_until.to_rfc3339()).as_deref(),
            observed.map(|r| r.retain_until.to_rfc3339()).as_deref(),
        ),
    };
    (mode, until)
}

/// OFF and absent both mean "no hold".
fn legal_hold(desired: Option<LegalHoldStatus>, observed: Option<LegalHoldStatus>) -> Change {
    let (want, have) = (LegalHoldStatus::is_on(desired), LegalHoldStatus::is_on(observed));
    match (want, have) {
        (true, true) | (false, false) => Change::Unchanged,
        (true, false) => Change::Modified {
            old: LegalHoldStatus::Off.as_str().into(),
            new: LegalHoldStatus::On.as_str().into(),
        },
        (false, true) => Change::Modified {
            old: LegalHoldStatus::On.as_str().into(),
            new: LegalHoldStatus::Off.as_str().into(),
        },
    }
}

fn metadata(
    desired: &BTreeMap<String, String>,
    observed: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, Change> {
    let remote: BTreeMap<String, &String> = observed
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    let mut changes = BTreeMap::new();
    for (key, value) in desired {
        let change = Change::between(Some(value.as_str()), remote.get(key).map(|v| v.as_str()));
        changes.insert(key.clone(), change);
    }
    for (key, value) in &remote {
        if !desired.contains_key(key) {
            changes.insert(key.clone(), Change::Removed { old: (*value).clone() });
        }
    }
    changes
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        desired::{ObjectConfig, ObjectHeaders, ServerSideEncryption},
        identity::ObjectId,
        lock::{LockMode, LockState},
    };
    use chrono::{TimeZone, Utc};

    fn desired(f: impl FnOnce(&mut ObjectConfig)) -> DesiredState {
        let mut cfg = ObjectConfig {
            bucket: "tf-test-bucket".into(),
            key: "test-key".into(),
            content: Some("stuff".into()),
            ..Default::default()
        };
        f(&mut cfg);
        DesiredState::try_from(cfg).unwrap()
    }

    fn prior() -> ObjectState {
        ObjectState {
            name: "object".into(),
            id: ObjectId::new("tf-test-bucket", "test-key"),
            observed: ObservedState {
                etag: hash("stuff"),
                version_id: Some("v1".into()),
                content_length: 5,
                headers: ObjectHeaders {
                    content_type: Some("binary/octet-stream".into()),
                    ..Default::default()
                },
                storage_class: "STANDARD".into(),
                server_side_encryption: Some(ServerSideEncryption::Aes256),
                kms_key_id: None,
                bucket_key_enabled: false,
                lock: LockState::default(),
                metadata: BTreeMap::new(),
                tags: BTreeMap::new(),
                last_modified: Utc::now(),
            },
            content_hash: hash("stuff"),
            source_hash: None,
            acl: None,
            force_destroy: false,
        }
    }

    fn hash(s: &str) -> String {
        format!("{:x}", md5::compute(s))
    }

    #[test]
    fn matching_state_has_no_changes() {
        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior()), &IgnoreTags::default());
        assert!(changes.changed().is_empty(), "{:?}", changes.changed());
    }

    #[test]
    fn missing_object_is_a_content_add() {
        let changes = diff(&desired(|_| {}), &hash("stuff"), None, &IgnoreTags::default());
        assert!(matches!(changes.get(Attribute::Content), Change::Added { .. }));
        assert!(!changes.touches(Strategy::Identity));
    }

    #[test]
    fn content_is_compared_by_fingerprint() {
        let changes = diff(&desired(|_| {}), &hash("changed"), Some(&prior()), &IgnoreTags::default());
        assert_eq!(
            changes.get(Attribute::Content),
            &Change::Modified {
                old: hash("stuff"),
                new: hash("changed"),
            }
        );
    }

    #[test]
    fn kms_etag_falls_back_to_recorded_hash() {
        let mut prior = prior();
        prior.observed.etag = hash("unrelated");
        prior.observed.server_side_encryption = Some(ServerSideEncryption::AwsKms);

        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(!changes.is_changed(Attribute::Content));

        prior.content_hash.clear();
        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert_eq!(
            changes.get(Attribute::Content),
            &Change::Modified {
                old: UNKNOWN.into(),
                new: hash("stuff"),
            }
        );
    }

    #[test]
    fn omitted_computed_attributes_are_unchanged() {
        let mut prior = prior();
        prior.observed.storage_class = "GLACIER".into();
        prior.observed.headers.content_type = Some("text/plain".into());
        prior.observed.bucket_key_enabled = true;

        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(changes.changed().is_empty());
    }

    #[test]
    fn omitted_plain_header_is_a_removal() {
        let mut prior = prior();
        prior.observed.headers.cache_control = Some("no-cache".into());

        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert_eq!(
            changes.get(Attribute::CacheControl),
            &Change::Removed {
                old: "no-cache".into()
            }
        );
        assert!(changes.touches(Strategy::Header));
    }

    #[test]
    fn retain_until_compares_instants() {
        let until = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let mut prior = prior();
        prior.observed.lock.retention = Some(Retention {
            mode: LockMode::Governance,
            retain_until: until,
        });

        let d = desired(|c| {
            c.object_lock_mode = Some("GOVERNANCE".into());
            c.object_lock_retain_until_date = Some("2030-01-01T02:00:00+02:00".into());
        });
        let changes = diff(&d, &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(!changes.is_changed(Attribute::ObjectLockRetainUntilDate));
        assert!(!changes.is_changed(Attribute::ObjectLockMode));
    }

    #[test]
    fn legal_hold_off_equals_absent() {
        let d = desired(|c| c.object_lock_legal_hold_status = Some("OFF".into()));
        let changes = diff(&d, &hash("stuff"), Some(&prior()), &IgnoreTags::default());
        assert!(!changes.is_changed(Attribute::ObjectLockLegalHoldStatus));

        let mut prior = prior();
        prior.observed.lock.legal_hold = Some(LegalHoldStatus::On);
        let changes = diff(&d, &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(changes.touches(Strategy::Lock));
    }

    #[test]
    fn acl_is_compared_against_applied_value() {
        let d = desired(|c| c.acl = Some("public-read".into()));
        let changes = diff(&d, &hash("stuff"), Some(&prior()), &IgnoreTags::default());
        assert!(changes.touches(Strategy::Acl));

        let mut prior = prior();
        prior.acl = Some("public-read".into());
        let changes = diff(&d, &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(!changes.touches(Strategy::Acl));

        let changes = diff(&desired(|_| {}), &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert!(!changes.touches(Strategy::Acl));
    }

    #[test]
    fn metadata_diffs_as_map_case_insensitively() {
        let mut prior = prior();
        prior.observed.metadata = BTreeMap::from([
            ("Key1".to_string(), "Value1".to_string()),
            ("key3".to_string(), "Value3".to_string()),
        ]);
        let d = desired(|c| {
            c.metadata = BTreeMap::from([
                ("key1".to_string(), "Value1".to_string()),
                ("Key2".to_string(), "Value2".to_string()),
            ]);
        });

        let changes = diff(&d, &hash("stuff"), Some(&prior), &IgnoreTags::default());
        assert_eq!(changes.metadata["key1"], Change::Unchanged);
        assert!(matches!(changes.metadata["key2"], Change::Added { .. }));
        assert!(matches!(changes.metadata["key3"], Change::Removed { .. }));
    }

    #[test]
    fn moved_key_is_an_identity_change() {
        let d = desired(|c| c.key = "other-key".into());
        let changes = diff(&d, &hash("stuff"), Some(&prior()), &IgnoreTags::default());
        assert!(changes.touches(Strategy::Identity));
    }

    #[test]
    fn force_destroy_only_touches_state() {
        let d = desired(|c| c.force_destroy = true);
        let changes = diff(&d, &hash("stuff"), Some(&prior()), &IgnoreTags::default());
        assert_eq!(changes.changed(), vec![Attribute::ForceDestroy]);
        assert!(changes.touches(Strategy::StateOnly));
    }
}
