//! Plan decision engine.

use crate::reconcile::diff::{ChangeSet, Strategy};
use serde::Serialize;
use std::fmt;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    NoOp,
    /// Headers, lock or ACL; never a new body.
    UpdateMetadataOnly,
    /// New body write: a new version in a versioned bucket, an overwrite otherwise.
    ReplaceContent,
    /// Tag calls only; the version id is kept.
    ReplaceTags,
    /// Delete the old key, then create the new one.
    FullReplace,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "no-op",
            Self::UpdateMetadataOnly => "update-metadata-only",
            Self::ReplaceContent => "replace-content",
            Self::ReplaceTags => "replace-tags",
            Self::FullReplace => "full-replace",
        }
    }

    /// Whether this plan may write a new object version.
    pub fn writes_object(&self) -> bool {
        matches!(
            self,
            Self::UpdateMetadataOnly | Self::ReplaceContent | Self::FullReplace
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First match wins: identity, content, tags alone, in-place updates.
pub fn decide(changes: &ChangeSet) -> Plan {
    if changes.touches(Strategy::Identity) {
        return Plan::FullReplace;
    }
    if changes.touches(Strategy::Content) {
        return Plan::ReplaceContent;
    }

    let in_place = changes.touches(Strategy::Header)
        || changes.touches(Strategy::Lock)
        || changes.touches(Strategy::Acl);
    let tags = changes.touches(Strategy::Tags);

    if tags && !in_place {
        Plan::ReplaceTags
    } else if in_place {
        Plan::UpdateMetadataOnly
    } else {
        Plan::NoOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{
        diff::{Attribute, Change},
        tags::TagPlan,
    };
    use std::collections::BTreeMap;

    fn modified() -> Change {
        Change::Modified {
            old: "a".into(),
            new: "b".into(),
        }
    }

    fn with(attrs: &[Attribute]) -> ChangeSet {
        ChangeSet {
            attributes: attrs.iter().map(|a| (*a, modified())).collect(),
            ..Default::default()
        }
    }

    fn with_tags(mut changes: ChangeSet) -> ChangeSet {
        changes.tags = TagPlan {
            additions: BTreeMap::from([("Key1".to_string(), "AAA".to_string())]),
            removals: Vec::new(),
        };
        changes
    }

    #[test]
    fn empty_change_set_is_noop() {
        assert_eq!(decide(&ChangeSet::default()), Plan::NoOp);
        assert_eq!(decide(&with(&[Attribute::ForceDestroy])), Plan::NoOp);
    }

    #[test]
    fn identity_wins_over_everything() {
        let changes = with_tags(with(&[Attribute::Key, Attribute::Content, Attribute::Acl]));
        assert_eq!(decide(&changes), Plan::FullReplace);
    }

    #[test]
    fn content_beats_metadata_and_tags() {
        let changes = with_tags(with(&[Attribute::SourceHash, Attribute::CacheControl]));
        assert_eq!(decide(&changes), Plan::ReplaceContent);
    }

    #[test]
    fn tags_alone_never_write() {
        let plan = decide(&with_tags(ChangeSet::default()));
        assert_eq!(plan, Plan::ReplaceTags);
        assert!(!plan.writes_object());
    }

    #[test]
    fn metadata_with_tags_updates_in_place() {
        for attr in [
            Attribute::ContentType,
            Attribute::StorageClass,
            Attribute::ObjectLockLegalHoldStatus,
            Attribute::ObjectLockRetainUntilDate,
            Attribute::Acl,
        ] {
            assert_eq!(decide(&with(&[attr])), Plan::UpdateMetadataOnly, "{attr:?}");
            assert_eq!(decide(&with_tags(with(&[attr]))), Plan::UpdateMetadataOnly);
        }
    }

    #[test]
    fn user_metadata_map_updates_in_place() {
        let mut changes = ChangeSet::default();
        changes
            .metadata
            .insert("key1".into(), Change::Added { new: "v".into() });
        assert_eq!(decide(&changes), Plan::UpdateMetadataOnly);
    }
}
