//! Tag reconciliation with ignore rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag keys the reconciler never adds, removes or reports.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct IgnoreTags {
    pub keys: Vec<String>,
    pub key_prefixes: Vec<String>,
}

impl IgnoreTags {
    pub fn new(keys: Vec<String>, key_prefixes: Vec<String>) -> Self {
        Self { keys, key_prefixes }
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
            || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// `tags` without ignored keys.
    pub fn filter(&self, tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        tags.iter()
            .filter(|(k, _)| !self.is_ignored(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TagPlan {
    /// New keys and keys whose value changes.
    pub additions: BTreeMap<String, String>,
    pub removals: Vec<String>,
}

impl TagPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// The full tag set to write: `observed` with this plan applied.
    ///
    /// Ignored tags in `observed` pass through untouched.
    pub fn merged(&self, observed: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut tags = observed.clone();
        for key in &self.removals {
            tags.remove(key);
        }
        tags.extend(self.additions.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }
}

/// Diff desired tags against the remote tag set, ignoring excluded keys on both sides.
pub fn reconcile_tags(
    desired: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
    ignore: &IgnoreTags,
) -> TagPlan {
    let effective = ignore.filter(observed);

    let additions = desired
        .iter()
        .filter(|(k, _)| !ignore.is_ignored(k))
        .filter(|(k, v)| effective.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let removals = effective
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();

    TagPlan {
        additions,
        removals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ignore() -> IgnoreTags {
        IgnoreTags::new(vec!["ignorekey1".into()], vec!["ignorekey".into(), "aws:".into()])
    }

    #[test]
    fn additions_and_removals() {
        let desired = tags(&[("Key1", "AAA"), ("Key2", "BBB")]);
        let observed = tags(&[("Key1", "A@AA"), ("Key3", "CCC")]);
        let plan = reconcile_tags(&desired, &observed, &IgnoreTags::default());

        assert_eq!(plan.additions, tags(&[("Key1", "AAA"), ("Key2", "BBB")]));
        assert_eq!(plan.removals, vec!["Key3".to_string()]);
    }

    #[test]
    fn equal_sets_produce_empty_plan() {
        let set = tags(&[("Key1", "A@AA"), ("Key2", "BBB")]);
        assert!(reconcile_tags(&set, &set, &IgnoreTags::default()).is_empty());
    }

    #[test]
    fn ignored_keys_never_appear_in_plan() {
        let ignore = ignore();
        let cases = [
            (tags(&[("ignorekey1", "a")]), tags(&[])),
            (tags(&[]), tags(&[("ignorekey1", "a")])),
            (tags(&[("ignorekeyX", "a")]), tags(&[("ignorekeyX", "b")])),
            (tags(&[("aws:cloudformation", "x")]), tags(&[("aws:other", "y")])),
            (
                tags(&[("Key1", "a"), ("ignorekey2", "c")]),
                tags(&[("ignorekey3", "d"), ("Key2", "b")]),
            ),
        ];
        for (desired, observed) in cases {
            let plan = reconcile_tags(&desired, &observed, &ignore);
            for key in plan.additions.keys().chain(plan.removals.iter()) {
                assert!(!ignore.is_ignored(key), "{key} leaked into the plan");
            }
        }
    }

    #[test]
    fn merge_preserves_ignored_remote_tags() {
        let ignore = ignore();
        let desired = tags(&[("Key1", "AAA")]);
        let observed = tags(&[("Key1", "old"), ("Key2", "gone"), ("ignorekey1", "keep")]);
        let plan = reconcile_tags(&desired, &observed, &ignore);

        assert_eq!(
            plan.merged(&observed),
            tags(&[("Key1", "AAA"), ("ignorekey1", "keep")])
        );
    }

    #[test]
    fn filter_hides_ignored_tags() {
        let observed = tags(&[("Key1", "a"), ("ignorekey2", "b")]);
        assert_eq!(ignore().filter(&observed), tags(&[("Key1", "a")]));
    }
}
