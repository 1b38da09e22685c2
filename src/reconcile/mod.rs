//! Reconciliation cycles for one object resource.
//!
//! A cycle validates the desired state, fingerprints its content, refreshes
//! the remote state, diffs, decides a [`Plan`] and, for `apply`, executes it
//! and persists the resulting state record. Nothing remote is cached between
//! cycles; the state record only keeps what the store cannot report back.

pub mod apply;
pub mod diff;
pub mod fingerprint;
pub mod guard;
pub mod plan;
pub mod tags;

use crate::{
    errors::{ReconcileError, ReconcileResult},
    models::{
        desired::{DesiredState, ObjectConfig},
        identity::ObjectId,
        observed::{ObjectState, ObservedState},
    },
    state::StateStore,
    transport::{StorageTransport, TransportError},
};
use apply::{ApplyOutcome, Executor};
use diff::{ChangeSet, diff};
use fingerprint::ResolvedContent;
use guard::DestroyOutcome;
use plan::{Plan, decide};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tags::IgnoreTags;
use tokio::sync::{Mutex as CycleLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// How `UpdateMetadataOnly` reaches the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataUpdatePolicy {
    /// Dedicated calls for lock, ACL and tags; a copy in place for headers.
    #[default]
    Minimal,
    /// Always rewrite the whole object.
    Rewrite,
}

impl FromStr for MetadataUpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "rewrite" => Ok(Self::Rewrite),
            other => Err(format!(
                "unknown metadata update policy `{}` (expected minimal or rewrite)",
                other
            )),
        }
    }
}

impl fmt::Display for MetadataUpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minimal => "minimal",
            Self::Rewrite => "rewrite",
        })
    }
}

/// Cross-resource settings, passed in explicitly.
#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    pub ignore_tags: IgnoreTags,
    pub metadata_update_policy: MetadataUpdatePolicy,
    /// Whether deletes may use the governance-retention bypass.
    pub governance_bypass: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            ignore_tags: IgnoreTags::default(),
            metadata_update_policy: MetadataUpdatePolicy::Minimal,
            governance_bypass: true,
        }
    }
}

/// Everything one cycle works from, computed before any write.
#[derive(Debug)]
pub struct Prepared {
    pub name: String,
    pub desired: DesiredState,
    pub content: ResolvedContent,
    /// Last state record with its observed half refreshed this cycle.
    pub prior: Option<ObjectState>,
    pub changes: ChangeSet,
    pub plan: Plan,
}

/// What `plan` reports.
#[derive(Serialize, Clone, Debug)]
pub struct PlanReport {
    pub name: String,
    pub plan: Plan,
    pub changes: ChangeSet,
}

/// Current version plus its full tag set, or `None` when the key is gone.
pub(crate) async fn observe(
    transport: &dyn StorageTransport,
    id: &ObjectId,
) -> ReconcileResult<Option<ObservedState>> {
    let Some(mut observed) = transport.head(id, None).await? else {
        return Ok(None);
    };
    observed.tags = transport
        .get_tags(id, observed.version_id.as_deref())
        .await?;
    Ok(Some(observed))
}

/// Runs reconciliation cycles. Clones share the transport and the per-resource locks.
#[derive(Clone)]
pub struct Reconciler {
    transport: Arc<dyn StorageTransport>,
    states: StateStore,
    settings: ReconcileSettings,
    /// One lock per resource name; mutating cycles on a name never overlap.
    cycles: Arc<Mutex<HashMap<String, Arc<CycleLock<()>>>>>,
}

impl Reconciler {
    pub fn new(
        transport: Arc<dyn StorageTransport>,
        states: StateStore,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            transport,
            states,
            settings,
            cycles: Arc::default(),
        }
    }

    /// Wait for any other mutating cycle on `name` to finish.
    async fn lock_cycle(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut cycles = self
                .cycles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cycles.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// The state record with freshly observed remote state.
    ///
    /// `None` when there is no record or the object no longer exists.
    pub async fn read(&self, name: &str) -> ReconcileResult<Option<ObjectState>> {
        let Some(mut record) = self.states.load(name).await? else {
            return Ok(None);
        };
        match observe(self.transport.as_ref(), &record.id).await? {
            Some(observed) => {
                record.observed = observed;
                Ok(Some(record))
            }
            None => {
                info!(name, id = %record.id, "object no longer exists");
                Ok(None)
            }
        }
    }

    async fn prepare(&self, name: &str, config: ObjectConfig) -> ReconcileResult<Prepared> {
        let desired = DesiredState::try_from(config)?;
        let content = fingerprint::resolve(&desired.content).await?;
        let prior = self.read(name).await?;

        let changes = diff(
            &desired,
            &content.content_hash,
            prior.as_ref(),
            &self.settings.ignore_tags,
        );
        let plan = decide(&changes);

        info!(name, id = %desired.id, %plan, "planned");
        for attribute in changes.changed() {
            debug!(name, ?attribute, "attribute changed");
        }

        Ok(Prepared {
            name: name.to_string(),
            desired,
            content,
            prior,
            changes,
            plan,
        })
    }

    pub async fn plan(&self, name: &str, config: ObjectConfig) -> ReconcileResult<PlanReport> {
        let prepared = self.prepare(name, config).await?;
        Ok(PlanReport {
            name: prepared.name,
            plan: prepared.plan,
            changes: prepared.changes,
        })
    }

    /// Run a full cycle and persist whatever the store confirmed.
    pub async fn apply(&self, name: &str, config: ObjectConfig) -> ReconcileResult<ApplyOutcome> {
        let _cycle = self.lock_cycle(name).await;
        let prepared = self.prepare(name, config).await?;
        let executor = Executor::new(self.transport.as_ref(), &self.settings);
        let outcome = executor.apply(&prepared).await?;

        self.states.save(&outcome.state).await?;
        match &outcome.error {
            None => info!(
                name,
                plan = %outcome.plan,
                wrote_object = outcome.plan.writes_object(),
                "applied"
            ),
            Some(err) => warn!(
                name,
                plan = %outcome.plan,
                divergent = ?outcome.divergent,
                error = %err,
                "partially applied"
            ),
        }
        Ok(outcome)
    }

    /// Delete the object per its recorded `force_destroy`, then forget it.
    pub async fn destroy(&self, name: &str) -> ReconcileResult<Option<DestroyOutcome>> {
        let _cycle = self.lock_cycle(name).await;
        let Some(record) = self.states.load(name).await? else {
            debug!(name, "nothing to destroy");
            return Ok(None);
        };
        let outcome = guard::destroy(
            self.transport.as_ref(),
            &record.id,
            record.force_destroy,
            self.settings.governance_bypass,
        )
        .await?;
        self.states.remove(name).await?;
        info!(name, id = %record.id, "destroyed");
        Ok(Some(outcome))
    }

    /// Adopt an existing object under `name` from an `s3://bucket/key` id.
    pub async fn import(&self, name: &str, import_id: &str) -> ReconcileResult<ObjectState> {
        let _cycle = self.lock_cycle(name).await;
        let id = ObjectId::parse_import_id(import_id).ok_or_else(|| {
            ReconcileError::validation(format!(
                "invalid import id `{}`; expected s3://<bucket>/<key>",
                import_id
            ))
        })?;
        let observed = observe(self.transport.as_ref(), &id)
            .await?
            .ok_or_else(|| ReconcileError::from(TransportError::not_found(&id)))?;

        let content_hash = if observed.etag_is_content_md5() {
            observed.etag.trim_matches('"').to_ascii_lowercase()
        } else {
            String::new()
        };
        let record = ObjectState {
            name: name.to_string(),
            id,
            observed,
            content_hash,
            source_hash: None,
            acl: None,
            force_destroy: false,
        };
        self.states.save(&record).await?;
        info!(name, import_id = %record.id.import_id(), "imported");
        Ok(record)
    }
}
