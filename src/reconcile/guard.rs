//! Destroy guard and the delete lifecycle.
//!
//! The guard is a per-version state check. A legal hold blocks deleting the
//! version it sits on and nothing else. Active retention blocks unless the
//! caller asked for force-destroy and holds the governance-bypass capability,
//! and COMPLIANCE retention blocks regardless.

use crate::{
    errors::{BlockReason, ReconcileError, ReconcileResult},
    models::{
        identity::ObjectId,
        lock::{LegalHoldStatus, LockMode, LockState},
        observed::ObservedState,
    },
    transport::StorageTransport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
}

impl Verdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn block(reason: BlockReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DestroyGuard {
    pub force_destroy: bool,
    pub governance_bypass: bool,
    pub now: DateTime<Utc>,
}

impl DestroyGuard {
    pub fn new(force_destroy: bool, governance_bypass: bool) -> Self {
        Self {
            force_destroy,
            governance_bypass,
            now: Utc::now(),
        }
    }

    pub fn check(&self, lock: &LockState, version_id: Option<&str>) -> Verdict {
        let version_id = version_id.map(str::to_string);
        if LegalHoldStatus::is_on(lock.legal_hold) {
            return Verdict::block(BlockReason::LegalHold {
                version_id,
                noncurrent: false,
            });
        }
        match lock.retention {
            Some(r) if r.is_active_at(self.now) => {
                let bypassable = r.mode == LockMode::Governance
                    && self.force_destroy
                    && self.governance_bypass;
                if bypassable {
                    Verdict::allow()
                } else {
                    Verdict::block(BlockReason::Retention {
                        mode: r.mode,
                        retain_until: r.retain_until,
                        version_id,
                    })
                }
            }
            _ => Verdict::allow(),
        }
    }

    fn ensure(
        &self,
        id: &ObjectId,
        lock: &LockState,
        version_id: Option<&str>,
        current: bool,
    ) -> ReconcileResult<()> {
        match self.check(lock, version_id).reason {
            None => Ok(()),
            Some(mut reason) => {
                if let BlockReason::LegalHold { noncurrent, .. } = &mut reason {
                    *noncurrent = !current;
                }
                warn!(%id, %reason, "destroy blocked");
                Err(ReconcileError::ReplaceBlocked {
                    id: id.clone(),
                    reason,
                })
            }
        }
    }
}

/// Guard check against the current version, with the capability given.
pub fn can_destroy(observed: &ObservedState, force_destroy: bool, governance_bypass: bool) -> Verdict {
    DestroyGuard::new(force_destroy, governance_bypass)
        .check(&observed.lock, observed.version_id.as_deref())
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DestroyOutcome {
    /// Versions and delete markers removed.
    pub removed_versions: usize,
    /// Marker created by a key-level delete in a versioned bucket.
    pub delete_marker: Option<String>,
}

/// Delete an object the way its `force_destroy` setting asks.
///
/// Without force only the key is deleted: a delete marker in a versioned
/// bucket, with every earlier version left in place. With force every version
/// and delete marker goes. Lock state is read from the store here, immediately
/// before deleting; a rejection by the store itself still surfaces as a
/// transport error.
pub async fn destroy(
    transport: &dyn StorageTransport,
    id: &ObjectId,
    force_destroy: bool,
    governance_bypass: bool,
) -> ReconcileResult<DestroyOutcome> {
    let guard = DestroyGuard::new(force_destroy, governance_bypass);

    if !force_destroy {
        let Some(current) = transport.head(id, None).await? else {
            debug!(%id, "object already gone");
            return Ok(DestroyOutcome::default());
        };
        guard.ensure(id, &current.lock, current.version_id.as_deref(), true)?;

        let out = transport.delete(id, None, false).await?;
        info!(%id, delete_marker = out.delete_marker, "deleted object key");
        return Ok(DestroyOutcome {
            removed_versions: usize::from(!out.delete_marker),
            delete_marker: out.delete_marker.then_some(out.version_id).flatten(),
        });
    }

    let versions = transport.list_versions(id).await?;
    for entry in versions.iter().filter(|v| !v.is_delete_marker) {
        let version_id = entry.version_id.as_deref();
        if let Some(observed) = transport.head(id, version_id).await? {
            guard.ensure(id, &observed.lock, version_id, entry.is_latest)?;
        }
    }

    let mut removed = 0;
    for entry in &versions {
        transport
            .delete(id, entry.version_id.as_deref(), governance_bypass)
            .await?;
        removed += 1;
    }
    info!(%id, removed, "deleted all object versions");
    Ok(DestroyOutcome {
        removed_versions: removed,
        delete_marker: None,
    })
}
