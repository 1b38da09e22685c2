//! Apply executor: carry out a [`Plan`] against the store.
//!
//! Every write carries lock, ACL and tags in the same call. After the
//! store acknowledges, the object is read back so the state record holds the
//! canonical ETag and version id. When a later step fails, the outcome keeps
//! what the store confirmed and lists the attributes still divergent; the
//! next cycle's diff picks them up again.

use super::{
    MetadataUpdatePolicy, Prepared, ReconcileSettings,
    diff::{Attribute, Strategy},
    guard,
    observe,
    plan::Plan,
};
use crate::{
    errors::{ReconcileError, ReconcileResult},
    models::{
        desired::DesiredState,
        lock::{LegalHoldStatus, LockState},
        observed::{ObjectState, ObservedState},
    },
    transport::{PutOutput, StorageTransport, TransportError, WriteAttributes},
};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ApplyOutcome {
    pub plan: Plan,
    /// State as confirmed by the store.
    pub state: ObjectState,
    /// Attributes that were meant to change but did not.
    pub divergent: Vec<Attribute>,
    pub error: Option<ReconcileError>,
}

impl ApplyOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Executor<'a> {
    pub transport: &'a dyn StorageTransport,
    pub settings: &'a ReconcileSettings,
}

/// What has been confirmed so far in this apply.
struct Progress {
    observed: ObservedState,
    content_hash: String,
    acl: Option<String>,
    divergent: Vec<Attribute>,
    error: Option<ReconcileError>,
}

impl<'a> Executor<'a> {
    pub fn new(transport: &'a dyn StorageTransport, settings: &'a ReconcileSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Errors returned here happened before the store confirmed anything.
    pub async fn apply(&self, prepared: &Prepared) -> ReconcileResult<ApplyOutcome> {
        let Some(prior) = prepared.prior.as_ref() else {
            let progress = self.write_object(prepared, &BTreeMap::new()).await?;
            return Ok(self.finish(prepared, progress));
        };

        let progress = match prepared.plan {
            Plan::NoOp => Progress {
                observed: prior.observed.clone(),
                content_hash: prepared.content.content_hash.clone(),
                acl: prior.acl.clone(),
                divergent: Vec::new(),
                error: None,
            },
            Plan::ReplaceTags => self.replace_tags(prepared, prior).await?,
            Plan::UpdateMetadataOnly => match self.settings.metadata_update_policy {
                MetadataUpdatePolicy::Minimal => self.update_in_place(prepared, prior).await?,
                MetadataUpdatePolicy::Rewrite => {
                    self.release_superseded_hold(prepared, prior).await?;
                    self.write_object(prepared, &prior.observed.tags).await?
                }
            },
            Plan::ReplaceContent => {
                self.release_superseded_hold(prepared, prior).await?;
                self.write_object(prepared, &prior.observed.tags).await?
            }
            Plan::FullReplace => {
                guard::destroy(
                    self.transport,
                    &prior.id,
                    prior.force_destroy,
                    self.settings.governance_bypass,
                )
                .await?;
                info!(old = %prior.id, new = %prepared.desired.id, "old key removed");
                self.write_object(prepared, &BTreeMap::new()).await?
            }
        };
        Ok(self.finish(prepared, progress))
    }

    /// Full object write with every attribute set in the same call.
    async fn write_object(
        &self,
        prepared: &Prepared,
        remote_tags: &BTreeMap<String, String>,
    ) -> ReconcileResult<Progress> {
        let desired = &prepared.desired;
        let attrs = write_attributes(desired, prepared.changes.tags.merged(remote_tags));
        let out = self
            .transport
            .put(&desired.id, prepared.content.body.clone(), &attrs)
            .await?;
        info!(id = %desired.id, etag = %out.etag, version_id = ?out.version_id, "object written");

        let progress = Progress {
            observed: acknowledged(&attrs, &out, prepared.content.content_length),
            content_hash: prepared.content.content_hash.clone(),
            acl: desired.acl.clone(),
            divergent: Vec::new(),
            error: None,
        };
        Ok(self.refresh(prepared, progress).await)
    }

    async fn replace_tags(
        &self,
        prepared: &Prepared,
        prior: &ObjectState,
    ) -> ReconcileResult<Progress> {
        let id = &prepared.desired.id;
        let tags = prepared.changes.tags.merged(&prior.observed.tags);
        self.transport
            .put_tags(id, prior.observed.version_id.as_deref(), &tags)
            .await?;
        debug!(%id, "tags replaced");

        let mut observed = prior.observed.clone();
        observed.tags = tags;
        let progress = Progress {
            observed,
            content_hash: prepared.content.content_hash.clone(),
            acl: prior.acl.clone(),
            divergent: Vec::new(),
            error: None,
        };
        Ok(self.refresh(prepared, progress).await)
    }

    /// Header changes go through a copy in place; lock, ACL and tag changes
    /// alone use their dedicated calls and keep the version.
    async fn update_in_place(
        &self,
        prepared: &Prepared,
        prior: &ObjectState,
    ) -> ReconcileResult<Progress> {
        let desired = &prepared.desired;
        let changes = &prepared.changes;
        let id = &desired.id;

        if changes.touches(Strategy::Header) {
            self.release_superseded_hold(prepared, prior).await?;
            let attrs = write_attributes(desired, changes.tags.merged(&prior.observed.tags));
            let out = self.transport.copy_in_place(id, &attrs).await?;
            info!(%id, version_id = ?out.version_id, "object metadata rewritten in place");
            let progress = Progress {
                observed: acknowledged(&attrs, &out, prior.observed.content_length),
                content_hash: prepared.content.content_hash.clone(),
                acl: desired.acl.clone(),
                divergent: Vec::new(),
                error: None,
            };
            return Ok(self.refresh(prepared, progress).await);
        }

        let mut progress = Progress {
            observed: prior.observed.clone(),
            content_hash: prepared.content.content_hash.clone(),
            acl: prior.acl.clone(),
            divergent: Vec::new(),
            error: None,
        };
        let version_id = prior.observed.version_id.as_deref();

        let mut steps: Vec<Attribute> = Vec::new();
        if changes.is_changed(Attribute::ObjectLockLegalHoldStatus) {
            steps.push(Attribute::ObjectLockLegalHoldStatus);
        }
        if changes.is_changed(Attribute::ObjectLockMode)
            || changes.is_changed(Attribute::ObjectLockRetainUntilDate)
        {
            steps.push(Attribute::ObjectLockRetainUntilDate);
        }
        if changes.is_changed(Attribute::Acl) {
            steps.push(Attribute::Acl);
        }
        if changes.is_changed(Attribute::Tags) {
            steps.push(Attribute::Tags);
        }

        for (i, step) in steps.iter().enumerate() {
            let result = match step {
                Attribute::ObjectLockLegalHoldStatus => {
                    let status = desired.legal_hold.unwrap_or(LegalHoldStatus::Off);
                    self.transport
                        .put_legal_hold(id, version_id, status)
                        .await
                        .map(|()| progress.observed.lock.legal_hold = Some(status))
                }
                Attribute::ObjectLockRetainUntilDate => self
                    .transport
                    .put_retention(id, version_id, desired.retention, self.settings.governance_bypass)
                    .await
                    .map(|()| progress.observed.lock.retention = desired.retention),
                Attribute::Acl => match desired.acl.as_deref() {
                    Some(acl) => self
                        .transport
                        .put_acl(id, version_id, acl)
                        .await
                        .map(|()| progress.acl = Some(acl.to_string())),
                    None => Ok(()),
                },
                _ => {
                    let tags = changes.tags.merged(&prior.observed.tags);
                    self.transport
                        .put_tags(id, version_id, &tags)
                        .await
                        .map(|()| progress.observed.tags = tags)
                }
            };
            if let Err(err) = result {
                warn!(%id, attribute = ?step, error = %err, "in-place update failed");
                progress.divergent = steps[i..].to_vec();
                progress.error = Some(err.into());
                return Ok(progress);
            }
            debug!(%id, attribute = ?step, "updated in place");
        }

        Ok(self.refresh(prepared, progress).await)
    }

    /// Clear the legal hold on the version a write is about to supersede when
    /// configuration no longer asks for one.
    ///
    /// Once superseded, that version is out of reach of later cycles and its
    /// hold would block force-destroy for good.
    async fn release_superseded_hold(
        &self,
        prepared: &Prepared,
        prior: &ObjectState,
    ) -> ReconcileResult<()> {
        let held = LegalHoldStatus::is_on(prior.observed.lock.legal_hold);
        if !held || LegalHoldStatus::is_on(prepared.desired.legal_hold) {
            return Ok(());
        }
        let version_id = prior.observed.version_id.as_deref();
        self.transport
            .put_legal_hold(&prior.id, version_id, LegalHoldStatus::Off)
            .await?;
        info!(id = %prior.id, ?version_id, "legal hold released on superseded version");
        Ok(())
    }

    /// Read back the object; on failure keep what the writes acknowledged.
    async fn refresh(&self, prepared: &Prepared, mut progress: Progress) -> Progress {
        let id = &prepared.desired.id;
        match observe(self.transport, id).await {
            Ok(Some(observed)) => progress.observed = observed,
            Ok(None) => {
                progress.error = Some(TransportError::not_found(id).into());
            }
            Err(err) => {
                warn!(%id, error = %err, "read-back after apply failed");
                progress.error = Some(err);
            }
        }
        progress
    }

    fn finish(&self, prepared: &Prepared, progress: Progress) -> ApplyOutcome {
        let desired = &prepared.desired;
        ApplyOutcome {
            plan: prepared.plan,
            state: ObjectState {
                name: prepared.name.clone(),
                id: desired.id.clone(),
                observed: progress.observed,
                content_hash: progress.content_hash,
                source_hash: desired.source_hash.clone(),
                acl: progress.acl,
                force_destroy: desired.force_destroy,
            },
            divergent: progress.divergent,
            error: progress.error,
        }
    }
}

fn write_attributes(desired: &DesiredState, tags: BTreeMap<String, String>) -> WriteAttributes {
    WriteAttributes {
        headers: desired.headers.clone(),
        storage_class: desired.storage_class.clone(),
        server_side_encryption: desired.server_side_encryption,
        kms_key_id: desired.kms_key_id.clone(),
        bucket_key_enabled: desired.bucket_key_enabled,
        lock: LockState {
            retention: desired.retention,
            legal_hold: desired.legal_hold,
        },
        acl: desired.acl.clone(),
        metadata: desired.metadata.clone(),
        tags,
    }
}

/// Observed state as far as a write acknowledgment tells.
fn acknowledged(attrs: &WriteAttributes, out: &PutOutput, content_length: u64) -> ObservedState {
    ObservedState {
        etag: out.etag.clone(),
        version_id: out.version_id.clone(),
        content_length,
        headers: attrs.headers.clone(),
        storage_class: attrs.storage_class.clone().unwrap_or_default(),
        server_side_encryption: attrs.server_side_encryption,
        kms_key_id: attrs.kms_key_id.clone(),
        bucket_key_enabled: attrs.bucket_key_enabled.unwrap_or(false),
        lock: attrs.lock,
        metadata: attrs.metadata.clone(),
        tags: attrs.tags.clone(),
        last_modified: Utc::now(),
    }
}
