//! HTTP handlers and the state they share.

pub mod health_handlers;
pub mod resource_handlers;

use crate::reconcile::Reconciler;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler,
    /// Pool behind the local store, probed by readiness.
    pub db: Arc<SqlitePool>,
    /// Payload root of the local store.
    pub storage_dir: PathBuf,
}
