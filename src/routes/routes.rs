//! Defines routes for the reconciler's HTTP control surface.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz` : liveness
//!   - `GET    /readyz` : SQLite, payload dir and state dir checks
//!
//! - **Resources** (one managed object per `name`)
//!   - `POST   /resources/{name}/plan` : diff a configuration, no writes
//!   - `PUT    /resources/{name}` : apply a configuration
//!   - `GET    /resources/{name}` : refreshed state
//!   - `DELETE /resources/{name}` : destroy
//!   - `POST   /resources/{name}/import?id=s3://bucket/key` : adopt an object

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    resource_handlers::{
        apply_resource, destroy_resource, get_resource, import_resource, plan_resource,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router for the control surface.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Resource routes
        .route(
            "/resources/{name}",
            put(apply_resource)
                .get(get_resource)
                .delete(destroy_resource),
        )
        .route("/resources/{name}/plan", post(plan_resource))
        .route("/resources/{name}/import", post(import_resource))
}
