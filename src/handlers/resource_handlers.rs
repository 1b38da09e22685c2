//! HTTP handlers for managed object resources.
//!
//! Each handler runs one reconciliation cycle for the resource named in the
//! path and maps the result onto JSON. Failures go through `AppError`.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{desired::ObjectConfig, observed::ObjectState},
    reconcile::{PlanReport, diff::Attribute, guard::DestroyOutcome, plan::Plan},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Resource as reported to the operator; ignored tags are left out.
#[derive(Debug, Serialize)]
pub struct ResourceView {
    #[serde(flatten)]
    pub state: ObjectState,
    pub reported_tags: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub plan: Plan,
    pub complete: bool,
    pub resource: ResourceView,
    pub divergent: Vec<Attribute>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImportParams {
    pub id: String,
}

fn view(app: &AppState, state: ObjectState) -> ResourceView {
    let reported_tags = state.reported_tags(&app.reconciler.settings().ignore_tags);
    ResourceView {
        state,
        reported_tags,
    }
}

/// `POST /resources/{name}/plan`
pub async fn plan_resource(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<ObjectConfig>,
) -> Result<Json<PlanReport>, AppError> {
    let report = app.reconciler.plan(&name, config).await?;
    Ok(Json(report))
}

/// `PUT /resources/{name}`
///
/// A partial apply answers with the status of the failure that stopped it,
/// but still carries the confirmed state and the divergent attributes.
pub async fn apply_resource(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<ObjectConfig>,
) -> Result<Response, AppError> {
    let outcome = app.reconciler.apply(&name, config).await?;

    let (status, error) = match outcome.error {
        None => (StatusCode::OK, None),
        Some(err) => {
            let err = AppError::from(err);
            (err.status, Some(err.message))
        }
    };
    let body = ApplyResponse {
        plan: outcome.plan,
        complete: error.is_none(),
        resource: view(&app, outcome.state),
        divergent: outcome.divergent,
        error,
    };
    Ok((status, Json(body)).into_response())
}

/// `GET /resources/{name}`
pub async fn get_resource(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ResourceView>, AppError> {
    match app.reconciler.read(&name).await? {
        Some(state) => Ok(Json(view(&app, state))),
        None => Err(AppError::not_found(format!("resource `{}` not found", name))),
    }
}

/// `DELETE /resources/{name}`
pub async fn destroy_resource(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    match app.reconciler.destroy(&name).await? {
        Some(DestroyOutcome {
            removed_versions,
            delete_marker,
        }) => Ok(Json(json!({
            "name": name,
            "removed_versions": removed_versions,
            "delete_marker": delete_marker,
        }))
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// `POST /resources/{name}/import?id=s3://bucket/key`
pub async fn import_resource(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ImportParams>,
) -> Result<(StatusCode, Json<ResourceView>), AppError> {
    let state = app.reconciler.import(&name, &params.id).await?;
    Ok((StatusCode::CREATED, Json(view(&app, state))))
}
