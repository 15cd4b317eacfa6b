use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::models::document::{fields, normalize, Document};
use crate::models::load::{
    DriverId, Geofence, Load, LoadId, LoadKind, LoadStatus, LoadTimestamps, Place,
};
use crate::models::route::RouteStep;
use crate::state::AppState;
use crate::store::StoreError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/loads", post(create_load))
        .route(
            "/loads/:id",
            get(get_load).patch(update_load).delete(delete_load),
        )
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    EmptyRun,
    LoadedRun,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadRequest {
    pub assigned_driver_id: String,
    pub kind: RunKind,
    #[serde(default)]
    pub status: Option<LoadStatus>,
    #[serde(default)]
    pub cargo_weight_kg: Option<f64>,
    #[serde(default)]
    pub origin: Place,
    pub destination: Place,
    #[serde(default)]
    pub geofence: Option<Geofence>,
    #[serde(default)]
    pub route: Option<Vec<RouteStep>>,
}

async fn create_load(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateLoadRequest>,
) -> Result<Json<Load>, AppError> {
    if payload.assigned_driver_id.trim().is_empty() {
        return Err(AppError::BadRequest("assignedDriverId cannot be empty".to_string()));
    }

    let status = payload.status.unwrap_or(LoadStatus::PendingAcceptance);
    if !status.is_offer() {
        return Err(AppError::BadRequest(format!(
            "loads are created as AWAITING_SCHEDULING or PENDING_ACCEPTANCE, not {status}"
        )));
    }

    let kind = match payload.kind {
        RunKind::EmptyRun => LoadKind::EmptyRun,
        RunKind::LoadedRun => LoadKind::LoadedRun {
            weight_kg: payload.cargo_weight_kg,
        },
    };

    let draft = Load {
        id: LoadId::new(""),
        status,
        kind,
        assigned_driver_id: DriverId::new(payload.assigned_driver_id),
        origin: payload.origin,
        destination: payload.destination,
        geofence: payload.geofence,
        route: payload.route,
        timestamps: LoadTimestamps {
            created_at: Some(Utc::now()),
            ..LoadTimestamps::default()
        },
        refusal_reason: None,
    };

    let document = draft.to_document();
    let probe = normalize(&draft.id, &document)?;
    let load_id = state.store.insert(document);

    Ok(Json(Load { id: load_id, ..probe }))
}

async fn get_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let load_id = LoadId::new(id);
    state
        .store
        .get(&load_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("load {load_id} not found")))
}

async fn update_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<Document>,
) -> Result<Json<Document>, AppError> {
    if patch.get(fields::STATUS).is_some_and(|status| {
        !status.is_null() && status.as_str().and_then(|raw| raw.parse::<LoadStatus>().ok()).is_none()
    }) {
        return Err(AppError::BadRequest(format!(
            "unknown status {}",
            patch.get(fields::STATUS).unwrap_or(&Value::Null)
        )));
    }

    state
        .store
        .update(&LoadId::new(id), patch)
        .map(Json)
        .map_err(store_error)
}

async fn delete_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .remove(&LoadId::new(id))
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(store_error)
}

fn store_error(err: StoreError) -> AppError {
    match err {
        StoreError::NotFound(load_id) => AppError::NotFound(format!("load {load_id} not found")),
        other => AppError::Internal(other.to_string()),
    }
}
