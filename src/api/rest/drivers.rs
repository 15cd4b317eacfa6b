use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::projection::ProjectionView;
use crate::error::AppError;
use crate::models::load::{DriverId, GeoPoint, LoadId};
use crate::models::route::Route;
use crate::notify::OfferChoice;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/drivers/:driver_id/session",
            put(subscribe).delete(teardown),
        )
        .route("/drivers/:driver_id/projection", get(projection))
        .route("/drivers/:driver_id/offers/:load_id", post(respond_to_offer))
        .route("/drivers/:driver_id/loads/:load_id/accept", post(accept))
        .route("/drivers/:driver_id/loads/:load_id/refuse", post(refuse))
        .route("/drivers/:driver_id/loads/:load_id/confirm", post(confirm))
        .route("/drivers/:driver_id/loads/:load_id/arrival", post(mark_arrival))
        .route("/drivers/:driver_id/position", post(report_position))
        .route("/drivers/:driver_id/route", post(plan_route))
}

#[derive(Deserialize, Default)]
pub struct RefuseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct OfferResponseRequest {
    pub choice: OfferChoice,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct PositionResponse {
    pub arrival_requested: bool,
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> Result<Json<ProjectionView>, AppError> {
    let driver_id = DriverId::new(driver_id);
    let session = state.session_for(&driver_id);
    session.subscribe(driver_id).await?;
    Ok(Json(session.projection()))
}

async fn teardown(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let driver_id = DriverId::new(driver_id);
    let (_, session) = state
        .sessions
        .remove(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("no session for driver {driver_id}")))?;
    session.teardown();
    Ok(StatusCode::NO_CONTENT)
}

async fn projection(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> Result<Json<ProjectionView>, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    Ok(Json(session.projection()))
}

async fn respond_to_offer(
    State(state): State<Arc<AppState>>,
    Path((driver_id, load_id)): Path<(String, String)>,
    Json(payload): Json<OfferResponseRequest>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    session
        .respond_to_offer(&LoadId::new(load_id), payload.choice, payload.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn accept(
    State(state): State<Arc<AppState>>,
    Path((driver_id, load_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    session.accept(&LoadId::new(load_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refuse(
    State(state): State<Arc<AppState>>,
    Path((driver_id, load_id)): Path<(String, String)>,
    payload: Option<Json<RefuseRequest>>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    let reason = payload.and_then(|Json(body)| body.reason);
    session
        .respond_to_offer(&LoadId::new(load_id), OfferChoice::Refuse, reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Path((driver_id, load_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    session.confirm(&LoadId::new(load_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_arrival(
    State(state): State<Arc<AppState>>,
    Path((driver_id, load_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    session.mark_arrival(&LoadId::new(load_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn report_position(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    Json(point): Json<GeoPoint>,
) -> Result<Json<PositionResponse>, AppError> {
    if !point.is_valid() {
        return Err(AppError::BadRequest(format!(
            "invalid position ({}, {})",
            point.lat, point.lng
        )));
    }

    let session = state.session(&DriverId::new(driver_id))?;
    let arrival_requested = session.report_position(point).await?;
    Ok(Json(PositionResponse { arrival_requested }))
}

async fn plan_route(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    Json(origin): Json<GeoPoint>,
) -> Result<Json<Route>, AppError> {
    let session = state.session(&DriverId::new(driver_id))?;
    Ok(Json(session.plan_route(origin).await?))
}
