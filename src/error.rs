use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::load::{LoadId, LoadStatus};
use crate::routing::RoutingError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot {trigger} load {load_id} from {from}")]
    InvalidTransition {
        load_id: LoadId,
        trigger: &'static str,
        from: LoadStatus,
    },

    #[error("store rejected {trigger} for load {load_id}: {source}")]
    RemoteMutationFailed {
        load_id: LoadId,
        trigger: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("subscription failed: {0}")]
    Subscription(#[source] StoreError),

    #[error("malformed document {load_id}: {reason}")]
    MalformedDocument { load_id: LoadId, reason: String },

    #[error("load {0} is not among the driver's open loads")]
    UnknownLoad(LoadId),

    #[error("driver session is not subscribed")]
    NotSubscribed,

    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Load(err) => match err {
                LoadError::InvalidTransition { .. } => StatusCode::CONFLICT,
                LoadError::RemoteMutationFailed { .. } => StatusCode::BAD_GATEWAY,
                LoadError::Subscription(_) => StatusCode::SERVICE_UNAVAILABLE,
                LoadError::MalformedDocument { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LoadError::UnknownLoad(_) => StatusCode::NOT_FOUND,
                LoadError::NotSubscribed => StatusCode::CONFLICT,
                LoadError::Routing(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
