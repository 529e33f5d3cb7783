use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tempo_booking::{CommitError, HoldError};
use tempo_core::repository::StoreError;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    /// Slots that could not be held or booked.
    ConflictError {
        message: String,
        slots: Vec<u32>,
        refunded: Option<bool>,
    },
    Unavailable(String),
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::ConflictError { message, slots, refunded } => {
                let mut body = json!({ "error": message, "slots": slots });
                if let Some(refunded) = refunded {
                    body["refunded"] = json!(refunded);
                }
                (StatusCode::CONFLICT, body)
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg })),
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal Server Error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<HoldError> for AppError {
    fn from(err: HoldError) -> Self {
        match err {
            HoldError::Conflict(slots) => AppError::ConflictError {
                message: "Slots unavailable".to_string(),
                slots,
                refunded: None,
            },
            HoldError::NotOwner { slots, .. } => AppError::ConflictError {
                message: "Slots are not held by this holder".to_string(),
                slots,
                refunded: None,
            },
            HoldError::Invalid(msg) => AppError::ValidationError(msg),
            HoldError::RoomNotFound(id) => AppError::NotFoundError(format!("Room {} not found", id)),
            other => AppError::Anyhow(other.into()),
        }
    }
}

impl From<CommitError> for AppError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Invalid(msg) => AppError::ValidationError(msg),
            CommitError::Conflict { slots, refunded } => AppError::ConflictError {
                message: "Payment captured but slots could not be booked".to_string(),
                slots,
                refunded: Some(refunded),
            },
            CommitError::Store(e) => AppError::Anyhow(e.into()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFoundError(what),
            other => AppError::Anyhow(other.into()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Anyhow(err)
    }
}
