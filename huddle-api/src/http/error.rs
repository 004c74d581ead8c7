// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_sfu::SignalError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            kind: self.kind.to_string(),
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert signaling errors to HTTP errors
impl From<SignalError> for AppError {
    fn from(err: SignalError) -> Self {
        let status = match &err {
            SignalError::RoomNotFound(_)
            | SignalError::TransportNotFound(_)
            | SignalError::ProducerNotFound(_)
            | SignalError::ConsumerNotFound(_) => StatusCode::NOT_FOUND,
            SignalError::RoomAlreadyExists(_)
            | SignalError::TransportAlreadyExists(_)
            | SignalError::AlreadyInRoom(_)
            | SignalError::RoomFull { .. } => StatusCode::CONFLICT,
            SignalError::NotInRoom(_) => StatusCode::FORBIDDEN,
            SignalError::InvalidRequest(_) | SignalError::IncompatibleCapabilities(_) => {
                StatusCode::BAD_REQUEST
            }
            SignalError::RoomLimitReached(_) | SignalError::EngineUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SignalError::Engine(msg) => {
                tracing::error!("Media engine error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.kind(), err.to_string())
    }
}
