use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("workflow engine error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Upstream(msg) => {
                tracing::error!("workflow engine error: {}", msg);
                StatusCode::BAD_GATEWAY
            }
            RelayError::Io(e) => {
                tracing::error!("io error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

impl From<threatwatch_core::InvalidRequest> for RelayError {
    fn from(e: threatwatch_core::InvalidRequest) -> Self {
        RelayError::BadRequest(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Upstream(e.to_string())
    }
}
