//! HTTP mapping of gateway failures

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure of a gateway request, rendered as a JSON error body.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] crm_rpc::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::Rpc(crm_rpc::Error::InvalidMethod(_)) => {
                StatusCode::BAD_REQUEST
            }
            Error::Rpc(crm_rpc::Error::NotInstalled) => StatusCode::CONFLICT,
            Error::Rpc(crm_rpc::Error::RefreshFailed(_)) => StatusCode::UNAUTHORIZED,
            Error::Rpc(crm_rpc::Error::Api { .. }) => StatusCode::BAD_GATEWAY,
            Error::Rpc(crm_rpc::Error::Transport(_)) => StatusCode::GATEWAY_TIMEOUT,
            Error::Rpc(crm_rpc::Error::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// `error` code in the response body.
    fn code(&self) -> String {
        match self {
            Error::BadRequest(_) => "bad_request".to_string(),
            Error::Rpc(crm_rpc::Error::Api { code, .. }) => code.clone(),
            Error::Rpc(other) => other.label().to_string(),
        }
    }

    fn description(&self) -> String {
        match self {
            Error::Rpc(crm_rpc::Error::Api { description, .. }) => description.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "error_description": self.description(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
