//! CRM response classification
//!
//! Maps raw REST responses onto the outcomes the client acts on. The CRM's
//! wire vocabulary stops here: the call path only ever matches on
//! `ErrorKind`.

use reqwest::StatusCode;
use serde_json::Value;

use crate::error::Error;

/// Error code the CRM returns when the access token is no longer accepted.
pub const EXPIRED_TOKEN_CODE: &str = "expired_token";

/// What the client should do about a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refresh the token and retry once
    ExpiredToken,
    /// Surface to the caller as-is
    Other,
}

impl ErrorKind {
    /// Classify a provider error code. Matching is case-insensitive.
    pub fn from_code(code: &str) -> Self {
        if code.trim().eq_ignore_ascii_case(EXPIRED_TOKEN_CODE) {
            ErrorKind::ExpiredToken
        } else {
            ErrorKind::Other
        }
    }
}

/// A failed CRM call as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub code: String,
    pub description: String,
}

impl ApiFailure {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(&self.code)
    }
}

impl From<ApiFailure> for Error {
    fn from(failure: ApiFailure) -> Self {
        Error::Api {
            code: failure.code,
            description: failure.description,
        }
    }
}

/// Decoded outcome of one CRM request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failed(ApiFailure),
}

/// Decode a CRM response.
///
/// Success requires a 2xx status and a JSON body without an `error` field.
/// Failure bodies normally look like
/// `{"error": "expired_token", "error_description": "..."}`; anything else
/// becomes an `http_<status>` failure carrying the raw body.
pub fn decode(status: StatusCode, body: &str) -> Outcome {
    let parsed = serde_json::from_str::<Value>(body);

    if let Ok(value) = &parsed
        && let Some(failure) = error_object(value)
    {
        return Outcome::Failed(failure);
    }

    match parsed {
        Ok(value) if status.is_success() => Outcome::Success(value),
        Err(e) if status.is_success() => Outcome::Failed(ApiFailure {
            code: "invalid_response".into(),
            description: format!("response body is not JSON: {e}"),
        }),
        _ => Outcome::Failed(ApiFailure {
            code: format!("http_{}", status.as_u16()),
            description: body.to_string(),
        }),
    }
}

/// Extract `error` / `error_description` from a JSON body, if present.
fn error_object(value: &Value) -> Option<ApiFailure> {
    let code = match value.get("error")? {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    let description = value
        .get("error_description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(ApiFailure { code, description })
}
