//! Request/response types for the REST API.
//!
//! Every response wraps its payload in the `{success, data?, error?}`
//! envelope; error codes mirror the error taxonomy.

use std::collections::HashMap;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{Sandbox, Session};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody { code: code.into(), message: message.into() }),
        }
    }
}

/// HTTP status and wire code for an error.
pub fn status_and_code(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        Error::TemplateNotFound(_) => (StatusCode::NOT_FOUND, "template_not_found"),
        Error::SandboxNotFound(_) | Error::SessionNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        Error::Conflict(_) => (StatusCode::CONFLICT, "invalid_request"),
        Error::SessionNotReady(_) => (StatusCode::CONFLICT, "not_ready"),
        Error::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        Error::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
        Error::Container(_) | Error::Storage(_) | Error::Provider(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub template_id: String,
    pub user_id: String,
    /// TTL override in seconds; template default applies when omitted.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSandboxesQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub duration_ns: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub template_id: String,
    /// Session TTL in seconds, measured from activation.
    pub ttl: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
}

/// Public join view: the session plus, once active, its sandbox.
#[derive(Debug, Serialize)]
pub struct JoinView {
    #[serde(flatten)]
    pub session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Sandbox>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_fields() {
        let ok = serde_json::to_value(ApiResponse::ok(1)).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"], 1);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ApiResponse::<()>::error("not_found", "nope")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"]["code"], "not_found");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn error_mapping_matches_taxonomy() {
        let (status, code) = status_and_code(&Error::Validation("x".into()));
        assert_eq!((status, code), (StatusCode::BAD_REQUEST, "validation_error"));
        let (status, code) = status_and_code(&Error::TemplateNotFound("x".into()));
        assert_eq!((status, code), (StatusCode::NOT_FOUND, "template_not_found"));
        let (status, code) = status_and_code(&Error::SessionNotReady("x".into()));
        assert_eq!((status, code), (StatusCode::CONFLICT, "not_ready"));
        let (status, _) = status_and_code(&Error::Storage("x".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
