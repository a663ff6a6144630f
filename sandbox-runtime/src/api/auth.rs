//! API-key authentication for admin routes.
//!
//! Credentials arrive as `X-API-Key`, an `Authorization: Bearer` header, or
//! (for websocket upgrades) a `token` query parameter. The matched client's
//! `last_used_at` is touched in a detached task with its own budget so the
//! request path never waits on it.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::api::AppState;
use crate::api::types::ApiResponse;
use crate::model::ApiClient;
use crate::store::SandboxStore;

const TOUCH_BUDGET: Duration = Duration::from_secs(5);

/// An authenticated admin caller.
pub struct AuthedClient(pub ApiClient);

impl AuthedClient {
    /// Wildcard-aware permission gate.
    pub fn require(&self, permission: &str) -> Result<(), Response> {
        if self.0.has_permission(permission) {
            Ok(())
        } else {
            Err(reject(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("missing permission '{permission}'"),
            ))
        }
    }
}

fn reject(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(ApiResponse::<()>::error(code, message))).into_response()
}

fn presented_key(parts: &Parts) -> Option<String> {
    if let Some(key) = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    if let Some(auth) = parts.headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    // Websocket upgrades cannot set headers from browsers; accept ?token=.
    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=").map(|value| value.to_string())
        })
    })
}

/// Resolve and validate the presented key against the store.
pub async fn authenticate(store: &Arc<dyn SandboxStore>, key: &str) -> Result<ApiClient, Response> {
    let client = store.client_by_api_key(key).await.map_err(|err| {
        reject(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    })?;
    // The store lookup already matched on the unique key column; compare
    // again in constant time before trusting the row.
    if !bool::from(client.api_key.as_bytes().ct_eq(key.as_bytes())) {
        return Err(reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid API key".to_string(),
        ));
    }
    if !client.is_active {
        return Err(reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "API key is deactivated".to_string(),
        ));
    }
    Ok(client)
}

/// Fire-and-forget `last_used_at` update, detached from the request.
pub fn touch_last_used(store: Arc<dyn SandboxStore>, key: String) {
    tokio::spawn(async move {
        match tokio::time::timeout(TOUCH_BUDGET, store.touch_client_last_used(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("last_used_at update failed: {err}"),
            Err(_) => debug!("last_used_at update timed out"),
        }
    });
}

impl FromRequestParts<AppState> for AuthedClient {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(key) = presented_key(parts) else {
            return Err(reject(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing API key".to_string(),
            ));
        };
        let client = authenticate(&state.store, &key).await?;
        touch_last_used(state.store.clone(), key);
        Ok(AuthedClient(client))
    }
}
