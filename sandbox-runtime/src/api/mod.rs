//! Axum REST + websocket surface.
//!
//! Admin routes authenticate with an API key; join routes authenticate with
//! the session token alone; terminal routes upgrade to the bidirectional
//! frame stream. REST handlers run under a 60 s timeout; terminal
//! upgrades deliberately do not.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::Error;
use crate::manager::{CreateOptions, SandboxManager};
use crate::model::{SandboxStatus, Session};
use crate::session::{SessionManager, SessionRequest};
use crate::store::{SandboxFilter, SandboxStore};
use crate::terminal;

pub mod auth;
pub mod types;

use auth::AuthedClient;
use types::{
    ApiResponse, CreateSandboxRequest, CreateSessionRequest, ExtendRequest, HealthResponse,
    JoinView, ListSandboxesQuery, ListSessionsQuery, LogsQuery, LogsResponse, TerminalQuery,
    status_and_code,
};

const REST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SandboxStore>,
    pub manager: Arc<SandboxManager>,
    pub sessions: Arc<SessionManager>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::ok(data))).into_response()
}

/// Map a runtime error onto the wire. Server-side faults keep their root
/// cause in the log and reach the client as a generic `internal_error`.
fn fail(err: Error) -> Response {
    let (status, code) = status_and_code(&err);
    let message = if status.is_server_error() {
        error!("request failed: {err}");
        "internal error".to_string()
    } else {
        err.to_string()
    };
    (status, Json(ApiResponse::<()>::error(code, message))).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health() -> Response {
    (
        StatusCode::OK,
        Json(HealthResponse { status: "healthy", time: chrono::Utc::now() }),
    )
        .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    match state.manager.ping().await {
        Ok(()) => ok("ready"),
        Err(err) => {
            error!("readiness check failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::<()>::error("internal_error", "not ready")),
            )
                .into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandboxes
// ─────────────────────────────────────────────────────────────────────────────

async fn create_sandbox(
    auth: AuthedClient,
    State(state): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:write") {
        return rejection;
    }
    if request.template_id.is_empty() || request.user_id.is_empty() {
        return fail(Error::Validation("template_id and user_id are required".to_string()));
    }
    let opts = CreateOptions {
        ttl: request.ttl.map(Duration::from_secs),
        env: request.env,
        metadata: request.metadata,
    };
    match state.manager.create(&request.template_id, &request.user_id, opts).await {
        Ok(sandbox) => created(sandbox),
        Err(err) => fail(err),
    }
}

async fn list_sandboxes(
    auth: AuthedClient,
    State(state): State<AppState>,
    Query(query): Query<ListSandboxesQuery>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:read") {
        return rejection;
    }
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<SandboxStatus>() {
            Ok(status) => Some(status),
            Err(err) => return fail(err),
        },
        None => None,
    };
    let filter = SandboxFilter {
        user_id: query.user_id,
        template_id: query.template_id,
        status,
        limit: query.limit,
        offset: query.offset,
    };
    match state.manager.list(&filter).await {
        Ok(sandboxes) => ok(sandboxes),
        Err(err) => fail(err),
    }
}

async fn get_sandbox(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:read") {
        return rejection;
    }
    match state.manager.get(&id).await {
        Ok(sandbox) => ok(sandbox),
        Err(err) => fail(err),
    }
}

async fn delete_sandbox(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:write") {
        return rejection;
    }
    match state.manager.delete(&id).await {
        Ok(()) => ok("deleted"),
        Err(err) => fail(err),
    }
}

async fn stop_sandbox(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:write") {
        return rejection;
    }
    match state.manager.stop(&id).await {
        Ok(()) => ok("stopped"),
        Err(err) => fail(err),
    }
}

async fn extend_sandbox(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:write") {
        return rejection;
    }
    if request.duration_ns == 0 {
        return fail(Error::Validation("duration_ns must be positive".to_string()));
    }
    let duration = Duration::from_nanos(request.duration_ns);
    match state.manager.extend_ttl(&id, duration).await {
        Ok(()) => ok("extended"),
        Err(err) => fail(err),
    }
}

async fn sandbox_logs(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:read") {
        return rejection;
    }
    match state.manager.logs(&id, query.tail).await {
        Ok(bytes) => ok(LogsResponse { logs: String::from_utf8_lossy(&bytes).into_owned() }),
        Err(err) => fail(err),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Create response carries the join token; it is never echoed anywhere
/// else.
#[derive(Serialize)]
struct SessionCreated {
    #[serde(flatten)]
    session: Session,
    token: String,
}

async fn create_session(
    auth: AuthedClient,
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    if let Err(rejection) = auth.require("sessions:write") {
        return rejection;
    }
    let session_request = SessionRequest {
        template_id: request.template_id,
        ttl_seconds: request.ttl,
        env: request.env,
        metadata: request.metadata,
        services: request.services,
        created_by: auth.0.name.clone(),
    };
    match state.sessions.create(session_request).await {
        Ok(session) => {
            let token = session.token.clone();
            created(SessionCreated { session, token })
        }
        Err(err) => fail(err),
    }
}

async fn list_sessions(
    auth: AuthedClient,
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Response {
    if let Err(rejection) = auth.require("sessions:read") {
        return rejection;
    }
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse() {
            Ok(status) => Some(status),
            Err(err) => return fail(err),
        },
        None => None,
    };
    match state.sessions.list(status, query.limit, query.offset).await {
        Ok(sessions) => ok(sessions),
        Err(err) => fail(err),
    }
}

async fn get_session(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    if let Err(rejection) = auth.require("sessions:read") {
        return rejection;
    }
    match state.sessions.get(id).await {
        Ok(session) => ok(session),
        Err(err) => fail(err),
    }
}

async fn delete_session(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    if let Err(rejection) = auth.require("sessions:write") {
        return rejection;
    }
    match state.sessions.delete(id).await {
        Ok(()) => ok("deleted"),
        Err(err) => fail(err),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public join routes (session token is the only authenticator)
// ─────────────────────────────────────────────────────────────────────────────

async fn join_view_for(state: &AppState, session: Session) -> JoinView {
    let sandbox = match (&session.status, &session.sandbox_id) {
        (crate::model::SessionStatus::Active, Some(sandbox_id)) => {
            state.manager.get(sandbox_id).await.ok()
        }
        _ => None,
    };
    JoinView { session, sandbox }
}

async fn join_get(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.sessions.get_by_token(&token).await {
        Ok(session) => ok(join_view_for(&state, session).await),
        Err(err) => fail(err),
    }
}

async fn join_activate(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.sessions.activate(&token).await {
        Ok(session) => ok(join_view_for(&state, session).await),
        Err(err) => fail(err),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal websocket routes
// ─────────────────────────────────────────────────────────────────────────────

async fn running_container(state: &AppState, id: &str) -> Result<String, Error> {
    let sandbox = state.manager.get(id).await?;
    if sandbox.status != SandboxStatus::Running || sandbox.container_id.is_empty() {
        return Err(Error::Conflict(format!(
            "sandbox '{id}' is {}, terminal requires running",
            sandbox.status
        )));
    }
    Ok(sandbox.container_id)
}

async fn ws_terminal(
    auth: AuthedClient,
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(rejection) = auth.require("sandboxes:write") {
        return rejection;
    }
    let container_id = match running_container(&state, &id).await {
        Ok(container_id) => container_id,
        Err(err) => return fail(err),
    };
    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| terminal::serve(manager, socket, container_id))
}

async fn ws_session_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.session_token else {
        return fail(Error::Auth("missing session_token".to_string()));
    };
    let session = match state.sessions.get_by_token(&token).await {
        Ok(session) => session,
        Err(err) => return fail(err),
    };
    if session.status != crate::model::SessionStatus::Active
        || session.sandbox_id.as_deref() != Some(id.as_str())
    {
        return fail(Error::Forbidden(
            "session is not active for this sandbox".to_string(),
        ));
    }
    let container_id = match running_container(&state, &id).await {
        Ok(container_id) => container_id,
        Err(err) => return fail(err),
    };
    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| terminal::serve(manager, socket, container_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build CORS layer from `CORS_ALLOWED_ORIGINS`.
///
/// - If the env var is set, parse comma-separated origins and whitelist them.
/// - If unset or `"*"`, allow any origin (development mode).
fn build_cors_layer() -> CorsLayer {
    use axum::http::{Method, header};

    let allowed_methods = vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let allowed_headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT];

    let origins_env = std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default();

    if origins_env.is_empty() || origins_env == "*" {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<_> = origins_env
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
            .allow_credentials(true)
    }
}

pub fn router(state: AppState) -> Router {
    let rest = Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/{id}", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/{id}/stop", post(stop_sandbox))
        .route("/sandboxes/{id}/extend", post(extend_sandbox))
        .route("/sandboxes/{id}/logs", get(sandbox_logs))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/join/{token}", get(join_get))
        .route("/join/{token}/activate", post(join_activate))
        .layer(TimeoutLayer::new(REST_TIMEOUT));

    // No timeout on upgrades: terminal connections are long-lived.
    let ws = Router::new()
        .route("/ws/terminal/{id}", get(ws_terminal))
        .route("/ws/session-terminal/{id}", get(ws_session_terminal));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/api/v1", rest.merge(ws))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, PullPolicy};
    use crate::model::ApiClient;
    use crate::providers::ProviderRegistry;
    use crate::templates::TemplateCatalog;
    use crate::testing::{MemoryStore, MockProvider, MockRuntime};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn test_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProvider::new("postgres")));
        let catalog = Arc::new(
            TemplateCatalog::from_templates(vec![
                serde_yaml::from_str(
                    "name: backend-python\nimage: python:3.12-slim\nservices: [postgres]\n",
                )
                .unwrap(),
            ])
            .unwrap(),
        );
        let manager = Arc::new(SandboxManager::new(
            store.clone(),
            Arc::new(providers),
            catalog,
            Arc::new(MockRuntime::new()),
            PullPolicy::Never,
            None,
            ProxyConfig::default(),
            "127.0.0.1".to_string(),
            CancellationToken::new(),
        ));
        let sessions = Arc::new(SessionManager::new(store.clone(), manager.clone()));

        store.insert_client(ApiClient {
            id: Uuid::new_v4(),
            name: "admin".into(),
            api_key: "admin-key".into(),
            is_active: true,
            permissions: vec!["*".into()],
            created_at: chrono::Utc::now(),
            last_used_at: None,
        });
        store.insert_client(ApiClient {
            id: Uuid::new_v4(),
            name: "viewer".into(),
            api_key: "viewer-key".into(),
            is_active: true,
            permissions: vec!["sandboxes:read".into()],
            created_at: chrono::Utc::now(),
            last_used_at: None,
        });

        let state = AppState { store: store.clone(), manager, sessions };
        (store, state)
    }

    fn app() -> (Arc<MemoryStore>, Router) {
        let (store, state) = test_state();
        (store, router(state))
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_, app) = app();
        let response = app.oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn ready_reports_healthy_backends() {
        let (_, app) = app();
        let response = app.oneshot(get_req("/ready", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_routes_require_api_key() {
        let (_, app) = app();
        let response = app.oneshot(get_req("/api/v1/sandboxes", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn create_sandbox_returns_pending() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json(
                "/api/v1/sandboxes",
                Some("admin-key"),
                serde_json::json!({"template_id": "backend-python", "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "pending");
        assert_eq!(json["data"]["id"].as_str().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn create_sandbox_unknown_template_is_404() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json(
                "/api/v1/sandboxes",
                Some("admin-key"),
                serde_json::json!({"template_id": "nope", "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"]["code"], "template_not_found");
    }

    #[tokio::test]
    async fn read_only_key_cannot_create() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json(
                "/api/v1/sandboxes",
                Some("viewer-key"),
                serde_json::json!({"template_id": "backend-python", "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn get_after_create_round_trips() {
        let (_, app) = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/sandboxes",
                Some("admin-key"),
                serde_json::json!({"template_id": "backend-python", "user_id": "u1"}),
            ))
            .await
            .unwrap();
        let created = body_json(response.into_body()).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(get_req(&format!("/api/v1/sandboxes/{id}"), Some("viewer-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["data"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn get_missing_sandbox_is_404() {
        let (_, app) = app();
        let response = app
            .oneshot(get_req("/api/v1/sandboxes/000000000000", Some("admin-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn session_create_join_activate_flow() {
        let (_, app) = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/sessions",
                Some("admin-key"),
                serde_json::json!({"template_id": "backend-python", "ttl": 3600}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response.into_body()).await;
        let token = created["data"]["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 48);
        assert_eq!(created["data"]["status"], "ready");

        // Public view, no API key.
        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/v1/join/{token}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view = body_json(response.into_body()).await;
        assert_eq!(view["data"]["status"], "ready");
        // The join view never echoes the token.
        assert!(view["data"].get("token").is_none());

        // Idempotent activation.
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/join/{token}/activate"),
                None,
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = body_json(response.into_body()).await;
        assert_eq!(first["data"]["status"], "active");
        let sandbox_id = first["data"]["sandbox_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                &format!("/api/v1/join/{token}/activate"),
                None,
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let second = body_json(response.into_body()).await;
        assert_eq!(second["data"]["sandbox_id"], sandbox_id.as_str());
    }

    #[tokio::test]
    async fn join_unknown_token_is_404() {
        let (_, app) = app();
        let response = app
            .oneshot(get_req("/api/v1/join/deadbeef", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_zero_ttl_is_validation_error() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json(
                "/api/v1/sessions",
                Some("admin-key"),
                serde_json::json!({"template_id": "backend-python", "ttl": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn deactivated_key_is_rejected() {
        let (store, state) = test_state();
        store.insert_client(ApiClient {
            id: Uuid::new_v4(),
            name: "old".into(),
            api_key: "old-key".into(),
            is_active: false,
            permissions: vec!["*".into()],
            created_at: chrono::Utc::now(),
            last_used_at: None,
        });
        let app = router(state);
        let response = app
            .oneshot(get_req("/api/v1/sandboxes", Some("old-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stop_then_stop_conflicts() {
        let (store, state) = test_state();
        let app = router(state.clone());
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/sandboxes",
                Some("admin-key"),
                serde_json::json!({"template_id": "backend-python", "user_id": "u1"}),
            ))
            .await
            .unwrap();
        let created = body_json(response.into_body()).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        // Wait for background provisioning to settle.
        for _ in 0..100 {
            let sandbox = store.get_sandbox(&id).await.unwrap();
            if sandbox.status != crate::model::SandboxStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/sandboxes/{id}/stop"),
                Some("admin-key"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                &format!("/api/v1/sandboxes/{id}/stop"),
                Some("admin-key"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"]["code"], "invalid_request");
    }
}
