//! Durable state for sandboxes, services, sessions, and API clients.
//!
//! The store is the single source of truth: components read freshly and
//! persist every transition; nothing is cached in-process. Postgres is the
//! backing dialect; business rules beyond uniqueness and cascade live in the
//! callers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    ApiClient, Sandbox, SandboxStatus, ServiceInstance, Session, SessionStatus,
};

/// Page size substituted when a caller passes `limit = 0`.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Filters for sandbox listing. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct SandboxFilter {
    pub user_id: Option<String>,
    pub template_id: Option<String>,
    pub status: Option<SandboxStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Capability set over persistent state. Mutations are visible once the call
/// returns; a `get` after `create` observes the row. Not-found is signaled
/// through the dedicated `*NotFound` error variants, never as a storage
/// failure.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    // ── Sandboxes ───────────────────────────────────────────────────────────
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()>;
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox>;
    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<()>;
    async fn delete_sandbox(&self, id: &str) -> Result<()>;
    async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>>;
    /// Non-terminal sandboxes whose `expires_at` is in the past.
    async fn expired_sandboxes(&self) -> Result<Vec<Sandbox>>;

    // ── Service instances ───────────────────────────────────────────────────
    /// Upserts on `(sandbox_id, service_name)`.
    async fn create_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()>;
    async fn list_services(&self, sandbox_id: &str) -> Result<Vec<ServiceInstance>>;
    async fn update_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()>;
    async fn delete_services(&self, sandbox_id: &str) -> Result<()>;

    // ── Sessions ────────────────────────────────────────────────────────────
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: Uuid) -> Result<Session>;
    async fn get_session_by_token(&self, token: &str) -> Result<Session>;
    async fn update_session(&self, session: &Session) -> Result<()>;
    async fn delete_session(&self, id: Uuid) -> Result<()>;
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>>;
    /// Active sessions whose `expires_at` is in the past.
    async fn expired_sessions(&self) -> Result<Vec<Session>>;
    /// Atomic status transition guard: flips `from` to `to` and reports
    /// whether this call won the transition. Concurrent activations race
    /// through here; exactly one observes `true`.
    async fn compare_and_set_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool>;

    // ── API clients ─────────────────────────────────────────────────────────
    async fn client_by_api_key(&self, api_key: &str) -> Result<ApiClient>;
    async fn touch_client_last_used(&self, api_key: &str) -> Result<()>;

    // ── Health ──────────────────────────────────────────────────────────────
    async fn ping(&self) -> Result<()>;
    async fn close(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Postgres implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Postgres-backed [`SandboxStore`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect, bounded by the caller's timeout, and run embedded migrations.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| Error::Storage(format!("migrations failed: {err}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with the database service provider).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn sandbox_from_row(row: &PgRow) -> Result<Sandbox> {
        let status: String = row.try_get("status")?;
        let metadata: serde_json::Value = row.try_get("metadata_json")?;
        let endpoints: serde_json::Value = row.try_get("endpoints_json")?;
        Ok(Sandbox {
            id: row.try_get("id")?,
            template_id: row.try_get("template_id")?,
            user_id: row.try_get("user_id")?,
            status: status.parse()?,
            status_message: row.try_get("status_message")?,
            container_id: row.try_get("container_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            expires_at: row.try_get("expires_at")?,
            services: HashMap::new(),
            endpoints: serde_json::from_value(endpoints)
                .map_err(|err| Error::Storage(format!("bad endpoints_json: {err}")))?,
            metadata: serde_json::from_value(metadata)
                .map_err(|err| Error::Storage(format!("bad metadata_json: {err}")))?,
        })
    }

    fn service_from_row(row: &PgRow) -> Result<ServiceInstance> {
        let status: String = row.try_get("status")?;
        let credentials: serde_json::Value = row.try_get("credentials_json")?;
        Ok(ServiceInstance {
            name: row.try_get("service_name")?,
            service_type: row.try_get("service_type")?,
            status: status.parse()?,
            credentials: serde_json::from_value(credentials)
                .map_err(|err| Error::Storage(format!("bad credentials_json: {err}")))?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn session_from_row(row: &PgRow) -> Result<Session> {
        let status: String = row.try_get("status")?;
        let env: serde_json::Value = row.try_get("env_json")?;
        let metadata: serde_json::Value = row.try_get("metadata_json")?;
        let services: Option<serde_json::Value> = row.try_get("services_json")?;
        let ttl: i64 = row.try_get("ttl_seconds")?;
        Ok(Session {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            template_id: row.try_get("template_id")?,
            status: status.parse()?,
            status_message: row.try_get("status_message")?,
            ttl_seconds: ttl.max(0) as u64,
            env: serde_json::from_value(env)
                .map_err(|err| Error::Storage(format!("bad env_json: {err}")))?,
            metadata: serde_json::from_value(metadata)
                .map_err(|err| Error::Storage(format!("bad metadata_json: {err}")))?,
            services: services
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| Error::Storage(format!("bad services_json: {err}")))?,
            sandbox_id: row.try_get("sandbox_id")?,
            created_at: row.try_get("created_at")?,
            activated_at: row.try_get("activated_at")?,
            expires_at: row.try_get("expires_at")?,
            created_by: row.try_get("created_by")?,
        })
    }

    fn client_from_row(row: &PgRow) -> Result<ApiClient> {
        let permissions: serde_json::Value = row.try_get("permissions_json")?;
        Ok(ApiClient {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            api_key: row.try_get("api_key")?,
            is_active: row.try_get("is_active")?,
            permissions: serde_json::from_value(permissions)
                .map_err(|err| Error::Storage(format!("bad permissions_json: {err}")))?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }

    /// Attach service rows to their sandboxes; services are eagerly joined
    /// into every read path.
    async fn hydrate_services(&self, sandboxes: &mut [Sandbox]) -> Result<()> {
        if sandboxes.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = sandboxes.iter().map(|s| s.id.clone()).collect();
        let rows = sqlx::query(
            "SELECT sandbox_id, service_name, service_type, status, credentials_json, created_at \
             FROM sandbox_services WHERE sandbox_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_sandbox: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for row in &rows {
            let sandbox_id: String = row.try_get("sandbox_id")?;
            by_sandbox
                .entry(sandbox_id)
                .or_default()
                .push(Self::service_from_row(row)?);
        }
        for sandbox in sandboxes.iter_mut() {
            if let Some(services) = by_sandbox.remove(&sandbox.id) {
                sandbox.services = services.into_iter().map(|s| (s.name.clone(), s)).collect();
            }
        }
        Ok(())
    }
}

fn normalize_page(limit: i64, offset: i64) -> (i64, i64) {
    let limit = if limit <= 0 { DEFAULT_PAGE_SIZE } else { limit };
    (limit, offset.max(0))
}

fn map_to_json(map: &HashMap<String, String>) -> serde_json::Value {
    serde_json::to_value(map).unwrap_or_else(|_| serde_json::json!({}))
}

#[async_trait]
impl SandboxStore for PgStore {
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        sqlx::query(
            "INSERT INTO sandboxes \
             (id, template_id, user_id, status, status_message, container_id, \
              created_at, started_at, expires_at, metadata_json, endpoints_json) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&sandbox.id)
        .bind(&sandbox.template_id)
        .bind(&sandbox.user_id)
        .bind(sandbox.status.as_str())
        .bind(&sandbox.status_message)
        .bind(&sandbox.container_id)
        .bind(sandbox.created_at)
        .bind(sandbox.started_at)
        .bind(sandbox.expires_at)
        .bind(map_to_json(&sandbox.metadata))
        .bind(map_to_json(&sandbox.endpoints))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let row = sqlx::query("SELECT * FROM sandboxes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        let mut sandboxes = vec![Self::sandbox_from_row(&row)?];
        self.hydrate_services(&mut sandboxes).await?;
        Ok(sandboxes.remove(0))
    }

    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET status = $2, status_message = $3, container_id = $4, \
             started_at = $5, expires_at = $6, metadata_json = $7, endpoints_json = $8 \
             WHERE id = $1",
        )
        .bind(&sandbox.id)
        .bind(sandbox.status.as_str())
        .bind(&sandbox.status_message)
        .bind(&sandbox.container_id)
        .bind(sandbox.started_at)
        .bind(sandbox.expires_at)
        .bind(map_to_json(&sandbox.metadata))
        .bind(map_to_json(&sandbox.endpoints))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SandboxNotFound(sandbox.id.clone()));
        }
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        // Service rows go with the sandbox via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM sandboxes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SandboxNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        let (limit, offset) = normalize_page(filter.limit, filter.offset);
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM sandboxes WHERE TRUE");
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(template_id) = &filter.template_id {
            builder.push(" AND template_id = ").push_bind(template_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut sandboxes = rows
            .iter()
            .map(Self::sandbox_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.hydrate_services(&mut sandboxes).await?;
        Ok(sandboxes)
    }

    async fn expired_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            "SELECT * FROM sandboxes \
             WHERE status NOT IN ('stopped', 'failed', 'expired') AND expires_at < $1",
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        let mut sandboxes = rows
            .iter()
            .map(Self::sandbox_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.hydrate_services(&mut sandboxes).await?;
        Ok(sandboxes)
    }

    async fn create_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        let credentials = serde_json::to_value(&svc.credentials)
            .map_err(|err| Error::Storage(format!("bad credentials: {err}")))?;
        sqlx::query(
            "INSERT INTO sandbox_services \
             (id, sandbox_id, service_name, service_type, status, credentials_json, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (sandbox_id, service_name) DO UPDATE SET \
             service_type = EXCLUDED.service_type, status = EXCLUDED.status, \
             credentials_json = EXCLUDED.credentials_json",
        )
        .bind(Uuid::new_v4())
        .bind(sandbox_id)
        .bind(&svc.name)
        .bind(&svc.service_type)
        .bind(svc.status.as_str())
        .bind(credentials)
        .bind(svc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_services(&self, sandbox_id: &str) -> Result<Vec<ServiceInstance>> {
        let rows = sqlx::query(
            "SELECT sandbox_id, service_name, service_type, status, credentials_json, created_at \
             FROM sandbox_services WHERE sandbox_id = $1 ORDER BY created_at",
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::service_from_row).collect()
    }

    async fn update_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        self.create_service(sandbox_id, svc).await
    }

    async fn delete_services(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sandbox_services WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let services = session
            .services
            .as_ref()
            .map(|s| serde_json::to_value(s).unwrap_or_default());
        sqlx::query(
            "INSERT INTO sessions \
             (id, token, template_id, status, status_message, env_json, metadata_json, \
              services_json, ttl_seconds, sandbox_id, created_at, activated_at, expires_at, \
              created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(session.id)
        .bind(&session.token)
        .bind(&session.template_id)
        .bind(session.status.as_str())
        .bind(&session.status_message)
        .bind(map_to_json(&session.env))
        .bind(map_to_json(&session.metadata))
        .bind(services)
        .bind(session.ttl_seconds as i64)
        .bind(&session.sandbox_id)
        .bind(session.created_at)
        .bind(session.activated_at)
        .bind(session.expires_at)
        .bind(&session.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        Self::session_from_row(&row)
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::SessionNotFound("token".to_string()))?;
        Self::session_from_row(&row)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET status = $2, status_message = $3, sandbox_id = $4, \
             activated_at = $5, expires_at = $6 WHERE id = $1",
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(&session.status_message)
        .bind(&session.sandbox_id)
        .bind(session.activated_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(session.id.to_string()));
        }
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let (limit, offset) = normalize_page(limit, offset);
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM sessions WHERE TRUE");
        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn expired_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'active' AND expires_at < $1",
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn compare_and_set_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn client_by_api_key(&self, api_key: &str) -> Result<ApiClient> {
        let row = sqlx::query("SELECT * FROM api_clients WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Auth("unknown API key".to_string()))?;
        Self::client_from_row(&row)
    }

    async fn touch_client_last_used(&self, api_key: &str) -> Result<()> {
        sqlx::query("UPDATE api_clients SET last_used_at = $2 WHERE api_key = $1")
            .bind(api_key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_substitutes_default_page_size() {
        assert_eq!(normalize_page(0, 0), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(normalize_page(-3, -7), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(normalize_page(10, 20), (10, 20));
    }
}
