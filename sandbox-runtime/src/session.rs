//! Deferred sandbox provisioning through opaque join tokens.
//!
//! A session is an intent to run a sandbox. It stays `ready` until someone
//! presents its token, at which point activation provisions a sandbox
//! exactly once regardless of how many activations race. The store's
//! status compare-and-set is the mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::manager::{CreateOptions, SandboxManager};
use crate::model::{Session, SessionStatus};
use crate::store::SandboxStore;
use crate::util::generate_session_token;

/// How long a lost activation race waits for the winner to settle before
/// returning whatever state the session is in.
const SETTLE_WAIT: Duration = Duration::from_millis(100);
const SETTLE_ATTEMPTS: u32 = 50;

/// Caller-supplied parameters for `create`.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    pub template_id: String,
    pub ttl_seconds: u64,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub services: Option<Vec<String>>,
    pub created_by: String,
}

pub struct SessionManager {
    store: Arc<dyn SandboxStore>,
    sandboxes: Arc<SandboxManager>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SandboxStore>, sandboxes: Arc<SandboxManager>) -> Self {
        Self { store, sandboxes }
    }

    /// Persist a `ready` session with a fresh join token. The TTL clock does
    /// not start until activation.
    pub async fn create(&self, request: SessionRequest) -> Result<Session> {
        if request.template_id.is_empty() {
            return Err(Error::Validation("template_id is required".to_string()));
        }
        if request.ttl_seconds == 0 {
            return Err(Error::Validation("ttl must be positive".to_string()));
        }
        let session = Session {
            id: Uuid::new_v4(),
            token: generate_session_token(),
            template_id: request.template_id,
            status: SessionStatus::Ready,
            status_message: String::new(),
            ttl_seconds: request.ttl_seconds,
            env: request.env,
            metadata: request.metadata,
            services: request.services,
            sandbox_id: None,
            created_at: Utc::now(),
            activated_at: None,
            expires_at: None,
            created_by: request.created_by,
        };
        self.store.create_session(&session).await?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Idempotent activation. The `ready → provisioning` transition is won
    /// by exactly one caller; everyone else observes the winner's outcome.
    pub async fn activate(&self, token: &str) -> Result<Session> {
        let session = self.store.get_session_by_token(token).await?;
        match session.status {
            SessionStatus::Active => return Ok(session),
            SessionStatus::Provisioning => return self.wait_for_settle(token).await,
            SessionStatus::Expired | SessionStatus::Failed => {
                return Err(Error::SessionNotReady(format!("session is {}", session.status)));
            }
            SessionStatus::Ready => {}
        }

        let won = self
            .store
            .compare_and_set_session_status(
                session.id,
                SessionStatus::Ready,
                SessionStatus::Provisioning,
            )
            .await?;
        if !won {
            return self.wait_for_settle(token).await;
        }

        let mut session = session;
        session.status = SessionStatus::Provisioning;

        let opts = CreateOptions {
            ttl: Some(Duration::from_secs(session.ttl_seconds)),
            env: session.env.clone(),
            metadata: session.metadata.clone(),
        };
        match self
            .sandboxes
            .create(&session.template_id, &session.id.to_string(), opts)
            .await
        {
            Ok(sandbox) => {
                let now = Utc::now();
                session.sandbox_id = Some(sandbox.id.clone());
                session.activated_at = Some(now);
                session.expires_at = Some(now + chrono::Duration::seconds(session.ttl_seconds as i64));
                session.status = SessionStatus::Active;
                session.status_message = String::new();
                self.store.update_session(&session).await?;
                info!(session_id = %session.id, sandbox_id = %sandbox.id, "session activated");
                Ok(session)
            }
            Err(err) => {
                session.status = SessionStatus::Failed;
                session.status_message = format!("activation failed: {err}");
                if let Err(update_err) = self.store.update_session(&session).await {
                    warn!(session_id = %session.id, "recording activation failure: {update_err}");
                }
                Err(err)
            }
        }
    }

    /// Delete the session, cascading into its sandbox when one is bound.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let session = self.store.get_session(id).await?;
        if let Some(sandbox_id) = &session.sandbox_id {
            match self.sandboxes.delete(sandbox_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(session_id = %id, sandbox_id = %sandbox_id, "sandbox delete during session delete: {err}");
                }
            }
        }
        self.store.delete_session(id).await?;
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Session> {
        self.store.get_session(id).await
    }

    pub async fn get_by_token(&self, token: &str) -> Result<Session> {
        self.store.get_session_by_token(token).await
    }

    pub async fn list(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        self.store.list_sessions(status, limit, offset).await
    }

    pub async fn expired(&self) -> Result<Vec<Session>> {
        self.store.expired_sessions().await
    }

    /// A concurrent activation is in flight; give the winner a bounded
    /// window to settle so both callers report the same outcome.
    async fn wait_for_settle(&self, token: &str) -> Result<Session> {
        for _ in 0..SETTLE_ATTEMPTS {
            let session = self.store.get_session_by_token(token).await?;
            if session.status != SessionStatus::Provisioning {
                return Ok(session);
            }
            tokio::time::sleep(SETTLE_WAIT).await;
        }
        self.store.get_session_by_token(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, PullPolicy};
    use crate::model::SandboxStatus;
    use crate::providers::ProviderRegistry;
    use crate::store::SandboxFilter;
    use crate::templates::{Template, TemplateCatalog};
    use crate::testing::{MemoryStore, MockProvider, MockRuntime};
    use tokio_util::sync::CancellationToken;

    fn template() -> Template {
        serde_yaml::from_str("name: backend-python\nimage: python:3.12-slim\nservices: [postgres]\n")
            .unwrap()
    }

    fn fixture() -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProvider::new("postgres")));
        let catalog = Arc::new(TemplateCatalog::from_templates(vec![template()]).unwrap());
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
        let sessions = SessionManager::new(store.clone(), manager);
        (store, sessions)
    }

    fn request(ttl: u64) -> SessionRequest {
        SessionRequest {
            template_id: "backend-python".to_string(),
            ttl_seconds: ttl,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_produces_ready_session_with_token() {
        let (_, sessions) = fixture();
        let session = sessions.create(request(3600)).await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.token.len(), 48);
        assert!(session.activated_at.is_none());
        assert!(session.expires_at.is_none());
    }

    #[tokio::test]
    async fn activate_binds_sandbox_owned_by_session() {
        let (store, sessions) = fixture();
        let session = sessions.create(request(3600)).await.unwrap();

        let activated = sessions.activate(&session.token).await.unwrap();
        assert_eq!(activated.status, SessionStatus::Active);
        let sandbox_id = activated.sandbox_id.clone().unwrap();
        assert!(activated.activated_at.is_some());
        assert!(activated.expires_at.is_some());

        let sandbox = store.get_sandbox(&sandbox_id).await.unwrap();
        assert_eq!(sandbox.user_id, session.id.to_string());
    }

    #[tokio::test]
    async fn activate_twice_returns_same_sandbox() {
        let (_, sessions) = fixture();
        let session = sessions.create(request(3600)).await.unwrap();

        let first = sessions.activate(&session.token).await.unwrap();
        let second = sessions.activate(&session.token).await.unwrap();
        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn concurrent_activations_yield_exactly_one_sandbox() {
        let (store, sessions) = fixture();
        let sessions = Arc::new(sessions);
        let session = sessions.create(request(3600)).await.unwrap();

        let a = {
            let sessions = sessions.clone();
            let token = session.token.clone();
            tokio::spawn(async move { sessions.activate(&token).await })
        };
        let b = {
            let sessions = sessions.clone();
            let token = session.token.clone();
            tokio::spawn(async move { sessions.activate(&token).await })
        };
        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();

        assert!(first.sandbox_id.is_some());
        assert_eq!(first.sandbox_id, second.sandbox_id);

        let owned = store
            .list_sandboxes(&SandboxFilter {
                user_id: Some(session.id.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn activate_unknown_template_records_failure() {
        let (store, sessions) = fixture();
        let session = sessions
            .create(SessionRequest {
                template_id: "missing".to_string(),
                ttl_seconds: 3600,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = sessions.activate(&session.token).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));

        let stored = store.get_session(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.status_message.contains("missing"));

        // Terminal sessions refuse further activation.
        let err = sessions.activate(&session.token).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotReady(_)));
    }

    #[tokio::test]
    async fn delete_cascades_into_bound_sandbox() {
        let (store, sessions) = fixture();
        let session = sessions.create(request(3600)).await.unwrap();
        let activated = sessions.activate(&session.token).await.unwrap();
        let sandbox_id = activated.sandbox_id.unwrap();

        // Let the background provisioning settle before deleting.
        for _ in 0..100 {
            let sandbox = store.get_sandbox(&sandbox_id).await.unwrap();
            if sandbox.status != SandboxStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        sessions.delete(session.id).await.unwrap();
        assert!(store.get_session(session.id).await.is_err());
        assert!(store.get_sandbox(&sandbox_id).await.is_err());

        let err = sessions.delete(session.id).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn create_rejects_zero_ttl() {
        let (_, sessions) = fixture();
        let err = sessions.create(request(0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
