//! TTL enforcement over sandboxes and sessions.
//!
//! Sandbox TTL is measured from creation, session TTL from activation, and
//! the two are swept independently so that either path alone converges.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::MIN_CLEANUP_INTERVAL;
use crate::manager::SandboxManager;
use crate::session::SessionManager;

pub struct Reaper {
    sandboxes: Arc<SandboxManager>,
    sessions: Arc<SessionManager>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        sandboxes: Arc<SandboxManager>,
        sessions: Arc<SessionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            sandboxes,
            sessions,
            interval: interval.max(MIN_CLEANUP_INTERVAL),
        }
    }

    /// Sweep immediately, then on every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reaper stopping");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One sweep. Failures are logged and the sweep continues; the next
    /// cycle retries whatever was left behind.
    pub async fn tick(&self) {
        match self.sandboxes.expired().await {
            Ok(expired) => {
                for sandbox in expired {
                    info!(sandbox_id = %sandbox.id, "reaping expired sandbox");
                    if let Err(err) = self.sandboxes.delete(&sandbox.id).await {
                        error!(sandbox_id = %sandbox.id, "reap failed: {err}");
                    }
                }
            }
            Err(err) => error!("loading expired sandboxes failed: {err}"),
        }

        match self.sessions.expired().await {
            Ok(expired) => {
                for session in expired {
                    info!(session_id = %session.id, "reaping expired session");
                    if let Err(err) = self.sessions.delete(session.id).await {
                        error!(session_id = %session.id, "reap failed: {err}");
                    }
                }
            }
            Err(err) => error!("loading expired sessions failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, PullPolicy};
    use crate::model::{Sandbox, SandboxStatus, Session, SessionStatus};
    use crate::providers::ProviderRegistry;
    use crate::session::SessionManager;
    use crate::store::SandboxStore;
    use crate::templates::TemplateCatalog;
    use crate::testing::{MemoryStore, MockProvider, MockRuntime};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn fixture() -> (Arc<MemoryStore>, Reaper) {
        let store = Arc::new(MemoryStore::new());
        let providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProvider::new("postgres")));
        let catalog = Arc::new(
            TemplateCatalog::from_templates(vec![
                serde_yaml::from_str("name: t\nimage: i\n").unwrap(),
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
        let reaper = Reaper::new(manager, sessions, Duration::from_secs(300));
        (store, reaper)
    }

    fn expired_sandbox(id: &str) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: id.to_string(),
            template_id: "t".to_string(),
            user_id: "u".to_string(),
            status: SandboxStatus::Running,
            status_message: String::new(),
            container_id: String::new(),
            created_at: now - chrono::Duration::seconds(120),
            started_at: Some(now - chrono::Duration::seconds(110)),
            expires_at: now - chrono::Duration::seconds(10),
            services: HashMap::new(),
            endpoints: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn tick_deletes_expired_sandboxes_only() {
        let (store, reaper) = fixture();
        store.create_sandbox(&expired_sandbox("aaa111")).await.unwrap();
        let mut live = expired_sandbox("bbb222");
        live.expires_at = Utc::now() + chrono::Duration::seconds(600);
        store.create_sandbox(&live).await.unwrap();

        reaper.tick().await;

        assert!(store.get_sandbox("aaa111").await.is_err());
        assert!(store.get_sandbox("bbb222").await.is_ok());
    }

    #[tokio::test]
    async fn tick_skips_terminal_sandboxes() {
        let (store, reaper) = fixture();
        let mut stopped = expired_sandbox("ccc333");
        stopped.status = SandboxStatus::Stopped;
        store.create_sandbox(&stopped).await.unwrap();

        reaper.tick().await;

        // Terminal rows are not the reaper's to delete.
        assert!(store.get_sandbox("ccc333").await.is_ok());
    }

    #[tokio::test]
    async fn tick_deletes_expired_sessions_and_their_sandboxes() {
        let (store, reaper) = fixture();
        store.create_sandbox(&expired_sandbox("ddd444")).await.unwrap();
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            token: "tok".to_string(),
            template_id: "t".to_string(),
            status: SessionStatus::Active,
            status_message: String::new(),
            ttl_seconds: 60,
            env: HashMap::new(),
            metadata: HashMap::new(),
            services: None,
            sandbox_id: Some("ddd444".to_string()),
            created_at: now - chrono::Duration::seconds(300),
            activated_at: Some(now - chrono::Duration::seconds(120)),
            expires_at: Some(now - chrono::Duration::seconds(60)),
            created_by: String::new(),
        };
        store.create_session(&session).await.unwrap();

        reaper.tick().await;

        assert!(store.get_session(session.id).await.is_err());
        assert!(store.get_sandbox("ddd444").await.is_err());
    }

    #[test]
    fn interval_is_floored() {
        let (_, reaper) = fixture();
        let reaper = Reaper::new(reaper.sandboxes, reaper.sessions, Duration::from_secs(1));
        assert_eq!(reaper.interval, MIN_CLEANUP_INTERVAL);
    }
}
