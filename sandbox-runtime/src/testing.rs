//! In-memory test doubles for the store, container runtime, and providers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::PullPolicy;
use crate::docker::{ContainerRuntime, ContainerSpec, ExecStream};
use crate::error::{Error, Result};
use crate::model::{
    ApiClient, Sandbox, ServiceCredentials, ServiceInstance, Session, SessionStatus,
};
use crate::providers::ServiceProvider;
use crate::store::{SandboxFilter, SandboxStore};

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    pub sandboxes: Mutex<HashMap<String, Sandbox>>,
    pub services: Mutex<HashMap<String, Vec<ServiceInstance>>>,
    pub sessions: Mutex<HashMap<Uuid, Session>>,
    pub clients: Mutex<HashMap<String, ApiClient>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_client(&self, client: ApiClient) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.api_key.clone(), client);
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        self.sandboxes
            .lock()
            .unwrap()
            .insert(sandbox.id.clone(), sandbox.clone());
        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let mut sandbox = self
            .sandboxes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        if let Some(services) = self.services.lock().unwrap().get(id) {
            sandbox.services = services
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect();
        }
        Ok(sandbox)
    }

    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        if !sandboxes.contains_key(&sandbox.id) {
            return Err(Error::SandboxNotFound(sandbox.id.clone()));
        }
        sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        if self.sandboxes.lock().unwrap().remove(id).is_none() {
            return Err(Error::SandboxNotFound(id.to_string()));
        }
        self.services.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        let mut all: Vec<Sandbox> = self
            .sandboxes
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                filter.user_id.as_ref().is_none_or(|u| &s.user_id == u)
                    && filter.template_id.as_ref().is_none_or(|t| &s.template_id == t)
                    && filter.status.is_none_or(|st| s.status == st)
            })
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn expired_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let now = Utc::now();
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.status.is_terminal() && s.expires_at < now)
            .cloned()
            .collect())
    }

    async fn create_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        let list = services.entry(sandbox_id.to_string()).or_default();
        list.retain(|s| s.name != svc.name);
        list.push(svc.clone());
        Ok(())
    }

    async fn list_services(&self, sandbox_id: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        self.create_service(sandbox_id, svc).await
    }

    async fn delete_services(&self, sandbox_id: &str) -> Result<()> {
        self.services.lock().unwrap().remove(sandbox_id);
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Session> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.token == token)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound("token".to_string()))
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(&session.id) {
            return Err(Error::SessionNotFound(session.id.to_string()));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        if self.sessions.lock().unwrap().remove(&id).is_none() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        _limit: i64,
        _offset: i64,
    ) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect())
    }

    async fn expired_sessions(&self) -> Result<Vec<Session>> {
        let now = Utc::now();
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == SessionStatus::Active && s.expires_at.is_some_and(|e| e < now)
            })
            .cloned()
            .collect())
    }

    async fn compare_and_set_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(session) if session.status == from => {
                session.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::SessionNotFound(id.to_string())),
        }
    }

    async fn client_by_api_key(&self, api_key: &str) -> Result<ApiClient> {
        self.clients
            .lock()
            .unwrap()
            .get(api_key)
            .cloned()
            .ok_or_else(|| Error::Auth("unknown API key".to_string()))
    }

    async fn touch_client_last_used(&self, api_key: &str) -> Result<()> {
        if let Some(client) = self.clients.lock().unwrap().get_mut(api_key) {
            client.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// MockRuntime
// ─────────────────────────────────────────────────────────────────────────────

/// Records container operations; fails on demand.
#[derive(Default)]
pub struct MockRuntime {
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<(String, i64)>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_start: bool,
    pub host_ports: Mutex<HashMap<u16, u16>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, _image: &str, _policy: PullPolicy) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(format!("ctr-{}", spec.name))
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        if self.fail_start {
            return Err(Error::Container("start refused".to_string()));
        }
        self.started.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        self.stopped
            .lock()
            .unwrap()
            .push((container_id.to_string(), timeout_secs));
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn container_logs(&self, _container_id: &str, _tail: Option<u32>) -> Result<Vec<u8>> {
        Ok(b"log line\n".to_vec())
    }

    async fn exec_attach(&self, _container_id: &str) -> Result<(String, ExecStream)> {
        Err(Error::Container("exec not supported by mock".to_string()))
    }

    async fn exec_resize(&self, _exec_id: &str, _rows: u16, _cols: u16) -> Result<()> {
        Ok(())
    }

    async fn published_ports(&self, _container_id: &str) -> Result<HashMap<u16, u16>> {
        Ok(self.host_ports.lock().unwrap().clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockProvider
// ─────────────────────────────────────────────────────────────────────────────

/// Provider that counts calls and can be told to fail provisioning.
pub struct MockProvider {
    service_type: String,
    pub provisioned: AtomicUsize,
    pub deprovisioned: AtomicUsize,
    pub fail_provision: bool,
}

impl MockProvider {
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            provisioned: AtomicUsize::new(0),
            deprovisioned: AtomicUsize::new(0),
            fail_provision: false,
        }
    }

    pub fn failing(service_type: &str) -> Self {
        Self {
            fail_provision: true,
            ..Self::new(service_type)
        }
    }
}

#[async_trait]
impl ServiceProvider for MockProvider {
    fn service_type(&self) -> &str {
        &self.service_type
    }

    async fn provision(&self, sandbox_id: &str, name: &str) -> Result<ServiceCredentials> {
        if self.fail_provision {
            return Err(Error::Provider(format!("{name} backend unavailable")));
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(ServiceCredentials {
            host: format!("{}-host", self.service_type),
            port: Some(5432),
            username: format!("user_{sandbox_id}"),
            password: "secret-password-1".to_string(),
            database: format!("db_{sandbox_id}"),
            ..Default::default()
        })
    }

    async fn deprovision(&self, _sandbox_id: &str, _name: &str) -> Result<()> {
        self.deprovisioned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
