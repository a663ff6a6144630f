//! Sandbox lifecycle orchestration.
//!
//! `create` persists a `pending` row and returns immediately; a detached
//! background task runs the provisioning pipeline (services → image →
//! container) and promotes the row to `running` or `failed`. `delete` is the
//! universal compensator: it works from any state and releases whatever
//! external resources exist at observation time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ProxyConfig, PullPolicy};
use crate::docker::{ContainerRuntime, ContainerSpec, ExecStream};
use crate::error::{Error, Result};
use crate::model::{Sandbox, SandboxStatus, ServiceInstance, ServiceStatus};
use crate::providers::ProviderRegistry;
use crate::store::{SandboxFilter, SandboxStore};
use crate::templates::Template;
use crate::util::generate_sandbox_id;

/// Graceful stop window for an explicit `stop`.
const STOP_TIMEOUT_SECS: i64 = 30;
/// Shorter stop window when the container is about to be removed anyway.
const DELETE_STOP_TIMEOUT_SECS: i64 = 10;
/// In-container mount point of the per-sandbox auxiliary volume.
const AUX_VOLUME_PATH: &str = "/var/lib/sandbox";

/// Caller-supplied overrides for `create`.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub ttl: Option<Duration>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

pub struct SandboxManager {
    store: Arc<dyn SandboxStore>,
    providers: Arc<ProviderRegistry>,
    catalog: Arc<crate::templates::TemplateCatalog>,
    runtime: Arc<dyn ContainerRuntime>,
    pull_policy: PullPolicy,
    network: Option<String>,
    proxy: ProxyConfig,
    public_host: String,
    /// Process-lifetime token. Background provisioning is bound to this,
    /// never to the caller's request.
    shutdown: CancellationToken,
}

impl SandboxManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SandboxStore>,
        providers: Arc<ProviderRegistry>,
        catalog: Arc<crate::templates::TemplateCatalog>,
        runtime: Arc<dyn ContainerRuntime>,
        pull_policy: PullPolicy,
        network: Option<String>,
        proxy: ProxyConfig,
        public_host: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            providers,
            catalog,
            runtime,
            pull_policy,
            network,
            proxy,
            public_host,
            shutdown,
        }
    }

    /// Validate the template, persist a `pending` row, and kick off
    /// provisioning in the background. Returns as soon as the row is
    /// durable; status converges to `running` or `failed` asynchronously.
    pub async fn create(
        self: &Arc<Self>,
        template_id: &str,
        user_id: &str,
        opts: CreateOptions,
    ) -> Result<Sandbox> {
        let template = self
            .catalog
            .get(template_id)
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?
            .clone();

        let id = generate_sandbox_id();
        let now = Utc::now();
        let ttl = opts
            .ttl
            .unwrap_or_else(|| Duration::from_secs(template.ttl_seconds()));

        let sandbox = Sandbox {
            id: id.clone(),
            template_id: template.name.clone(),
            user_id: user_id.to_string(),
            status: SandboxStatus::Pending,
            status_message: String::new(),
            container_id: String::new(),
            created_at: now,
            started_at: None,
            expires_at: now
                + chrono::Duration::from_std(ttl)
                    .map_err(|_| Error::Validation("ttl out of range".to_string()))?,
            services: HashMap::new(),
            endpoints: HashMap::new(),
            metadata: opts.metadata.clone(),
        };
        self.store.create_sandbox(&sandbox).await?;

        let manager = Arc::clone(self);
        let background = sandbox.clone();
        let background_id = background.id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(sandbox_id = %background_id, "shutdown during provisioning");
                }
                _ = manager.provision(background, template, opts.env) => {}
            }
        });

        Ok(sandbox)
    }

    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.store.get_sandbox(id).await
    }

    pub async fn list(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        self.store.list_sandboxes(filter).await
    }

    pub async fn expired(&self) -> Result<Vec<Sandbox>> {
        self.store.expired_sandboxes().await
    }

    /// Graceful stop. Keeps the row and its services; `delete` is the only
    /// path that releases external resources.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut sandbox = self.store.get_sandbox(id).await?;
        if sandbox.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "sandbox '{id}' is already {}",
                sandbox.status
            )));
        }
        if !sandbox.container_id.is_empty() {
            if let Err(err) = self
                .runtime
                .stop_container(&sandbox.container_id, STOP_TIMEOUT_SECS)
                .await
            {
                warn!(sandbox_id = %id, "container stop failed: {err}");
            }
        }
        sandbox.status = SandboxStatus::Stopped;
        sandbox.status_message = String::new();
        self.store.update_sandbox(&sandbox).await?;
        info!(sandbox_id = %id, "sandbox stopped");
        Ok(())
    }

    /// Compensating cleanup from any state: container, then provider
    /// resources, then the row (service rows cascade). Individual failures
    /// are logged and skipped so half-provisioned sandboxes still converge.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let sandbox = self.store.get_sandbox(id).await?;

        if !sandbox.container_id.is_empty() {
            if let Err(err) = self
                .runtime
                .stop_container(&sandbox.container_id, DELETE_STOP_TIMEOUT_SECS)
                .await
            {
                warn!(sandbox_id = %id, "container stop during delete: {err}");
            }
            if let Err(err) = self.runtime.remove_container(&sandbox.container_id).await {
                warn!(sandbox_id = %id, "container remove during delete: {err}");
            }
        }

        for name in sandbox.services.keys() {
            match self.providers.get(name) {
                Some(provider) => {
                    if let Err(err) = provider.deprovision(id, name).await {
                        error!(sandbox_id = %id, service = %name, "deprovision failed: {err}");
                    }
                }
                None => {
                    warn!(sandbox_id = %id, service = %name, "no provider for service, skipping");
                }
            }
        }

        self.store.delete_sandbox(id).await?;
        info!(sandbox_id = %id, "sandbox deleted");
        Ok(())
    }

    /// Push `expires_at` out by `duration`. Callers are trusted; no cap.
    pub async fn extend_ttl(&self, id: &str, duration: Duration) -> Result<()> {
        let mut sandbox = self.store.get_sandbox(id).await?;
        if sandbox.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "sandbox '{id}' is already {}",
                sandbox.status
            )));
        }
        sandbox.expires_at = sandbox.expires_at
            + chrono::Duration::from_std(duration)
                .map_err(|_| Error::Validation("duration out of range".to_string()))?;
        self.store.update_sandbox(&sandbox).await?;
        Ok(())
    }

    pub async fn logs(&self, id: &str, tail: Option<u32>) -> Result<Vec<u8>> {
        let sandbox = self.store.get_sandbox(id).await?;
        if sandbox.container_id.is_empty() {
            return Err(Error::Conflict(format!("sandbox '{id}' has no container yet")));
        }
        self.runtime.container_logs(&sandbox.container_id, tail).await
    }

    pub async fn exec_attach(&self, container_id: &str) -> Result<(String, ExecStream)> {
        self.runtime.exec_attach(container_id).await
    }

    pub async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.runtime.exec_resize(exec_id, rows, cols).await
    }

    /// Healthy only when both the container runtime and the store answer.
    pub async fn ping(&self) -> Result<()> {
        self.runtime
            .ping()
            .await
            .map_err(|err| Error::Container(format!("container runtime unhealthy: {err}")))?;
        self.store
            .ping()
            .await
            .map_err(|err| Error::Storage(format!("store unhealthy: {err}")))?;
        Ok(())
    }

    // ── Background provisioning pipeline ────────────────────────────────────

    /// Runs detached from the creating request. Never panics; every failure
    /// is captured into the row as `failed` plus a reason.
    pub(crate) async fn provision(
        &self,
        mut sandbox: Sandbox,
        template: Template,
        extra_env: HashMap<String, String>,
    ) {
        for name in &template.services {
            let Some(provider) = self.providers.get(name) else {
                self.fail(&mut sandbox, format!("unknown service '{name}'")).await;
                return;
            };
            let credentials = match provider.provision(&sandbox.id, name).await {
                Ok(credentials) => credentials,
                Err(err) => {
                    // No rollback here: `delete` compensates for everything
                    // provisioned so far.
                    self.fail(&mut sandbox, format!("provisioning service '{name}' failed: {err}"))
                        .await;
                    return;
                }
            };
            let instance = ServiceInstance {
                name: name.clone(),
                service_type: name.clone(),
                status: ServiceStatus::Ready,
                credentials,
                created_at: Utc::now(),
            };
            if let Err(err) = self.store.create_service(&sandbox.id, &instance).await {
                self.fail(&mut sandbox, format!("recording service '{name}' failed: {err}"))
                    .await;
                return;
            }
            sandbox.services.insert(name.clone(), instance);
        }

        if let Err(err) = self
            .runtime
            .ensure_image(&template.image, self.pull_policy)
            .await
        {
            self.fail(&mut sandbox, format!("image '{}': {err}", template.image))
                .await;
            return;
        }

        let env = build_env(&template, &sandbox, &extra_env);
        let labels = build_labels(&template, &sandbox, &self.proxy);
        let publish: Vec<u16> = template
            .ports
            .iter()
            .filter(|p| p.public)
            .map(|p| p.container_port)
            .collect();
        let mut binds = vec![format!("sandbox-{}-aux:{AUX_VOLUME_PATH}", sandbox.id)];
        binds.extend(template.volumes.iter().cloned());

        let spec = ContainerSpec {
            name: sandbox.container_name(),
            image: template.image.clone(),
            env,
            ports: template
                .ports
                .iter()
                .map(|p| (p.container_port, p.protocol.clone()))
                .collect(),
            publish,
            labels,
            network: self.network.clone(),
            binds,
        };

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(container_id) => container_id,
            Err(err) => {
                self.fail(&mut sandbox, format!("container create failed: {err}")).await;
                return;
            }
        };
        sandbox.container_id = container_id.clone();
        if let Err(err) = self.store.update_sandbox(&sandbox).await {
            error!(sandbox_id = %sandbox.id, "persisting container id failed: {err}");
        }

        if let Err(err) = self.runtime.start_container(&container_id).await {
            self.fail(&mut sandbox, format!("container start failed: {err}")).await;
            return;
        }

        sandbox.endpoints = match self.compute_endpoints(&template, &sandbox).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!(sandbox_id = %sandbox.id, "endpoint discovery failed: {err}");
                HashMap::new()
            }
        };
        sandbox.status = SandboxStatus::Running;
        sandbox.started_at = Some(Utc::now());
        sandbox.status_message = String::new();
        if let Err(err) = self.store.update_sandbox(&sandbox).await {
            error!(sandbox_id = %sandbox.id, "persisting running state failed: {err}");
            return;
        }
        info!(sandbox_id = %sandbox.id, container_id = %container_id, "sandbox running");
    }

    async fn fail(&self, sandbox: &mut Sandbox, message: String) {
        error!(sandbox_id = %sandbox.id, "provisioning failed: {message}");
        sandbox.status = SandboxStatus::Failed;
        sandbox.status_message = message;
        if let Err(err) = self.store.update_sandbox(sandbox).await {
            error!(sandbox_id = %sandbox.id, "recording failure state failed: {err}");
        }
    }

    /// Symbolic name → URL map for every public template port.
    async fn compute_endpoints(
        &self,
        template: &Template,
        sandbox: &Sandbox,
    ) -> Result<HashMap<String, String>> {
        let mut endpoints = HashMap::new();
        let public_ports: Vec<_> = template.ports.iter().filter(|p| p.public).collect();
        if public_ports.is_empty() {
            return Ok(endpoints);
        }

        if self.proxy.enabled && !self.proxy.domain.is_empty() {
            endpoints.insert(
                "default".to_string(),
                format!("https://{}.{}", sandbox.id, self.proxy.domain),
            );
            for port in &public_ports {
                endpoints.insert(
                    port.name.clone(),
                    format!("https://{}-{}.{}", sandbox.id, port.name, self.proxy.domain),
                );
            }
            return Ok(endpoints);
        }

        let host_ports = self.runtime.published_ports(&sandbox.container_id).await?;
        for port in &public_ports {
            if let Some(host_port) = host_ports.get(&port.container_port) {
                endpoints.insert(
                    port.name.clone(),
                    format!("http://{}:{}", self.public_host, host_port),
                );
            }
        }
        Ok(endpoints)
    }
}

/// Compose the container environment: template env, then per-service
/// connection variables, then caller overrides, with the sandbox identity
/// appended last. Deterministically ordered.
pub(crate) fn build_env(
    template: &Template,
    sandbox: &Sandbox,
    extra_env: &HashMap<String, String>,
) -> Vec<String> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in &template.env {
        merged.insert(key.clone(), value.clone());
    }

    for (name, instance) in &sandbox.services {
        let upper = name.to_uppercase();
        let credentials = &instance.credentials;
        let mut set = |suffix: &str, value: String| {
            if !value.is_empty() {
                merged.insert(format!("{upper}_{suffix}"), value);
            }
        };
        set("HOST", credentials.host.clone());
        set("PORT", credentials.port.map(|p| p.to_string()).unwrap_or_default());
        set("USER", credentials.username.clone());
        set("PASSWORD", credentials.password.clone());
        set("DATABASE", credentials.database.clone());
        set("URI", credentials.uri.clone());
        set("PREFIX", credentials.prefix.clone());
    }

    for (key, value) in extra_env {
        merged.insert(key.clone(), value.clone());
    }

    merged.insert("SANDBOX_ID".to_string(), sandbox.id.clone());
    merged.insert("SANDBOX_USER_ID".to_string(), sandbox.user_id.clone());

    merged
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Identity labels, template labels, and (when the proxy is on) routing
/// labels with hostnames `<id>.<domain>` and `<id>-<portname>.<domain>`.
pub(crate) fn build_labels(
    template: &Template,
    sandbox: &Sandbox,
    proxy: &ProxyConfig,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("sandbox.id".to_string(), sandbox.id.clone());
    labels.insert("sandbox.user".to_string(), sandbox.user_id.clone());
    labels.insert("sandbox.template".to_string(), sandbox.template_id.clone());
    labels.insert("sandbox.managed".to_string(), "true".to_string());
    for (key, value) in &template.labels {
        labels.insert(key.clone(), value.clone());
    }

    let public_ports: Vec<_> = template.ports.iter().filter(|p| p.public).collect();
    if !proxy.enabled || proxy.domain.is_empty() || public_ports.is_empty() {
        return labels;
    }

    labels.insert("traefik.enable".to_string(), "true".to_string());
    let default_router = format!("sandbox-{}", sandbox.id);
    labels.insert(
        format!("traefik.http.routers.{default_router}.rule"),
        format!("Host(`{}.{}`)", sandbox.id, proxy.domain),
    );
    labels.insert(
        format!("traefik.http.services.{default_router}.loadbalancer.server.port"),
        public_ports[0].container_port.to_string(),
    );
    if !proxy.cert_resolver.is_empty() {
        labels.insert(
            format!("traefik.http.routers.{default_router}.tls.certresolver"),
            proxy.cert_resolver.clone(),
        );
    }
    for port in &public_ports {
        let router = format!("sandbox-{}-{}", sandbox.id, port.name);
        labels.insert(
            format!("traefik.http.routers.{router}.rule"),
            format!("Host(`{}-{}.{}`)", sandbox.id, port.name, proxy.domain),
        );
        labels.insert(
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.container_port.to_string(),
        );
        if !proxy.cert_resolver.is_empty() {
            labels.insert(
                format!("traefik.http.routers.{router}.tls.certresolver"),
                proxy.cert_resolver.clone(),
            );
        }
    }
    labels
}
