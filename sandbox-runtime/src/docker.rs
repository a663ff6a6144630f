//! Container runtime plumbing.
//!
//! [`ContainerRuntime`] is the capability set the manager and terminal
//! depend on; [`DockerRuntime`] implements it over the bollard client that
//! docktopus exposes. Container mutations are not transactional with the
//! store; callers compensate through `delete`.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use docktopus::bollard::exec::{
    CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use docktopus::bollard::image::CreateImageOptions;
use docktopus::bollard::models::{
    HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum,
};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWrite;

use crate::config::PullPolicy;
use crate::error::{Error, Result};

/// Everything needed to create one sandbox container.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `(container_port, protocol)` pairs to expose.
    pub ports: Vec<(u16, String)>,
    /// Container ports published to an ephemeral host port.
    pub publish: Vec<u16>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    /// `source:container_path` bind specifications.
    pub binds: Vec<String>,
}

/// Full-duplex byte stream attached to a container exec.
///
/// The output half is safe to read while another task writes to the input
/// half.
pub struct ExecStream {
    pub output: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Capability set over the external container backend.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is locally available according to `policy`. Pull
    /// output is drained and discarded.
    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<()>;

    /// Create (but do not start) a container; returns the runtime's id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Graceful stop with the given timeout before the runtime kills.
    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()>;

    /// Force-remove, tolerating an already-stopped container.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn container_logs(&self, container_id: &str, tail: Option<u32>) -> Result<Vec<u8>>;

    /// Open an interactive login shell exec with TTY; returns the exec id
    /// and the attached duplex stream.
    async fn exec_attach(&self, container_id: &str) -> Result<(String, ExecStream)>;

    async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()>;

    /// Published host ports keyed by container port.
    async fn published_ports(&self, container_id: &str) -> Result<HashMap<u16, u16>>;

    async fn ping(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Docker implementation
// ─────────────────────────────────────────────────────────────────────────────

pub struct DockerRuntime {
    builder: DockerBuilder,
}

impl DockerRuntime {
    /// Connect to the Docker daemon, honoring an explicit host when given.
    pub async fn connect(host: Option<&str>) -> Result<Self> {
        let builder = match host {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                Error::Container(format!("failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new()
                .await
                .map_err(|err| Error::Container(format!("failed to connect to docker: {err}")))?,
        };
        Ok(Self { builder })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let client = self.builder.client();
        let mut stream = client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress
                .map_err(|err| Error::Container(format!("failed to pull image {image}: {err}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<()> {
        match policy {
            PullPolicy::Never => Ok(()),
            PullPolicy::Always => self.pull_image(image).await,
            PullPolicy::IfNotPresent => {
                if self.builder.client().inspect_image(image).await.is_ok() {
                    return Ok(());
                }
                self.pull_image(image).await
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        for (port, protocol) in &spec.ports {
            exposed_ports.insert(format!("{port}/{protocol}"), HashMap::new());
        }

        let mut port_bindings = PortMap::new();
        for port in &spec.publish {
            let protocol = spec
                .ports
                .iter()
                .find(|(p, _)| p == port)
                .map(|(_, proto)| proto.as_str())
                .unwrap_or("tcp");
            port_bindings.insert(
                format!("{port}/{protocol}"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: None,
                }]),
            );
        }

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: spec.network.clone(),
            auto_remove: Some(false),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            ..Default::default()
        };

        // TTY plus open attached stdin make later exec attach behave like a
        // terminal.
        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .builder
            .client()
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| Error::Container(format!("failed to create container: {err}")))?;
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.builder
            .client()
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| Error::Container(format!("failed to start container: {err}")))
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        self.builder
            .client()
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|err| Error::Container(format!("failed to stop container: {err}")))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.builder
            .client()
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| Error::Container(format!("failed to remove container: {err}")))
    }

    async fn container_logs(&self, container_id: &str, tail: Option<u32>) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = self.builder.client().logs(container_id, Some(options));
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| Error::Container(format!("failed to read logs: {err}")))?;
            collected.extend_from_slice(&chunk.into_bytes());
        }
        Ok(collected)
    }

    async fn exec_attach(&self, container_id: &str) -> Result<(String, ExecStream)> {
        let client = self.builder.client();
        let exec = client
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec![
                        "TERM=xterm-256color".to_string(),
                        "COLORTERM=truecolor".to_string(),
                    ]),
                    cmd: Some(vec!["/bin/bash".to_string(), "--login".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| Error::Container(format!("failed to create exec: {err}")))?;

        let started = client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| Error::Container(format!("failed to start exec: {err}")))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|item| {
                        item.map(|log| log.into_bytes()).map_err(|err| {
                            Error::Container(format!("exec stream error: {err}"))
                        })
                    })
                    .boxed();
                Ok((exec.id, ExecStream { output, input }))
            }
            StartExecResults::Detached => {
                Err(Error::Container("exec started detached".to_string()))
            }
        }
    }

    async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.builder
            .client()
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|err| Error::Container(format!("failed to resize exec: {err}")))
    }

    async fn published_ports(&self, container_id: &str) -> Result<HashMap<u16, u16>> {
        let inspect = self
            .builder
            .client()
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| Error::Container(format!("failed to inspect container: {err}")))?;

        let mut ports = HashMap::new();
        let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref())
        else {
            return Ok(ports);
        };
        for (key, bindings) in port_map {
            let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|binding| binding.host_port.as_ref())
                .and_then(|p| p.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                ports.insert(container_port, host_port);
            }
        }
        Ok(ports)
    }

    async fn ping(&self) -> Result<()> {
        self.builder
            .client()
            .ping()
            .await
            .map_err(|err| Error::Container(format!("docker ping failed: {err}")))?;
        Ok(())
    }
}
