//! Uniform client surface over docker, containerd and generic CRI runtimes.

use std::{collections::HashMap, future::Future, io, path::Path, time::Duration};

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::RuntimeError,
    flags::{RuntimeKind, RuntimeOptions},
    nsexec::BinPaths,
};

mod containerd;
mod cri;
mod docker;

pub(crate) use containerd::ContainerdClient;
pub(crate) use cri::CriClient;
pub(crate) use docker::DockerClient;

/// The resolved target of one dispatch.
///
/// Valid only for the duration of that dispatch; PIDs and handles are never
/// cached across calls.
#[derive(Debug, Clone, Default)]
pub struct ContainerHandle {
    /// Runtime-specific container id.
    pub id: String,
    /// Human name; may be empty for containerd.
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Raw OCI runtime spec bytes, when the runtime exposes them.
    pub runtime_spec: Option<Vec<u8>>,
}

/// Everything needed to run a short-lived sidecar next to a target.
#[derive(Debug, Clone)]
pub(crate) struct SidecarSpec {
    pub name: String,
    pub image: String,
    /// Shell command executed inside the sidecar once it is up.
    pub command: String,
    pub labels: HashMap<String, String>,
    /// The sidecar joins this container's network namespace.
    pub target_container_id: String,
    pub cap_add: Vec<String>,
    pub remove_on_exit: bool,
    #[allow(dead_code)] // part of the capability surface, unused by docker
    pub timeout: Duration,
}

#[async_trait]
#[enum_dispatch]
pub(crate) trait ContainerRuntime {
    async fn get_container_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<ContainerHandle, RuntimeError>;

    async fn get_container_by_name(
        &self,
        cancel: &CancellationToken,
        container_name: &str,
    ) -> Result<ContainerHandle, RuntimeError>;

    async fn get_container_by_labels(
        &self,
        cancel: &CancellationToken,
        labels: &HashMap<String, String>,
    ) -> Result<ContainerHandle, RuntimeError>;

    /// The container's init PID on the host.
    async fn get_pid_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<i32, RuntimeError>;

    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        force: bool,
    ) -> Result<(), RuntimeError>;

    /// Copy a local `.tar.gz` into `dst_path` inside the container and
    /// unpack it there as `extracted_dir`.
    async fn copy_to_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        src_file: &Path,
        dst_path: &str,
        extracted_dir: &str,
        override_existing: bool,
    ) -> Result<(), RuntimeError>;

    /// Run a shell command (always under `sh -c`) inside the container and
    /// return its output.
    async fn exec_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        command: &str,
    ) -> Result<String, RuntimeError>;

    /// Create and start a sidecar, exec the command in it, then remove it.
    /// Returns `(sidecar_id, output)`.
    async fn execute_and_remove(
        &self,
        cancel: &CancellationToken,
        spec: &SidecarSpec,
    ) -> Result<(String, String), RuntimeError>;
}

#[enum_dispatch(ContainerRuntime)]
#[derive(Debug, Clone)]
pub(crate) enum RuntimeClient {
    Docker(DockerClient),
    Containerd(ContainerdClient),
    Cri(CriClient),
}

/// Race a runtime-client future against the caller's cancellation.
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    tokio::select! {
        result = future => result,
        _ = cancel.cancelled() => Err(RuntimeError::Io(io::Error::new(
            io::ErrorKind::Interrupted,
            "cancelled during container runtime call",
        ))),
    }
}

/// Process-wide cache of runtime connections.
///
/// Holds at most one live connection per runtime kind, lazily created on
/// first use and health-checked on reuse (ping for docker, serving probes
/// for the gRPC runtimes). This replaces ambient singletons with an
/// explicit dependency handed to the dispatcher at construction.
pub struct ClientRegistry {
    paths: BinPaths,
    docker: Mutex<Option<DockerClient>>,
    containerd: Mutex<Option<ContainerdClient>>,
    cri: Mutex<Option<CriClient>>,
}

impl ClientRegistry {
    pub fn new(paths: BinPaths) -> Self {
        ClientRegistry {
            paths,
            docker: Mutex::new(None),
            containerd: Mutex::new(None),
            cri: Mutex::new(None),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn get(
        &self,
        options: &RuntimeOptions,
    ) -> Result<RuntimeClient, RuntimeError> {
        match options.kind {
            RuntimeKind::Docker => {
                let mut slot = self.docker.lock().await;
                if let Some(client) = slot.as_ref() {
                    if client.healthy().await {
                        return Ok(RuntimeClient::Docker(client.clone()));
                    }
                    debug!("cached docker client failed its ping, reconnecting");
                }
                let client = DockerClient::connect(&options.endpoint).await?;
                *slot = Some(client.clone());
                Ok(RuntimeClient::Docker(client))
            }
            RuntimeKind::Containerd => {
                let mut slot = self.containerd.lock().await;
                if let Some(client) = slot.as_ref() {
                    if client.serves(&options.endpoint, &options.namespace).await {
                        return Ok(RuntimeClient::Containerd(client.clone()));
                    }
                    debug!("cached containerd client is stale, reconnecting");
                }
                let client =
                    ContainerdClient::connect(&options.endpoint, &options.namespace).await?;
                *slot = Some(client.clone());
                Ok(RuntimeClient::Containerd(client))
            }
            RuntimeKind::Cri => {
                let mut slot = self.cri.lock().await;
                if let Some(client) = slot.as_ref() {
                    if client.serves(&options.endpoint).await {
                        return Ok(RuntimeClient::Cri(client.clone()));
                    }
                    debug!("cached cri client is stale, reconnecting");
                }
                let client = CriClient::connect(&options.endpoint, self.paths.clone()).await?;
                *slot = Some(client.clone());
                Ok(RuntimeClient::Cri(client))
            }
        }
    }
}
