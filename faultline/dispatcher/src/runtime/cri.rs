//! Generic CRI variant of the runtime client, for cri-o and friends.
//!
//! Talks the kubelet CRI `RuntimeService` protocol over a unix socket.
//! Filesystem access goes through the host-side `nsexec` helper, since CRI
//! has no copy primitive.

use std::{collections::HashMap, io, path::Path};

use async_trait::async_trait;
use k8s_cri::v1::{
    runtime_service_client::RuntimeServiceClient, Container, ContainerFilter, ContainerState,
    ContainerStateValue, ContainerStatusRequest, ExecSyncRequest, ListContainersRequest,
    RemoveContainerRequest, VersionRequest,
};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::RuntimeError,
    nsexec::{self, BinPaths},
    runtime::{with_cancel, ContainerHandle, ContainerRuntime, SidecarSpec},
};

/// Probed in order when no `cri-endpoint` is given.
const DEFAULT_ENDPOINTS: &[&str] = &[
    "/run/containerd/containerd.sock",
    "/run/crio/crio.sock",
    "/var/run/dockershim.sock",
    "/var/run/cri-dockerd.sock",
];

#[derive(Debug, Clone)]
pub(crate) struct CriClient {
    channel: Channel,
    endpoint: String,
    paths: BinPaths,
}

impl CriClient {
    pub(crate) async fn connect(endpoint: &str, paths: BinPaths) -> Result<Self, RuntimeError> {
        let endpoint = if endpoint.is_empty() {
            probe_endpoint().await?
        } else {
            endpoint.to_string()
        };
        debug!(%endpoint, "connecting CRI runtime service");

        let socket = endpoint.clone();
        let channel = Endpoint::try_from("http://localhost")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move { UnixStream::connect(socket).await }
            }))
            .await?;

        Ok(CriClient {
            channel,
            endpoint,
            paths,
        })
    }

    pub(crate) async fn serves(&self, endpoint: &str) -> bool {
        if !endpoint.is_empty() && endpoint != self.endpoint {
            return false;
        }
        self.client()
            .version(VersionRequest {
                version: String::new(),
            })
            .await
            .is_ok()
    }

    fn client(&self) -> RuntimeServiceClient<Channel> {
        RuntimeServiceClient::new(self.channel.clone())
    }

    async fn list(&self, filter: ContainerFilter) -> Result<Vec<Container>, RuntimeError> {
        let response = self
            .client()
            .list_containers(ListContainersRequest {
                filter: Some(filter),
            })
            .await
            .map_err(|err| RuntimeError::ExecFailed {
                op: "GetContainerList",
                cause: err.to_string(),
            })?;
        Ok(response.into_inner().containers)
    }

    async fn pid(&self, container_id: &str) -> Result<i32, RuntimeError> {
        // The info map is only populated when verbose is set.
        let status = self
            .client()
            .container_status(ContainerStatusRequest {
                container_id: container_id.to_string(),
                verbose: true,
            })
            .await?
            .into_inner();

        let info = status.info;
        let pid = info
            .get("pid")
            .and_then(|value| value.parse::<i32>().ok())
            .or_else(|| {
                // Some runtimes nest the status under an `info` JSON blob.
                info.get("info")
                    .and_then(|blob| serde_json::from_str::<serde_json::Value>(blob).ok())
                    .and_then(|value| value.get("pid").and_then(serde_json::Value::as_i64))
                    .map(|pid| pid as i32)
            });
        pid.filter(|pid| *pid > 0)
            .ok_or_else(|| RuntimeError::PidUnavailable(container_id.to_string()))
    }
}

async fn probe_endpoint() -> Result<String, RuntimeError> {
    for endpoint in DEFAULT_ENDPOINTS {
        if UnixStream::connect(endpoint).await.is_ok() {
            trace!(endpoint, "probed CRI endpoint");
            return Ok(endpoint.to_string());
        }
    }
    Err(RuntimeError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        "no probeable CRI endpoint among the defaults",
    )))
}

fn running_filter() -> ContainerStateValue {
    ContainerStateValue {
        state: ContainerState::ContainerRunning.into(),
    }
}

fn handle_of(container: Container) -> ContainerHandle {
    ContainerHandle {
        name: container
            .metadata
            .as_ref()
            .map(|metadata| metadata.name.clone())
            .unwrap_or_default(),
        id: container.id,
        labels: container.labels,
        runtime_spec: None,
    }
}

#[async_trait]
impl ContainerRuntime for CriClient {
    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let filter = ContainerFilter {
            id: container_id.to_string(),
            state: Some(running_filter()),
            ..Default::default()
        };
        with_cancel(cancel, async {
            self.list(filter)
                .await?
                .into_iter()
                .next()
                .map(handle_of)
                .ok_or_else(|| RuntimeError::CriNotFound(format!("container-id={container_id}")))
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_name(
        &self,
        cancel: &CancellationToken,
        container_name: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let filter = ContainerFilter {
            state: Some(running_filter()),
            ..Default::default()
        };
        with_cancel(cancel, async {
            self.list(filter)
                .await?
                .into_iter()
                .find(|container| {
                    container
                        .metadata
                        .as_ref()
                        .map(|metadata| metadata.name == container_name)
                        .unwrap_or(false)
                })
                .map(handle_of)
                .ok_or_else(|| {
                    RuntimeError::CriNotFound(format!("container-name={container_name}"))
                })
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_labels(
        &self,
        cancel: &CancellationToken,
        labels: &HashMap<String, String>,
    ) -> Result<ContainerHandle, RuntimeError> {
        let filter = ContainerFilter {
            state: Some(running_filter()),
            label_selector: labels.clone(),
            ..Default::default()
        };
        with_cancel(cancel, async {
            self.list(filter)
                .await?
                .into_iter()
                .next()
                .map(handle_of)
                .ok_or_else(|| {
                    let mut pairs: Vec<String> = labels
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect();
                    pairs.sort();
                    RuntimeError::CriNotFound(pairs.join(","))
                })
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_pid_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<i32, RuntimeError> {
        with_cancel(cancel, self.pid(container_id)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        with_cancel(cancel, async {
            self.client()
                .remove_container(RemoveContainerRequest {
                    container_id: container_id.to_string(),
                })
                .await?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn copy_to_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        src_file: &Path,
        dst_path: &str,
        _extracted_dir: &str,
        _override_existing: bool,
    ) -> Result<(), RuntimeError> {
        let pid = with_cancel(cancel, self.pid(container_id)).await?;
        nsexec::copy_into_namespace(&self.paths, pid, src_file, dst_path, cancel)
            .await
            .map_err(|err| RuntimeError::ExecFailed {
                op: "CopyToContainer",
                cause: err.to_string(),
            })
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn exec_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        command: &str,
    ) -> Result<String, RuntimeError> {
        let response = with_cancel(cancel, async {
            Ok(self
                .client()
                .exec_sync(ExecSyncRequest {
                    container_id: container_id.to_string(),
                    cmd: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
                    timeout: 0,
                })
                .await?
                .into_inner())
        })
        .await?;

        let stdout = String::from_utf8_lossy(&response.stdout);
        let stderr = String::from_utf8_lossy(&response.stderr);
        let exit = if response.exit_code == 0 {
            Ok(())
        } else {
            Err(format!("exit status {}", response.exit_code))
        };
        nsexec::extract_streams(&stdout, &stderr, exit).map_err(|err| RuntimeError::ExecFailed {
            op: "ContainerExecCmd",
            cause: err.to_string(),
        })
    }

    async fn execute_and_remove(
        &self,
        _cancel: &CancellationToken,
        _spec: &SidecarSpec,
    ) -> Result<(String, String), RuntimeError> {
        Err(RuntimeError::CreateContainer(
            "sidecar execution requires the docker runtime".to_string(),
        ))
    }
}
