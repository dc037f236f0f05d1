//! Docker engine variant of the runtime client, backed by bollard.

use std::{collections::HashMap, io, path::Path, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{CreateImageOptions, ListImagesOptions},
    models::HostConfig,
    ClientVersion, Docker,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::RuntimeError,
    runtime::{with_cancel, ContainerHandle, ContainerRuntime, SidecarSpec},
};

const DEFAULT_DOCKER_SOCKET: &str = "unix:///var/run/docker.sock";
const CONNECT_TIMEOUT_SECS: u64 = 120;
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Initial API target; older engines are handled by version negotiation.
const API_VERSION: ClientVersion = ClientVersion {
    major_version: 1,
    minor_version: 24,
};

#[derive(Debug, Clone)]
pub(crate) struct DockerClient {
    client: Docker,
}

impl DockerClient {
    /// Connect and verify the engine answers.
    ///
    /// First ping runs against API 1.24; if it fails, the version reported
    /// by the server is negotiated and pinged once more. Only a double
    /// failure is fatal.
    pub(crate) async fn connect(endpoint: &str) -> Result<Self, RuntimeError> {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_DOCKER_SOCKET
        } else {
            endpoint
        };
        let client = Docker::connect_with_unix(endpoint, CONNECT_TIMEOUT_SECS, &API_VERSION)?;

        match tokio::time::timeout(PING_TIMEOUT, client.ping()).await {
            Ok(Ok(_)) => Ok(DockerClient { client }),
            outcome => {
                debug!(?outcome, "initial docker ping failed, negotiating api version");
                let negotiated = client.negotiate_version().await?;
                tokio::time::timeout(PING_TIMEOUT, negotiated.ping())
                    .await
                    .map_err(|_| ping_timeout())??;
                Ok(DockerClient { client: negotiated })
            }
        }
    }

    pub(crate) async fn healthy(&self) -> bool {
        matches!(
            tokio::time::timeout(PING_TIMEOUT, self.client.ping()).await,
            Ok(Ok(_))
        )
    }

    /// First container matching the list filters.
    async fn get_container_from_list(
        &self,
        filters: HashMap<String, Vec<String>>,
        all: bool,
    ) -> Result<ContainerHandle, RuntimeError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| RuntimeError::ExecFailed {
                op: "GetContainerList",
                cause: err.to_string(),
            })?;

        let container = containers
            .into_iter()
            .next()
            .ok_or(RuntimeError::ContainerNotFound {
                flag: "container-id",
            })?;

        Ok(ContainerHandle {
            id: container.id.unwrap_or_default(),
            name: container
                .names
                .and_then(|names| names.into_iter().next())
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            labels: container.labels.unwrap_or_default(),
            runtime_spec: None,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        privileged: bool,
    ) -> Result<String, RuntimeError> {
        trace!(container_id, command, privileged, "docker exec");
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    privileged: privileged.then_some(true),
                    user: privileged.then(|| "root".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }
        trace!(%stdout, %stderr, "docker exec finished");

        if !stderr.is_empty() {
            return Err(RuntimeError::ExecFailed {
                op: "execContainer",
                cause: stderr,
            });
        }
        Ok(stdout)
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let filters = HashMap::from([("reference".to_string(), vec![image.to_string()])]);
        let images = self
            .client
            .list_images(Some(ListImagesOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(!images.is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut progress = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(update) = progress.next().await {
            update.map_err(|err| RuntimeError::ImagePull {
                image: image.to_string(),
                cause: err.to_string(),
            })?;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| {
                warn!(container_id, %err, "failed to remove container");
                err
            })?;
        Ok(())
    }
}

fn ping_timeout() -> RuntimeError {
    RuntimeError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "docker ping timed out",
    ))
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let filters = HashMap::from([("id".to_string(), vec![container_id.to_string()])]);
        with_cancel(cancel, self.get_container_from_list(filters, false)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_name(
        &self,
        cancel: &CancellationToken,
        container_name: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let filters = HashMap::from([("name".to_string(), vec![container_name.to_string()])]);
        with_cancel(cancel, self.get_container_from_list(filters, true)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_labels(
        &self,
        cancel: &CancellationToken,
        labels: &HashMap<String, String>,
    ) -> Result<ContainerHandle, RuntimeError> {
        let pairs = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let filters = HashMap::from([("label".to_string(), pairs)]);
        with_cancel(cancel, self.get_container_from_list(filters, true)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_pid_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<i32, RuntimeError> {
        let inspect = with_cancel(cancel, async {
            Ok(self.client.inspect_container(container_id, None).await?)
        })
        .await?;
        inspect
            .state
            .and_then(|state| state.pid)
            .filter(|pid| *pid > 0)
            .map(|pid| pid as i32)
            .ok_or_else(|| RuntimeError::PidUnavailable(container_id.to_string()))
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        with_cancel(cancel, self.remove(container_id, force)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn copy_to_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        src_file: &Path,
        dst_path: &str,
        _extracted_dir: &str,
        override_existing: bool,
    ) -> Result<(), RuntimeError> {
        with_cancel(cancel, async {
            // The engine refuses to unpack into a missing directory.
            self.exec(container_id, &format!("mkdir -p {dst_path}"), true)
                .await?;

            let contents = tokio::fs::read(src_file).await?;
            self.client
                .upload_to_container(
                    container_id,
                    Some(UploadToContainerOptions {
                        path: dst_path.to_string(),
                        no_overwrite_dir_non_dir: (!override_existing).to_string(),
                    }),
                    contents.into(),
                )
                .await?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn exec_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        command: &str,
    ) -> Result<String, RuntimeError> {
        with_cancel(cancel, self.exec(container_id, command, false)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel, spec), fields(sidecar = %spec.name))]
    async fn execute_and_remove(
        &self,
        cancel: &CancellationToken,
        spec: &SidecarSpec,
    ) -> Result<(String, String), RuntimeError> {
        with_cancel(cancel, async {
            if !self.image_present(&spec.image).await.unwrap_or(false) {
                self.pull_image(&spec.image).await?;
            }

            let host_config = HostConfig {
                network_mode: Some(format!("container:{}", spec.target_container_id)),
                cap_add: Some(spec.cap_add.clone()),
                ..Default::default()
            };
            let created = self
                .client
                .create_container(
                    Some(CreateContainerOptions {
                        name: spec.name.clone(),
                        platform: None,
                    }),
                    Config {
                        image: Some(spec.image.clone()),
                        tty: Some(true),
                        attach_stdout: Some(false),
                        attach_stderr: Some(false),
                        cmd: Some(vec!["/bin/sh".to_string()]),
                        labels: Some(spec.labels.clone()),
                        host_config: Some(host_config),
                        ..Default::default()
                    },
                )
                .await;

            let sidecar_id = match created {
                Ok(response) => response.id,
                Err(err) => {
                    return Err(RuntimeError::ExecFailed {
                        op: "CreateAndStartContainer",
                        cause: err.to_string(),
                    });
                }
            };
            if let Err(err) = self
                .client
                .start_container(&sidecar_id, None::<StartContainerOptions<String>>)
                .await
            {
                let _ = self.remove(&sidecar_id, true).await;
                return Err(RuntimeError::ExecFailed {
                    op: "CreateAndStartContainer",
                    cause: err.to_string(),
                });
            }

            let output = match self.exec(&sidecar_id, &spec.command, false).await {
                Ok(output) => output,
                Err(err) => {
                    if spec.remove_on_exit {
                        let _ = self.remove(&sidecar_id, true).await;
                    }
                    return Err(RuntimeError::ExecFailed {
                        op: "ContainerExecCmd",
                        cause: err.to_string(),
                    });
                }
            };
            debug!(%sidecar_id, %output, "sidecar command finished");

            if spec.remove_on_exit {
                let _ = self.remove(&sidecar_id, true).await;
            }
            Ok((sidecar_id, output))
        })
        .await
    }
}
