//! containerd variant of the runtime client, speaking gRPC to the daemon.
//!
//! The client is pinned to one containerd namespace. Filesystem access to
//! the container happens out-of-band through `/proc/<pid>/root`, since the
//! snapshot mounts are not reachable over the API.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use containerd_client::{
    connect,
    services::v1::{
        containers_client::ContainersClient, tasks_client::TasksClient,
        version_client::VersionClient, Container, DeleteContainerRequest, DeleteProcessRequest,
        ExecProcessRequest, GetContainerRequest, GetRequest, ListContainersRequest, StartRequest,
        WaitRequest,
    },
    tonic::{transport::Channel, Code, Request},
    with_namespace,
};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::RuntimeError,
    runtime::{with_cancel, ContainerHandle, ContainerRuntime, SidecarSpec},
};

const DEFAULT_ENDPOINT: &str = "/run/containerd/containerd.sock";
const FIFO_ROOT: &str = "/run/containerd/fifo";
const KUBE_NAME_LABEL: &str = "io.kubernetes.container.name";
const PROCESS_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";

#[derive(Debug, Clone)]
pub(crate) struct ContainerdClient {
    channel: Channel,
    endpoint: String,
    namespace: String,
}

impl ContainerdClient {
    pub(crate) async fn connect(endpoint: &str, namespace: &str) -> Result<Self, RuntimeError> {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            endpoint
        };
        let channel = connect(endpoint).await?;
        Ok(ContainerdClient {
            channel,
            endpoint: endpoint.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Whether the cached connection still serves the requested endpoint
    /// and namespace.
    pub(crate) async fn serves(&self, endpoint: &str, namespace: &str) -> bool {
        if !endpoint.is_empty() && endpoint != self.endpoint {
            return false;
        }
        if namespace != self.namespace {
            return false;
        }
        VersionClient::new(self.channel.clone())
            .version(())
            .await
            .is_ok()
    }

    async fn container(&self, container_id: &str) -> Result<Container, RuntimeError> {
        let request = GetContainerRequest {
            id: container_id.to_string(),
        };
        let response = ContainersClient::new(self.channel.clone())
            .get(with_namespace!(request, &self.namespace))
            .await?;
        response
            .into_inner()
            .container
            .ok_or(RuntimeError::ContainerNotFound {
                flag: "container-id",
            })
    }

    async fn list_first(&self, filter: String) -> Result<ContainerHandle, RuntimeError> {
        let request = ListContainersRequest {
            filters: vec![filter],
        };
        let response = ContainersClient::new(self.channel.clone())
            .list(with_namespace!(request, &self.namespace))
            .await
            .map_err(|err| RuntimeError::ExecFailed {
                op: "GetContainerList",
                cause: err.to_string(),
            })?;
        // containerd does not define an ordering here; first match wins.
        response
            .into_inner()
            .containers
            .into_iter()
            .next()
            .map(handle_of)
            .ok_or(RuntimeError::ContainerNotFound {
                flag: "container-id",
            })
    }

    async fn task_pid(&self, container_id: &str) -> Result<i32, RuntimeError> {
        let request = GetRequest {
            container_id: container_id.to_string(),
            ..Default::default()
        };
        let response = TasksClient::new(self.channel.clone())
            .get(with_namespace!(request, &self.namespace))
            .await?;
        response
            .into_inner()
            .process
            .map(|process| process.pid as i32)
            .filter(|pid| *pid > 0)
            .ok_or_else(|| RuntimeError::PidUnavailable(container_id.to_string()))
    }

    /// Exec through the tasks service with a fresh FIFO pair for IO.
    async fn exec(&self, container_id: &str, command: &str) -> Result<String, RuntimeError> {
        let exec_id = format!("exec-{:016x}", rand::random::<u64>());
        let fifo_dir = Path::new(FIFO_ROOT).join(&exec_id);
        tokio::fs::create_dir_all(&fifo_dir).await?;
        let result = self
            .exec_with_fifos(container_id, command, &exec_id, &fifo_dir)
            .await;
        if let Err(err) = tokio::fs::remove_dir_all(&fifo_dir).await {
            warn!(dir = %fifo_dir.display(), %err, "failed to clean up exec fifos");
        }
        result
    }

    async fn exec_with_fifos(
        &self,
        container_id: &str,
        command: &str,
        exec_id: &str,
        fifo_dir: &Path,
    ) -> Result<String, RuntimeError> {
        let stdout_path = fifo_dir.join("stdout");
        let stderr_path = fifo_dir.join("stderr");
        let mode = nix::sys::stat::Mode::from_bits_truncate(0o600);
        nix::unistd::mkfifo(&stdout_path, mode).map_err(nix_io)?;
        nix::unistd::mkfifo(&stderr_path, mode).map_err(nix_io)?;

        // Process spec: the container's own process template with the argv
        // swapped for our shell command.
        let container = self.container(container_id).await?;
        let spec = container.spec.ok_or_else(|| RuntimeError::ExecFailed {
            op: "execContainer",
            cause: format!("container {container_id} has no runtime spec"),
        })?;
        let oci: serde_json::Value =
            serde_json::from_slice(&spec.value).map_err(|err| RuntimeError::ExecFailed {
                op: "execContainer",
                cause: format!("undecodable runtime spec: {err}"),
            })?;
        let mut process = oci
            .get("process")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        process["args"] = serde_json::json!(["sh", "-c", command]);
        process["terminal"] = serde_json::json!(false);
        let process_any = prost_types::Any {
            type_url: PROCESS_SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(&process).map_err(|err| RuntimeError::ExecFailed {
                op: "execContainer",
                cause: err.to_string(),
            })?,
        };

        let mut tasks = TasksClient::new(self.channel.clone());
        let request = ExecProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            terminal: false,
            // No stdin fifo: the exec gets /dev/null, equivalent to closing
            // it right away.
            stdin: String::new(),
            stdout: stdout_path.to_string_lossy().into_owned(),
            stderr: stderr_path.to_string_lossy().into_owned(),
            spec: Some(process_any),
        };
        tasks.exec(with_namespace!(request, &self.namespace)).await?;

        // Hold write ends open ourselves so the fifos do not EOF before the
        // shim attaches; the drain stops once the process is gone.
        let stdout_rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&stdout_path)?;
        let stderr_rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&stderr_path)?;
        let (stop_stdout, stopped_stdout) = tokio::sync::oneshot::channel();
        let (stop_stderr, stopped_stderr) = tokio::sync::oneshot::channel();
        let stdout_task = tokio::spawn(drain_fifo(stdout_rx, stopped_stdout));
        let stderr_task = tokio::spawn(drain_fifo(stderr_rx, stopped_stderr));

        let request = StartRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        tasks
            .start(with_namespace!(request, &self.namespace))
            .await?;

        let request = WaitRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let exit = tasks
            .wait(with_namespace!(request, &self.namespace))
            .await?
            .into_inner();
        trace!(exec_id, exit_status = exit.exit_status, "containerd exec finished");

        let _ = stop_stdout.send(());
        let _ = stop_stderr.send(());
        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        let request = DeleteProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        if let Err(status) = tasks
            .delete_process(with_namespace!(request, &self.namespace))
            .await
        {
            warn!(exec_id, %status, "failed to delete exec process");
        }

        if stdout.trim().is_empty() && !stderr.trim().is_empty() {
            return Err(RuntimeError::ExecFailed {
                op: "ContainerExecCmd",
                cause: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    async fn host_shell(&self, command: &str) -> Result<String, RuntimeError> {
        trace!(command, "host-side shell for containerd copy");
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::ExecFailed {
                op: "CopyToContainer",
                cause: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn handle_of(container: Container) -> ContainerHandle {
    ContainerHandle {
        id: container.id,
        name: container
            .labels
            .get(KUBE_NAME_LABEL)
            .cloned()
            .unwrap_or_default(),
        labels: container.labels,
        runtime_spec: container.spec.map(|any| any.value),
    }
}

fn label_filter(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(key, value)| format!(r#"labels."{key}"=={value}"#))
        .collect();
    pairs.sort();
    pairs.join(",")
}

fn nix_io(errno: nix::errno::Errno) -> RuntimeError {
    RuntimeError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

/// Drain a FIFO until told to stop, then pull whatever is still buffered.
async fn drain_fifo(
    mut rx: pipe::Receiver,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            read = rx.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(chunk.get(..n).unwrap_or_default()),
                Err(_) => break,
            },
            _ = &mut stop => {
                while let Ok(n) = rx.try_read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    buffer.extend_from_slice(chunk.get(..n).unwrap_or_default());
                }
                break;
            }
        }
    }
    buffer
}

#[async_trait]
impl ContainerRuntime for ContainerdClient {
    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let container = with_cancel(cancel, self.container(container_id)).await?;
        Ok(handle_of(container))
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_name(
        &self,
        cancel: &CancellationToken,
        container_name: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        // containerd has no native name field; the kubelet's name label is
        // the closest thing.
        let filter = format!(r#"labels."{KUBE_NAME_LABEL}"=={container_name}"#);
        with_cancel(cancel, self.list_first(filter)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_container_by_labels(
        &self,
        cancel: &CancellationToken,
        labels: &HashMap<String, String>,
    ) -> Result<ContainerHandle, RuntimeError> {
        with_cancel(cancel, self.list_first(label_filter(labels))).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn get_pid_by_id(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<i32, RuntimeError> {
        with_cancel(cancel, self.task_pid(container_id)).await
    }

    #[tracing::instrument(level = "trace", skip(self, cancel))]
    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        let request = DeleteContainerRequest {
            id: container_id.to_string(),
        };
        let deleted = with_cancel(cancel, async {
            Ok(ContainersClient::new(self.channel.clone())
                .delete(with_namespace!(request, &self.namespace))
                .await)
        })
        .await?;
        match deleted {
            Ok(_) => Ok(()),
            // Destroy is idempotent: a container already gone is a success.
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status.into()),
        }
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
        with_cancel(cancel, async {
            let pid = self.task_pid(container_id).await?;
            let dst_abs = format!("/proc/{pid}/root/{}", dst_path.trim_start_matches('/'));

            let probe = self
                .host_shell(&format!("[ -e {dst_abs} ] && echo True || echo False"))
                .await?;
            if !probe.contains("True") {
                self.host_shell(&format!("mkdir -p {dst_abs}")).await?;
            }

            let src = src_file.display();
            self.host_shell(&format!("cp -R {src} {dst_abs}")).await?;

            let base = src_file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(%dst_abs, %base, "unpacking release inside container root");
            self.host_shell(&format!("cd {dst_abs} && tar -zxf {dst_abs}/{base}"))
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
        with_cancel(cancel, self.exec(container_id, command)).await
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_filters_are_deterministic() {
        let labels = HashMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "backend".to_string()),
        ]);
        assert_eq!(
            label_filter(&labels),
            r#"labels."app"==web,labels."tier"==backend"#
        );
    }
}
