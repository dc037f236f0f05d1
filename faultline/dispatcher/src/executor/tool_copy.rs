//! Tool-copy strategy: run the full chaosblade tool inside the container.
//!
//! Used for faults `chaos_os` cannot deliver from outside (JVM agents, some
//! file mutations). The release tarball is deployed into `/opt` of the
//! target once, then `blade` is exec-ed in place.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    error::{code, DispatchError, RuntimeError},
    executor::Executor,
    flags,
    request::ExperimentRequest,
    response::{decode_output, Response},
    runtime::{ClientRegistry, ContainerRuntime, RuntimeClient},
    selector,
};

pub(crate) const BLADE_BIN: &str = "/opt/chaosblade/blade";
pub(crate) const DST_BLADE_DIR: &str = "/opt";

pub(crate) struct ToolCopyExecutor {
    registry: Arc<ClientRegistry>,
}

impl ToolCopyExecutor {
    pub(crate) fn new(registry: Arc<ClientRegistry>) -> Self {
        ToolCopyExecutor { registry }
    }

    /// Make sure `/opt/chaosblade/blade` exists inside the container,
    /// deploying the release tarball when it is missing or an override is
    /// requested.
    async fn deploy_blade(
        &self,
        client: &RuntimeClient,
        cancel: &CancellationToken,
        container_id: &str,
        release: &str,
        extracted_dir: &str,
        override_existing: bool,
    ) -> Result<(), RuntimeError> {
        let probe = client
            .exec_container(
                cancel,
                container_id,
                &format!("[ -e {BLADE_BIN} ] && echo True || echo False"),
            )
            .await;
        if let Ok(output) = probe {
            if output.contains("True") && !override_existing {
                debug!(container_id, "blade tool already deployed");
                return Ok(());
            }
        }

        client
            .copy_to_container(
                cancel,
                container_id,
                Path::new(release),
                DST_BLADE_DIR,
                extracted_dir,
                override_existing,
            )
            .await?;

        client
            .exec_container(
                cancel,
                container_id,
                &format!("rm -rf {DST_BLADE_DIR}/chaosblade"),
            )
            .await?;
        client
            .exec_container(
                cancel,
                container_id,
                &format!("mv {DST_BLADE_DIR}/{extracted_dir} {DST_BLADE_DIR}/chaosblade"),
            )
            .await?;
        Ok(())
    }
}

/// Top-level directory inside the release tarball, probed with host `tar`.
async fn extracted_dir_name(release: &str) -> Result<String, DispatchError> {
    let available = Command::new("/bin/sh")
        .args(["-c", "command -v tar"])
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !available {
        return Err(DispatchError::OsCmd {
            cmd: "tar",
            cause: "`tar` is not available on the host".to_string(),
        });
    }

    let output = Command::new("/bin/sh")
        .args(["-c", &format!("tar tf {release} | head -1 | cut -f1 -d/")])
        .output()
        .await
        .map_err(|err| DispatchError::OsCmd {
            cmd: "tar",
            cause: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(DispatchError::ParameterInvalid {
            flag: flags::CHAOSBLADE_RELEASE,
            value: release.to_string(),
            cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .trim()
        .trim_end_matches('/')
        .to_string();
    if name.is_empty() {
        return Err(DispatchError::ParameterInvalid {
            flag: flags::CHAOSBLADE_RELEASE,
            value: release.to_string(),
            cause: "the obtained directory name is empty".to_string(),
        });
    }
    Ok(name)
}

/// The `blade` command line run inside the container.
///
/// `--uid` is carried on create always and on destroy for every target with
/// create/destroy symmetry; the jvm agent manages its own instances, so its
/// destroys go out bare.
pub(crate) fn blade_command(uid: &str, request: &ExperimentRequest) -> String {
    let mut command = format!(
        "{BLADE_BIN} {} {} {}",
        request.phase.as_str(),
        request.target,
        request.action
    );
    for (name, value) in flags::forwarded_flags(request) {
        command.push_str(&format!(" --{name} {value}"));
    }
    if !(request.phase.is_destroy() && request.target == "jvm") {
        command.push_str(&format!(" --uid {uid}"));
    }
    command
}

#[async_trait]
impl Executor for ToolCopyExecutor {
    async fn exec(
        &self,
        uid: &str,
        cancel: &CancellationToken,
        request: &ExperimentRequest,
    ) -> Response {
        let options = flags::RuntimeOptions::from_request(request);
        let client = match self.registry.get(&options).await {
            Ok(client) => client,
            Err(err) => {
                error!(%err, "GetClient failed");
                return Response::fail(code::CONTAINER_EXEC_FAILED, format!("GetClient: {err}"));
            }
        };
        let handle = match selector::resolve(&client, cancel, request).await {
            Ok(handle) => handle,
            Err(err) => return Response::from(err),
        };

        if !request.phase.is_destroy() {
            let release = flags::blade_release_path(request);
            let override_existing = request.flag_enabled(flags::CHAOSBLADE_OVERRIDE);
            let extracted_dir = match extracted_dir_name(&release).await {
                Ok(name) => name,
                Err(err) => {
                    error!(%err, %release, "chaosblade release check failed");
                    return Response::from(err);
                }
            };
            if let Err(err) = self
                .deploy_blade(
                    &client,
                    cancel,
                    &handle.id,
                    &release,
                    &extracted_dir,
                    override_existing,
                )
                .await
            {
                error!(%err, "DeployChaosBlade failed");
                return Response::fail(
                    code::CONTAINER_EXEC_FAILED,
                    format!("DeployChaosBlade: {err}"),
                );
            }
        }

        let command = blade_command(uid, request);
        debug!(%command, container_id = %handle.id, "running blade in container");
        match client.exec_container(cancel, &handle.id, &command).await {
            Ok(output) => decode_output(&output, None),
            Err(err) => decode_output("", Some(&err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Phase;

    #[test]
    fn create_carries_uid() {
        let request = ExperimentRequest::new("exp-4", "jvm", "return", Phase::Create)
            .with_flag(flags::CONTAINER_ID, "c")
            .with_flag("classname", "com.example.Svc")
            .with_flag(flags::CHAOSBLADE_RELEASE, "/opt/cb.tar.gz");
        assert_eq!(
            blade_command("exp-4", &request),
            "/opt/chaosblade/blade create jvm return --classname com.example.Svc --uid exp-4"
        );
    }

    #[test]
    fn jvm_destroy_goes_out_bare() {
        let request = ExperimentRequest::new("exp-4", "jvm", "return", Phase::Destroy)
            .with_flag("classname", "com.example.Svc");
        assert_eq!(
            blade_command("exp-4", &request),
            "/opt/chaosblade/blade destroy jvm return --classname com.example.Svc"
        );
    }

    #[test]
    fn file_destroy_keeps_uid() {
        let request = ExperimentRequest::new("exp-5", "file", "append", Phase::Destroy)
            .with_flag("filepath", "/home/logs/nginx.log");
        assert_eq!(
            blade_command("exp-5", &request),
            "/opt/chaosblade/blade destroy file append --filepath /home/logs/nginx.log --uid exp-5"
        );
    }
}
