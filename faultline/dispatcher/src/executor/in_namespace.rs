//! In-namespace strategy: `chaos_os` run inside the target's namespaces.
//!
//! Network faults enter `pid`+`net`; everything else enters `pid`+`mount`.
//! Hang actions are handed to the pause/resume coordinator so the resident
//! helper lands in the target's cgroups before the payload runs.

use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    cgroup::{self, TargetCgroup},
    error::code,
    executor::Executor,
    flags,
    nsexec::{self, BinPaths, NamespaceSet},
    pause,
    request::ExperimentRequest,
    response::{decode_output, Response},
    runtime::{ClientRegistry, ContainerRuntime},
    selector,
};

pub(crate) struct InNamespaceExecutor {
    registry: Arc<ClientRegistry>,
    paths: BinPaths,
}

impl InNamespaceExecutor {
    pub(crate) fn new(registry: Arc<ClientRegistry>, paths: BinPaths) -> Self {
        InNamespaceExecutor { registry, paths }
    }

    /// Launch the `-s` wrapped helper and see it through the handshake.
    async fn exec_hang(
        &self,
        cancel: &CancellationToken,
        request: &ExperimentRequest,
        target_pid: i32,
        args: Vec<String>,
    ) -> Response {
        let root = cgroup::resolve_root(request.flag(flags::CGROUP_ROOT));
        let target = match TargetCgroup::for_pid(root, target_pid) {
            Ok(target) => target,
            Err(err) => {
                error!(%err, "loading target cgroups failed");
                return Response::fail(code::OS_CMD_EXEC_FAILED, err.to_string());
            }
        };

        let mut command = Command::new(self.paths.nsexec());
        command
            .arg("-s")
            .args(["-t", &target_pid.to_string(), "-p", "-n", "--"])
            .arg(self.paths.chaos_os())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        debug!(?command, "starting resident helper");

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Response::fail(
                    code::OS_CMD_EXEC_FAILED,
                    format!("command start failed, {err}"),
                );
            }
        };

        let shield = request.target == "mem" && request.flag_enabled(flags::AVOID_BEING_KILLED);
        match pause::supervise(cancel, child, &target, shield).await {
            Ok(helper_pid) => Response::ok(helper_pid as i64),
            Err(err) => Response::fail(code::OS_CMD_EXEC_FAILED, err.to_string()),
        }
    }
}

/// The stable `chaos_os` argument vector.
///
/// `<create|destroy> <target> <action> <--flag=value …> --uid=<uid>
/// --channel=nsexec --ns-target=<pid> --ns-pid=true
/// [--ns-mnt=true|--ns-net=true]` — re-orderings of the tail would break
/// destroys issued by older callers.
pub(crate) fn helper_args(uid: &str, request: &ExperimentRequest, pid: i32) -> Vec<String> {
    let mut args = vec![
        request.phase.as_str().to_string(),
        request.target.clone(),
        request.action.clone(),
    ];
    for (name, value) in flags::forwarded_flags(request) {
        args.push(format!("--{name}={value}"));
    }
    args.push(format!("--uid={uid}"));
    args.push("--channel=nsexec".to_string());
    args.push(format!("--ns-target={pid}"));
    args.push("--ns-pid=true".to_string());
    if request.target == "network" {
        args.push("--ns-net=true".to_string());
    } else {
        args.push("--ns-mnt=true".to_string());
    }
    args
}

#[async_trait]
impl Executor for InNamespaceExecutor {
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
        let pid = match client.get_pid_by_id(cancel, &handle.id).await {
            Ok(pid) => pid,
            Err(err) => {
                error!(%err, container_id = %handle.id, "GetPidById failed");
                return Response::fail(err.code(), err.to_string());
            }
        };

        let hang_create = request.hang && !request.phase.is_destroy();
        let mut request = request.clone();
        if hang_create {
            // The env override must reach both our cgroup placement and the
            // helper's own bookkeeping.
            if let Ok(root) = std::env::var(cgroup::CGROUP_ROOT_ENV) {
                if !root.is_empty() {
                    request
                        .flags
                        .entry(flags::CGROUP_ROOT.to_string())
                        .or_insert(root);
                }
            }
        }
        let args = helper_args(uid, &request, pid);

        if hang_create {
            return self.exec_hang(cancel, &request, pid, args).await;
        }

        let namespaces = if request.target == "network" {
            NamespaceSet::net()
        } else {
            NamespaceSet::mount()
        };
        let shell_command = format!(
            "{} {}",
            self.paths.chaos_os().display(),
            args.join(" ")
        );
        debug!(%shell_command, pid, "running chaos_os through nsexec");

        match nsexec::run_in_namespace(&self.paths, pid, namespaces, &shell_command, cancel).await
        {
            Ok(result) => decode_output(&result, None),
            Err(err) => Response::fail(
                code::OS_CMD_EXEC_FAILED,
                format!("command exec failed, {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Phase;

    #[test]
    fn network_create_vector() {
        let request = ExperimentRequest::new("exp-1", "network", "delay", Phase::Create)
            .with_flag(flags::CONTAINER_ID, "abc123")
            .with_flag("time", "3000")
            .with_flag("interface", "eth0")
            .with_flag("local-port", "8080");
        let args = helper_args("exp-1", &request, 4242);
        assert_eq!(
            args,
            vec![
                "create",
                "network",
                "delay",
                "--interface=eth0",
                "--local-port=8080",
                "--time=3000",
                "--uid=exp-1",
                "--channel=nsexec",
                "--ns-target=4242",
                "--ns-pid=true",
                "--ns-net=true",
            ]
        );
    }

    #[test]
    fn cpu_destroy_vector() {
        let request = ExperimentRequest::new("exp-2", "cpu", "load", Phase::Destroy)
            .with_flag(flags::CONTAINER_NAME, "web")
            .with_flag("cpu-percent", "60");
        let args = helper_args("exp-2", &request, 99);
        assert_eq!(
            args,
            vec![
                "destroy",
                "cpu",
                "load",
                "--cpu-percent=60",
                "--uid=exp-2",
                "--channel=nsexec",
                "--ns-target=99",
                "--ns-pid=true",
                "--ns-mnt=true",
            ]
        );
    }

    #[test]
    fn timeout_flag_never_reaches_the_helper() {
        let request = ExperimentRequest::new("exp-3", "mem", "load", Phase::Create)
            .with_flag("timeout", "200")
            .with_flag("mem-percent", "50");
        let args = helper_args("exp-3", &request, 7);
        assert!(!args.iter().any(|arg| arg.contains("timeout")));
        assert!(args.contains(&"--mem-percent=50".to_string()));
    }
}
