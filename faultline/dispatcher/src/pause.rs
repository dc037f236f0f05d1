//! Supervising resident fault helpers through the pause/resume handshake.
//!
//! Hang actions launch `nsexec` with a leading `-s`, which makes it raise
//! `SIGSTOP` on itself after entering the target's namespaces but before
//! exec-ing the payload. That window is used to place the helper into the
//! target's cgroups so the fault is accounted against the right limits.
//! Only once the helper's `comm` reads `nsexec` again is the fault
//! considered installed.

use std::{io, path::Path, time::Duration};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{cgroup::TargetCgroup, error::PauseError};

/// Handshake progress, driven by `comm` polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HangState {
    /// Helper spawned, waiting for it to park itself.
    Starting,
    /// Helper parked in `SIGSTOP`, cgroup placement done, `SIGCONT` pending.
    PausedAwaitingCgroup,
    /// Helper exec-ed the payload; the fault is installed.
    Running,
}

const POLL_FLOOR: Duration = Duration::from_millis(1);
const POLL_CEILING: Duration = Duration::from_millis(10);

fn next_interval(current: Duration) -> Duration {
    (current * 2).min(POLL_CEILING)
}

/// Drive a freshly spawned `-s` helper to the running state.
///
/// Cgroup placement strictly precedes `SIGCONT`, which strictly precedes
/// the success return. Any failure, including cancellation, kills the
/// helper before returning. On success the helper's PID is handed back as
/// the experiment instance identifier.
#[tracing::instrument(level = "trace", skip_all, fields(helper_pid))]
pub(crate) async fn supervise(
    cancel: &CancellationToken,
    mut child: Child,
    target: &TargetCgroup,
    oom_shield: bool,
) -> Result<u32, PauseError> {
    let pid = child.id().ok_or(PauseError::DiedDuringPause)?;
    tracing::Span::current().record("helper_pid", pid);

    if let Err(cgroup_err) = target.add_process(pid) {
        error!(%cgroup_err, "cgroup placement failed, killing helper");
        let _ = child.kill().await;
        return Err(cgroup_err.into());
    }

    let mut state = HangState::Starting;
    let mut interval = POLL_FLOOR;
    loop {
        match state {
            HangState::Starting => {
                if comm_is(&mut child, pid, "pause", PauseError::DiedDuringPause).await? {
                    debug!("helper parked, sending SIGCONT");
                    state = HangState::PausedAwaitingCgroup;
                    interval = POLL_FLOOR;
                    continue;
                }
            }
            HangState::PausedAwaitingCgroup => {
                if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGCONT) {
                    let _ = child.kill().await;
                    return Err(PauseError::Signal(errno));
                }
                if comm_is(&mut child, pid, "nsexec", PauseError::DiedDuringResume).await? {
                    state = HangState::Running;
                    continue;
                }
            }
            HangState::Running => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                debug!("cancelled during pause handshake, killing helper");
                let _ = child.kill().await;
                return Err(PauseError::Cancelled);
            }
        }
        interval = next_interval(interval);
    }

    if oom_shield {
        shield_from_oom(pid).await;
    }

    // The helper outlives this call (spawned without kill-on-drop);
    // destroy reaches it later through the uid.
    drop(child);
    Ok(pid)
}

/// One `comm` poll. `Ok(true)` when it matches, `Ok(false)` to keep
/// polling, `died` when the helper is gone.
async fn comm_is(
    child: &mut Child,
    pid: u32,
    expected: &str,
    died: PauseError,
) -> Result<bool, PauseError> {
    if child.try_wait()?.is_some() {
        error!(pid, "helper exited during handshake");
        return Err(died);
    }
    match read_comm(pid) {
        Ok(comm) => {
            trace!(pid, comm = comm.trim_end(), expected, "polled helper comm");
            if comm.trim_end() == expected {
                return Ok(true);
            }
            match read_cmdline(pid) {
                Ok(cmdline) if cmdline.is_empty() => {
                    let _ = child.kill().await;
                    Err(died)
                }
                // The child may not have its /proc entry fully up yet.
                Ok(_) | Err(_) => Ok(false),
            }
        }
        Err(read_err) if read_err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(read_err) => {
            let _ = child.kill().await;
            Err(read_err.into())
        }
    }
}

pub(crate) fn read_comm(pid: u32) -> io::Result<String> {
    read_comm_at(Path::new("/proc"), pid)
}

fn read_comm_at(proc_root: &Path, pid: u32) -> io::Result<String> {
    std::fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
}

pub(crate) fn read_cmdline(pid: u32) -> io::Result<String> {
    read_cmdline_at(Path::new("/proc"), pid)
}

fn read_cmdline_at(proc_root: &Path, pid: u32) -> io::Result<String> {
    std::fs::read_to_string(proc_root.join(pid.to_string()).join("cmdline"))
}

fn child_pids_at(proc_root: &Path, pid: u32) -> io::Result<Vec<u32>> {
    let path = proc_root
        .join(pid.to_string())
        .join("task")
        .join(pid.to_string())
        .join("children");
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .split_whitespace()
        .filter_map(|field| field.parse().ok())
        .collect())
}

fn child_pids(pid: u32) -> io::Result<Vec<u32>> {
    child_pids_at(Path::new("/proc"), pid)
}

/// Pin `oom_score_adj` of the helper and all of its descendants to -1000 so
/// a `mem` fault does not get its own injector reaped first.
async fn shield_from_oom(pid: u32) {
    let mut pending = vec![pid];
    while let Some(pid) = pending.pop() {
        match choom(pid).await {
            Ok(()) => {
                debug!(pid, "oom shield applied");
                match child_pids(pid) {
                    Ok(children) => pending.extend(children),
                    Err(err) => error!(pid, %err, "failed to enumerate helper children"),
                }
            }
            Err(err) => error!(pid, %err, "choom failed"),
        }
    }
}

async fn choom(pid: u32) -> io::Result<()> {
    let status = Command::new("choom")
        .args(["-n", "-1000", "-p", &pid.to_string()])
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("choom exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn poll_interval_grows_to_ceiling() {
        let mut interval = POLL_FLOOR;
        let mut observed = vec![interval];
        for _ in 0..5 {
            interval = next_interval(interval);
            observed.push(interval);
        }
        assert_eq!(
            observed,
            [1, 2, 4, 8, 10, 10].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn proc_readers() {
        let proc_root = TempDir::new().unwrap();
        let dir = proc_root.path().join("4242");
        std::fs::create_dir_all(dir.join("task/4242")).unwrap();
        std::fs::write(dir.join("comm"), "pause\n").unwrap();
        std::fs::write(dir.join("cmdline"), "nsexec\0-s\0").unwrap();
        std::fs::write(dir.join("task/4242/children"), "100 101 102\n").unwrap();

        assert_eq!(read_comm_at(proc_root.path(), 4242).unwrap(), "pause\n");
        assert!(!read_cmdline_at(proc_root.path(), 4242).unwrap().is_empty());
        assert_eq!(
            child_pids_at(proc_root.path(), 4242).unwrap(),
            vec![100, 101, 102]
        );
    }

    #[test]
    fn missing_proc_entry_is_not_found() {
        let proc_root = TempDir::new().unwrap();
        let err = read_comm_at(proc_root.path(), 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
