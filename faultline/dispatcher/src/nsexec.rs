//! Invoking the external `nsexec` helper inside a target's namespaces.
//!
//! `nsexec` enters the namespaces of `-t <pid>` and execs the payload after
//! `--`. The dispatcher only ever hands it shell commands or the `chaos_os`
//! fault binary; both live under `<program dir>/bin/`.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::NsExecError;

pub(crate) const NSEXEC_BIN: &str = "nsexec";
pub(crate) const CHAOS_OS_BIN: &str = "chaos_os";

/// Locations of the host-side helper binaries.
#[derive(Debug, Clone)]
pub struct BinPaths {
    dir: PathBuf,
}

impl BinPaths {
    /// Helpers under `<dir>/bin/`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BinPaths { dir: dir.into() }
    }

    /// Helpers next to the embedding binary, the conventional layout.
    pub fn from_current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "program has no parent dir"))?;
        Ok(BinPaths { dir })
    }

    pub(crate) fn nsexec(&self) -> PathBuf {
        self.dir.join("bin").join(NSEXEC_BIN)
    }

    pub(crate) fn chaos_os(&self) -> PathBuf {
        self.dir.join("bin").join(CHAOS_OS_BIN)
    }
}

/// Which of the target's namespaces the payload enters. Pid is always
/// joined; network faults add net, everything else adds mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NamespaceSet {
    pub pid: bool,
    pub mount: bool,
    pub net: bool,
}

impl NamespaceSet {
    pub(crate) fn mount() -> Self {
        NamespaceSet {
            pid: true,
            mount: true,
            net: false,
        }
    }

    pub(crate) fn net() -> Self {
        NamespaceSet {
            pid: true,
            mount: false,
            net: true,
        }
    }

    pub(crate) fn args(&self, pid: i32) -> Vec<String> {
        let mut args = vec!["-t".to_string(), pid.to_string()];
        if self.pid {
            args.push("-p".to_string());
        }
        if self.mount {
            args.push("-m".to_string());
        }
        if self.net {
            args.push("-n".to_string());
        }
        args
    }
}

#[derive(Debug)]
pub(crate) struct HelperOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

async fn run(
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<HelperOutput, NsExecError> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.spawn().map_err(NsExecError::Start)?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => {
            return Err(NsExecError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled while waiting for nsexec",
            )));
        }
    };

    Ok(HelperOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status,
    })
}

/// Pick the authoritative result out of a helper's split output.
///
/// Some fault helpers emit human-readable progress on stderr with the JSON
/// result on stdout; on certain distros others invert that. Hence the
/// ordering: JSON-shaped stdout, JSON-shaped stderr, raw stderr, raw
/// stdout, then the exit status.
pub(crate) fn extract_streams(
    stdout: &str,
    stderr: &str,
    exit: Result<(), String>,
) -> Result<String, NsExecError> {
    let stdout = stdout.trim();
    let stderr = stderr.trim();

    if stdout.starts_with('{') && stdout.ends_with('}') {
        return Ok(stdout.to_string());
    }
    if stderr.starts_with('{') && stderr.ends_with('}') {
        return Ok(stderr.to_string());
    }
    if !stderr.is_empty() {
        return Ok(stderr.to_string());
    }
    if !stdout.is_empty() {
        return Ok(stdout.to_string());
    }
    exit.map(|()| String::new()).map_err(NsExecError::Exit)
}

pub(crate) fn extract_result(output: &HelperOutput) -> Result<String, NsExecError> {
    let exit = if output.status.success() {
        Ok(())
    } else {
        Err(output.status.to_string())
    };
    extract_streams(&output.stdout, &output.stderr, exit)
}

/// Run a shell command inside the target's namespaces and extract its
/// result.
#[tracing::instrument(level = "trace", skip(paths, cancel))]
pub(crate) async fn run_in_namespace(
    paths: &BinPaths,
    pid: i32,
    namespaces: NamespaceSet,
    shell_command: &str,
    cancel: &CancellationToken,
) -> Result<String, NsExecError> {
    let mut command = Command::new(paths.nsexec());
    command
        .args(namespaces.args(pid))
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg(shell_command)
        .stdin(Stdio::null());
    debug!(pid, shell_command, "running command through nsexec");

    let output = run(command, cancel).await?;
    trace!(stdout = %output.stdout, stderr = %output.stderr, "nsexec output");
    extract_result(&output)
}

/// Copy a local tarball into a target's mount namespace and unpack it.
///
/// Two `nsexec` invocations: stream the file into `<dst>/<base>` through
/// `cat`, then `tar -zxf` it in place. Either step writing to stderr is a
/// failure.
#[tracing::instrument(level = "trace", skip(paths, cancel))]
pub(crate) async fn copy_into_namespace(
    paths: &BinPaths,
    pid: i32,
    src_file: &Path,
    dst_path: &str,
    cancel: &CancellationToken,
) -> Result<(), NsExecError> {
    let base = src_file
        .file_name()
        .ok_or_else(|| {
            NsExecError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source file has no name",
            ))
        })?
        .to_string_lossy()
        .into_owned();
    let dst_file = format!("{}/{}", dst_path.trim_end_matches('/'), base);

    let source = std::fs::File::open(src_file)?;
    let mut command = Command::new(paths.nsexec());
    command
        .args(NamespaceSet::mount().args(pid))
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!("cat > {dst_file}"))
        .stdin(Stdio::from(source));
    debug!(pid, %dst_file, "streaming tarball into namespace");
    let output = run(command, cancel).await?;
    if !output.stderr.trim().is_empty() {
        return Err(NsExecError::Stderr(output.stderr.trim().to_string()));
    }
    if !output.status.success() {
        return Err(NsExecError::Exit(output.status.to_string()));
    }

    let mut command = Command::new(paths.nsexec());
    command
        .args(NamespaceSet::mount().args(pid))
        .arg("--")
        .arg("tar")
        .arg("-zxf")
        .arg(&dst_file)
        .arg("-C")
        .arg(dst_path)
        .stdin(Stdio::null());
    debug!(pid, %dst_file, "unpacking tarball inside namespace");
    let output = run(command, cancel).await?;
    if !output.stderr.trim().is_empty() {
        return Err(NsExecError::Stderr(output.stderr.trim().to_string()));
    }
    if !output.status.success() {
        return Err(NsExecError::Exit(output.status.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use rstest::rstest;

    use super::*;

    fn output(stdout: &str, stderr: &str, code: i32) -> HelperOutput {
        HelperOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status: std::process::ExitStatus::from_raw(code << 8),
        }
    }

    #[test]
    fn namespace_args_for_network() {
        assert_eq!(
            NamespaceSet::net().args(4242),
            vec!["-t", "4242", "-p", "-n"]
        );
    }

    #[test]
    fn namespace_args_for_mount() {
        assert_eq!(NamespaceSet::mount().args(99), vec!["-t", "99", "-p", "-m"]);
    }

    #[rstest]
    #[case(r#"{"code":200}"#, "progress on stderr", r#"{"code":200}"#)]
    #[case("plain progress", r#"{"code":200}"#, r#"{"code":200}"#)]
    #[case("", "tc: not found", "tc: not found")]
    #[case("done", "", "done")]
    fn extraction_priority(#[case] stdout: &str, #[case] stderr: &str, #[case] expected: &str) {
        let result = extract_result(&output(stdout, stderr, 0)).unwrap();
        assert_eq!(result, expected);
    }

    #[test]
    fn silent_nonzero_exit_is_an_error() {
        let err = extract_result(&output("", "", 1)).unwrap_err();
        assert!(matches!(err, NsExecError::Exit(..)));
    }

    #[test]
    fn silent_success_is_empty() {
        assert_eq!(extract_result(&output("", "", 0)).unwrap(), "");
    }
}
