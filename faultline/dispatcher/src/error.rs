use thiserror::Error;

/// Numeric codes carried alongside every failure, stable across releases so
/// that embedding processes can match on them.
pub mod code {
    pub const OK: i32 = 200;
    pub const PARAMETER_LESS: i32 = 45000;
    pub const PARAMETER_INVALID: i32 = 45002;
    pub const PARAMETER_INVALID_CONTAINER_ID: i32 = 45004;
    pub const IMAGE_PULL_FAILED: i32 = 56001;
    pub const CREATE_CONTAINER_FAILED: i32 = 56002;
    pub const CONTAINER_EXEC_FAILED: i32 = 56003;
    pub const OS_CMD_EXEC_FAILED: i32 = 56004;
    pub const CRI_EXEC_NOT_FOUND: i32 = 56005;
}

/// Failures surfaced by the runtime clients (docker / containerd / CRI).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("`{flag}` parameter is invalid, no container matched the selector")]
    ContainerNotFound { flag: &'static str },

    #[error("no running container matched the CRI query `{0}`")]
    CriNotFound(String),

    #[error("PID unavailable for container `{0}`")]
    PidUnavailable(String),

    #[error("container exec failed in `{op}`: {cause}")]
    ExecFailed { op: &'static str, cause: String },

    #[error("pulling image `{image}` failed: {cause}")]
    ImagePull { image: String, cause: String },

    #[error("creating sidecar container failed: {0}")]
    CreateContainer(String),

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn code(&self) -> i32 {
        match self {
            RuntimeError::ContainerNotFound { .. } => code::PARAMETER_INVALID_CONTAINER_ID,
            RuntimeError::CriNotFound(..) => code::CRI_EXEC_NOT_FOUND,
            RuntimeError::ImagePull { .. } => code::IMAGE_PULL_FAILED,
            RuntimeError::CreateContainer(..) => code::CREATE_CONTAINER_FAILED,
            _ => code::CONTAINER_EXEC_FAILED,
        }
    }
}

/// Failures from invoking the host-side `nsexec` helper.
#[derive(Debug, Error)]
pub enum NsExecError {
    #[error("command start failed, {0}")]
    Start(std::io::Error),

    #[error("nsexec reported: {0}")]
    Stderr(String),

    #[error("helper exited with {0}")]
    Exit(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while joining the helper to the target's cgroups.
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cannot read `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no cgroup entry found for pid {0}")]
    MissingEntry(u32),

    #[error("cgroup controller `{0}` is not supported on this host")]
    UnsupportedController(String),

    #[error("cgroup filesystem at `{path}` is not writable: {source}")]
    ReadOnly {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to join cgroup `{path}`: {source}")]
    Join {
        path: String,
        source: std::io::Error,
    },
}

/// Failures of the pause/resume handshake for hang actions.
#[derive(Debug, Error)]
pub enum PauseError {
    #[error("command start failed, {0}")]
    Start(std::io::Error),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    #[error("nsexec process exited unexpectedly during pause")]
    DiedDuringPause,

    #[error("nsexec process exited unexpectedly during resume")]
    DiedDuringResume,

    #[error("send signal failed, {0}")]
    Signal(nix::errno::Errno),

    #[error("experiment cancelled while waiting for the helper to settle")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level dispatcher error. Every variant maps to one of the stable
/// numeric codes in [`code`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("less parameter, please add the `{tips}` flag")]
    ParameterLess { tips: String },

    #[error("`{value}`: {flag} parameter is invalid, {cause}")]
    ParameterInvalid {
        flag: &'static str,
        value: String,
        cause: String,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    NsExec(#[from] NsExecError),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    #[error(transparent)]
    Pause(#[from] PauseError),

    #[error("`{cmd}` command failed on host: {cause}")]
    OsCmd { cmd: &'static str, cause: String },
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::ParameterLess { .. } => code::PARAMETER_LESS,
            DispatchError::ParameterInvalid { .. } => code::PARAMETER_INVALID,
            DispatchError::Runtime(inner) => inner.code(),
            DispatchError::NsExec(..)
            | DispatchError::Cgroup(..)
            | DispatchError::Pause(..)
            | DispatchError::OsCmd { .. } => code::OS_CMD_EXEC_FAILED,
        }
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        let not_found = DispatchError::from(RuntimeError::ContainerNotFound {
            flag: "container-id",
        });
        assert_eq!(not_found.code(), code::PARAMETER_INVALID_CONTAINER_ID);
        assert!(not_found.to_string().contains("container-id"));

        assert_eq!(
            DispatchError::from(RuntimeError::CriNotFound("x".into())).code(),
            code::CRI_EXEC_NOT_FOUND
        );
        assert_eq!(
            DispatchError::from(RuntimeError::ImagePull {
                image: "img".into(),
                cause: "no route".into(),
            })
            .code(),
            code::IMAGE_PULL_FAILED
        );
        assert_eq!(
            DispatchError::ParameterLess {
                tips: "container-id".into()
            }
            .code(),
            code::PARAMETER_LESS
        );
        assert_eq!(
            DispatchError::from(NsExecError::Stderr("boom".into())).code(),
            code::OS_CMD_EXEC_FAILED
        );
    }
}
