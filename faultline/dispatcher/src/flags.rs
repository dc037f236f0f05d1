//! Recognised request flags and their extraction into runtime options.
//!
//! The flag catalogue mirrors the flat table published by the experiment
//! model library; only the names the dispatcher itself consumes live here.

use crate::request::ExperimentRequest;

pub const CONTAINER_ID: &str = "container-id";
pub const CONTAINER_NAME: &str = "container-name";
pub const CONTAINER_LABEL_SELECTOR: &str = "container-label-selector";
pub const CONTAINER_RUNTIME: &str = "container-runtime";
pub const CRI_ENDPOINT: &str = "cri-endpoint";
pub const CONTAINER_NAMESPACE: &str = "container-namespace";
pub const IMAGE_REPO: &str = "image-repo";
pub const IMAGE_VERSION: &str = "image-version";
pub const CHAOSBLADE_RELEASE: &str = "chaosblade-release";
pub const CHAOSBLADE_OVERRIDE: &str = "chaosblade-override";
pub const CGROUP_ROOT: &str = "cgroup-root";
pub const AVOID_BEING_KILLED: &str = "avoid-being-killed";
pub const TIMEOUT: &str = "timeout";

/// Flags steering the namespace helper itself; never forwarded.
pub const CHANNEL: &str = "channel";
pub const NS_TARGET: &str = "ns-target";
pub const NS_PID: &str = "ns-pid";
pub const NS_MNT: &str = "ns-mnt";
pub const NS_NET: &str = "ns-net";

/// Version baked into the default chaosblade release tarball path.
pub const BLADE_VERSION: &str = "1.7.4";

pub const DEFAULT_IMAGE_REPO: &str =
    "registry.cn-hangzhou.aliyuncs.com/chaosblade/chaosblade-tool";
pub const DEFAULT_IMAGE_VERSION: &str = "latest";

/// Flags the dispatcher extracts for its own use. They select the container
/// and the runtime; the fault helpers never see them.
const DISPATCHER_FLAGS: &[&str] = &[
    CONTAINER_ID,
    CONTAINER_NAME,
    CONTAINER_LABEL_SELECTOR,
    CONTAINER_RUNTIME,
    CRI_ENDPOINT,
    CONTAINER_NAMESPACE,
    IMAGE_REPO,
    IMAGE_VERSION,
    CHAOSBLADE_RELEASE,
    CHAOSBLADE_OVERRIDE,
];

const NSEXEC_FLAGS: &[&str] = &[CHANNEL, NS_TARGET, NS_PID, NS_MNT, NS_NET];

pub(crate) fn is_dispatcher_flag(name: &str) -> bool {
    DISPATCHER_FLAGS.contains(&name)
}

pub(crate) fn is_nsexec_flag(name: &str) -> bool {
    NSEXEC_FLAGS.contains(&name)
}

/// The flags forwarded to the helper, `(name, value)` in sorted name order.
///
/// Sorted order keeps the argument vector deterministic so that a destroy
/// built by a newer caller matches the create issued by an older one. Empty
/// values, dispatcher flags, namespace-control flags and `timeout` are
/// dropped.
pub(crate) fn forwarded_flags(request: &ExperimentRequest) -> Vec<(String, String)> {
    let mut flags: Vec<(String, String)> = request
        .flags
        .iter()
        .filter(|(name, value)| {
            !value.is_empty()
                && !is_dispatcher_flag(name)
                && !is_nsexec_flag(name)
                && name.as_str() != TIMEOUT
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    flags.sort();
    flags
}

/// Which runtime variant serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Cri,
}

/// Runtime-level options extracted from the request flags.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub kind: RuntimeKind,
    /// Socket endpoint; empty means probe the defaults (CRI) or use the
    /// runtime's conventional socket.
    pub endpoint: String,
    /// containerd namespace.
    pub namespace: String,
}

impl RuntimeOptions {
    pub fn from_request(request: &ExperimentRequest) -> Self {
        // Anything that is neither docker nor containerd is served through
        // the generic CRI endpoint path.
        let kind = match request.flag(CONTAINER_RUNTIME) {
            None | Some("docker") => RuntimeKind::Docker,
            Some("containerd") => RuntimeKind::Containerd,
            Some(_) => RuntimeKind::Cri,
        };
        RuntimeOptions {
            kind,
            endpoint: request.flag(CRI_ENDPOINT).unwrap_or_default().to_string(),
            namespace: request
                .flag(CONTAINER_NAMESPACE)
                .unwrap_or("k8s.io")
                .to_string(),
        }
    }
}

/// Sidecar image reference, `<repo>:<version>` with the chaosblade-tool
/// defaults.
pub(crate) fn image_ref(request: &ExperimentRequest) -> String {
    let repo = request.flag(IMAGE_REPO).unwrap_or(DEFAULT_IMAGE_REPO);
    let version = request.flag(IMAGE_VERSION).unwrap_or(DEFAULT_IMAGE_VERSION);
    format!("{repo}:{version}")
}

/// Path of the chaosblade release tarball used by the tool-copy strategy.
pub(crate) fn blade_release_path(request: &ExperimentRequest) -> String {
    request
        .flag(CHAOSBLADE_RELEASE)
        .map(str::to_string)
        .unwrap_or_else(|| format!("/opt/chaosblade-{BLADE_VERSION}.tar.gz"))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::request::Phase;

    fn request() -> ExperimentRequest {
        ExperimentRequest::new("exp-1", "network", "delay", Phase::Create)
            .with_flag(CONTAINER_ID, "abc123")
            .with_flag("time", "3000")
            .with_flag("interface", "eth0")
            .with_flag(TIMEOUT, "60")
            .with_flag(NS_TARGET, "1")
            .with_flag("offset", "")
    }

    #[test]
    fn forwarded_flags_drop_control_flags_and_sort() {
        let flags = forwarded_flags(&request());
        assert_eq!(
            flags,
            vec![
                ("interface".to_string(), "eth0".to_string()),
                ("time".to_string(), "3000".to_string()),
            ]
        );
    }

    #[rstest]
    #[case(None, RuntimeKind::Docker)]
    #[case(Some("docker"), RuntimeKind::Docker)]
    #[case(Some("containerd"), RuntimeKind::Containerd)]
    #[case(Some("cri"), RuntimeKind::Cri)]
    #[case(Some("cri-o"), RuntimeKind::Cri)]
    fn runtime_selection(#[case] flag: Option<&str>, #[case] expected: RuntimeKind) {
        let mut request = request();
        if let Some(flag) = flag {
            request = request.with_flag(CONTAINER_RUNTIME, flag);
        }
        assert_eq!(RuntimeOptions::from_request(&request).kind, expected);
    }

    #[test]
    fn containerd_namespace_defaults() {
        let options = RuntimeOptions::from_request(&request());
        assert_eq!(options.namespace, "k8s.io");
        assert_eq!(options.endpoint, "");
    }

    #[test]
    fn image_and_release_defaults() {
        let plain = request();
        assert_eq!(
            image_ref(&plain),
            "registry.cn-hangzhou.aliyuncs.com/chaosblade/chaosblade-tool:latest"
        );
        assert_eq!(
            blade_release_path(&plain),
            format!("/opt/chaosblade-{BLADE_VERSION}.tar.gz")
        );

        let custom = plain
            .with_flag(IMAGE_REPO, "example.com/tool")
            .with_flag(IMAGE_VERSION, "1.2.0")
            .with_flag(CHAOSBLADE_RELEASE, "/opt/cb.tar.gz");
        assert_eq!(image_ref(&custom), "example.com/tool:1.2.0");
        assert_eq!(blade_release_path(&custom), "/opt/cb.tar.gz");
    }
}
