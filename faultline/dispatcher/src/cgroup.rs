//! Placing helper processes into a target's cgroups.
//!
//! The helper must be accounted against the target container's resource
//! limits, so before it starts running the payload its PID is written into
//! every group the target PID is a member of. Layout detection and the
//! `/proc/<pid>/cgroup` parsing cover both the unified v2 hierarchy and the
//! per-controller v1 hierarchies.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::error::CgroupError;

pub(crate) const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/";
pub(crate) const CGROUP_ROOT_ENV: &str = "CGROUP_ROOT";

/// Root of the cgroup filesystem: `CGROUP_ROOT` env wins, then the
/// `cgroup-root` experiment flag, then the conventional mount point.
pub(crate) fn resolve_root(flag: Option<&str>) -> PathBuf {
    std::env::var(CGROUP_ROOT_ENV)
        .ok()
        .filter(|root| !root.is_empty())
        .or_else(|| flag.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CGROUP_ROOT.to_string())
        .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CgroupVersion {
    V1,
    V2,
}

/// v2 mounts expose `cgroup.controllers` at the hierarchy root.
pub(crate) fn detect_version(root: &Path) -> CgroupVersion {
    if root.join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else {
        CgroupVersion::V1
    }
}

/// One line of `/proc/<pid>/cgroup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Membership {
    pub hierarchy: u32,
    pub controllers: Vec<String>,
    pub path: String,
}

pub(crate) fn parse_memberships(content: &str) -> Vec<Membership> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let hierarchy = parts.next()?.parse().ok()?;
            let controllers = parts.next()?;
            let path = parts.next()?;
            Some(Membership {
                hierarchy,
                controllers: controllers
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// The cgroups of one target PID, resolved against a hierarchy root.
#[derive(Debug)]
pub(crate) struct TargetCgroup {
    root: PathBuf,
    version: CgroupVersion,
    memberships: Vec<Membership>,
}

impl TargetCgroup {
    pub(crate) fn for_pid(root: PathBuf, pid: i32) -> Result<Self, CgroupError> {
        let path = format!("/proc/{pid}/cgroup");
        let content = fs::read_to_string(&path).map_err(|source| CgroupError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(Self::from_parts(root, &content))
    }

    pub(crate) fn from_parts(root: PathBuf, proc_cgroup: &str) -> Self {
        let version = detect_version(&root);
        TargetCgroup {
            root,
            version,
            memberships: parse_memberships(proc_cgroup),
        }
    }

    /// The unified-hierarchy group, from the `0::` line.
    fn v2_group(&self) -> Result<&str, CgroupError> {
        self.memberships
            .iter()
            .find(|membership| membership.hierarchy == 0 && membership.controllers.is_empty())
            .map(|membership| membership.path.as_str())
            .ok_or(CgroupError::MissingEntry(0))
    }

    /// Add `pid` to every group the target belongs to.
    ///
    /// Missing group directories are recreated (the runtime may have cycled
    /// the group), which fails loudly when the cgroup filesystem is mounted
    /// read-only.
    #[tracing::instrument(level = "trace", skip(self), fields(root = %self.root.display()))]
    pub(crate) fn add_process(&self, pid: u32) -> Result<(), CgroupError> {
        match self.version {
            CgroupVersion::V2 => {
                let group = self.v2_group()?;
                self.join_group(&self.root.join(group.trim_start_matches('/')), pid)
            }
            CgroupVersion::V1 => {
                for membership in &self.memberships {
                    for controller in &membership.controllers {
                        let dir = self.controller_mount(controller)?;
                        self.join_group(
                            &dir.join(membership.path.trim_start_matches('/')),
                            pid,
                        )?;
                    }
                }
                Ok(())
            }
        }
    }

    /// v1 mount directory for a controller, resolving `name=<ctrl>` aliases.
    fn controller_mount(&self, controller: &str) -> Result<PathBuf, CgroupError> {
        let plain = self.root.join(controller);
        if plain.exists() {
            return Ok(plain);
        }
        if let Some(alias) = controller.strip_prefix("name=") {
            let aliased = self.root.join(alias);
            if aliased.exists() {
                return Ok(aliased);
            }
        }
        Err(CgroupError::UnsupportedController(controller.to_string()))
    }

    fn join_group(&self, group_dir: &Path, pid: u32) -> Result<(), CgroupError> {
        if !group_dir.exists() {
            debug!(dir = %group_dir.display(), "cgroup missing, recreating");
            fs::create_dir_all(group_dir).map_err(|source| {
                if source.raw_os_error() == Some(nix::errno::Errno::EROFS as i32) {
                    CgroupError::ReadOnly {
                        path: group_dir.display().to_string(),
                        source,
                    }
                } else {
                    CgroupError::Join {
                        path: group_dir.display().to_string(),
                        source,
                    }
                }
            })?;
        }
        let procs = group_dir.join("cgroup.procs");
        trace!(file = %procs.display(), pid, "joining cgroup");
        fs::write(&procs, pid.to_string()).map_err(|source| CgroupError::Join {
            path: procs.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const V1_PROC_CGROUP: &str = "\
12:memory:/docker/abc
5:cpu,cpuacct:/docker/abc
1:name=systemd:/docker/abc
";

    const V2_PROC_CGROUP: &str = "0::/kubepods/burstable/pod1/abc\n";

    fn v2_root() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("cgroup.controllers"), "cpu memory").unwrap();
        root
    }

    #[test]
    fn parses_v1_lines() {
        let memberships = parse_memberships(V1_PROC_CGROUP);
        assert_eq!(memberships.len(), 3);
        assert_eq!(
            memberships[1].controllers,
            vec!["cpu".to_string(), "cpuacct".to_string()]
        );
        assert_eq!(memberships[2].controllers, vec!["name=systemd".to_string()]);
        assert_eq!(memberships[0].path, "/docker/abc");
    }

    #[test]
    fn detects_layouts() {
        let v1 = TempDir::new().unwrap();
        assert_eq!(detect_version(v1.path()), CgroupVersion::V1);
        let v2 = v2_root();
        assert_eq!(detect_version(v2.path()), CgroupVersion::V2);
    }

    #[test]
    fn v2_join_writes_pid_and_creates_missing_group() {
        let root = v2_root();
        let target = TargetCgroup::from_parts(root.path().to_path_buf(), V2_PROC_CGROUP);
        target.add_process(4242).unwrap();

        let procs = root
            .path()
            .join("kubepods/burstable/pod1/abc")
            .join("cgroup.procs");
        assert_eq!(fs::read_to_string(procs).unwrap(), "4242");
    }

    #[test]
    fn v2_without_unified_entry_is_an_error() {
        let root = v2_root();
        let target = TargetCgroup::from_parts(root.path().to_path_buf(), V1_PROC_CGROUP);
        assert!(matches!(
            target.add_process(1).unwrap_err(),
            CgroupError::MissingEntry(0)
        ));
    }

    #[test]
    fn v1_joins_every_controller_with_alias() {
        let root = TempDir::new().unwrap();
        for controller in ["memory", "cpu", "cpuacct", "systemd"] {
            fs::create_dir_all(root.path().join(controller).join("docker/abc")).unwrap();
        }
        let target = TargetCgroup::from_parts(root.path().to_path_buf(), V1_PROC_CGROUP);
        target.add_process(99).unwrap();

        for controller in ["memory", "cpu", "cpuacct", "systemd"] {
            let procs = root.path().join(controller).join("docker/abc/cgroup.procs");
            assert_eq!(fs::read_to_string(procs).unwrap(), "99", "{controller}");
        }
    }

    #[test]
    fn v1_missing_controller_is_unsupported() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("memory")).unwrap();
        let target = TargetCgroup::from_parts(root.path().to_path_buf(), V1_PROC_CGROUP);
        assert!(matches!(
            target.add_process(99).unwrap_err(),
            CgroupError::UnsupportedController(controller) if controller == "cpu"
        ));
    }
}
