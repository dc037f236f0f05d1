//! Flat catalogue of the supported experiments.
//!
//! The shape mirrors the experiment model table shipped by the model
//! library:
//! one row per `(target, action)` with its routing strategy and whether the
//! action leaves a resident helper behind. Embedders use it to pre-fill
//! [`ExperimentRequest::hang`](crate::request::ExperimentRequest) and to
//! enumerate what the dispatcher understands.

/// Which executor strategy serves an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// `chaos_os` through `nsexec` inside the target's namespaces.
    InNamespace,
    /// Full chaosblade tool copied into and executed inside the container.
    ToolCopy,
    /// Temporary container sharing the target's network namespace.
    Sidecar,
}

#[derive(Debug, Clone, Copy)]
pub struct ExperimentDef {
    pub target: &'static str,
    pub action: &'static str,
    /// Whether create spawns a resident helper kept alive until destroy.
    pub hang: bool,
    pub executor: ExecutorKind,
    pub summary: &'static str,
}

const fn def(
    target: &'static str,
    action: &'static str,
    hang: bool,
    executor: ExecutorKind,
    summary: &'static str,
) -> ExperimentDef {
    ExperimentDef {
        target,
        action,
        hang,
        executor,
        summary,
    }
}

use ExecutorKind::{InNamespace, ToolCopy};

pub static CATALOG: &[ExperimentDef] = &[
    def("network", "delay", false, InNamespace, "delay outgoing packets"),
    def("network", "loss", false, InNamespace, "drop a percentage of packets"),
    def("network", "dns", false, InNamespace, "hijack domain resolution"),
    def("network", "corrupt", false, InNamespace, "corrupt packet payloads"),
    def("network", "duplicate", false, InNamespace, "duplicate packets"),
    def("network", "reorder", false, InNamespace, "reorder packets"),
    def("network", "drop", false, InNamespace, "drop traffic on a port"),
    def("network", "occupy", true, InNamespace, "hold a port open"),
    def("cpu", "load", true, InNamespace, "burn cpu at a target percentage"),
    def("mem", "load", true, InNamespace, "fill memory to a target percentage"),
    def("disk", "fill", true, InNamespace, "fill disk space under a path"),
    def("disk", "burn", true, InNamespace, "saturate disk read/write io"),
    def("file", "append", false, ToolCopy, "append content to a file"),
    def("file", "add", false, ToolCopy, "create a file or directory"),
    def("file", "chmod", false, ToolCopy, "change file permissions"),
    def("file", "delete", false, ToolCopy, "delete a file"),
    def("file", "move", false, ToolCopy, "move a file"),
    def("process", "kill", false, InNamespace, "kill processes by name or port"),
    def("process", "stop", false, InNamespace, "SIGSTOP processes by name"),
    def("jvm", "return", false, ToolCopy, "mock a method return value"),
    def("jvm", "throws", false, ToolCopy, "throw an exception from a method"),
    def("jvm", "delay", false, ToolCopy, "delay a method call"),
    def("jvm", "full-gc", false, ToolCopy, "trigger full garbage collections"),
    def("jvm", "oom", false, ToolCopy, "exhaust jvm heap or metaspace"),
];

pub fn lookup(target: &str, action: &str) -> Option<&'static ExperimentDef> {
    CATALOG
        .iter()
        .find(|def| def.target == target && def.action == action)
}

/// Whether a create for this experiment leaves a resident helper behind.
pub fn is_hang(target: &str, action: &str) -> bool {
    lookup(target, action).map(|def| def.hang).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("cpu", "load", true)]
    #[case("mem", "load", true)]
    #[case("disk", "burn", true)]
    #[case("network", "delay", false)]
    #[case("process", "kill", false)]
    #[case("nosuch", "action", false)]
    fn hang_classification(#[case] target: &str, #[case] action: &str, #[case] hang: bool) {
        assert_eq!(is_hang(target, action), hang);
    }

    #[test]
    fn jvm_routes_to_tool_copy() {
        for def in CATALOG.iter().filter(|def| def.target == "jvm") {
            assert_eq!(def.executor, ExecutorKind::ToolCopy);
        }
    }

    #[test]
    fn no_duplicate_rows() {
        for (index, def) in CATALOG.iter().enumerate() {
            assert!(
                !CATALOG
                    .iter()
                    .skip(index + 1)
                    .any(|other| other.target == def.target && other.action == def.action),
                "duplicate row {}/{}",
                def.target,
                def.action
            );
        }
    }
}
