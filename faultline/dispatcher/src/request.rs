use std::collections::HashMap;

/// Which half of the experiment lifecycle a dispatch drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Destroy,
}

impl Phase {
    /// The literal verb handed to the fault helpers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Create => "create",
            Phase::Destroy => "destroy",
        }
    }

    pub fn is_destroy(&self) -> bool {
        matches!(self, Phase::Destroy)
    }
}

/// One experiment to install or retract.
///
/// The request lives only on the call stack of a single dispatch; nothing is
/// registered or cached across calls. `uid` correlates the create with a
/// later destroy and is propagated verbatim into the helper argument vector.
#[derive(Debug, Clone)]
pub struct ExperimentRequest {
    /// Caller-chosen identifier, unique across concurrent experiments.
    pub uid: String,
    /// Domain noun: `network`, `cpu`, `mem`, `disk`, `file`, `process`, `jvm`.
    pub target: String,
    /// Verb within the target, e.g. `delay`, `loss`, `load`, `kill`.
    pub action: String,
    pub phase: Phase,
    /// Whether the action spawns a resident helper that must stay alive
    /// until the destroy phase.
    pub hang: bool,
    /// Flag name to value. Selector and runtime flags are extracted by the
    /// dispatcher; everything else is forwarded to the helper unchanged.
    pub flags: HashMap<String, String>,
}

impl ExperimentRequest {
    pub fn new(
        uid: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        phase: Phase,
    ) -> Self {
        ExperimentRequest {
            uid: uid.into(),
            target: target.into(),
            action: action.into(),
            phase,
            hang: false,
            flags: HashMap::new(),
        }
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    pub fn with_hang(mut self, hang: bool) -> Self {
        self.hang = hang;
        self
    }

    /// Flag lookup treating empty values as absent, matching how the fault
    /// helpers interpret their command lines.
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Truthy flag lookup; anything but a parseable `true` is `false`.
    pub fn flag_enabled(&self, name: &str) -> bool {
        self.flag(name)
            .and_then(|value| value.parse::<bool>().ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flag_values_are_absent() {
        let request = ExperimentRequest::new("exp-1", "network", "delay", Phase::Create)
            .with_flag("interface", "eth0")
            .with_flag("time", "");

        assert_eq!(request.flag("interface"), Some("eth0"));
        assert_eq!(request.flag("time"), None);
        assert_eq!(request.flag("missing"), None);
    }

    #[test]
    fn flag_enabled_only_on_literal_true() {
        let request = ExperimentRequest::new("exp-1", "mem", "load", Phase::Create)
            .with_flag("avoid-being-killed", "true")
            .with_flag("chaosblade-override", "yes");

        assert!(request.flag_enabled("avoid-being-killed"));
        assert!(!request.flag_enabled("chaosblade-override"));
        assert!(!request.flag_enabled("missing"));
    }
}
