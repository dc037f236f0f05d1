//! Resolving the target container from request flags.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    error::{DispatchError, Result},
    flags,
    request::ExperimentRequest,
    runtime::{ContainerHandle, ContainerRuntime, RuntimeClient},
};

/// How the target container is addressed, in flag-precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selector {
    Id(String),
    Name(String),
    Labels(HashMap<String, String>),
}

/// Pick the selector from the request flags.
///
/// `container-id` wins over `container-name`, which wins over
/// `container-label-selector`. All three absent is a parameter error naming
/// every flag.
pub(crate) fn selector_of(request: &ExperimentRequest) -> Result<Selector> {
    if let Some(id) = request.flag(flags::CONTAINER_ID) {
        return Ok(Selector::Id(id.to_string()));
    }
    if let Some(name) = request.flag(flags::CONTAINER_NAME) {
        return Ok(Selector::Name(name.to_string()));
    }
    if let Some(raw) = request.flag(flags::CONTAINER_LABEL_SELECTOR) {
        let labels = parse_label_selector(raw);
        if !labels.is_empty() {
            return Ok(Selector::Labels(labels));
        }
    }
    let tips = format!(
        "{} or {} or {}",
        flags::CONTAINER_ID,
        flags::CONTAINER_NAME,
        flags::CONTAINER_LABEL_SELECTOR
    );
    error!(%tips, "container selector flags are all empty");
    Err(DispatchError::ParameterLess { tips })
}

/// Parse `k=v,k=v`. Pairs without a `=` are silently dropped; there is no
/// escaping, so values cannot contain `,`.
pub(crate) fn parse_label_selector(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Resolve the request's target container through the runtime client.
pub(crate) async fn resolve(
    client: &RuntimeClient,
    cancel: &CancellationToken,
    request: &ExperimentRequest,
) -> Result<ContainerHandle> {
    let handle = match selector_of(request)? {
        Selector::Id(id) => client.get_container_by_id(cancel, &id).await?,
        Selector::Name(name) => client.get_container_by_name(cancel, &name).await?,
        Selector::Labels(labels) => client.get_container_by_labels(cancel, &labels).await?,
    };
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::request::Phase;

    fn request() -> ExperimentRequest {
        ExperimentRequest::new("exp-1", "cpu", "load", Phase::Create)
    }

    #[test]
    fn id_beats_name_and_labels() {
        let request = request()
            .with_flag(flags::CONTAINER_ID, "abc")
            .with_flag(flags::CONTAINER_NAME, "web")
            .with_flag(flags::CONTAINER_LABEL_SELECTOR, "app=web");
        assert_eq!(selector_of(&request).unwrap(), Selector::Id("abc".into()));
    }

    #[test]
    fn name_beats_labels() {
        let request = request()
            .with_flag(flags::CONTAINER_NAME, "web")
            .with_flag(flags::CONTAINER_LABEL_SELECTOR, "app=web");
        assert_eq!(
            selector_of(&request).unwrap(),
            Selector::Name("web".into())
        );
    }

    #[test]
    fn missing_selectors_report_all_flag_names() {
        let err = selector_of(&request()).unwrap_err();
        let message = err.to_string();
        for flag in [
            flags::CONTAINER_ID,
            flags::CONTAINER_NAME,
            flags::CONTAINER_LABEL_SELECTOR,
        ] {
            assert!(message.contains(flag), "`{message}` misses `{flag}`");
        }
    }

    #[rstest]
    #[case("app=web", &[("app", "web")])]
    #[case("app=web,tier=backend", &[("app", "web"), ("tier", "backend")])]
    #[case("app=web,garbage,x=1", &[("app", "web"), ("x", "1")])]
    #[case("novalue", &[])]
    #[case("", &[])]
    fn label_selector_grammar(#[case] raw: &str, #[case] expected: &[(&str, &str)]) {
        let labels = parse_label_selector(raw);
        assert_eq!(labels.len(), expected.len());
        for (key, value) in expected {
            assert_eq!(labels.get(*key).map(String::as_str), Some(*value));
        }
    }
}
