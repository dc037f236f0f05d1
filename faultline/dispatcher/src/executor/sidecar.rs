//! Sidecar strategy: network faults from a container sharing the target's
//! network namespace, leaving the target itself untouched.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    error::code,
    executor::{tool_copy::blade_command, Executor},
    flags,
    request::ExperimentRequest,
    response::{decode_output, Response},
    runtime::{ClientRegistry, ContainerRuntime, SidecarSpec},
    selector,
};

const SIDECAR_LABEL_KEY: &str = "chaosblade";
const SIDECAR_LABEL_VALUE: &str = "chaosblade-sidecar";
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct SidecarExecutor {
    registry: Arc<ClientRegistry>,
}

impl SidecarExecutor {
    pub(crate) fn new(registry: Arc<ClientRegistry>) -> Self {
        SidecarExecutor { registry }
    }
}

/// Deterministic sidecar name so that a destroy finds the same container a
/// create would have made.
pub(crate) fn sidecar_name(target_name: &str, target: &str, action: &str) -> String {
    format!("{target_name}-{target}-{action}")
}

#[async_trait]
impl Executor for SidecarExecutor {
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

        let timeout = request
            .flag(flags::TIMEOUT)
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXEC_TIMEOUT);
        let spec = SidecarSpec {
            name: sidecar_name(&handle.name, &request.target, &request.action),
            image: flags::image_ref(request),
            command: blade_command(uid, request),
            labels: HashMap::from([(
                SIDECAR_LABEL_KEY.to_string(),
                SIDECAR_LABEL_VALUE.to_string(),
            )]),
            target_container_id: handle.id.clone(),
            cap_add: vec!["NET_ADMIN".to_string()],
            remove_on_exit: true,
            timeout,
        };

        match client.execute_and_remove(cancel, &spec).await {
            Ok((sidecar_id, output)) => {
                info!(uid, %sidecar_id, %output, "sidecar finished");
                decode_output(&output, None)
            }
            Err(err) => {
                error!(%err, "sidecar execution failed");
                Response::fail(err.code(), err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_names_are_deterministic() {
        assert_eq!(sidecar_name("web", "network", "delay"), "web-network-delay");
    }
}
