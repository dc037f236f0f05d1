//! Executor strategies and the dispatcher that routes requests to them.

use std::sync::Arc;

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    flags,
    nsexec::BinPaths,
    request::ExperimentRequest,
    response::Response,
    runtime::ClientRegistry,
};

mod in_namespace;
mod sidecar;
mod tool_copy;

pub(crate) use in_namespace::InNamespaceExecutor;
pub(crate) use sidecar::SidecarExecutor;
pub(crate) use tool_copy::ToolCopyExecutor;

/// One way of delivering a fault to a container.
#[async_trait]
#[enum_dispatch]
pub(crate) trait Executor {
    async fn exec(
        &self,
        uid: &str,
        cancel: &CancellationToken,
        request: &ExperimentRequest,
    ) -> Response;
}

#[enum_dispatch(Executor)]
pub(crate) enum Strategy {
    InNamespace(InNamespaceExecutor),
    ToolCopy(ToolCopyExecutor),
    Sidecar(SidecarExecutor),
}

/// How network faults are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkStrategy {
    /// `chaos_os` inside the target's net namespace (the default).
    #[default]
    InNamespace,
    /// A temporary chaosblade-tool container sharing the target's net
    /// namespace; requires the docker runtime.
    Sidecar,
}

/// The container fault dispatcher.
///
/// Synchronous per call: picks a strategy for the request, resolves the
/// target container through the shared [`ClientRegistry`], delivers the
/// fault and decodes the helper's output. All spawned workers are scoped to
/// the call.
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    paths: BinPaths,
    network: NetworkStrategy,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>, paths: BinPaths) -> Self {
        Dispatcher {
            registry,
            paths,
            network: NetworkStrategy::default(),
        }
    }

    pub fn with_network_strategy(mut self, network: NetworkStrategy) -> Self {
        self.network = network;
        self
    }

    fn route(&self, request: &ExperimentRequest) -> Strategy {
        let wants_blade_tool = request.flag(flags::CHAOSBLADE_RELEASE).is_some()
            || request.flag(flags::CHAOSBLADE_OVERRIDE).is_some();
        match request.target.as_str() {
            "jvm" => Strategy::ToolCopy(ToolCopyExecutor::new(self.registry.clone())),
            "file" if wants_blade_tool => {
                Strategy::ToolCopy(ToolCopyExecutor::new(self.registry.clone()))
            }
            "network" if self.network == NetworkStrategy::Sidecar => {
                Strategy::Sidecar(SidecarExecutor::new(self.registry.clone()))
            }
            _ => Strategy::InNamespace(InNamespaceExecutor::new(
                self.registry.clone(),
                self.paths.clone(),
            )),
        }
    }

    /// Run one experiment phase to completion.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(uid = %request.uid, target = %request.target, action = %request.action, phase = request.phase.as_str())
    )]
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        request: &ExperimentRequest,
    ) -> Response {
        let strategy = self.route(request);
        debug!("dispatching experiment");
        strategy.exec(&request.uid, cancel, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Phase;

    fn dispatcher() -> Dispatcher {
        let paths = BinPaths::new("/opt/faultline");
        Dispatcher::new(Arc::new(ClientRegistry::new(paths.clone())), paths)
    }

    fn request(target: &str, action: &str) -> ExperimentRequest {
        ExperimentRequest::new("exp-1", target, action, Phase::Create)
    }

    #[test]
    fn jvm_routes_to_tool_copy() {
        assert!(matches!(
            dispatcher().route(&request("jvm", "return")),
            Strategy::ToolCopy(..)
        ));
    }

    #[test]
    fn file_routes_by_blade_flags() {
        let dispatcher = dispatcher();
        assert!(matches!(
            dispatcher.route(&request("file", "append")),
            Strategy::InNamespace(..)
        ));
        assert!(matches!(
            dispatcher.route(
                &request("file", "append").with_flag(flags::CHAOSBLADE_RELEASE, "/opt/cb.tar.gz")
            ),
            Strategy::ToolCopy(..)
        ));
    }

    #[test]
    fn network_routes_by_configured_strategy() {
        assert!(matches!(
            dispatcher().route(&request("network", "delay")),
            Strategy::InNamespace(..)
        ));
        assert!(matches!(
            dispatcher()
                .with_network_strategy(NetworkStrategy::Sidecar)
                .route(&request("network", "delay")),
            Strategy::Sidecar(..)
        ));
    }

    #[test]
    fn everything_else_runs_in_namespace() {
        for (target, action) in [("cpu", "load"), ("mem", "load"), ("process", "kill")] {
            assert!(matches!(
                dispatcher().route(&request(target, action)),
                Strategy::InNamespace(..)
            ));
        }
    }
}
