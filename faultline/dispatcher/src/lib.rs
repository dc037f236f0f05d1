//! Container fault dispatcher.
//!
//! Injects controlled faults (network loss/delay/corruption, cpu/mem/disk
//! pressure, file mutation, process kill, JVM faults) into individual
//! workloads running under docker, containerd or any CRI-compatible
//! runtime. Each fault is a named experiment with a create/destroy
//! lifecycle correlated by a caller-chosen `uid`.
//!
//! The embedding process builds an [`ExperimentRequest`], hands it to
//! [`Dispatcher::dispatch`] together with a cancellation token, and gets a
//! structured [`Response`] back. The low-level fault programs (`chaos_os`,
//! `nsexec`, the chaosblade tool tarball) are black-box binaries expected
//! under the configured [`BinPaths`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use faultline_dispatcher::{
//!     BinPaths, ClientRegistry, Dispatcher, ExperimentRequest, Phase,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let paths = BinPaths::from_current_exe().unwrap();
//! let dispatcher = Dispatcher::new(Arc::new(ClientRegistry::new(paths.clone())), paths);
//!
//! let request = ExperimentRequest::new("exp-1", "network", "delay", Phase::Create)
//!     .with_flag("container-id", "ee54f1e61c08")
//!     .with_flag("time", "3000")
//!     .with_flag("interface", "eth0");
//! let response = dispatcher.dispatch(&CancellationToken::new(), &request).await;
//! assert!(response.success);
//! # }
//! ```

#![cfg(target_os = "linux")]

pub mod catalog;
pub mod error;
pub mod flags;

mod cgroup;
mod executor;
mod nsexec;
mod pause;
mod request;
mod response;
mod runtime;
mod selector;

pub use executor::{Dispatcher, NetworkStrategy};
pub use flags::{RuntimeKind, RuntimeOptions};
pub use nsexec::BinPaths;
pub use request::{ExperimentRequest, Phase};
pub use response::{decode_output, Response};
pub use runtime::{ClientRegistry, ContainerHandle};
