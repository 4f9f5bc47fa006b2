//! # krun-exec
//!
//! Remote execution plumbing for the krun orchestrator:
//! - [`transport`] — the [`Transport`] seam and per-exec [`ExecSession`]
//! - [`kubectl`] — kubectl-backed transport and endpoint discovery
//! - [`dispatcher`] — parallel exec with per-endpoint line-prefixed output
//! - [`shell`] — `sh -c` wrapping for shell-syntax commands

pub mod dispatcher;
pub mod error;
pub mod kubectl;
pub mod shell;
pub mod transport;

pub use dispatcher::{run_on_endpoints, DispatchReport, OutputRecord, SinkKind};
pub use error::ExecError;
pub use kubectl::KubectlTransport;
pub use shell::wrap_command_in_shell;
pub use transport::{ExecSession, StreamRequest, Transport};
