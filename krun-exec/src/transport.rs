//! The exec transport seam.
//!
//! A [`Transport`] opens bidirectional stdio streams for an argv on a remote
//! endpoint. The production implementation shells out to kubectl
//! ([`crate::kubectl::KubectlTransport`]); tests swap in scripted mocks.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use krun_core::Endpoint;

use crate::error::ExecError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Writable handle to the remote process's stdin.
pub type StdinPipe = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable handle to the remote process's stdout or stderr.
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// Which stdio streams the caller wants attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRequest {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StreamRequest {
    pub fn all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

/// One in-flight remote execution.
///
/// Callers take the handles they asked for and must drain the output pipes
/// they requested (an undrained pipe can wedge the remote process). Dropping
/// the stdin handle closes the remote stdin; [`ExecSession::wait`] drops any
/// handles still attached before awaiting completion.
pub struct ExecSession {
    pub stdin: Option<StdinPipe>,
    pub stdout: Option<OutputPipe>,
    pub stderr: Option<OutputPipe>,
    completion: JoinHandle<Result<(), ExecError>>,
}

impl ExecSession {
    pub fn new(
        stdin: Option<StdinPipe>,
        stdout: Option<OutputPipe>,
        stderr: Option<OutputPipe>,
        completion: JoinHandle<Result<(), ExecError>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            completion,
        }
    }

    /// Take the stdin handle, failing if it was not requested.
    pub fn take_stdin(&mut self) -> Result<StdinPipe, ExecError> {
        self.stdin.take().ok_or(ExecError::MissingStream("stdin"))
    }

    /// Take the stdout handle, failing if it was not requested.
    pub fn take_stdout(&mut self) -> Result<OutputPipe, ExecError> {
        self.stdout.take().ok_or(ExecError::MissingStream("stdout"))
    }

    /// Take the stderr handle, failing if it was not requested.
    pub fn take_stderr(&mut self) -> Result<OutputPipe, ExecError> {
        self.stderr.take().ok_or(ExecError::MissingStream("stderr"))
    }

    /// Close any remaining handles and wait for the remote command to finish.
    pub async fn wait(mut self) -> Result<(), ExecError> {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        match self.completion.await {
            Ok(result) => result,
            Err(err) => Err(ExecError::Task(format!("exec completion: {err}"))),
        }
    }
}

/// Opens argv executions on remote endpoints.
///
/// Dyn-compatible by design: the dispatcher and the fleet-sync orchestrator
/// hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + 'static {
    /// Start `argv` on `endpoint` with the requested streams attached.
    fn open<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        argv: &'a [String],
        streams: StreamRequest,
    ) -> BoxFuture<'a, Result<ExecSession, ExecError>>;
}
