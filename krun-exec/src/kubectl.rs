//! kubectl-backed transport.
//!
//! The cluster control plane is an external collaborator: endpoint discovery
//! and exec channels go through the `kubectl` binary rather than an in-process
//! API client. One transport instance is scoped to a namespace (and an
//! optional kubeconfig) for the duration of an invocation.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use krun_core::Endpoint;

use crate::error::ExecError;
use crate::transport::{BoxFuture, ExecSession, OutputPipe, StdinPipe, StreamRequest, Transport};

pub struct KubectlTransport {
    program: String,
    namespace: String,
    kubeconfig: Option<PathBuf>,
}

impl KubectlTransport {
    pub fn new(namespace: impl Into<String>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            program: "kubectl".to_string(),
            namespace: namespace.into(),
            kubeconfig,
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }

    /// List running, IP-addressable pods matching `selector`.
    pub async fn list_endpoints(&self, selector: &str) -> Result<Vec<Endpoint>, ExecError> {
        let output = self
            .base_command()
            .args(["get", "pods", "--selector", selector, "--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ExecError::EndpointList(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let list: PodList = serde_json::from_slice(&output.stdout)?;
        Ok(endpoints_from_pod_list(list))
    }
}

impl Transport for KubectlTransport {
    fn open<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        argv: &'a [String],
        streams: StreamRequest,
    ) -> BoxFuture<'a, Result<ExecSession, ExecError>> {
        Box::pin(async move {
            let mut cmd = self.base_command();
            cmd.arg("exec");
            if streams.stdin {
                cmd.arg("--stdin");
            }
            cmd.arg(&endpoint.name).arg("--").args(argv);

            cmd.stdin(if streams.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            cmd.stdout(if streams.stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            cmd.stderr(if streams.stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            // Root cancellation drops the session; the exec channel must die
            // with it rather than linger on the endpoint.
            cmd.kill_on_drop(true);

            tracing::debug!(endpoint = %endpoint.name, ?argv, "opening exec channel");

            let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

            let stdin = child.stdin.take().map(|s| Box::new(s) as StdinPipe);
            let stdout = child.stdout.take().map(|s| Box::new(s) as OutputPipe);
            let stderr = child.stderr.take().map(|s| Box::new(s) as OutputPipe);

            let name = endpoint.name.clone();
            let completion = tokio::spawn(async move {
                let status = child.wait().await.map_err(|e| ExecError::Stream {
                    endpoint: name.clone(),
                    source: e,
                })?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ExecError::CommandFailed {
                        endpoint: name,
                        detail: status.to_string(),
                    })
                }
            });

            Ok(ExecSession::new(stdin, stdout, stderr, completion))
        })
    }
}

// ---------------------------------------------------------------------------
// Pod list JSON — the slice of `kubectl get pods -o json` we consume
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default, rename = "podIP")]
    pod_ip: String,
    #[serde(default)]
    phase: String,
}

fn endpoints_from_pod_list(list: PodList) -> Vec<Endpoint> {
    list.items
        .into_iter()
        .filter(|pod| pod.status.phase == "Running" && !pod.status.pod_ip.is_empty())
        .map(|pod| Endpoint::new(pod.metadata.name, pod.status.pod_ip))
        .collect()
}
