//! `krun run` — upload files and/or execute a command on matching endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use regex::Regex;
use tokio::sync::broadcast;

use krun_core::{layout, Endpoint};
use krun_exec::{run_on_endpoints, wrap_command_in_shell, KubectlTransport, Transport};
use krun_sync::sync_endpoints;

/// Arguments for `krun run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Label selector for endpoints (e.g. app=my-app).
    #[arg(short = 'l', long)]
    pub label_selector: String,

    /// Cluster namespace.
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,

    /// Absolute path to the kubeconfig file.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Local folder or file to upload.
    #[arg(long)]
    pub upload_src: Option<PathBuf>,

    /// Remote destination directory (e.g. /tmp/app).
    #[arg(long, requires = "upload_src")]
    pub upload_dest: Option<PathBuf>,

    /// Regex of relative paths to exclude from the upload.
    #[arg(long)]
    pub exclude: Option<String>,

    /// Deadline for the whole invocation, in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Wrap the command with `sh -c` for pipes, &&, ||, and cd.
    #[arg(long)]
    pub shell: bool,

    /// Path of the agent helper binary on each endpoint.
    #[arg(long, default_value = layout::AGENT_PATH)]
    pub agent_path: String,

    /// Command to execute, after `--`.
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    pub async fn run(self) -> Result<()> {
        self.validate()?;
        let exclude = self
            .exclude
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid exclude pattern")?;

        let transport = Arc::new(KubectlTransport::new(
            &self.namespace,
            self.kubeconfig.clone(),
        ));

        tracing::info!(
            namespace = %self.namespace,
            selector = %self.label_selector,
            "listing endpoints"
        );
        let endpoints = transport
            .list_endpoints(&self.label_selector)
            .await
            .context("failed to list endpoints")?;
        if endpoints.is_empty() {
            println!("No endpoints found with selector: {}", self.label_selector);
            return Ok(());
        }
        tracing::info!(count = endpoints.len(), "starting execution");

        let shutdown = broadcast::channel::<()>(16).0;
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, cancelling");
                    let _ = shutdown.send(());
                }
            });
        }

        let mut interrupted = shutdown.subscribe();
        let deadline = self.timeout.map(Duration::from_secs);
        let work = self.execute(transport, &endpoints, exclude.as_ref(), &shutdown);

        tokio::select! {
            result = with_deadline(deadline, work) => result,
            _ = interrupted.recv() => Err(anyhow!("interrupted")),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.command.is_empty() && self.upload_src.is_none() {
            bail!("provide a command (after --) or --upload-src (or both)");
        }
        if self.upload_src.is_some() && self.upload_dest.is_none() {
            bail!("--upload-dest is required when --upload-src is provided");
        }
        Ok(())
    }

    /// Upload phase first, command phase second; a command never runs on a
    /// fleet whose upload did not complete.
    async fn execute(
        &self,
        transport: Arc<KubectlTransport>,
        endpoints: &[Endpoint],
        exclude: Option<&Regex>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        let dyn_transport: Arc<dyn Transport> = transport;

        if let (Some(src), Some(dest)) = (&self.upload_src, &self.upload_dest) {
            sync_endpoints(
                dyn_transport.clone(),
                endpoints,
                src,
                dest,
                exclude,
                &self.agent_path,
            )
            .await
            .context("failed to sync endpoints")?;
        }

        if !self.command.is_empty() {
            let argv = if self.shell {
                wrap_command_in_shell(&self.command)
            } else {
                self.command.clone()
            };
            let report = run_on_endpoints(
                dyn_transport,
                endpoints,
                &argv,
                None,
                tokio::io::stdout(),
                tokio::io::stderr(),
                shutdown,
            )
            .await
            .context("command execution failed")?;

            if !report.all_succeeded() {
                bail!(
                    "command failed on {} of {} endpoints",
                    report.failures.len(),
                    endpoints.len()
                );
            }
        }

        Ok(())
    }
}

async fn with_deadline<F>(deadline: Option<Duration>, work: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {}s", limit.as_secs())),
        },
        None => work.await,
    }
}
