//! krun-agent — the on-endpoint helper for krun fleet sync.
//!
//! # Usage
//!
//! ```text
//! krun-agent --mode check  --dir <dest>                       # manifest on stdin
//! krun-agent --mode ingest --dir <dest> [--cleanup] [--mirror=false]
//! krun-agent --mode hub    --dir <dest> --tracker-port 0
//! krun-agent --mode peer   --dir <dest> --tracker http://<ip>:<port> [--cleanup]
//! ```
//!
//! stdout is a wire surface (check reply, hub sentinel); all logging goes to
//! stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use krun_agent::{check, hub, ingest, peer, signals, workset, AgentError};
use krun_core::layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Hub,
    Peer,
    Check,
    Ingest,
}

#[derive(Parser, Debug)]
#[command(
    name = "krun-agent",
    version,
    about = "On-endpoint helper: chunk check/ingest, hub serving, peer sync",
    long_about = None,
)]
struct Cli {
    /// Mode selector.
    #[arg(long, value_enum, default_value_t = Mode::Peer)]
    mode: Mode,

    /// Working-set root.
    #[arg(long, default_value = "/app")]
    dir: PathBuf,

    /// Hub base URL (peer mode).
    #[arg(long)]
    tracker: Option<String>,

    /// Bind port for the hub; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 8000)]
    tracker_port: u16,

    /// Remove the working set after a successful sync.
    #[arg(long)]
    cleanup: bool,

    /// Delete destination files not present in the manifest after apply.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    mirror: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    workset::ensure(&cli.dir).context("failed to prepare working set")?;
    let chunks_dir = layout::chunks_dir(&cli.dir);

    match cli.mode {
        Mode::Check => {
            let stdin = std::io::stdin().lock();
            let stdout = std::io::stdout().lock();
            check::run_check(stdin, stdout, &chunks_dir).context("check failed")?;
        }
        Mode::Ingest => {
            let stdin = std::io::stdin().lock();
            ingest::run_ingest(stdin, &cli.dir, cli.cleanup, cli.mirror)
                .context("ingest failed")?;
        }
        Mode::Hub => {
            let runtime = runtime()?;
            runtime
                .block_on(hub::run_hub(&cli.dir, cli.tracker_port))
                .context("hub failed")?;
        }
        Mode::Peer => {
            let tracker = cli
                .tracker
                .as_deref()
                .context("--tracker is required for peer mode")?;
            let runtime = runtime()?;
            runtime
                .block_on(async {
                    tokio::select! {
                        result = peer::run_peer(&cli.dir, tracker, cli.cleanup, cli.mirror) => result,
                        _ = signals::terminated() => Err(AgentError::Terminated),
                    }
                })
                .context("peer sync failed")?;
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
