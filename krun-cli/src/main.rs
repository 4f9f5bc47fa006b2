//! krun — fleet orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! # Run a command on endpoints labeled app=backend
//! krun run --label-selector app=backend -- pip install -r requirements.txt
//!
//! # Upload files and run a script
//! krun run -l app=backend --upload-src ./bin --upload-dest /tmp/bin -- /tmp/bin/start.sh
//!
//! # Shell features (pipes, &&, cd) via --shell
//! krun run -l app=backend --shell -- "cd /app && pip install ."
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::run::RunArgs;

#[derive(Parser, Debug)]
#[command(
    name = "krun",
    version,
    about = "Fan out file sync and command execution across a fleet of endpoints",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file tree and/or run a command on every matching endpoint.
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run().await,
    }
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

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn run_command_parses_trailing_argv_after_dashes() {
        let cli = Cli::try_parse_from([
            "krun",
            "run",
            "--label-selector",
            "app=backend",
            "--",
            "pip",
            "install",
            "-r",
            "requirements.txt",
        ])
        .expect("parse");

        let Commands::Run(args) = cli.command;
        assert_eq!(args.label_selector, "app=backend");
        assert_eq!(
            args.command,
            vec!["pip", "install", "-r", "requirements.txt"]
        );
    }

    #[test]
    fn upload_flags_parse_with_short_selector() {
        let cli = Cli::try_parse_from([
            "krun",
            "run",
            "-l",
            "app=x",
            "--upload-src",
            "./bin",
            "--upload-dest",
            "/tmp/bin",
            "--exclude",
            r"\.log$",
        ])
        .expect("parse");

        let Commands::Run(args) = cli.command;
        assert_eq!(args.upload_src.as_deref(), Some(std::path::Path::new("./bin")));
        assert_eq!(
            args.upload_dest.as_deref(),
            Some(std::path::Path::new("/tmp/bin"))
        );
        assert!(args.command.is_empty());
    }
}
