//! dataio command-line entry point.
//!
//! Read-only inspection of a dataio store. Logging goes to stderr so payload
//! bytes written by `cat` stay clean on stdout.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dataio_core::{DataIoConfig, Store};

mod commands;

#[derive(Debug, Parser)]
#[command(name = "dataio", version, about = "Inspect a dataio store")]
struct Cli {
    /// Data root; overrides `paths.root` from config and environment.
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions, newest first.
    Sessions {
        /// Only sessions for this source.
        #[arg(long)]
        source: Option<String>,

        /// Show at most this many sessions.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the id of the newest session for a source.
    Latest { source: String },
    /// Write a stored payload to stdout.
    Cat { checksum: String },
    /// Check that a stored payload still matches its checksum.
    Verify { checksum: String },
    /// Print the sidecar metadata of a stored payload.
    Meta { checksum: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = DataIoConfig::load().context("loading configuration")?;
    if let Some(root) = cli.root {
        config.paths.root = root;
    }

    let store = Store::open(&config)
        .await
        .with_context(|| format!("opening store at {}", config.paths.db_path().display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let ok = match cli.command {
        Command::Sessions { source, limit } => {
            commands::sessions(&store, source.as_deref(), limit, &mut out).await?;
            true
        }
        Command::Latest { source } => commands::latest(&store, &source, &mut out).await?,
        Command::Cat { checksum } => {
            commands::cat(&store, &checksum, &mut out).await?;
            true
        }
        Command::Verify { checksum } => commands::verify(&store, &checksum, &mut out).await?,
        Command::Meta { checksum } => {
            commands::meta(&store, &checksum, &mut out).await?;
            true
        }
    };
    out.flush()?;

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
