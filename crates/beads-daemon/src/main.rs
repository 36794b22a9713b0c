//! `beads-daemon` -- workspace-local issue service.
//!
//! Discovers the workspace state directory, opens the store, and serves
//! length-prefixed JSON requests on the workspace socket until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use beads_daemon::{DEFAULT_MAX_CONNECTIONS, Daemon, serve};

#[derive(Parser)]
#[command(name = "beads-daemon", version, about = "Issue store request service")]
struct Cli {
    /// Workspace root (defaults to discovering .beads/ upward from the
    /// working directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Maximum concurrent client connections.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Verbose logging to stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "beads_daemon=debug,beads_storage=debug,beads_sync=debug"
    } else {
        "beads_daemon=info,beads_storage=warn,beads_sync=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let state_dir = match cli.workspace {
        Some(root) => beads_config::ensure_state_dir(&root)?,
        None => {
            let cwd = std::env::current_dir()?;
            beads_config::workspace::find_state_dir_or_error(&cwd)
                .context("no workspace found; pass --workspace or run inside one")?
        }
    };

    let daemon = Arc::new(
        Daemon::open_with_limits(&state_dir, cli.max_connections)
            .with_context(|| format!("failed to open workspace at {}", state_dir.display()))?,
    );

    // First Ctrl+C triggers cooperative shutdown; a second forces exit.
    {
        let daemon = Arc::clone(&daemon);
        ctrlc::set_handler(move || {
            if daemon.is_shutting_down() {
                std::process::exit(1);
            }
            daemon.request_shutdown();
        })?;
    }

    serve(daemon)?;
    Ok(())
}
