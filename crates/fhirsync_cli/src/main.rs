//! fhirsync CLI
//!
//! Runs the FHIR sync engine against FHIR bundles on disk, keeping the
//! normalized records and the sync checkpoint in a local data directory.
//!
//! # Commands
//!
//! - `sync` - Run one sync pass over a bundle directory
//! - `status` - Show the checkpoint and whether a pass is due
//! - `invalidate` - Force the next pass to be a full refresh
//! - `conflicts` - List conflicts waiting for manual resolution
//! - `resolve` - Settle a pending conflict
//! - `watch` - Run background sync until interrupted

mod commands;
mod fetcher;
mod store;

use clap::{Parser, Subcommand};
use commands::Context;
use fhirsync_model::{ConflictPolicy, ConflictResolution};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// FHIR synchronization tools.
#[derive(Parser)]
#[command(name = "fhirsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the local records and sync state
    #[arg(global = true, short, long, default_value = ".fhirsync")]
    data_dir: PathBuf,

    /// Connection ID the sync state is kept under
    #[arg(global = true, short, long, default_value = "default")]
    connection: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass over a directory of FHIR bundles
    Sync {
        /// Directory of `*.json` bundles or resources
        #[arg(short, long)]
        bundles: PathBuf,

        /// Ignore the checkpoint and fetch everything
        #[arg(long)]
        full_refresh: bool,

        /// Conflict policy (server-wins, client-wins, manual)
        #[arg(short, long)]
        policy: Option<ConflictPolicy>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the sync checkpoint and whether a pass is due
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Forget the checkpoint so the next pass is a full refresh
    Invalidate,

    /// List conflicts waiting for manual resolution
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Settle a pending conflict
    Resolve {
        /// Conflict ID
        id: Uuid,

        /// Value to keep (server, client, merged)
        #[arg(short = 'u', long = "use")]
        resolution: ConflictResolution,

        /// JSON file with the merged record
        #[arg(short, long)]
        record: Option<PathBuf>,
    },

    /// Run background sync until Ctrl-C
    Watch {
        /// Directory of `*.json` bundles or resources
        #[arg(short, long)]
        bundles: PathBuf,

        /// Minutes between passes
        #[arg(short, long, default_value = "60")]
        interval_minutes: u64,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context {
        data_dir: cli.data_dir,
        connection: cli.connection,
    };

    match cli.command {
        Commands::Sync {
            bundles,
            full_refresh,
            policy,
            format,
        } => {
            commands::sync::run(&ctx, &bundles, full_refresh, policy, &format).await?;
        }
        Commands::Status { format } => {
            commands::status::run(&ctx, &format).await?;
        }
        Commands::Invalidate => {
            commands::invalidate::run(&ctx).await?;
        }
        Commands::Conflicts { format } => {
            commands::conflicts::run(&ctx, &format).await?;
        }
        Commands::Resolve {
            id,
            resolution,
            record,
        } => {
            commands::resolve::run(&ctx, id, resolution, record.as_deref()).await?;
        }
        Commands::Watch {
            bundles,
            interval_minutes,
        } => {
            commands::watch::run(&ctx, &bundles, interval_minutes).await?;
        }
        Commands::Version => {
            println!("fhirsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
