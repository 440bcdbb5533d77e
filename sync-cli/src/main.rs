//! # lanbackup
//!
//! Back up a device to backup servers on the local network.
//!
//! ## Commands
//!
//! - `discover`: List backup servers on the network
//! - `pair`: Pair with a server after comparing a six-digit code
//! - `list`: Show paired servers
//! - `remove`: Forget a paired server
//! - `set-dir`: Choose the directory backed up to a server
//! - `reset`: Forget every paired server, also after registry corruption
//! - `sync`: Send new and changed files to every paired server
//!
//! ## Example
//!
//! ```bash
//! # Find servers
//! lanbackup discover
//!
//! # Pair and compare the code shown on the server
//! lanbackup pair 0102030405060708090a0b0c0d0e0f10
//!
//! # Back up the photos directory
//! lanbackup set-dir 0102030405060708090a0b0c0d0e0f10 ~/Pictures
//! lanbackup sync
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{discover, pair, servers, sync};
use config::Settings;

/// Back up this device to servers on the local network.
#[derive(Parser, Debug)]
#[command(name = "lanbackup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the paired-server registry
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: lanbackup.toml in the data directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List backup servers on the network
    Discover {
        /// Number of discovery cycles to run
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Pair with a backup server
    Pair {
        /// Server id as shown by `discover`
        id: String,

        /// Accept the verification code without asking
        #[arg(long, short)]
        yes: bool,
    },

    /// Show paired servers
    List,

    /// Forget a paired server
    Remove {
        /// Server id
        id: String,
    },

    /// Set the directory backed up to a server (omit the path to clear it)
    SetDir {
        /// Server id
        id: String,

        /// Directory to back up
        path: Option<PathBuf>,
    },

    /// Send new and changed files to every paired server
    Sync,

    /// Forget every paired server (recovers from a corrupt registry)
    Reset {
        /// Confirm that all pairings are dropped
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    let settings = Settings::load(data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Discover { cycles } => discover::run(&settings, cycles).await?,
        Commands::Pair { id, yes } => pair::run(&settings, &id, yes).await?,
        Commands::List => servers::list(&settings).await?,
        Commands::Remove { id } => servers::remove(&settings, &id).await?,
        Commands::SetDir { id, path } => servers::set_dir(&settings, &id, path.as_deref()).await?,
        Commands::Sync => sync::run(&settings).await?,
        Commands::Reset { yes } => servers::reset(&settings, yes).await?,
    }

    Ok(())
}

/// Get the default data directory for lanbackup.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "lanbackup", "lanbackup")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
