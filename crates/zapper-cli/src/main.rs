//! Zapper CLI - Channel and key tooling for the playback controller
//!
//! Features:
//! - DRM descriptor inspection
//! - Channel list review with offline flags
//! - Offline registry maintenance
//! - Harvested key capture and waiting

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zapper_core::{ControllerConfig, JsonFileStore, KeyValueStore};

mod commands;
mod output;

use output::OutputFormat;

/// Zapper CLI - Live-channel controller toolkit
#[derive(Parser)]
#[command(name = "zapper")]
#[command(version)]
#[command(about = "Inspect channels, DRM descriptors and harvested keys", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON file holding the key slot and offline registry
    #[arg(short, long, global = true, default_value = "zapper-store.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a license descriptor resolves
    Drm {
        /// `keyId:key`, a license server URL, or nothing
        license: Option<String>,

        /// Apply the configured override for this channel
        #[arg(long)]
        channel: Option<String>,
    },

    /// List channels from a JSON channel file
    Channels {
        /// Path to a JSON array of channel descriptors
        file: PathBuf,
    },

    /// Maintain the offline channel registry
    Offline {
        #[command(subcommand)]
        action: OfflineAction,
    },

    /// Work with the harvested key slot
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum OfflineAction {
    /// List channels marked offline
    List,
    /// Mark a channel offline
    Mark { channel: String },
    /// Bring a channel back
    Remove { channel: String },
    /// Forget every offline channel
    Clear,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Wait for a key to appear in the slot
    Wait {
        /// Channel the key is expected for
        #[arg(long, default_value = "cli")]
        channel: String,
    },
    /// Deliver a collaborator message, e.g. '{"type":"KEY_CAPTURED","key":"..."}'
    Capture { message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(cli.store.clone()));

    match cli.command {
        Commands::Drm { license, channel } => {
            commands::drm(license.as_deref(), channel.as_deref(), &config, cli.format)?;
        }
        Commands::Channels { file } => {
            commands::channels(&file, &config, &store, cli.format)?;
        }
        Commands::Offline { action } => match action {
            OfflineAction::List => commands::offline_list(&config, &store, cli.format)?,
            OfflineAction::Mark { channel } => commands::offline_mark(&channel, &config, &store)?,
            OfflineAction::Remove { channel } => commands::offline_remove(&channel, &config, &store)?,
            OfflineAction::Clear => commands::offline_clear(&config, &store)?,
        },
        Commands::Key { action } => match action {
            KeyAction::Wait { channel } => {
                commands::key_wait(&channel, &config, &store, cli.format).await?;
            }
            KeyAction::Capture { message } => {
                commands::key_capture(&message, &config, &store)?;
            }
        },
    }

    Ok(())
}
