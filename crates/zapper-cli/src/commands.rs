//! CLI command implementations

use crate::output::{self, OutputFormat};
use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;
use zapper_core::{
    harvest::synthetic_key_uri, manifest, ChannelDescriptor, CollaboratorMessage, ControllerConfig,
    DrmConfig, Error, KeyHarvester, KeySlot, KeyValueStore, OfflineRegistry, StoreKeySlot,
};

/// Show how a license descriptor resolves
pub fn drm(
    license: Option<&str>,
    channel: Option<&str>,
    config: &ControllerConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let overridden = channel.and_then(|id| config.license_override(id));
    if let (Some(id), Some(_)) = (channel, overridden) {
        tracing::info!(channel = id, "Using configured license override");
    }
    let drm = DrmConfig::resolve(overridden.or(license));

    if format == OutputFormat::Json {
        return output::print_json(&drm);
    }

    println!("DRM mode: {}", drm.mode());
    match &drm {
        DrmConfig::None => println!("  Stream plays without protection"),
        DrmConfig::ClearKey {
            keys,
            retry,
            audio_robustness,
            video_robustness,
        } => {
            for (key_id, key) in keys {
                println!("  Key ID: {}", key_id);
                println!("  Key:    {}", key);
            }
            println!(
                "  Retry:  {} attempts, {:?} base delay, x{} backoff",
                retry.max_attempts, retry.base_delay, retry.backoff_factor
            );
            println!(
                "  Robustness: audio={:?} video={:?}",
                audio_robustness, video_robustness
            );
            match drm.clearkey_license() {
                Ok(Some(license)) => println!("  License: {}", license),
                Ok(None) => {}
                Err(e) => println!("  License: cannot build ({})", e),
            }
        }
        DrmConfig::LicenseServer { url, retry } => {
            println!("  Server: {}", url);
            println!(
                "  Retry:  {} attempts, timeout {:?}",
                retry.max_attempts, retry.timeout
            );
        }
        DrmConfig::Unrecognized { raw } => {
            println!("  Unrecognized descriptor {:?}; playback continues without DRM", raw);
        }
    }

    Ok(())
}

/// One line of the channel listing
#[derive(Debug, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRow {
    #[tabled(rename = "#")]
    pub index: usize,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "DRM")]
    pub drm: String,
    #[tabled(rename = "Type")]
    pub mime_type: String,
    #[tabled(rename = "Harvested")]
    pub harvested: bool,
    #[tabled(rename = "Offline")]
    pub offline: bool,
}

/// Read a JSON array of channel descriptors
pub fn load_channels(path: &Path) -> anyhow::Result<Vec<ChannelDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading channel file {}", path.display()))?;
    let channels: Vec<ChannelDescriptor> = serde_json::from_str(&content)
        .with_context(|| format!("parsing channel file {}", path.display()))?;
    if channels.is_empty() {
        return Err(Error::EmptyChannelList.into());
    }
    Ok(channels)
}

/// Annotate channels the way the channel strip renders them
pub fn channel_rows(
    channels: &[ChannelDescriptor],
    config: &ControllerConfig,
    registry: &OfflineRegistry,
) -> anyhow::Result<Vec<ChannelRow>> {
    channels
        .iter()
        .enumerate()
        .map(|(index, channel)| {
            let license = config
                .license_override(&channel.id)
                .or(channel.license_key.as_deref());
            Ok(ChannelRow {
                index,
                id: channel.id.clone(),
                name: channel.name.clone(),
                drm: DrmConfig::resolve(license).mode().to_string(),
                mime_type: manifest::mime_hint(&channel.stream_url)
                    .unwrap_or("-")
                    .to_string(),
                harvested: channel.requires_harvest(),
                offline: registry.is_offline(&channel.id)?,
            })
        })
        .collect()
}

/// List channels with their DRM mode, manifest type and availability
pub fn channels(
    file: &Path,
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let channels = load_channels(file)?;
    let rows = channel_rows(&channels, config, &registry(config, store))?;

    match format {
        OutputFormat::Json => output::print_json(&rows)?,
        OutputFormat::Table => output::print_table(rows),
        OutputFormat::Text => {
            println!("Channels ({}):", rows.len());
            for row in &rows {
                println!(
                    "  {:>3}. {:<20} {:<16} {:<22} {}{}",
                    row.index + 1,
                    row.name,
                    row.drm,
                    row.mime_type,
                    output::availability(row.offline),
                    if row.harvested { "  [harvested key]" } else { "" }
                );
            }
        }
    }

    Ok(())
}

/// List offline channels
pub fn offline_list(
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let ids = registry(config, store).list()?;

    #[derive(Tabled)]
    struct OfflineRow {
        #[tabled(rename = "Offline channel")]
        id: String,
    }

    match format {
        OutputFormat::Json => output::print_json(&ids)?,
        OutputFormat::Table => output::print_table(ids.into_iter().map(|id| OfflineRow { id })),
        OutputFormat::Text if ids.is_empty() => println!("No channels marked offline"),
        OutputFormat::Text => {
            for id in ids {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

/// Mark a channel offline
pub fn offline_mark(
    channel: &str,
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
) -> anyhow::Result<()> {
    if registry(config, store).mark_offline(channel)? {
        println!("Marked {} offline", channel);
    } else {
        println!("{} was already offline", channel);
    }
    Ok(())
}

/// Remove a channel from the offline registry
pub fn offline_remove(
    channel: &str,
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
) -> anyhow::Result<()> {
    if registry(config, store).remove(channel)? {
        println!("{} is no longer marked offline", channel);
    } else {
        println!("{} was not marked offline", channel);
    }
    Ok(())
}

/// Clear the offline registry
pub fn offline_clear(config: &ControllerConfig, store: &Arc<dyn KeyValueStore>) -> anyhow::Result<()> {
    registry(config, store).clear()?;
    println!("Offline registry cleared");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarvestedKey<'a> {
    channel: &'a str,
    key_hex: String,
    bytes: usize,
}

impl<'a> HarvestedKey<'a> {
    fn new(channel: &'a str, key: &[u8]) -> Self {
        Self {
            channel,
            key_hex: hex::encode(key),
            bytes: key.len(),
        }
    }
}

/// Wait for a harvested key using the configured polling budget
pub async fn key_wait(
    channel: &str,
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let harvester = KeyHarvester::new(Arc::new(key_slot(config, store)), config.harvest.clone());
    let uri = synthetic_key_uri(channel);
    let cancel = cancel_on_ctrl_c();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message(format!(
        "Waiting up to {:?} for a key for {}",
        config.harvest.budget(),
        channel
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = harvester.resolve_harvested_key(&uri, &cancel).await;
    spinner.finish_and_clear();

    match result {
        Ok(key) => {
            let found = HarvestedKey::new(channel, &key);
            match format {
                OutputFormat::Json => output::print_json(&found)?,
                _ => println!("Key for {} ({} bytes): {}", found.channel, found.bytes, found.key_hex),
            }
            Ok(())
        }
        Err(Error::Cancelled) => {
            println!("Cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Deliver a collaborator message into the key slot
pub fn key_capture(
    message: &str,
    config: &ControllerConfig,
    store: &Arc<dyn KeyValueStore>,
) -> anyhow::Result<()> {
    let message = CollaboratorMessage::parse(message)
        .ok_or_else(|| anyhow!("not a KEY_CAPTURED message: {}", message))?;

    let slot = Arc::new(key_slot(config, store));
    let harvester = KeyHarvester::new(slot.clone(), config.harvest.clone());
    harvester.deliver(message)?;

    let Some(record) = slot.read()? else {
        bail!("key slot is empty after capture");
    };
    if record.key_bytes().is_none() {
        println!(
            "{} stored key is not valid hex; waiting pollers will ignore it",
            console::style("warning:").yellow()
        );
    }
    println!("Captured key (slot version {})", record.version);
    Ok(())
}

/// Token cancelled when the user presses Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    token
}

fn registry(config: &ControllerConfig, store: &Arc<dyn KeyValueStore>) -> OfflineRegistry {
    OfflineRegistry::new(store.clone(), config.storage.offline_channels.clone())
}

fn key_slot(config: &ControllerConfig, store: &Arc<dyn KeyValueStore>) -> StoreKeySlot {
    StoreKeySlot::new(store.clone(), config.storage.key_slot.clone())
}
