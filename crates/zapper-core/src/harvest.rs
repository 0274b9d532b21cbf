//! Key harvesting bridge
//!
//! Some channels cannot be decrypted with a static key or a license server we
//! can talk to. For those an off-screen collaborator page performs its own
//! playback handshake, and the key it ends up with lands in a shared key slot
//! (or is posted to us as a `KEY_CAPTURED` message). The bridge never drives
//! the collaborator; it only waits for that slot to fill.
//!
//! ```text
//!   collaborator ──KEY_CAPTURED──▶ deliver() ──write──▶ ┌─────────┐
//!   collaborator ─────────────── direct write ───────▶ │ KeySlot │
//!                                                      └────┬────┘
//!   engine ─synthetic:channel-key─▶ resolve_harvested_key ◀─┘ poll 100ms × 150
//! ```
//!
//! The poll is bound to the channel being loaded: `arm` clears the slot and
//! stamps subsequent captures with that channel, and records stamped for a
//! different channel are never returned.

use crate::engine::SchemeResolver;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// URI scheme answered locally by the bridge
pub const SYNTHETIC_SCHEME: &str = "synthetic";

/// Path of the synthetic key URI
pub const SYNTHETIC_KEY_PATH: &str = "channel-key";

/// Default store entry holding the latest harvested key
pub const DEFAULT_KEY_SLOT: &str = "zapper.harvestedKey";

const CHANNEL_PARAM: &str = "channel";

/// Build the synthetic key URI for a channel
pub fn synthetic_key_uri(channel_id: &str) -> Url {
    let mut uri = Url::parse(&format!("{SYNTHETIC_SCHEME}:{SYNTHETIC_KEY_PATH}"))
        .expect("synthetic key URI is a valid URL");
    uri.query_pairs_mut().append_pair(CHANNEL_PARAM, channel_id);
    uri
}

/// Channel id carried by a synthetic key URI
pub fn synthetic_channel(uri: &Url) -> Option<String> {
    if uri.scheme() != SYNTHETIC_SCHEME || uri.path() != SYNTHETIC_KEY_PATH {
        return None;
    }
    uri.query_pairs()
        .find(|(name, _)| name == CHANNEL_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|channel| !channel.is_empty())
}

/// Harvest polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Delay between slot reads in milliseconds
    pub poll_interval_ms: u64,
    /// Slot reads before giving up
    pub max_attempts: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_attempts: 150,
        }
    }
}

impl HarvestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Total time a harvest may take
    pub fn budget(&self) -> Duration {
        self.poll_interval() * self.max_attempts
    }
}

/// Latest key written into the slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestedKeyRecord {
    /// Channel the capture was bound to, if the writer knew it
    #[serde(default)]
    pub channel: Option<String>,
    /// Hex-encoded key bytes
    pub key_hex: String,
    pub acquired_at: DateTime<Utc>,
    /// Monotonic write counter of the slot
    #[serde(default)]
    pub version: u64,
}

impl HarvestedKeyRecord {
    /// Decode the key, treating blank or malformed hex as missing
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        let hex = self.key_hex.trim();
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        if hex.is_empty() {
            return None;
        }
        hex::decode(hex).ok()
    }

    /// Whether this record may answer a request for `channel_id`
    pub fn matches_channel(&self, channel_id: &str) -> bool {
        self.channel.as_deref().map_or(true, |bound| bound == channel_id)
    }
}

/// "Latest value" cell the collaborator writes and the bridge polls
pub trait KeySlot: Send + Sync {
    fn read(&self) -> Result<Option<HarvestedKeyRecord>>;

    fn write(&self, key_hex: &str, channel: Option<&str>) -> Result<HarvestedKeyRecord>;

    fn clear(&self) -> Result<()>;
}

/// In-process key slot
#[derive(Debug, Default)]
pub struct MemoryKeySlot {
    record: RwLock<Option<HarvestedKeyRecord>>,
    version: AtomicU64,
}

impl MemoryKeySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeySlot for MemoryKeySlot {
    fn read(&self) -> Result<Option<HarvestedKeyRecord>> {
        let record = self.record.read().map_err(|_| Error::store("key slot poisoned"))?;
        Ok(record.clone())
    }

    fn write(&self, key_hex: &str, channel: Option<&str>) -> Result<HarvestedKeyRecord> {
        let record = HarvestedKeyRecord {
            channel: channel.map(str::to_string),
            key_hex: key_hex.to_string(),
            acquired_at: Utc::now(),
            version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
        };
        *self.record.write().map_err(|_| Error::store("key slot poisoned"))? = Some(record.clone());
        Ok(record)
    }

    fn clear(&self) -> Result<()> {
        *self.record.write().map_err(|_| Error::store("key slot poisoned"))? = None;
        Ok(())
    }
}

/// Key slot persisted as a named store entry.
///
/// The entry holds a JSON record; a bare hex string written by a collaborator
/// that knows nothing about records is accepted as an unbound key.
pub struct StoreKeySlot {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl StoreKeySlot {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn with_default_key(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, DEFAULT_KEY_SLOT)
    }
}

impl KeySlot for StoreKeySlot {
    fn read(&self) -> Result<Option<HarvestedKeyRecord>> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if raw.starts_with('{') {
            return Ok(serde_json::from_str(raw).ok());
        }

        Ok(Some(HarvestedKeyRecord {
            channel: None,
            key_hex: raw.trim_matches('"').to_string(),
            acquired_at: Utc::now(),
            version: 0,
        }))
    }

    fn write(&self, key_hex: &str, channel: Option<&str>) -> Result<HarvestedKeyRecord> {
        let previous = self.read()?.map(|r| r.version).unwrap_or(0);
        let record = HarvestedKeyRecord {
            channel: channel.map(str::to_string),
            key_hex: key_hex.to_string(),
            acquired_at: Utc::now(),
            version: previous + 1,
        };
        self.store.set(&self.key, &serde_json::to_string(&record)?)?;
        Ok(record)
    }

    fn clear(&self) -> Result<()> {
        self.store.remove(&self.key)
    }
}

/// Message posted by the collaborator's embedding context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CollaboratorMessage {
    #[serde(rename = "KEY_CAPTURED")]
    KeyCaptured { key: String },
}

impl CollaboratorMessage {
    /// Parse a posted message; anything that is not a key capture is ignored
    pub fn parse(json: &str) -> Option<Self> {
        match serde_json::from_str(json) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, "Ignoring collaborator message");
                None
            }
        }
    }
}

/// Waits for harvested key material on behalf of the loading session
pub struct KeyHarvester {
    slot: Arc<dyn KeySlot>,
    config: HarvestConfig,
    armed: RwLock<Option<String>>,
    delivered: Notify,
}

impl KeyHarvester {
    pub fn new(slot: Arc<dyn KeySlot>, config: HarvestConfig) -> Self {
        Self {
            slot,
            config,
            armed: RwLock::new(None),
            delivered: Notify::new(),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Bind the bridge to the channel about to load and drop any stale key
    pub fn arm(&self, channel_id: &str) -> Result<()> {
        self.slot.clear()?;
        *self.armed.write().map_err(|_| Error::store("harvester binding poisoned"))? =
            Some(channel_id.to_string());
        debug!(channel = channel_id, "Harvester armed");
        Ok(())
    }

    /// Release the channel binding after teardown
    pub fn disarm(&self) {
        if let Ok(mut armed) = self.armed.write() {
            if let Some(channel) = armed.take() {
                debug!(channel = %channel, "Harvester disarmed");
            }
        }
    }

    /// Channel the bridge is currently bound to
    pub fn armed_channel(&self) -> Option<String> {
        self.armed.read().ok().and_then(|armed| armed.clone())
    }

    /// Store a key posted by the collaborator and wake the poller
    pub fn deliver(&self, message: CollaboratorMessage) -> Result<()> {
        match message {
            CollaboratorMessage::KeyCaptured { key } => {
                let channel = self.armed_channel();
                let record = self.slot.write(&key, channel.as_deref())?;
                info!(
                    channel = ?record.channel,
                    version = record.version,
                    "Collaborator key captured"
                );
                self.delivered.notify_one();
            }
        }
        Ok(())
    }

    /// Feed collaborator messages into the slot until the sender goes away
    pub async fn listen(&self, mut messages: mpsc::Receiver<CollaboratorMessage>) {
        while let Some(message) = messages.recv().await {
            if let Err(e) = self.deliver(message) {
                warn!(error = %e, "Failed to store collaborator key");
            }
        }
        debug!("Collaborator message channel closed");
    }

    /// Wait for the key answering a synthetic key URI.
    ///
    /// Polls the slot every `poll_interval` for at most `max_attempts` reads.
    /// Deliveries trigger extra reads between ticks; they never shorten the
    /// budget. Returns `Cancelled` as soon as `cancel` fires so nothing
    /// resolves into a torn-down session.
    #[instrument(skip(self, uri, cancel), fields(uri = %uri))]
    pub async fn resolve_harvested_key(&self, uri: &Url, cancel: &CancellationToken) -> Result<Bytes> {
        let channel = synthetic_channel(uri).ok_or_else(|| Error::InvalidSyntheticUri(uri.to_string()))?;
        let interval = self.config.poll_interval();
        let start = Instant::now();

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(key) = self.poll_once(&channel) {
                info!(channel = %channel, attempt, bytes = key.len(), "Harvested key resolved");
                return Ok(Bytes::from(key));
            }

            let next_tick = start + interval * attempt;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(channel = %channel, attempt, "Harvest cancelled");
                        return Err(Error::Cancelled);
                    }
                    _ = tokio::time::sleep_until(next_tick) => break,
                    _ = self.delivered.notified() => {
                        if let Some(key) = self.poll_once(&channel) {
                            info!(channel = %channel, attempt, bytes = key.len(), "Harvested key delivered");
                            return Ok(Bytes::from(key));
                        }
                    }
                }
            }
        }

        warn!(
            channel = %channel,
            attempts = self.config.max_attempts,
            "No harvested key within budget"
        );
        Err(Error::HarvestTimeout {
            attempts: self.config.max_attempts,
        })
    }

    fn poll_once(&self, channel: &str) -> Option<Vec<u8>> {
        let record = match self.slot.read() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Key slot read failed, retrying");
                return None;
            }
        };

        if !record.matches_channel(channel) {
            debug!(expected = channel, found = ?record.channel, "Ignoring key bound to another channel");
            return None;
        }

        let key = record.key_bytes();
        if key.is_none() {
            debug!(version = record.version, "Malformed key in slot, continuing to poll");
        }
        key
    }
}

/// Answers `synthetic:` requests of one session from the harvester
pub struct HarvestSchemeResolver {
    harvester: Arc<KeyHarvester>,
    cancel: CancellationToken,
}

impl HarvestSchemeResolver {
    pub fn new(harvester: Arc<KeyHarvester>, cancel: CancellationToken) -> Self {
        Self { harvester, cancel }
    }
}

#[async_trait]
impl SchemeResolver for HarvestSchemeResolver {
    async fn resolve(&self, uri: &Url) -> Result<Bytes> {
        self.harvester.resolve_harvested_key(uri, &self.cancel).await
    }
}
