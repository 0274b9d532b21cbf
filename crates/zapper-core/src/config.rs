//! Controller configuration

use crate::drm::RetryParameters;
use crate::error::{Error, Result};
use crate::harvest::{HarvestConfig, DEFAULT_KEY_SLOT};
use crate::interceptor::InterceptorConfig;
use crate::offline::DEFAULT_OFFLINE_KEY;
use crate::overlay::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Buffering and retry parameters applied to every engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Seconds of content to buffer ahead
    pub buffering_goal: f64,
    /// Seconds buffered before playback resumes after a stall
    pub rebuffering_goal: f64,
    /// Seconds of played content to keep behind the playhead
    pub buffer_behind: f64,
    /// Segment/manifest retry attempts
    pub retry_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub retry_base_delay_ms: u64,
    /// Delay multiplier between retries
    pub retry_backoff_factor: f64,
    /// Keep playing when a subtitle track fails to load
    pub ignore_text_stream_failures: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffering_goal: 30.0,
            rebuffering_goal: 5.0,
            buffer_behind: 10.0,
            retry_attempts: 5,
            retry_base_delay_ms: 1000,
            retry_backoff_factor: 2.0,
            ignore_text_stream_failures: true,
        }
    }
}

impl StreamingConfig {
    /// Retry policy for streaming requests
    pub fn retry_parameters(&self) -> RetryParameters {
        RetryParameters {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            backoff_factor: self.retry_backoff_factor,
            timeout: None,
        }
    }
}

/// Names of the persisted store entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub key_slot: String,
    pub offline_channels: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_slot: DEFAULT_KEY_SLOT.to_string(),
            offline_channels: DEFAULT_OFFLINE_KEY.to_string(),
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub streaming: StreamingConfig,
    pub harvest: HarvestConfig,
    pub interceptor: InterceptorConfig,
    pub storage: StorageConfig,
    pub overlay: OverlayConfig,
    /// Corrected license descriptors keyed by channel id
    pub license_overrides: BTreeMap<String, String>,
}

impl ControllerConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        let s = &self.streaming;
        if s.buffering_goal <= 0.0 || s.rebuffering_goal < 0.0 || s.buffer_behind < 0.0 {
            return Err(Error::InvalidConfig("buffer goals must be positive".into()));
        }
        if s.rebuffering_goal > s.buffering_goal {
            return Err(Error::InvalidConfig(
                "rebuffering_goal cannot exceed buffering_goal".into(),
            ));
        }
        if s.retry_backoff_factor < 1.0 {
            return Err(Error::InvalidConfig("retry_backoff_factor must be >= 1".into()));
        }
        if self.harvest.max_attempts == 0 || self.harvest.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "harvest polling needs a non-zero interval and attempt budget".into(),
            ));
        }
        if self.storage.key_slot.is_empty() || self.storage.offline_channels.is_empty() {
            return Err(Error::InvalidConfig("storage entry names cannot be empty".into()));
        }
        if self.storage.key_slot == self.storage.offline_channels {
            return Err(Error::InvalidConfig(
                "key slot and offline registry must use different entries".into(),
            ));
        }
        Ok(())
    }

    /// License descriptor override for a channel, if any
    pub fn license_override(&self, channel_id: &str) -> Option<&str> {
        self.license_overrides.get(channel_id).map(String::as_str)
    }
}
