//! DRM - license descriptor resolution
//!
//! A channel's license descriptor is a single string whose shape decides the
//! protection scheme:
//!
//! | Descriptor           | Result                         |
//! |----------------------|--------------------------------|
//! | absent / blank       | [`DrmConfig::None`]            |
//! | `http(s)://...`      | [`DrmConfig::LicenseServer`]   |
//! | `keyId:key`          | [`DrmConfig::ClearKey`]        |
//! | anything else        | [`DrmConfig::Unrecognized`]    |
//!
//! Resolution is pure and never fails. Unrecognized descriptors are logged and
//! configured like `None`, so playback proceeds unencrypted or fails naturally
//! inside the engine.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// ClearKey system ID (UUID), as carried in PSSH boxes
pub const CLEARKEY_SYSTEM_ID: &str = "1077efec-c0b2-4d02-ace3-3c1e52e2fb4b";

/// Key system name the engine uses for ClearKey
pub const CLEARKEY_KEY_SYSTEM: &str = "org.w3.clearkey";

/// Retry policy for DRM requests
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryParameters {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
    /// Per-request timeout (None = engine default)
    pub timeout: Option<Duration>,
}

impl RetryParameters {
    /// License-server policy: 3 attempts, fixed 10s request timeout
    pub fn license_server() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// ClearKey policy: 3 attempts, exponential backoff from 500ms
    pub fn clear_key() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            timeout: None,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        self.base_delay.mul_f64(self.backoff_factor.powi(exponent))
    }
}

/// Required decryption robustness for a track type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Robustness {
    /// Software-only decryption accepted
    #[default]
    None,
    SoftwareSecure,
    HardwareSecure,
}

impl Robustness {
    /// EME robustness string
    pub fn as_str(&self) -> &'static str {
        match self {
            Robustness::None => "",
            Robustness::SoftwareSecure => "SW_SECURE_CRYPTO",
            Robustness::HardwareSecure => "HW_SECURE_ALL",
        }
    }
}

/// Concrete DRM configuration for one channel
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DrmConfig {
    /// No protection configured
    #[default]
    None,
    /// Static keys supplied directly (key id -> key)
    ClearKey {
        keys: BTreeMap<String, String>,
        retry: RetryParameters,
        audio_robustness: Robustness,
        video_robustness: Robustness,
    },
    /// Remote license server the engine negotiates with
    LicenseServer { url: String, retry: RetryParameters },
    /// Descriptor of an unknown shape; treated as `None`
    Unrecognized { raw: String },
}

impl DrmConfig {
    /// Parse a license descriptor
    pub fn resolve(license: Option<&str>) -> Self {
        let Some(license) = license.filter(|s| !s.trim().is_empty()) else {
            return DrmConfig::None;
        };
        let raw = license.trim();

        if is_http_url(raw) {
            debug!(url = license, "License server descriptor");
            return DrmConfig::LicenseServer {
                url: license.to_string(),
                retry: RetryParameters::license_server(),
            };
        }

        if let Some((key_id, key)) = raw.split_once(':') {
            if !key_id.is_empty() && !key.is_empty() {
                debug!(key_id, "ClearKey descriptor");
                let mut keys = BTreeMap::new();
                keys.insert(key_id.to_string(), key.to_string());
                return DrmConfig::ClearKey {
                    keys,
                    retry: RetryParameters::clear_key(),
                    audio_robustness: Robustness::None,
                    video_robustness: Robustness::None,
                };
            }
        }

        warn!(descriptor = raw, "Unrecognized license descriptor, continuing without DRM");
        DrmConfig::Unrecognized { raw: raw.to_string() }
    }

    /// Short label for logs and listings
    pub fn mode(&self) -> &'static str {
        match self {
            DrmConfig::None => "none",
            DrmConfig::ClearKey { .. } => "clearkey",
            DrmConfig::LicenseServer { .. } => "license-server",
            DrmConfig::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Whether the engine should set up a key system at all
    pub fn is_configured(&self) -> bool {
        matches!(self, DrmConfig::ClearKey { .. } | DrmConfig::LicenseServer { .. })
    }

    /// Build a ClearKey JSON Web Key license from hex key pairs.
    ///
    /// Returns `None` for non-ClearKey configurations.
    pub fn clearkey_license(&self) -> Result<Option<String>> {
        let DrmConfig::ClearKey { keys, .. } = self else {
            return Ok(None);
        };

        let keys = keys
            .iter()
            .map(|(kid, key)| -> Result<serde_json::Value> {
                let kid = hex::decode(kid)
                    .map_err(|e| Error::InvalidConfig(format!("key id {kid} is not hex: {e}")))?;
                let key = hex::decode(key)
                    .map_err(|e| Error::InvalidConfig(format!("key for {} is not hex: {e}", hex::encode(&kid))))?;
                Ok(serde_json::json!({
                    "kty": "oct",
                    "kid": URL_SAFE_NO_PAD.encode(kid),
                    "k": URL_SAFE_NO_PAD.encode(key),
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        let license = serde_json::json!({
            "keys": keys,
            "type": "temporary",
        });

        Ok(Some(license.to_string()))
    }
}

fn is_http_url(raw: &str) -> bool {
    let lower = raw.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
