//! Core types for Zapper

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable definition of a live channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    /// Stable identifier, unique within the active channel list
    pub id: String,
    /// Display name
    pub name: String,
    /// Manifest URL (DASH or HLS)
    pub stream_url: String,
    /// Logo URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    /// License descriptor: absolute URL, `keyId:key`, or absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    /// Collaborator scope for channels whose key must be harvested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_id: Option<String>,
}

impl ChannelDescriptor {
    /// Create a channel without DRM hints
    pub fn new(id: impl Into<String>, name: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_url: stream_url.into(),
            logo: None,
            license_key: None,
            harvest_id: None,
        }
    }

    /// Set the license descriptor
    pub fn with_license_key(mut self, license_key: impl Into<String>) -> Self {
        self.license_key = Some(license_key.into());
        self
    }

    /// Mark the channel as requiring a harvested key
    pub fn with_harvest_id(mut self, harvest_id: impl Into<String>) -> Self {
        self.harvest_id = Some(harvest_id.into());
        self
    }

    /// Set the logo URL
    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    /// Whether key material must come from the harvesting bridge
    pub fn requires_harvest(&self) -> bool {
        self.harvest_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }
}

/// Lifecycle status of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Loading,
    Playing,
    TornDown,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Uninitialized => write!(f, "uninitialized"),
            SessionStatus::Loading => write!(f, "loading"),
            SessionStatus::Playing => write!(f, "playing"),
            SessionStatus::TornDown => write!(f, "torn_down"),
        }
    }
}

/// Fault severity as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Self-healing under the configured retry policy
    Recoverable,
    /// Playback cannot continue
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "recoverable"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Subsystem an engine fault originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    Network,
    Text,
    Media,
    Manifest,
    Streaming,
    Drm,
    Player,
    Storage,
}

impl std::fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultCategory::Network => "network",
            FaultCategory::Text => "text",
            FaultCategory::Media => "media",
            FaultCategory::Manifest => "manifest",
            FaultCategory::Streaming => "streaming",
            FaultCategory::Drm => "drm",
            FaultCategory::Player => "player",
            FaultCategory::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Fault event delivered by the playback engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFault {
    pub severity: Severity,
    pub code: String,
    pub category: FaultCategory,
    pub message: String,
}

impl EngineFault {
    pub fn new(
        severity: Severity,
        code: impl Into<String>,
        category: FaultCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            category,
            message: message.into(),
        }
    }

    pub fn critical(code: impl Into<String>, category: FaultCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, code, category, message)
    }

    pub fn recoverable(code: impl Into<String>, category: FaultCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Recoverable, code, category, message)
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Presentation mode of the player page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    /// Full-screen playback, zapping with left/right
    #[default]
    Zap,
    /// On-screen channel list with focus navigation
    Strip,
}

/// Channel switch state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    /// No channel selected yet
    #[default]
    Idle,
    /// A channel load is in flight
    Loading,
    /// Current channel is playing
    Playing,
    /// Current channel failed critically
    Failed,
}

impl SwitchPhase {
    /// Check if transition to target phase is valid
    pub fn can_transition_to(&self, target: SwitchPhase) -> bool {
        use SwitchPhase::*;
        matches!(
            (self, target),
            (Idle, Loading)
                | (Loading, Loading)
                | (Loading, Playing)
                | (Loading, Failed)
                | (Playing, Loading)
                | (Playing, Failed)
                | (Failed, Loading)
        )
    }
}

impl std::fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchPhase::Idle => write!(f, "idle"),
            SwitchPhase::Loading => write!(f, "loading"),
            SwitchPhase::Playing => write!(f, "playing"),
            SwitchPhase::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_camel_case_json() {
        let json = r#"{
            "id": "news-1",
            "name": "News One",
            "streamUrl": "https://cdn.example.com/news/index.mpd",
            "licenseKey": "abcd:ef01",
            "harvestId": "relay-7"
        }"#;

        let channel: ChannelDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(channel.id, "news-1");
        assert_eq!(channel.license_key.as_deref(), Some("abcd:ef01"));
        assert!(channel.requires_harvest());
        assert!(channel.logo.is_none());
    }

    #[test]
    fn test_blank_harvest_id_does_not_require_harvest() {
        let channel = ChannelDescriptor::new("a", "A", "https://x/a.m3u8").with_harvest_id("  ");
        assert!(!channel.requires_harvest());
    }

    #[test]
    fn test_switch_phase_transitions() {
        assert!(SwitchPhase::Idle.can_transition_to(SwitchPhase::Loading));
        assert!(SwitchPhase::Failed.can_transition_to(SwitchPhase::Loading));
        assert!(SwitchPhase::Playing.can_transition_to(SwitchPhase::Failed));
        assert!(!SwitchPhase::Idle.can_transition_to(SwitchPhase::Playing));
        assert!(!SwitchPhase::Failed.can_transition_to(SwitchPhase::Playing));
    }
}
