//! Error types for Zapper Core

use crate::types::{EngineFault, FaultCategory, Severity};
use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    // Key harvesting errors
    #[error("No harvested key appeared after {attempts} attempts")]
    HarvestTimeout { attempts: u32 },

    #[error("Operation cancelled by session teardown")]
    Cancelled,

    #[error("Invalid synthetic key URI: {0}")]
    InvalidSyntheticUri(String),

    // Engine errors
    #[error("Engine fault {}: {}", .0.code, .0.message)]
    Engine(EngineFault),

    #[error("Invalid stream URL: {0}")]
    InvalidStreamUrl(String),

    #[error("No engine session is active")]
    NoActiveSession,

    // Channel list errors
    #[error("Channel list is empty")]
    EmptyChannelList,

    #[error("Channel index {index} out of range (len {len})")]
    ChannelIndexOutOfRange { index: usize, len: usize },

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Returns true if retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Engine(fault) => fault.severity == Severity::Recoverable,
            Error::Store(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error came from a session teardown rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns the error code for fault reports
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::HarvestTimeout { .. } => "HARVEST_TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::InvalidSyntheticUri(_) => "INVALID_SYNTHETIC_URI",
            Error::Engine(_) => "ENGINE",
            Error::InvalidStreamUrl(_) => "INVALID_STREAM_URL",
            Error::NoActiveSession => "NO_SESSION",
            Error::EmptyChannelList => "EMPTY_CHANNEL_LIST",
            Error::ChannelIndexOutOfRange { .. } => "CHANNEL_INDEX",
            Error::Store(_) => "STORE",
            Error::Json(_) => "JSON",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Io(_) => "IO",
        }
    }

    /// Translate a load failure into the engine fault the classifier sees.
    ///
    /// Engine faults pass through untouched so their own severity wins; every
    /// other error prevented playback from starting and is critical.
    pub fn into_fault(self) -> EngineFault {
        match self {
            Error::Engine(fault) => fault,
            Error::HarvestTimeout { .. } => EngineFault::critical(
                self.error_code(),
                FaultCategory::Drm,
                self.to_string(),
            ),
            Error::InvalidStreamUrl(_) => EngineFault::critical(
                self.error_code(),
                FaultCategory::Manifest,
                self.to_string(),
            ),
            other => EngineFault::critical(
                other.error_code(),
                FaultCategory::Player,
                other.to_string(),
            ),
        }
    }
}

impl From<EngineFault> for Error {
    fn from(fault: EngineFault) -> Self {
        Error::Engine(fault)
    }
}
