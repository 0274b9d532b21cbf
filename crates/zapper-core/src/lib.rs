//! Zapper Core - Live-channel playback controller
//!
//! This crate drives a pluggable adaptive-streaming engine for live TV:
//! - DRM descriptor resolution (clear-key pairs and license servers)
//! - Key harvesting for channels whose keys arrive out of band
//! - Rewriting of relay key requests to a locally answered scheme
//! - Session lifecycle with strict teardown before each load
//! - Channel switching with newest-wins semantics
//! - Fault classification and a persisted offline-channel registry
//! - Control overlay state (auto-hide, fullscreen, channel strip)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Zapper Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Overlay    │  │   Channel    │  │    Error     │          │
//! │  │  Controller  │──│   Switcher   │──│  Classifier  │          │
//! │  └──────────────┘  └──────┬───────┘  └──────┬───────┘          │
//! │                           │                 │                   │
//! │                    ┌──────┴──────┐   ┌──────┴───────┐           │
//! │                    │   Session   │   │   Offline    │           │
//! │                    │   Manager   │   │   Registry   │           │
//! │                    └──────┬──────┘   └──────────────┘           │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐           │
//! │  │     DRM      │  │  Playback   │  │   Network    │           │
//! │  │   Resolver   │  │   Engine    │──│ Interceptor  │           │
//! │  └──────────────┘  └──────┬──────┘  └──────────────┘           │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │     Key     │◀── collaborator messages     │
//! │                    │  Harvester  │                              │
//! │                    └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod store;
pub mod drm;
pub mod manifest;
pub mod engine;
pub mod harvest;
pub mod interceptor;
pub mod offline;
pub mod classifier;
pub mod overlay;
pub mod session;
pub mod switcher;

pub use error::{Error, Result};
pub use types::*;
pub use config::{ControllerConfig, StorageConfig, StreamingConfig};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use drm::{DrmConfig, RetryParameters, Robustness};
pub use manifest::{mime_hint, ManifestType};
pub use engine::{
    EngineFactory, EngineRequest, FaultReceiver, FaultSender, PlaybackEngine, RequestFilter,
    RequestKind, SchemeResolver, SessionFault, VideoSink,
};
pub use harvest::{
    CollaboratorMessage, HarvestConfig, HarvestSchemeResolver, HarvestedKeyRecord, KeyHarvester,
    KeySlot, MemoryKeySlot, StoreKeySlot,
};
pub use interceptor::{InterceptorConfig, NetworkInterceptor};
pub use offline::OfflineRegistry;
pub use classifier::{Classification, ErrorClassifier, FaultReport};
pub use overlay::{OverlayCommand, OverlayConfig, OverlayController, RemoteKey};
pub use session::{InterruptHandle, LoadTicket, SessionManager};
pub use switcher::{ChannelSwitcher, ChannelView, SwitchOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the controller library
pub fn init() {
    tracing::info!(version = VERSION, "Zapper Core initialized");
}
