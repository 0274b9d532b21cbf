//! Offline channel registry
//!
//! Channels that failed critically are remembered in a persisted JSON array so
//! list views can gray them out. Entries are never evicted by the controller;
//! only explicit operator actions (`remove`, `clear`) shrink the set.

use crate::error::Result;
use crate::store::KeyValueStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Default store entry holding the registry
pub const DEFAULT_OFFLINE_KEY: &str = "zapper.offlineChannels";

/// Persisted set of channel ids that failed critically
pub struct OfflineRegistry {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl OfflineRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Registry under the default store entry
    pub fn with_default_key(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, DEFAULT_OFFLINE_KEY)
    }

    /// Record a channel as offline. Marking twice keeps a single entry.
    pub fn mark_offline(&self, channel_id: &str) -> Result<bool> {
        let mut ids = self.load()?;
        if !ids.insert(channel_id.to_string()) {
            return Ok(false);
        }
        self.save(&ids)?;
        info!(channel = channel_id, total = ids.len(), "Channel marked offline");
        Ok(true)
    }

    pub fn is_offline(&self, channel_id: &str) -> Result<bool> {
        Ok(self.load()?.contains(channel_id))
    }

    /// All offline ids, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.load()?.into_iter().collect())
    }

    /// Operator action: forget one channel
    pub fn remove(&self, channel_id: &str) -> Result<bool> {
        let mut ids = self.load()?;
        if !ids.remove(channel_id) {
            return Ok(false);
        }
        self.save(&ids)?;
        info!(channel = channel_id, "Channel removed from offline registry");
        Ok(true)
    }

    /// Operator action: forget every channel
    pub fn clear(&self) -> Result<()> {
        self.store.remove(&self.key)?;
        info!("Offline registry cleared");
        Ok(())
    }

    fn load(&self) -> Result<BTreeSet<String>> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(BTreeSet::new());
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Offline registry is malformed, treating as empty");
                Ok(BTreeSet::new())
            }
        }
    }

    fn save(&self, ids: &BTreeSet<String>) -> Result<()> {
        let json = serde_json::to_string(&ids.iter().collect::<Vec<_>>())?;
        self.store.set(&self.key, &json)
    }
}
