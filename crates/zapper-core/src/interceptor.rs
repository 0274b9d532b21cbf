//! Network interceptor for harvested channels
//!
//! The engine's DRM client can only be pointed at a URI. For harvested
//! channels its key requests go to a relay host we cannot use, so they are
//! redirected to `synthetic:channel-key?channel=<id>`, which the harvesting
//! bridge answers locally.

use crate::engine::{EngineRequest, RequestFilter};
use crate::harvest::synthetic_key_uri;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Relay hosts used when none are configured
pub const DEFAULT_RELAY_HOSTS: &[&str] = &["keyrelay.zapper.local", "license-relay.zapper.local"];

/// Interceptor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Hostnames whose key requests are redirected (subdomains included)
    pub relay_hosts: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            relay_hosts: DEFAULT_RELAY_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Request filter bound to the channel currently loading
#[derive(Debug, Clone)]
pub struct NetworkInterceptor {
    relay_hosts: Vec<String>,
    channel_id: String,
}

impl NetworkInterceptor {
    pub fn new(relay_hosts: &[String], channel_id: impl Into<String>) -> Self {
        Self {
            relay_hosts: relay_hosts
                .iter()
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Whether `uri` targets one of the relay hosts
    pub fn should_rewrite(&self, uri: &Url) -> bool {
        let Some(host) = uri.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        self.relay_hosts.iter().any(|relay| {
            host == *relay
                || host
                    .strip_suffix(relay.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Synthetic URI the bridge answers for this channel
    pub fn rewrite(&self, uri: &Url) -> Url {
        let synthetic = synthetic_key_uri(&self.channel_id);
        debug!(from = %uri, to = %synthetic, "Rewriting key request");
        synthetic
    }
}

impl RequestFilter for NetworkInterceptor {
    fn filter(&self, request: &mut EngineRequest) {
        if request.kind.is_key_fetch() && self.should_rewrite(&request.uri) {
            request.uri = self.rewrite(&request.uri);
        }
    }
}
