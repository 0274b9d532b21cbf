//! Playback engine seam
//!
//! The adaptive-streaming engine is an external collaborator. The controller
//! only needs to construct it, configure it, hook its requests, attach it to
//! a sink, load a manifest and destroy it again; everything else happens
//! inside the implementation behind [`PlaybackEngine`].

use crate::config::StreamingConfig;
use crate::drm::DrmConfig;
use crate::types::{EngineFault, SessionId};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Kind of outbound request the engine is about to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Manifest,
    Segment,
    License,
    Key,
    Other,
}

impl RequestKind {
    /// License and key fetches carry key material
    pub fn is_key_fetch(&self) -> bool {
        matches!(self, RequestKind::License | RequestKind::Key)
    }
}

/// Mutable view of an outbound engine request
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub kind: RequestKind,
    pub uri: Url,
    pub headers: BTreeMap<String, String>,
}

impl EngineRequest {
    pub fn new(kind: RequestKind, uri: Url) -> Self {
        Self {
            kind,
            uri,
            headers: BTreeMap::new(),
        }
    }
}

/// Hook run on every outbound request before it leaves the engine
pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &mut EngineRequest);
}

/// Answers requests for a custom URI scheme locally
#[async_trait]
pub trait SchemeResolver: Send + Sync {
    async fn resolve(&self, uri: &Url) -> Result<Bytes>;
}

/// Output surface an engine renders into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoSink {
    pub id: String,
}

impl VideoSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for VideoSink {
    fn default() -> Self {
        Self::new("main-video")
    }
}

/// One engine instance, owned by the session manager
#[async_trait]
pub trait PlaybackEngine: Send {
    /// Apply buffering and retry parameters
    fn configure_streaming(&mut self, config: &StreamingConfig) -> Result<()>;

    /// Apply the resolved DRM configuration
    fn configure_drm(&mut self, drm: &DrmConfig) -> Result<()>;

    /// Install a filter on outbound requests
    fn register_request_filter(&mut self, filter: Arc<dyn RequestFilter>);

    /// Route a URI scheme to a local resolver
    fn register_scheme(&mut self, scheme: &str, resolver: Arc<dyn SchemeResolver>);

    /// Bind the engine to a video sink
    async fn attach(&mut self, sink: &VideoSink) -> Result<()>;

    /// Load a manifest and start playback
    async fn load(&mut self, url: &Url, start_time: f64, mime_type: Option<&'static str>) -> Result<()>;

    /// Release every native resource held by the engine
    async fn destroy(&mut self) -> Result<()>;
}

/// Constructs engines for new sessions
pub trait EngineFactory: Send + Sync {
    fn create(&self, faults: FaultSender) -> Result<Box<dyn PlaybackEngine>>;
}

/// Fault tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub session_id: SessionId,
    pub channel_id: String,
    pub fault: EngineFault,
}

/// Receiving end of session faults
pub type FaultReceiver = mpsc::UnboundedReceiver<SessionFault>;

/// Session-scoped fault callback handed to an engine.
///
/// Once the session is torn down the sender is closed and late faults are
/// dropped instead of reaching the controller.
#[derive(Debug, Clone)]
pub struct FaultSender {
    session_id: SessionId,
    channel_id: String,
    tx: mpsc::UnboundedSender<SessionFault>,
    closed: CancellationToken,
}

impl FaultSender {
    pub fn new(
        session_id: SessionId,
        channel_id: impl Into<String>,
        tx: mpsc::UnboundedSender<SessionFault>,
    ) -> Self {
        Self {
            session_id,
            channel_id: channel_id.into(),
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Deliver a fault. Returns false when the fault was dropped.
    pub fn emit(&self, fault: EngineFault) -> bool {
        if self.closed.is_cancelled() {
            debug!(
                session_id = %self.session_id,
                code = %fault.code,
                "Dropping fault from torn-down session"
            );
            return false;
        }

        self.tx
            .send(SessionFault {
                session_id: self.session_id,
                channel_id: self.channel_id.clone(),
                fault,
            })
            .is_ok()
    }

    /// Stop delivering faults for this session
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaultCategory;

    #[test]
    fn test_fault_sender_drops_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = FaultSender::new(SessionId::new(), "news", tx);
        let clone = sender.clone();

        assert!(clone.emit(EngineFault::recoverable("1001", FaultCategory::Network, "retry")));
        sender.close();
        assert!(!clone.emit(EngineFault::critical("6007", FaultCategory::Drm, "late")));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.channel_id, "news");
        assert_eq!(delivered.fault.code, "1001");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_key_fetch_kinds() {
        assert!(RequestKind::License.is_key_fetch());
        assert!(RequestKind::Key.is_key_fetch());
        assert!(!RequestKind::Segment.is_key_fetch());
    }
}
