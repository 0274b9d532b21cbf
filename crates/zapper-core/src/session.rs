//! Session Manager - sole owner of the playback engine
//!
//! Coordinates:
//! - Teardown of the previous engine before anything new is attached
//! - DRM resolution and streaming configuration
//! - Request rewriting and key harvesting for harvested channels
//! - Session-scoped fault delivery and cancellation

use crate::{
    config::ControllerConfig,
    drm::DrmConfig,
    engine::{EngineFactory, FaultReceiver, FaultSender, PlaybackEngine, SessionFault, VideoSink},
    harvest::{HarvestSchemeResolver, KeyHarvester, SYNTHETIC_SCHEME},
    interceptor::NetworkInterceptor,
    manifest,
    types::*,
    Error, Result,
};
use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Cancellation registered for one load request
#[derive(Debug, Clone)]
pub struct LoadTicket {
    id: u64,
    token: CancellationToken,
}

impl LoadTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct Inflight {
    next_id: u64,
    current: Option<LoadTicket>,
}

/// Cancels the load in flight from outside the manager.
///
/// A request registers its ticket when it is issued, before it waits for the
/// manager, so a newer request can cancel it at any point of its lifetime.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    inflight: Arc<Mutex<Inflight>>,
}

impl InterruptHandle {
    /// Cancel any registered request and register a new one
    pub fn begin(&self) -> LoadTicket {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.next_id += 1;
        let ticket = LoadTicket {
            id: inflight.next_id,
            token: CancellationToken::new(),
        };
        if let Some(previous) = inflight.current.replace(ticket.clone()) {
            previous.token.cancel();
        }
        ticket
    }

    /// Cancel the registered request, if any. Returns true if one was interrupted.
    pub fn interrupt(&self) -> bool {
        let ticket = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .take();
        match ticket {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    fn finish(&self, ticket: &LoadTicket) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.current.as_ref().is_some_and(|current| current.id == ticket.id) {
            inflight.current = None;
        }
    }
}

/// The one live engine and everything scoped to it
struct ActiveSession {
    id: SessionId,
    channel: ChannelDescriptor,
    engine: Box<dyn PlaybackEngine>,
    status: SessionStatus,
    cancel: CancellationToken,
    faults: FaultSender,
}

/// Owns construction, configuration, attachment, loading and teardown of
/// the playback engine. At most one session exists at a time.
pub struct SessionManager {
    factory: Arc<dyn EngineFactory>,
    harvester: Arc<KeyHarvester>,
    config: Arc<ControllerConfig>,
    sink: VideoSink,
    fault_tx: mpsc::UnboundedSender<SessionFault>,
    current: Option<ActiveSession>,
    interrupt: InterruptHandle,
}

impl SessionManager {
    /// Create a manager and the receiver its sessions report faults on
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        harvester: Arc<KeyHarvester>,
        config: Arc<ControllerConfig>,
        sink: VideoSink,
    ) -> (Self, FaultReceiver) {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let manager = Self {
            factory,
            harvester,
            config,
            sink,
            fault_tx,
            current: None,
            interrupt: InterruptHandle::default(),
        };
        (manager, fault_rx)
    }

    /// Handle for cancelling an in-flight load
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Current session ID
    pub fn session_id(&self) -> Option<SessionId> {
        self.current.as_ref().map(|s| s.id)
    }

    /// Channel bound to the current session
    pub fn channel(&self) -> Option<&ChannelDescriptor> {
        self.current.as_ref().map(|s| &s.channel)
    }

    /// Status of the current session
    pub fn status(&self) -> SessionStatus {
        self.current
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Uninitialized)
    }

    pub fn harvester(&self) -> &Arc<KeyHarvester> {
        &self.harvester
    }

    /// Tear down any existing session, then build, attach and load a new one
    pub async fn load_channel(&mut self, descriptor: &ChannelDescriptor) -> Result<SessionId> {
        let ticket = self.interrupt.begin();
        self.load_channel_with(descriptor, ticket).await
    }

    /// Load under a ticket registered earlier with the interrupt handle.
    ///
    /// Returns `Cancelled` as soon as the ticket is cancelled, including while
    /// the previous session is still being torn down.
    #[instrument(skip(self, descriptor, ticket), fields(channel = %descriptor.id))]
    pub async fn load_channel_with(
        &mut self,
        descriptor: &ChannelDescriptor,
        ticket: LoadTicket,
    ) -> Result<SessionId> {
        let result = self.load(descriptor, ticket.token.clone()).await;
        self.interrupt.finish(&ticket);
        result
    }

    async fn load(&mut self, descriptor: &ChannelDescriptor, cancel: CancellationToken) -> Result<SessionId> {
        self.destroy().await;
        if cancel.is_cancelled() {
            debug!("Load interrupted during teardown");
            return Err(Error::Cancelled);
        }

        let descriptor = self.apply_override(descriptor);
        let stream_url = Url::parse(&descriptor.stream_url)
            .map_err(|e| Error::InvalidStreamUrl(format!("{}: {e}", descriptor.stream_url)))?;

        let id = SessionId::new();
        let faults = FaultSender::new(id, descriptor.id.clone(), self.fault_tx.clone());
        let engine = self.factory.create(faults.clone())?;

        self.current = Some(ActiveSession {
            id,
            channel: descriptor.clone().into_owned(),
            engine,
            status: SessionStatus::Uninitialized,
            cancel,
            faults,
        });

        info!(session_id = %id, url = %stream_url, "Loading channel");

        match self.start(&stream_url).await {
            Ok(()) => {
                if let Some(session) = self.current.as_mut() {
                    session.status = SessionStatus::Playing;
                }
                info!(session_id = %id, "Channel playing");
                Ok(id)
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(session_id = %id, "Load interrupted");
                } else {
                    warn!(session_id = %id, error = %e, "Load failed");
                }
                self.destroy().await;
                Err(e)
            }
        }
    }

    async fn start(&mut self, stream_url: &Url) -> Result<()> {
        let session = self.current.as_mut().ok_or(Error::NoActiveSession)?;
        if session.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let channel = &session.channel;

        let drm = DrmConfig::resolve(channel.license_key.as_deref());
        debug!(mode = drm.mode(), "DRM resolved");

        session.engine.configure_streaming(&self.config.streaming)?;
        session.engine.configure_drm(&drm)?;

        if channel.requires_harvest() {
            self.harvester.arm(&channel.id)?;
            session.engine.register_request_filter(Arc::new(NetworkInterceptor::new(
                &self.config.interceptor.relay_hosts,
                channel.id.clone(),
            )));
            session.engine.register_scheme(
                SYNTHETIC_SCHEME,
                Arc::new(HarvestSchemeResolver::new(
                    self.harvester.clone(),
                    session.cancel.clone(),
                )),
            );
            debug!(harvest_id = ?channel.harvest_id, "Key harvesting registered");
        }

        if session.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        session.status = SessionStatus::Loading;
        session.engine.attach(&self.sink).await?;

        let mime_type = manifest::mime_hint(&channel.stream_url);
        let cancel = session.cancel.clone();
        tokio::select! {
            result = session.engine.load(stream_url, 0.0, mime_type) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Destroy the current session. Safe to call repeatedly.
    pub async fn destroy(&mut self) {
        let Some(mut session) = self.current.take() else {
            return;
        };

        session.cancel.cancel();
        session.faults.close();

        if let Err(e) = session.engine.destroy().await {
            warn!(session_id = %session.id, error = %e, "Engine destroy reported an error");
        }
        if session.channel.requires_harvest() {
            self.harvester.disarm();
        }

        session.status = SessionStatus::TornDown;
        info!(session_id = %session.id, channel = %session.channel.id, status = %session.status, "Session destroyed");
    }

    fn apply_override<'a>(&self, descriptor: &'a ChannelDescriptor) -> Cow<'a, ChannelDescriptor> {
        match self.config.license_override(&descriptor.id) {
            Some(license) if descriptor.license_key.as_deref() != Some(license) => {
                debug!(channel = %descriptor.id, "Applying license override");
                let mut patched = descriptor.clone();
                patched.license_key = Some(license.to_string());
                Cow::Owned(patched)
            }
            _ => Cow::Borrowed(descriptor),
        }
    }
}
