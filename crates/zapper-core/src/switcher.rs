//! Channel switch state machine
//!
//! Phases run `Idle -> Loading -> {Playing | Failed}`; every new switch
//! re-enters `Loading`. Switch requests form a queue of depth one: a request
//! bumps the generation, interrupts whatever is loading, and only proceeds
//! if nothing newer arrived while it waited for the session manager.

use crate::{
    classifier::{Classification, ErrorClassifier},
    config::ControllerConfig,
    engine::{EngineFactory, FaultReceiver, SessionFault, VideoSink},
    harvest::{KeyHarvester, StoreKeySlot},
    offline::OfflineRegistry,
    overlay::{OverlayCommand, OverlayConfig, OverlayController, RemoteKey},
    session::{InterruptHandle, SessionManager},
    store::KeyValueStore,
    types::*,
    Error, Result,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of a switch request
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchOutcome {
    /// Requested channel is already current
    Unchanged,
    /// Channel loaded and playing
    Playing(SessionId),
    /// Load failed; the classification is also kept as the last error
    Failed(Classification),
    /// A newer request took over before this one finished
    Superseded,
}

/// Channel list entry prepared for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub index: usize,
    pub channel: ChannelDescriptor,
    /// Previously failed; rendered grayed out but still selectable
    pub offline: bool,
    pub current: bool,
}

struct SwitchState {
    channels: Vec<ChannelDescriptor>,
    current: Option<ChannelDescriptor>,
    current_index: Option<usize>,
    phase: SwitchPhase,
    last_error: Option<Classification>,
    overlay: OverlayController,
}

/// Drives channel selection on top of the session manager
pub struct ChannelSwitcher {
    state: RwLock<SwitchState>,
    sessions: Mutex<SessionManager>,
    faults: Mutex<FaultReceiver>,
    classifier: Arc<ErrorClassifier>,
    harvester: Arc<KeyHarvester>,
    interrupt: InterruptHandle,
    generation: AtomicU64,
    phase_tx: watch::Sender<SwitchPhase>,
}

impl ChannelSwitcher {
    pub fn new(
        sessions: SessionManager,
        faults: FaultReceiver,
        classifier: Arc<ErrorClassifier>,
        overlay: OverlayConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SwitchPhase::Idle);
        Self {
            interrupt: sessions.interrupt_handle(),
            harvester: sessions.harvester().clone(),
            state: RwLock::new(SwitchState {
                channels: Vec::new(),
                current: None,
                current_index: None,
                phase: SwitchPhase::Idle,
                last_error: None,
                overlay: OverlayController::new(overlay),
            }),
            sessions: Mutex::new(sessions),
            faults: Mutex::new(faults),
            classifier,
            generation: AtomicU64::new(0),
            phase_tx,
        }
    }

    /// Wire a complete controller over one persistent store
    pub fn with_store(
        factory: Arc<dyn EngineFactory>,
        store: Arc<dyn KeyValueStore>,
        config: ControllerConfig,
        sink: VideoSink,
    ) -> Self {
        let slot = Arc::new(StoreKeySlot::new(store.clone(), config.storage.key_slot.clone()));
        let harvester = Arc::new(KeyHarvester::new(slot, config.harvest.clone()));
        let registry = Arc::new(OfflineRegistry::new(store, config.storage.offline_channels.clone()));
        let classifier = Arc::new(ErrorClassifier::new(registry));
        let overlay = config.overlay;

        let (sessions, faults) = SessionManager::new(factory, harvester, Arc::new(config), sink);
        Self::new(sessions, faults, classifier, overlay)
    }

    /// Replace the channel list. The current channel keeps playing.
    pub async fn set_channels(&self, channels: Vec<ChannelDescriptor>) {
        let mut state = self.state.write().await;
        state.current_index = state
            .current
            .as_ref()
            .and_then(|current| channels.iter().position(|c| c.id == current.id));
        info!(count = channels.len(), "Channel list updated");
        state.channels = channels;
    }

    pub async fn channels(&self) -> Vec<ChannelDescriptor> {
        self.state.read().await.channels.clone()
    }

    pub async fn phase(&self) -> SwitchPhase {
        self.state.read().await.phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SwitchPhase> {
        self.phase_tx.subscribe()
    }

    pub async fn current_channel(&self) -> Option<ChannelDescriptor> {
        self.state.read().await.current.clone()
    }

    pub async fn current_index(&self) -> Option<usize> {
        self.state.read().await.current_index
    }

    pub async fn last_error(&self) -> Option<Classification> {
        self.state.read().await.last_error.clone()
    }

    pub async fn view_mode(&self) -> ViewMode {
        self.state.read().await.overlay.view_mode()
    }

    /// Snapshot of the overlay for rendering
    pub async fn overlay(&self) -> OverlayController {
        self.state.read().await.overlay.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.sessions.lock().await.session_id()
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Bridge that receives collaborator key messages
    pub fn harvester(&self) -> &Arc<KeyHarvester> {
        &self.harvester
    }

    /// Switch to `descriptor`, stored at `index` of the channel list
    pub async fn select_channel(
        &self,
        descriptor: ChannelDescriptor,
        index: usize,
    ) -> Result<SwitchOutcome> {
        self.switch_to(descriptor, index, false).await
    }

    /// Switch to the channel at `index` of the channel list
    pub async fn select_index(&self, index: usize) -> Result<SwitchOutcome> {
        let descriptor = {
            let state = self.state.read().await;
            let len = state.channels.len();
            state
                .channels
                .get(index)
                .cloned()
                .ok_or(Error::ChannelIndexOutOfRange { index, len })?
        };
        self.select_channel(descriptor, index).await
    }

    /// Zap `delta` positions through the list, wrapping at both ends
    pub async fn navigate_relative(&self, delta: i32) -> Result<SwitchOutcome> {
        let (descriptor, index) = {
            let state = self.state.read().await;
            if state.channels.is_empty() {
                return Err(Error::EmptyChannelList);
            }
            let len = state.channels.len() as i64;
            let base = state.current_index.unwrap_or(0) as i64;
            let index = (base + delta as i64).rem_euclid(len) as usize;
            (state.channels[index].clone(), index)
        };
        self.select_channel(descriptor, index).await
    }

    /// Reload the current channel from scratch
    pub async fn retry(&self) -> Result<SwitchOutcome> {
        let (descriptor, index) = {
            let state = self.state.read().await;
            let descriptor = state.current.clone().ok_or(Error::NoActiveSession)?;
            (descriptor, state.current_index.unwrap_or(0))
        };
        info!(channel = %descriptor.id, "Retrying channel");
        self.switch_to(descriptor, index, true).await
    }

    #[instrument(skip(self, descriptor), fields(channel = %descriptor.id))]
    async fn switch_to(
        &self,
        descriptor: ChannelDescriptor,
        index: usize,
        force: bool,
    ) -> Result<SwitchOutcome> {
        let (generation, ticket) = {
            let mut state = self.state.write().await;
            let same = state.current.as_ref().is_some_and(|c| c.id == descriptor.id);
            if same && !force {
                debug!("Channel already current");
                return Ok(SwitchOutcome::Unchanged);
            }
            state.current = Some(descriptor.clone());
            state.current_index = Some(index);
            state.last_error = None;
            self.set_phase(&mut state, SwitchPhase::Loading);

            // Generation order must match the order requests are committed
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (generation, self.interrupt.begin())
        };

        let mut sessions = self.sessions.lock().await;
        if self.is_superseded(generation) {
            debug!(generation, "Switch superseded before loading");
            return Ok(SwitchOutcome::Superseded);
        }

        let result = sessions.load_channel_with(&descriptor, ticket).await;
        if self.is_superseded(generation) {
            debug!(generation, "Switch superseded while loading");
            return Ok(SwitchOutcome::Superseded);
        }

        match result {
            Ok(session_id) => {
                {
                    let mut state = self.state.write().await;
                    self.set_phase(&mut state, SwitchPhase::Playing);
                }
                if let Some(classification) = self.drain_faults(&mut sessions).await {
                    return Ok(SwitchOutcome::Failed(classification));
                }
                Ok(SwitchOutcome::Playing(session_id))
            }
            Err(e) if e.is_cancelled() => Ok(SwitchOutcome::Superseded),
            Err(e) => {
                let classification = self.classifier.handle(&e.into_fault(), Some(&descriptor.id), None);
                let mut state = self.state.write().await;
                state.last_error = Some(classification.clone());
                self.set_phase(&mut state, SwitchPhase::Failed);
                Ok(SwitchOutcome::Failed(classification))
            }
        }
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Apply queued runtime faults. Returns how many were processed.
    ///
    /// Does nothing if `watch_faults` currently owns the fault stream.
    pub async fn pump_faults(&self) -> usize {
        let pending = self.take_pending();
        if pending.is_empty() {
            return 0;
        }
        let count = pending.len();
        let mut sessions = self.sessions.lock().await;
        for fault in pending {
            self.apply_fault(&mut sessions, fault).await;
        }
        count
    }

    /// Apply runtime faults as they arrive until `shutdown` fires
    pub async fn watch_faults(&self, shutdown: CancellationToken) {
        loop {
            let fault = {
                let mut faults = self.faults.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    fault = faults.recv() => fault,
                }
            };
            let Some(fault) = fault else {
                debug!("Fault stream closed");
                return;
            };
            let mut sessions = self.sessions.lock().await;
            self.apply_fault(&mut sessions, fault).await;
        }
    }

    fn take_pending(&self) -> Vec<SessionFault> {
        let mut pending = Vec::new();
        if let Ok(mut faults) = self.faults.try_lock() {
            while let Ok(fault) = faults.try_recv() {
                pending.push(fault);
            }
        }
        pending
    }

    async fn drain_faults(&self, sessions: &mut SessionManager) -> Option<Classification> {
        let mut critical = None;
        for fault in self.take_pending() {
            if let Some(classification) = self.apply_fault(sessions, fault).await {
                critical = Some(classification);
            }
        }
        critical
    }

    /// Returns the classification when the fault stopped playback
    async fn apply_fault(
        &self,
        sessions: &mut SessionManager,
        fault: SessionFault,
    ) -> Option<Classification> {
        if sessions.session_id() != Some(fault.session_id) {
            debug!(
                session_id = %fault.session_id,
                code = %fault.fault.code,
                "Discarding fault from stale session"
            );
            return None;
        }

        let classification =
            self.classifier
                .handle(&fault.fault, Some(&fault.channel_id), Some(fault.session_id));
        if !classification.is_user_visible() {
            return None;
        }

        sessions.destroy().await;
        let mut state = self.state.write().await;
        state.last_error = Some(classification.clone());
        self.set_phase(&mut state, SwitchPhase::Failed);
        Some(classification)
    }

    /// Toggle between zapping and the channel strip
    pub async fn toggle_view_mode(&self, now: Instant) -> ViewMode {
        let mut state = self.state.write().await;
        let index = state.current_index.unwrap_or(0);
        state.overlay.toggle_view_mode(index, now)
    }

    /// Route a remote key through the overlay and run the switch it asks for
    pub async fn handle_key(&self, key: RemoteKey, now: Instant) -> Result<Option<SwitchOutcome>> {
        let command = {
            let mut state = self.state.write().await;
            let count = state.channels.len();
            let index = state.current_index.unwrap_or(0);
            state.overlay.handle_key(key, now, count, index)
        };

        match command {
            Some(OverlayCommand::Select(index)) => self.select_index(index).await.map(Some),
            Some(OverlayCommand::Navigate(delta)) => self.navigate_relative(delta).await.map(Some),
            None => Ok(None),
        }
    }

    /// Advance overlay timers
    pub async fn tick(&self, now: Instant) {
        self.state.write().await.overlay.tick(now);
    }

    /// Channel list annotated with offline and current flags
    pub async fn channel_views(&self) -> Vec<ChannelView> {
        let state = self.state.read().await;
        let registry = self.classifier.registry();
        state
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| ChannelView {
                index,
                offline: registry.is_offline(&channel.id).unwrap_or_else(|e| {
                    warn!(channel = %channel.id, error = %e, "Offline lookup failed");
                    false
                }),
                current: state.current_index == Some(index),
                channel: channel.clone(),
            })
            .collect()
    }

    /// Tear down playback
    pub async fn shutdown(&self) {
        {
            let _state = self.state.write().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.interrupt.interrupt();
        }
        self.sessions.lock().await.destroy().await;
        info!("Controller shut down");
    }

    fn set_phase(&self, state: &mut SwitchState, phase: SwitchPhase) {
        if !state.phase.can_transition_to(phase) {
            warn!(from = %state.phase, to = %phase, "Unexpected phase transition");
        }
        debug!(from = %state.phase, to = %phase, "Phase change");
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}
