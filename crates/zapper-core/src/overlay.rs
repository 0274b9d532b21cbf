//! Control overlay: auto-hiding controls, fullscreen and channel strip
//!
//! Time is passed in by the caller so the controller stays deterministic and
//! owns no timers of its own; `tick` applies any expired deadline.

use crate::types::ViewMode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Overlay timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Hide controls after this much inactivity (ms)
    pub controls_hide_ms: u64,
    /// Leave the channel strip after this much inactivity (ms)
    pub strip_inactivity_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            controls_hide_ms: 3000,
            strip_inactivity_ms: 5000,
        }
    }
}

/// Keyboard / remote input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKey {
    Up,
    Down,
    Left,
    Right,
    Enter,
    Back,
    /// Toggle the channel strip
    Menu,
    Fullscreen,
}

/// Channel action requested by overlay input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayCommand {
    /// Select the channel at this list index
    Select(usize),
    /// Zap relative to the current channel
    Navigate(i32),
}

/// Overlay state
#[derive(Debug, Clone)]
pub struct OverlayController {
    config: OverlayConfig,
    controls_visible: bool,
    hide_at: Option<Instant>,
    fullscreen: bool,
    view_mode: ViewMode,
    strip_focus: usize,
    strip_deadline: Option<Instant>,
}

impl OverlayController {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            controls_visible: false,
            hide_at: None,
            fullscreen: false,
            view_mode: ViewMode::Zap,
            strip_focus: 0,
            strip_deadline: None,
        }
    }

    pub fn controls_visible(&self) -> bool {
        self.controls_visible
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    /// Focused strip entry (meaningful in strip mode)
    pub fn strip_focus(&self) -> usize {
        self.strip_focus
    }

    /// Show controls and restart the hide timer
    pub fn show_controls(&mut self, now: Instant) {
        self.controls_visible = true;
        self.hide_at = Some(now + Duration::from_millis(self.config.controls_hide_ms));
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        self.fullscreen = !self.fullscreen;
        self.fullscreen
    }

    /// Open the strip with focus on the playing channel
    pub fn enter_strip(&mut self, current_index: usize, now: Instant) {
        self.view_mode = ViewMode::Strip;
        self.strip_focus = current_index;
        self.touch_strip(now);
        debug!(focus = current_index, "Channel strip opened");
    }

    pub fn exit_strip(&mut self) {
        self.view_mode = ViewMode::Zap;
        self.strip_deadline = None;
    }

    pub fn toggle_view_mode(&mut self, current_index: usize, now: Instant) -> ViewMode {
        match self.view_mode {
            ViewMode::Zap => self.enter_strip(current_index, now),
            ViewMode::Strip => self.exit_strip(),
        }
        self.view_mode
    }

    /// Apply input; returns the channel action it requests, if any
    pub fn handle_key(
        &mut self,
        key: RemoteKey,
        now: Instant,
        channel_count: usize,
        current_index: usize,
    ) -> Option<OverlayCommand> {
        self.show_controls(now);

        match (self.view_mode, key) {
            (_, RemoteKey::Menu) => {
                self.toggle_view_mode(current_index, now);
                None
            }
            (_, RemoteKey::Fullscreen) => {
                self.toggle_fullscreen();
                None
            }
            (ViewMode::Zap, RemoteKey::Left) => Some(OverlayCommand::Navigate(-1)),
            (ViewMode::Zap, RemoteKey::Right) => Some(OverlayCommand::Navigate(1)),
            (ViewMode::Zap, _) => None,
            (ViewMode::Strip, RemoteKey::Up | RemoteKey::Down) if channel_count > 0 => {
                let delta: i64 = if key == RemoteKey::Up { -1 } else { 1 };
                let len = channel_count as i64;
                self.strip_focus = (self.strip_focus as i64 + delta).rem_euclid(len) as usize;
                self.touch_strip(now);
                None
            }
            (ViewMode::Strip, RemoteKey::Enter) if self.strip_focus < channel_count => {
                let index = self.strip_focus;
                self.exit_strip();
                Some(OverlayCommand::Select(index))
            }
            (ViewMode::Strip, RemoteKey::Back) => {
                self.exit_strip();
                None
            }
            (ViewMode::Strip, _) => {
                self.touch_strip(now);
                None
            }
        }
    }

    /// Apply expired deadlines
    pub fn tick(&mut self, now: Instant) {
        if self.hide_at.is_some_and(|at| now >= at) {
            self.controls_visible = false;
            self.hide_at = None;
        }
        if self.view_mode == ViewMode::Strip && self.strip_deadline.is_some_and(|at| now >= at) {
            debug!("Channel strip inactive, returning to zap mode");
            self.exit_strip();
        }
    }

    fn touch_strip(&mut self, now: Instant) {
        self.strip_deadline = Some(now + Duration::from_millis(self.config.strip_inactivity_ms));
    }
}

impl Default for OverlayController {
    fn default() -> Self {
        Self::new(OverlayConfig::default())
    }
}
