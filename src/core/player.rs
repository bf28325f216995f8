//! Playback controller: clock, state machine and frame delivery
//!
//! **Ownership**: `Player` owns the frame store, the fetch coordinator and the
//! preload planner. Every mutation happens on the caller's thread; worker jobs
//! only report completions, which `pump()` applies.
//!
//! # State machine
//!
//! ```text
//!   Idle --init--> Loading --batch resident--> Paused <--toggle--> Playing
//!                     |                          ^  \                 |
//!                     +------- scrub ----------> Scrubbing <-- scrub -+
//!                                    release --> Paused
//!   Playing/Loading --required frame failed--> Error --reinitialize--> Loading
//! ```
//! "Ready" is `Paused`: enough data to play, not advancing.
//!
//! # Timing model
//!
//! `tick(elapsed_ms)` converts wall time to frames:
//! `elapsed * speed / (time_interval * 1000)` into an accumulator. Whole frames
//! advance the playhead, at most `max_frame_skip_per_tick` per tick. When the
//! cap is hit the remainder is dropped (frame skip, no catch-up), so a faster
//! speed is never behind a slower one after the same ticks.
//!
//! # Micro-suspend
//!
//! If the playhead frame is not resident, the last shown frame stays on screen
//! (re-sent once with `loading` set) while the playhead keeps moving. The
//! first resident target is shown; frames skipped meanwhile are never shown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use super::event_bus::{BoxedEvent, EventBus, downcast_event};
use super::fetch::FetchCoordinator;
use super::frame_store::{CacheStatsSnapshot, FrameStore};
use super::player_events::*;
use super::preload::PreloadPlanner;
use crate::config::{ConfigError, PlaybackConfig};
use crate::entities::{
    DataSource, Frame, FrameLoadError, FrameMeta, Metadata, PlaybackError, Priority, Progress, RenderSink, WorkerPool,
};

/// Allowed speed multipliers
pub const SPEED_PRESETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0];

/// Tolerance when matching a requested speed against the presets
const SPEED_EPSILON: f64 = 1e-9;

/// Absorbs float drift when many small ticks add up to a whole frame
const FRAME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackMode {
    /// No dataset
    #[default]
    Idle,
    /// Initial batch in flight
    Loading,
    Paused,
    Playing,
    /// User drives the position, autonomous advance suspended
    Scrubbing,
    /// Terminal for the current dataset, see `Player::reinitialize`
    Error,
}

impl PlaybackMode {
    /// Modes in which a frame is on screen and controls are live
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Paused | Self::Playing | Self::Scrubbing)
    }
}

/// Mutable playback state. Playback is forward-only.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub current_index: usize,
    pub speed: f64,
    pub mode: PlaybackMode,
    /// Fractional progress toward the next advance, in frames
    pub accumulated_time: f64,
    /// Last index handed to the render sink
    pub displayed_index: Option<usize>,
    /// Display target not resident, stale frame on screen
    pub loading: bool,
    pub scrub_target: Option<usize>,
    /// Scrub interrupted playback
    pub was_playing: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_index: 0,
            speed: 1.0,
            mode: PlaybackMode::Idle,
            accumulated_time: 0.0,
            displayed_index: None,
            loading: false,
            scrub_target: None,
            was_playing: false,
        }
    }
}

/// Round a continuous timeline position to the nearest valid index
pub fn snap_to_frame(value: f64, total_frames: usize) -> usize {
    let last = total_frames.saturating_sub(1);
    if value.is_nan() {
        return 0;
    }
    let rounded = value.round();
    if rounded <= 0.0 {
        0
    } else if rounded >= last as f64 {
        last
    } else {
        rounded as usize
    }
}

/// Playback controller for one dataset at a time
pub struct Player {
    config: PlaybackConfig,
    store: FrameStore,
    fetch: FetchCoordinator,
    planner: Option<PreloadPlanner>,
    meta: Option<Metadata>,
    state: PlaybackState,
    sink: Box<dyn RenderSink>,
    events: EventBus,
    /// Frame currently on screen
    shown: Option<Frame>,
    last_error: Option<FrameLoadError>,
    last_progress: Option<Progress>,
    /// Initial batch satisfied (or skipped by play/scrub)
    batch_done: bool,
    /// Background fill held back until the next pump
    fill_deferred: bool,
    /// Wall clock of the previous `update()`
    last_frame_time: Option<Instant>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state)
            .field("store", &self.store.len())
            .field("fetch", &self.fetch)
            .finish_non_exhaustive()
    }
}

impl Player {
    pub fn new(
        config: PlaybackConfig,
        source: Arc<dyn DataSource>,
        sink: Box<dyn RenderSink>,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let fetch = FetchCoordinator::new(source, pool, config.fetch_policy());
        info!("Player created (retries={}, timeout={} ms)", config.max_retries, config.fetch_timeout_ms);
        Ok(Self {
            store: FrameStore::new(config.capacity_frames.unwrap_or(1)),
            fetch,
            planner: None,
            meta: None,
            state: PlaybackState::default(),
            sink,
            events: EventBus::new(),
            shown: None,
            last_error: None,
            last_progress: None,
            batch_done: false,
            fill_deferred: false,
            last_frame_time: None,
            config,
        })
    }

    /// Share an existing bus instead of the player's own
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    // ========== Initialization ==========

    /// Fetch metadata from the source and start loading
    pub fn initialize(&mut self) -> Result<(), PlaybackError> {
        self.require_idle()?;
        let meta = match self.fetch.source().fetch_metadata() {
            Ok(meta) => meta,
            Err(e) => {
                error!("Metadata fetch failed: {}", e);
                self.set_mode(PlaybackMode::Error);
                return Err(PlaybackError::Source(e));
            }
        };
        self.initialize_with_metadata(meta)
    }

    /// `Idle -> Loading`: size the store, issue the initial batch
    pub fn initialize_with_metadata(&mut self, meta: Metadata) -> Result<(), PlaybackError> {
        self.require_idle()?;
        if let Err(e) = meta.validate() {
            error!("Invalid metadata: {}", e);
            self.set_mode(PlaybackMode::Error);
            return Err(e.into());
        }

        let planner = PreloadPlanner::new(&meta, &self.config);
        self.store.clear();
        self.store.set_capacity(self.config.capacity(&meta));
        self.fetch.set_metadata(meta.clone());
        info!(
            "Dataset: {} frames, interval {} s, mesh {}x{}, store capacity {}",
            meta.total_frames(),
            meta.time_interval(),
            meta.mesh().width,
            meta.mesh().height,
            self.store.capacity()
        );

        self.state.current_index = 0;
        self.state.accumulated_time = 0.0;
        self.batch_done = false;
        self.set_mode(PlaybackMode::Loading);
        let issued = planner.ensure_initial_batch(&self.store, &mut self.fetch);
        debug!("Initial batch: {} frame(s) requested", issued.len());
        self.planner = Some(planner);
        self.meta = Some(meta);
        self.report_progress();
        self.pump();
        Ok(())
    }

    /// Drop the dataset and everything derived from it, then initialize again
    pub fn reinitialize(&mut self) -> Result<(), PlaybackError> {
        info!("Reinitializing player");
        self.reset();
        self.initialize()
    }

    /// Back to `Idle`. Late completions of the old dataset are discarded.
    pub fn reset(&mut self) {
        self.fetch.clear();
        self.store.clear();
        self.planner = None;
        self.meta = None;
        self.shown = None;
        self.last_error = None;
        self.last_progress = None;
        self.batch_done = false;
        self.fill_deferred = false;
        self.last_frame_time = None;
        self.state = PlaybackState {
            speed: self.state.speed,
            mode: self.state.mode,
            ..Default::default()
        };
        self.set_mode(PlaybackMode::Idle);
    }

    /// Error for a command issued in `Error` mode
    fn halted(&self) -> PlaybackError {
        match &self.last_error {
            Some(err) => PlaybackError::FrameLoad(err.clone()),
            None => PlaybackError::NotReady("player is in error state"),
        }
    }

    fn require_idle(&self) -> Result<(), PlaybackError> {
        match self.state.mode {
            PlaybackMode::Idle => Ok(()),
            _ => Err(PlaybackError::NotReady("dataset already loaded, reinitialize first")),
        }
    }

    // ========== Frame pipeline ==========

    /// Apply finished fetches and refresh the display. Never blocks.
    pub fn pump(&mut self) {
        if self.meta.is_none() {
            return;
        }
        let protected = self.protected();
        // Cancelled tickets still land frames, so progress is checked even
        // when no outcome is delivered
        let outcomes = self.fetch.drain(&mut self.store, &protected);
        for outcome in outcomes {
            if let Err(err) = outcome.result {
                self.on_load_failed(err);
            }
        }
        self.report_progress();
        self.check_initial_batch();
        self.refresh_display();
        if std::mem::take(&mut self.fill_deferred) {
            self.replan();
        }
    }

    /// Indices eviction must not touch: playhead, screen, scrub target
    fn protected(&self) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        set.insert(self.state.current_index);
        set.extend(self.state.displayed_index);
        set.extend(self.state.scrub_target);
        set
    }

    fn is_required(&self, index: usize) -> bool {
        match self.state.mode {
            PlaybackMode::Loading => self.planner.as_ref().is_some_and(|p| index < p.initial_batch()),
            PlaybackMode::Scrubbing => self.state.scrub_target == Some(index),
            PlaybackMode::Paused | PlaybackMode::Playing => self.state.current_index == index,
            PlaybackMode::Idle | PlaybackMode::Error => false,
        }
    }

    fn on_load_failed(&mut self, err: FrameLoadError) {
        if self.state.mode == PlaybackMode::Error {
            return;
        }
        if !self.is_required(err.index) {
            debug!("Preload of frame {} failed: {}", err.index, err.cause);
            return;
        }
        match self.state.mode {
            PlaybackMode::Playing | PlaybackMode::Loading => self.fail(err),
            _ => {
                warn!("Frame {} unavailable: {}", err.index, err.cause);
                self.sink.on_error(&err);
                self.events.emit(FrameLoadFailedEvent(err.clone()));
                self.last_error = Some(err);
            }
        }
    }

    /// Enter `Error`: stop fetching, surface the failure
    fn fail(&mut self, err: FrameLoadError) {
        error!("Playback halted: {}", err);
        let cancelled = self.fetch.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} outstanding fetch(es)", cancelled);
        }
        self.sink.on_error(&err);
        self.events.emit(FrameLoadFailedEvent(err.clone()));
        self.last_error = Some(err);
        self.last_frame_time = None;
        self.set_mode(PlaybackMode::Error);
    }

    fn check_initial_batch(&mut self) {
        if self.state.mode != PlaybackMode::Loading || self.batch_done {
            return;
        }
        let ready = self
            .planner
            .as_ref()
            .is_some_and(|p| p.initial_batch_ready(&self.store));
        if ready {
            self.batch_done = true;
            self.state.current_index = 0;
            info!("Initial batch resident");
            self.set_mode(PlaybackMode::Paused);
            self.replan();
        }
    }

    /// Keep the window fetched and fresh in the LRU, then fill in the background
    fn replan(&mut self) {
        let Some(planner) = &self.planner else {
            return;
        };
        let speed = self.state.speed;
        let anchor = match self.state.mode {
            PlaybackMode::Paused | PlaybackMode::Playing => self.state.current_index,
            PlaybackMode::Scrubbing => self.state.scrub_target.unwrap_or(self.state.current_index),
            _ => return,
        };

        // Far end first: frames behind the playhead stay the least recent,
        // the playhead the most recent
        for index in planner.fill_range(anchor, speed).rev() {
            self.store.touch(index);
        }
        for index in planner.window(anchor, speed).rev() {
            self.store.touch(index);
        }
        planner.ensure_window(anchor, speed, &self.store, &mut self.fetch);
        if self.batch_done && !self.fill_deferred && self.state.mode != PlaybackMode::Scrubbing {
            planner.ensure_background(anchor, speed, &self.store, &mut self.fetch);
        }
    }

    fn display_target(&self) -> Option<usize> {
        match self.state.mode {
            PlaybackMode::Paused | PlaybackMode::Playing => Some(self.state.current_index),
            PlaybackMode::Scrubbing => self.state.scrub_target.or(Some(self.state.current_index)),
            PlaybackMode::Idle | PlaybackMode::Loading | PlaybackMode::Error => None,
        }
    }

    /// Show the display target if resident, otherwise hold the screen
    fn refresh_display(&mut self) {
        let Some(target) = self.display_target() else {
            return;
        };
        if self.state.displayed_index == Some(target) {
            self.set_loading(false);
            return;
        }

        if let Some(frame) = self.store.get(target) {
            self.show(frame);
            return;
        }

        // A failure recorded while the frame was only preload gets one more
        // ticket now that playback needs it
        if self.state.mode == PlaybackMode::Playing && self.fetch.forget_failure(target) {
            debug!("Retrying frame {} at the playhead", target);
        }
        if !self.fetch.has_failed(target) {
            if let Err(e) = self.fetch.ensure(target, Priority::High, &self.store) {
                warn!("Cannot request frame {}: {}", target, e);
            }
        }
        self.set_loading(true);
    }

    fn show(&mut self, frame: Frame) {
        let index = frame.index();
        trace!("Show frame {} (t={:.3})", index, frame.time());
        self.sink.on_frame_ready(&frame, FrameMeta::default());
        self.state.displayed_index = Some(index);
        self.shown = Some(frame);
        self.events.emit(FrameShownEvent { index, loading: false });
        self.set_loading(false);
    }

    fn set_loading(&mut self, loading: bool) {
        if self.state.loading == loading {
            return;
        }
        self.state.loading = loading;
        if loading {
            debug!("Waiting for frame {:?}", self.display_target());
            if let Some(frame) = &self.shown {
                let meta = FrameMeta {
                    is_interpolated: false,
                    loading: true,
                };
                self.sink.on_frame_ready(frame, meta);
                self.events.emit(FrameShownEvent {
                    index: frame.index(),
                    loading: true,
                });
            }
        }
        self.events.emit(LoadingChangedEvent(loading));
    }

    fn report_progress(&mut self) {
        let Some(meta) = &self.meta else {
            return;
        };
        let progress = Progress {
            loaded_count: self.store.len(),
            total_count: meta.total_frames(),
        };
        if self.last_progress == Some(progress) {
            return;
        }
        self.last_progress = Some(progress);
        self.sink.on_progress(progress);
        self.events.emit(ProgressEvent(progress));
    }

    fn set_mode(&mut self, mode: PlaybackMode) {
        let from = self.state.mode;
        if from == mode {
            return;
        }
        self.state.mode = mode;
        info!("Playback: {:?} -> {:?}", from, mode);
        self.events.emit(StateChangedEvent { from, to: mode });
    }

    // ========== Clock ==========

    /// Advance the playhead by `elapsed_ms` of wall time. Call once per
    /// render cycle; it also drains fetch results in every mode.
    pub fn tick(&mut self, elapsed_ms: f64) {
        self.pump();
        if self.state.mode != PlaybackMode::Playing {
            return;
        }
        let Some(meta) = &self.meta else {
            return;
        };
        let last = meta.last_index();
        let interval_ms = meta.time_interval() * 1000.0;

        let elapsed = if elapsed_ms.is_finite() { elapsed_ms.max(0.0) } else { 0.0 };
        self.state.accumulated_time += elapsed * self.state.speed / interval_ms;

        let due = (self.state.accumulated_time + FRAME_EPSILON).floor();
        let cap = self.config.max_frame_skip_per_tick;
        let steps = if due >= cap as f64 {
            if due > cap as f64 {
                trace!("Frame skip: {} frame(s) due, advancing {}", due, cap);
            }
            self.state.accumulated_time = 0.0;
            cap
        } else {
            self.state.accumulated_time = (self.state.accumulated_time - due).max(0.0);
            due as usize
        };

        if steps > 0 {
            let next = self.state.current_index.saturating_add(steps).min(last);
            trace!("Advance {} -> {}", self.state.current_index, next);
            self.state.current_index = next;
        }
        if self.state.current_index >= last {
            info!("Reached last frame {}", last);
            self.state.accumulated_time = 0.0;
            self.last_frame_time = None;
            self.set_mode(PlaybackMode::Paused);
        }

        self.replan();
        self.refresh_display();
    }

    /// Host-loop helper: measure wall time since the previous call and tick
    pub fn update(&mut self) {
        let now = Instant::now();
        let elapsed_ms = match self.last_frame_time {
            Some(last) if self.state.mode == PlaybackMode::Playing => {
                now.duration_since(last).as_secs_f64() * 1000.0
            }
            _ => 0.0,
        };
        self.last_frame_time = Some(now);
        self.tick(elapsed_ms);
    }

    // ========== Transport ==========

    /// `Paused -> Playing`. From `Loading` only once frame 0 is resident.
    pub fn play(&mut self) -> Result<(), PlaybackError> {
        match self.state.mode {
            PlaybackMode::Playing => return Ok(()),
            PlaybackMode::Paused => {}
            PlaybackMode::Loading if self.store.has(0) => {
                self.batch_done = true;
                self.state.current_index = 0;
            }
            PlaybackMode::Loading => return Err(PlaybackError::NotReady("initial frames still loading")),
            PlaybackMode::Idle => return Err(PlaybackError::NotReady("no dataset loaded")),
            PlaybackMode::Scrubbing => return Err(PlaybackError::NotReady("scrub in progress")),
            PlaybackMode::Error => return Err(self.halted()),
        }
        self.fetch.clear_failures();
        self.last_frame_time = Some(Instant::now());
        self.set_mode(PlaybackMode::Playing);
        self.replan();
        self.refresh_display();
        Ok(())
    }

    /// `Playing -> Paused`, the shown frame stays. No-op otherwise.
    pub fn pause(&mut self) {
        if self.state.mode == PlaybackMode::Playing {
            self.last_frame_time = None;
            self.set_mode(PlaybackMode::Paused);
        }
    }

    pub fn toggle_play_pause(&mut self) -> Result<(), PlaybackError> {
        if self.state.mode == PlaybackMode::Playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    /// Pause and rewind to the first frame
    pub fn stop(&mut self) -> Result<(), PlaybackError> {
        match self.state.mode {
            PlaybackMode::Idle => return Err(PlaybackError::NotReady("no dataset loaded")),
            PlaybackMode::Error => return Err(self.halted()),
            PlaybackMode::Loading => return Ok(()),
            _ => {}
        }
        self.pause();
        self.scrub(0)?;
        self.state.was_playing = false;
        self.release_scrub()
    }

    /// Move `count` frames (negative = back), leaving playback paused
    pub fn step(&mut self, count: i64) -> Result<usize, PlaybackError> {
        match self.state.mode {
            PlaybackMode::Paused | PlaybackMode::Playing => {}
            PlaybackMode::Loading => return Err(PlaybackError::NotReady("initial frames still loading")),
            PlaybackMode::Idle => return Err(PlaybackError::NotReady("no dataset loaded")),
            PlaybackMode::Scrubbing => return Err(PlaybackError::NotReady("scrub in progress")),
            PlaybackMode::Error => return Err(self.halted()),
        }
        self.pause();
        let target = (self.state.current_index as i64).saturating_add(count);
        self.scrub(target)?;
        self.state.was_playing = false;
        self.release_scrub()?;
        Ok(self.state.current_index)
    }

    // ========== Speed ==========

    /// Takes effect on the next tick
    pub fn set_speed(&mut self, multiplier: f64) -> Result<(), PlaybackError> {
        let Some(&speed) = SPEED_PRESETS.iter().find(|p| (*p - multiplier).abs() < SPEED_EPSILON) else {
            return Err(PlaybackError::InvalidSpeed(multiplier));
        };
        if speed != self.state.speed {
            self.state.speed = speed;
            info!("Speed {}x", speed);
            self.events.emit(SpeedChangedEvent(speed));
            self.replan();
        }
        Ok(())
    }

    /// Next faster preset. Returns the resulting speed.
    pub fn increase_speed(&mut self) -> f64 {
        let current = self.state.speed;
        if let Some(&next) = SPEED_PRESETS.iter().find(|&&s| s > current + SPEED_EPSILON) {
            let _ = self.set_speed(next);
        }
        self.state.speed
    }

    /// Next slower preset. Returns the resulting speed.
    pub fn decrease_speed(&mut self) -> f64 {
        let current = self.state.speed;
        if let Some(&prev) = SPEED_PRESETS.iter().rev().find(|&&s| s < current - SPEED_EPSILON) {
            let _ = self.set_speed(prev);
        }
        self.state.speed
    }

    // ========== Scrubbing ==========

    /// Jump the preview to `target` (clamped). Pauses playback first.
    pub fn scrub(&mut self, target: i64) -> Result<usize, PlaybackError> {
        self.scrub_at(target, target as f64)
    }

    /// Scrub to a continuous timeline position, snapped to a frame
    pub fn scrub_to(&mut self, position: f64) -> Result<usize, PlaybackError> {
        let index = self.snap_to_frame(position);
        self.scrub_at(index as i64, position)
    }

    fn scrub_at(&mut self, target: i64, position: f64) -> Result<usize, PlaybackError> {
        match self.state.mode {
            PlaybackMode::Idle => return Err(PlaybackError::NotReady("no dataset loaded")),
            PlaybackMode::Error => return Err(self.halted()),
            _ => {}
        }
        let Some(meta) = &self.meta else {
            return Err(PlaybackError::NotReady("no dataset loaded"));
        };
        let index = meta.clamp_index(target);

        if self.state.mode != PlaybackMode::Scrubbing {
            self.state.was_playing = self.state.mode == PlaybackMode::Playing;
            self.pause();
            self.set_mode(PlaybackMode::Scrubbing);
        }
        self.events.emit(ScrubPositionChangedEvent(position));
        trace!("Scrub to {} ({:.2})", index, position);

        self.state.scrub_target = Some(index);
        self.fetch.clear_failures();
        if let Some(planner) = &self.planner {
            planner.rewindow(index, self.state.speed, &self.store, &mut self.fetch);
        }
        self.refresh_display();
        Ok(index)
    }

    /// `Scrubbing -> Paused` at the scrub target
    pub fn release_scrub(&mut self) -> Result<(), PlaybackError> {
        if self.state.mode != PlaybackMode::Scrubbing {
            return Err(PlaybackError::NotReady("not scrubbing"));
        }
        let target = self.state.scrub_target.take().unwrap_or(self.state.current_index);
        self.state.current_index = target;
        self.state.accumulated_time = 0.0;
        self.batch_done = true;
        self.set_mode(PlaybackMode::Paused);
        self.fill_deferred = true;
        debug!("Scrub released at {}", target);

        if let Some(planner) = &self.planner {
            planner.rewindow(target, self.state.speed, &self.store, &mut self.fetch);
        }
        self.replan();
        self.refresh_display();

        if std::mem::take(&mut self.state.was_playing) && self.config.resume_after_scrub {
            self.play()?;
        }
        Ok(())
    }

    /// Nearest valid index for a continuous position (0 without a dataset)
    pub fn snap_to_frame(&self, value: f64) -> usize {
        self.meta
            .as_ref()
            .map(|m| snap_to_frame(value, m.total_frames()))
            .unwrap_or(0)
    }

    // ========== Export ==========

    /// Hand the frame on screen to the sink's capture hook
    pub fn export_current(&mut self) -> anyhow::Result<()> {
        let Some(frame) = self.shown.clone() else {
            anyhow::bail!("no frame shown yet");
        };
        self.sink
            .capture(&frame)
            .with_context(|| format!("Failed to export frame {}", frame.index()))?;
        info!("Exported frame {}", frame.index());
        Ok(())
    }

    // ========== Commands ==========

    /// Apply a command event from the bus. Returns false if `event` is not a
    /// player command. Command errors are logged, not returned.
    pub fn handle_event(&mut self, event: &BoxedEvent) -> bool {
        let result = if downcast_event::<PlayEvent>(event).is_some() {
            self.play()
        } else if downcast_event::<PauseEvent>(event).is_some() {
            self.pause();
            Ok(())
        } else if downcast_event::<TogglePlayPauseEvent>(event).is_some() {
            self.toggle_play_pause()
        } else if downcast_event::<StopEvent>(event).is_some() {
            self.stop()
        } else if let Some(e) = downcast_event::<SetSpeedEvent>(event) {
            self.set_speed(e.0)
        } else if downcast_event::<IncreaseSpeedEvent>(event).is_some() {
            self.increase_speed();
            Ok(())
        } else if downcast_event::<DecreaseSpeedEvent>(event).is_some() {
            self.decrease_speed();
            Ok(())
        } else if let Some(e) = downcast_event::<ScrubEvent>(event) {
            self.scrub_to(e.0).map(|_| ())
        } else if downcast_event::<ReleaseScrubEvent>(event).is_some() {
            self.release_scrub()
        } else if let Some(e) = downcast_event::<StepEvent>(event) {
            self.step(e.0).map(|_| ())
        } else if downcast_event::<ExportFrameEvent>(event).is_some() {
            if let Err(e) = self.export_current() {
                warn!("Export failed: {:#}", e);
            }
            Ok(())
        } else if downcast_event::<ReinitializeEvent>(event).is_some() {
            self.reinitialize()
        } else {
            return false;
        };

        if let Err(e) = result {
            warn!("{} rejected: {}", (**event).type_name(), e);
        }
        true
    }

    // ========== Accessors ==========

    pub fn mode(&self) -> PlaybackMode {
        self.state.mode
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn displayed_index(&self) -> Option<usize> {
        self.state.displayed_index
    }

    pub fn speed(&self) -> f64 {
        self.state.speed
    }

    pub fn is_loading(&self) -> bool {
        self.state.loading
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.meta.as_ref()
    }

    /// Simulation time of the playhead, in seconds
    pub fn current_time(&self) -> f64 {
        match (&self.shown, &self.meta) {
            (Some(frame), _) if frame.index() == self.state.current_index => frame.time(),
            (_, Some(meta)) => meta.time_of(self.state.current_index),
            _ => 0.0,
        }
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.store.stats()
    }

    pub fn last_error(&self) -> Option<&FrameLoadError> {
        self.last_error.as_ref()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    pub fn fetch(&self) -> &FetchCoordinator {
        &self.fetch
    }

    pub fn planner(&self) -> Option<&PreloadPlanner> {
        self.planner.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
