//! Player and playback events.
//!
//! Notifications are emitted by the player on its event bus. Commands are
//! emitted by UI glue and applied with `Player::handle_event`.

use super::player::PlaybackMode;
use crate::entities::{FrameLoadError, Progress};

// === Notifications ===

#[derive(Clone, Debug, PartialEq)]
pub struct StateChangedEvent {
    pub from: PlaybackMode,
    pub to: PlaybackMode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpeedChangedEvent(pub f64);

/// Continuous scrubber position as requested by the user
#[derive(Clone, Debug, PartialEq)]
pub struct ScrubPositionChangedEvent(pub f64);

#[derive(Clone, Debug, PartialEq)]
pub struct FrameShownEvent {
    pub index: usize,
    pub loading: bool,
}

/// Playhead target not resident (true) / resident again (false)
#[derive(Clone, Debug, PartialEq)]
pub struct LoadingChangedEvent(pub bool);

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent(pub Progress);

#[derive(Clone, Debug, PartialEq)]
pub struct FrameLoadFailedEvent(pub FrameLoadError);

// === Commands ===

#[derive(Clone, Debug)]
pub struct PlayEvent;

#[derive(Clone, Debug)]
pub struct PauseEvent;

#[derive(Clone, Debug)]
pub struct TogglePlayPauseEvent;

/// Pause and rewind to the first frame
#[derive(Clone, Debug)]
pub struct StopEvent;

#[derive(Clone, Debug)]
pub struct SetSpeedEvent(pub f64);

#[derive(Clone, Debug)]
pub struct IncreaseSpeedEvent;

#[derive(Clone, Debug)]
pub struct DecreaseSpeedEvent;

/// Drag the scrubber to a continuous timeline position (frame units)
#[derive(Clone, Debug)]
pub struct ScrubEvent(pub f64);

#[derive(Clone, Debug)]
pub struct ReleaseScrubEvent;

/// Step N frames (negative = back)
#[derive(Clone, Debug)]
pub struct StepEvent(pub i64);

#[derive(Clone, Debug)]
pub struct ExportFrameEvent;

/// Retry after a terminal error
#[derive(Clone, Debug)]
pub struct ReinitializeEvent;
