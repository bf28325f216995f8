//! GRIDPLAY - frame cache and playback controller for simulated heat grids
//!
//! Re-exports all modules for use by the binary target and embedders.

// Core engine (store, fetch, preload, player, workers)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod shell;

pub use core::event_bus::{BoxedEvent, EventBus, EventEmitter, downcast_event};
pub use core::player::{PlaybackMode, Player};
pub use core::workers::Workers;

pub use config::PlaybackConfig;
pub use entities::{DataSource, Frame, FrameLoadError, Metadata, PlaybackError, RenderSink};
