//! Core engine modules - store, fetch, preload, player, workers
//!
//! These modules form the playback engine, independent of any UI.

pub mod event_bus;
pub mod fetch;
pub mod frame_store;
pub mod player;
pub mod player_events;
pub mod preload;
pub mod testing;
pub mod workers;

pub use event_bus::{BoxedEvent, EventBus, EventEmitter, downcast_event};
pub use fetch::{FetchCoordinator, FetchHandle, FetchOutcome, FetchPolicy, FetchResult};
pub use frame_store::{CacheStats, CacheStatsSnapshot, FrameStore};
pub use player::{PlaybackMode, PlaybackState, Player, SPEED_PRESETS, snap_to_frame};
pub use preload::PreloadPlanner;
pub use workers::Workers;
