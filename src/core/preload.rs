//! Preload planner - decides which frames should be resident.
//!
//! Forward-only strategy (playback never runs backwards):
//! ```text
//!   keep:    [cur-1 ............................. cur+ceil(K*speed)]
//!   window:       [cur ........................... cur+ceil(K*speed)]
//!   background:                                                     [end+1 ...]
//! ```
//! - Window frames are fetched at high priority; faster playback widens it.
//! - Background fill runs at low priority and never takes more store slots
//!   than the window leaves free, so it cannot evict window frames.
//! - Frames behind the playhead are not evicted here. They stop being touched
//!   and the store's LRU drops them.

use std::ops::{Range, RangeInclusive};

use log::{debug, trace};

use super::fetch::FetchCoordinator;
use super::frame_store::FrameStore;
use crate::config::PlaybackConfig;
use crate::entities::{Metadata, Priority};

#[derive(Debug, Clone)]
pub struct PreloadPlanner {
    total_frames: usize,
    look_ahead: usize,
    initial_batch: usize,
    background_batch: usize,
    capacity: usize,
}

impl PreloadPlanner {
    pub fn new(meta: &Metadata, config: &PlaybackConfig) -> Self {
        let capacity = config.capacity(meta);
        let planner = Self {
            total_frames: meta.total_frames(),
            look_ahead: config.look_ahead(meta),
            // A batch larger than the store could never be fully resident
            initial_batch: config.initial_batch(meta).min(capacity),
            background_batch: config.background_batch,
            capacity,
        };
        debug!(
            "PreloadPlanner: total={}, K={}, batch={}, capacity={}",
            planner.total_frames, planner.look_ahead, planner.initial_batch, planner.capacity
        );
        planner
    }

    pub fn look_ahead(&self) -> usize {
        self.look_ahead
    }

    pub fn initial_batch(&self) -> usize {
        self.initial_batch
    }

    fn last(&self) -> usize {
        self.total_frames.saturating_sub(1)
    }

    /// Frames to keep resident ahead of `current`: `[cur, cur + ceil(K * speed)]`
    pub fn window(&self, current: usize, speed: f64) -> RangeInclusive<usize> {
        let current = current.min(self.last());
        let span = (self.look_ahead as f64 * speed.max(0.0)).ceil() as usize;
        current..=current.saturating_add(span).min(self.last())
    }

    /// Window plus the frame just behind the playhead
    pub fn keep_range(&self, current: usize, speed: f64) -> RangeInclusive<usize> {
        let window = self.window(current, speed);
        window.start().saturating_sub(1)..=*window.end()
    }

    /// Window frames that are not resident, nearest first
    pub fn plan_window(&self, current: usize, speed: f64, store: &FrameStore) -> Vec<usize> {
        self.window(current, speed).filter(|i| !store.has(*i)).collect()
    }

    /// First `batch_size` frames (fetch order), clamped to the dataset
    pub fn plan_initial_batch(&self, batch_size: usize) -> Vec<usize> {
        (0..batch_size.min(self.total_frames)).collect()
    }

    /// True once every initial batch frame is resident
    pub fn initial_batch_ready(&self, store: &FrameStore) -> bool {
        self.plan_initial_batch(self.initial_batch).into_iter().all(|i| store.has(i))
    }

    /// Frames right after the window that fit in the slots the window leaves
    pub fn fill_range(&self, current: usize, speed: f64) -> Range<usize> {
        let window = self.window(current, speed);
        let window_len = window.end() - window.start() + 1;
        let after = (window.end() + 1).min(self.total_frames);
        let slots = self.capacity.saturating_sub(window_len);
        after..after.saturating_add(slots).min(self.total_frames)
    }

    /// Up to `background_batch` frames after the window worth fetching now.
    ///
    /// Budget: slots left after the window, minus frames already resident or
    /// pending after the window.
    pub fn plan_background(&self, current: usize, speed: f64, store: &FrameStore, coord: &FetchCoordinator) -> Vec<usize> {
        let fill = self.fill_range(current, speed);
        if fill.is_empty() || self.background_batch == 0 {
            return Vec::new();
        }

        let used = fill.clone().filter(|i| store.has(*i) || coord.is_pending(*i)).count();
        let budget = fill.len().saturating_sub(used).min(self.background_batch);
        if budget == 0 {
            return Vec::new();
        }

        fill
            .filter(|i| !store.has(*i) && !coord.is_pending(*i) && !coord.has_failed(*i))
            .take(budget)
            .collect()
    }

    /// Issue fetches for the initial batch. Returns indices requested.
    pub fn ensure_initial_batch(&self, store: &FrameStore, coord: &mut FetchCoordinator) -> Vec<usize> {
        let indices = self.plan_initial_batch(self.initial_batch);
        self.issue(indices, Priority::High, store, coord)
    }

    /// Issue fetches for missing window frames
    pub fn ensure_window(&self, current: usize, speed: f64, store: &FrameStore, coord: &mut FetchCoordinator) -> Vec<usize> {
        let missing = self.plan_window(current, speed, store);
        self.issue(missing, Priority::High, store, coord)
    }

    /// Issue low-priority fetches beyond the window
    pub fn ensure_background(&self, current: usize, speed: f64, store: &FrameStore, coord: &mut FetchCoordinator) -> Vec<usize> {
        let indices = self.plan_background(current, speed, store, coord);
        self.issue(indices, Priority::Low, store, coord)
    }

    /// Seek: drop preload intent far from `target` and plan around it
    pub fn rewindow(&self, target: usize, speed: f64, store: &FrameStore, coord: &mut FetchCoordinator) -> Vec<usize> {
        let keep = self.keep_range(target, speed);
        let cancelled = coord.cancel_outside(&keep);
        if !cancelled.is_empty() {
            trace!("Rewindow to {}: cancelled {:?}", target, cancelled);
        }
        self.ensure_window(target, speed, store, coord)
    }

    fn issue(&self, indices: Vec<usize>, priority: Priority, store: &FrameStore, coord: &mut FetchCoordinator) -> Vec<usize> {
        let mut issued = Vec::with_capacity(indices.len());
        for index in indices {
            if coord.has_failed(index) {
                continue;
            }
            // Pending tickets still go through `ensure` so they can be promoted
            let pending = coord.is_pending(index);
            match coord.ensure(index, priority, store) {
                Ok(false) if pending => {}
                Ok(false) => issued.push(index),
                Ok(true) => {}
                Err(e) => debug!("Preload skipped frame {}: {}", index, e),
            }
        }
        issued
    }
}
