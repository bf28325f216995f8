//! Seams to external collaborators.
//!
//! The engine only knows these traits: where frames come from (`DataSource`),
//! where they go (`RenderSink`) and what runs background fetches (`WorkerPool`).
//! Implementations live in `core/` (workers) or in the embedding application.

use std::sync::Arc;

use super::error::{FetchError, FrameLoadError};
use super::frame::{Frame, Metadata};

/// Producer of the precomputed time series (simulation output, file, server).
///
/// Called from worker threads, so it must be `Send + Sync`.
pub trait DataSource: Send + Sync {
    /// Describe the dataset. Called once per initialization.
    fn fetch_metadata(&self) -> Result<Metadata, FetchError>;

    /// Produce one frame. Fails with `SourceUnavailable` or `IndexOutOfRange`.
    fn fetch_frame(&self, index: usize) -> Result<Frame, FetchError>;
}

impl<T: DataSource + ?Sized> DataSource for Arc<T> {
    fn fetch_metadata(&self) -> Result<Metadata, FetchError> {
        (**self).fetch_metadata()
    }

    fn fetch_frame(&self, index: usize) -> Result<Frame, FetchError> {
        (**self).fetch_frame(index)
    }
}

/// Display hints passed with every shown frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    /// Always false: frames are shown as stored, never blended
    pub is_interpolated: bool,
    /// Playhead target is not resident yet, the shown frame is stale
    pub loading: bool,
}

/// Load progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub loaded_count: usize,
    pub total_count: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.loaded_count as f64 / self.total_count as f64
        }
    }
}

/// Surface that paints frames.
///
/// `frame` is only borrowed for the call; clone it (cheap) or copy the values
/// out to keep them past the current event.
pub trait RenderSink {
    fn on_frame_ready(&mut self, frame: &Frame, meta: FrameMeta);

    fn on_progress(&mut self, progress: Progress);

    fn on_error(&mut self, error: &FrameLoadError);

    /// Export hook: write the given frame out (image, file, clipboard).
    fn capture(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let _ = frame;
        anyhow::bail!("render sink does not support capture")
    }
}

/// Sink that drops everything (headless runs, tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn on_frame_ready(&mut self, _frame: &Frame, _meta: FrameMeta) {}
    fn on_progress(&mut self, _progress: Progress) {}
    fn on_error(&mut self, _error: &FrameLoadError) {}
}

/// Scheduling lane for background jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Playhead, scrub target, initial batch
    High,
    /// Background fill beyond the preload window
    Low,
}

/// Job executed by a worker pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Abstract worker pool interface.
///
/// Lets the fetch coordinator schedule blocking source calls without knowing
/// the concrete thread pool (or a deterministic test executor).
pub trait WorkerPool: Send + Sync {
    fn execute(&self, priority: Priority, job: Job);
}

impl<T: WorkerPool + ?Sized> WorkerPool for Arc<T> {
    fn execute(&self, priority: Priority, job: Job) {
        (**self).execute(priority, job)
    }
}
