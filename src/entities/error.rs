//! Error taxonomy for the playback engine
//!
//! - `MetadataError`: bad dataset description, fatal at init
//! - `FetchError`: one failed fetch attempt (retried by the coordinator)
//! - `FrameLoadError`: terminal failure after retries are exhausted
//! - `PlaybackError`: caller-usage errors, state is left unchanged

use thiserror::Error;

/// Invalid dataset description or a frame that does not fit it
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetadataError {
    #[error("dataset has no frames")]
    NoFrames,
    #[error("time interval must be positive, got {0}")]
    TimeInterval(f64),
    #[error("frame index {index} outside dataset of {total} frames")]
    FrameIndex { index: usize, total: usize },
    #[error("requested frame {requested}, source returned frame {actual}")]
    IndexMismatch { requested: usize, actual: usize },
    #[error("frame {index} has {actual} values, mesh has {expected} nodes")]
    NodeCount { index: usize, expected: usize, actual: usize },
}

/// Failure of a single fetch attempt or of handle delivery
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame index {index} out of range (total {total})")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("fetch timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid frame from source: {0}")]
    InvalidFrame(#[from] MetadataError),
    /// Ticket was cancelled before it resolved; no result is delivered
    #[error("fetch cancelled")]
    Cancelled,
    /// Worker went away without reporting
    #[error("fetch worker disconnected")]
    Disconnected,
}

impl FetchError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Cancelled | FetchError::Disconnected)
    }
}

/// Terminal frame load failure, wraps the last attempt's cause
#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to load frame {index} after {attempts} attempt(s): {cause}")]
pub struct FrameLoadError {
    pub index: usize,
    pub attempts: u32,
    #[source]
    pub cause: FetchError,
}

/// Errors returned synchronously by the playback controller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    #[error("speed {0} is not one of the allowed multipliers")]
    InvalidSpeed(f64),
    #[error("player not ready: {0}")]
    NotReady(&'static str),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
    #[error("metadata fetch failed: {0}")]
    Source(FetchError),
    #[error(transparent)]
    FrameLoad(#[from] FrameLoadError),
}
