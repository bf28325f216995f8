//! Frame and dataset metadata
//!
//! A `Frame` is one time step of the scalar field: index, simulated time and
//! the flat node values. `Metadata` describes the whole series and is fixed
//! once the dataset is opened.
//!
//! Both are validated at construction so the rest of the engine never sees a
//! negative interval or an empty dataset.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::MetadataError;

/// Min/max of a scalar field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempRange {
    pub min: f64,
    pub max: f64,
}

impl TempRange {
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max { Self { min, max } } else { Self { min: max, max: min } }
    }

    /// Range spanned by `values`, None for empty or all-NaN input
    pub fn of(values: &[f64]) -> Option<Self> {
        let mut iter = values.iter().copied().filter(|v| !v.is_nan());
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(Self { min, max })
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Mesh node layout of every frame in the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDimensions {
    pub width: usize,
    pub height: usize,
}

impl MeshDimensions {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Number of mesh nodes (length of `Frame::values`)
    pub fn node_count(&self) -> usize {
        self.width * self.height
    }
}

/// Immutable one-step snapshot of the scalar field.
///
/// Values are shared behind an `Arc`, so cloning a frame is cheap and a frame
/// lent to a render sink stays valid after the store evicts it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: usize,
    time: f64,
    values: Arc<[f64]>,
    temp_range: Option<TempRange>,
}

impl Frame {
    pub fn new(index: usize, time: f64, values: Vec<f64>) -> Self {
        Self {
            index,
            time,
            values: values.into(),
            temp_range: None,
        }
    }

    pub fn with_temp_range(mut self, range: TempRange) -> Self {
        self.temp_range = Some(range);
        self
    }

    /// Validate a frame delivered by a data source for `requested`
    pub fn checked(self, requested: usize, meta: &Metadata) -> Result<Self, MetadataError> {
        if self.index != requested {
            return Err(MetadataError::IndexMismatch {
                requested,
                actual: self.index,
            });
        }
        if self.index >= meta.total_frames() {
            return Err(MetadataError::FrameIndex {
                index: self.index,
                total: meta.total_frames(),
            });
        }
        let expected = meta.mesh().node_count();
        if expected != 0 && self.values.len() != expected {
            return Err(MetadataError::NodeCount {
                index: self.index,
                expected,
                actual: self.values.len(),
            });
        }
        Ok(self)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Simulated time in seconds
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Owned copy of the node values (for sinks that retain data)
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    pub fn temp_range(&self) -> Option<TempRange> {
        self.temp_range
    }

    /// Payload size in bytes
    pub fn mem(&self) -> usize {
        self.values.len() * std::mem::size_of::<f64>()
    }
}

/// Dataset description, established once per dataset.
///
/// **Invariant**: `total_frames > 0` and `time_interval > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    total_frames: usize,
    time_interval: f64,
    mesh: MeshDimensions,
    global_temp_range: Option<TempRange>,
}

impl Metadata {
    pub fn new(
        total_frames: usize,
        time_interval: f64,
        mesh: MeshDimensions,
        global_temp_range: Option<TempRange>,
    ) -> Result<Self, MetadataError> {
        let meta = Self {
            total_frames,
            time_interval,
            mesh,
            global_temp_range,
        };
        meta.validate()?;
        Ok(meta)
    }

    /// Re-check invariants (used for deserialized metadata)
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.total_frames == 0 {
            return Err(MetadataError::NoFrames);
        }
        if !(self.time_interval.is_finite() && self.time_interval > 0.0) {
            return Err(MetadataError::TimeInterval(self.time_interval));
        }
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Seconds between consecutive frames
    pub fn time_interval(&self) -> f64 {
        self.time_interval
    }

    pub fn mesh(&self) -> MeshDimensions {
        self.mesh
    }

    pub fn global_temp_range(&self) -> Option<TempRange> {
        self.global_temp_range
    }

    pub fn last_index(&self) -> usize {
        self.total_frames - 1
    }

    pub fn total_duration(&self) -> f64 {
        self.time_interval * (self.total_frames - 1) as f64
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.total_frames
    }

    /// Simulated time of a frame index
    pub fn time_of(&self, index: usize) -> f64 {
        self.time_interval * index as f64
    }

    pub fn clamp_index(&self, index: i64) -> usize {
        index.clamp(0, self.last_index() as i64) as usize
    }
}
