//! Entities - dataset types, errors and collaborator seams

pub mod error;
pub mod frame;
pub mod traits;

pub use error::{FetchError, FrameLoadError, MetadataError, PlaybackError};
pub use frame::{Frame, MeshDimensions, Metadata, TempRange};
pub use traits::{DataSource, FrameMeta, Job, NullSink, Priority, Progress, RenderSink, WorkerPool};
