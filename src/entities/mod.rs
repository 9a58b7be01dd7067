//! Entities - passive data shared by the workflows
//!
//! Clips and their placements on tracks, frame buffers and output formats.

pub mod clip;
pub mod frame;

pub use clip::{Clip, ClipHelper, ClipPlacement, JsonPlacementWriter, PlacementSink};
pub use frame::{FrameBuffer, OutputFormat, TrackType};
