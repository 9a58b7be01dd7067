//! trackflow - timeline playback core
//!
//! Per-clip decode sessions feeding pooled frame buffers, scheduled per track
//! and conducted per timeline frame.

// Playback engine (buffer pool, clip/track/main workflows, events)
pub mod core;

pub mod config;
pub mod decoder;
pub mod entities;
pub mod error;
pub mod utils;

// Re-export commonly used types from core
pub use core::clip_state::ClipState;
pub use core::clip_workflow::{ClipOutput, ClipWorkflow, FrameSink, FrameSlot, GetMode};
pub use core::event_bus::{BoxedEvent, EventBus, EventEmitter, downcast_event};
pub use core::main_workflow::{MainWorkflow, TimelineOutput};
pub use core::stacked_buffer::{BufferPool, PoolStats, StackedBuffer};
pub use core::track_workflow::{OutputSource, TrackOutput, TrackWorkflow};
pub use core::workflow_events::TrackEndReached;

pub use config::WorkflowSettings;
pub use decoder::{DecoderBackend, DecoderFactory, DefaultDecoderFactory};
pub use entities::{Clip, ClipHelper, ClipPlacement, FrameBuffer, OutputFormat, TrackType};
pub use error::{Result, WorkflowError};
