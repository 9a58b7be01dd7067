//! Error types for the timeline playback core
//!
//! Decode-layer failures never cross `ClipWorkflow::get_output`: they are absorbed
//! into the clip's `Error` state. The variants below are what backends, mutators
//! and configuration helpers hand back to their direct callers.

use thiserror::Error;

use crate::core::clip_state::ClipState;

#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Decoder could not open or bind the source
    #[error("Decoder init failed: {0}")]
    DecodeInit(String),

    /// Mid-stream decoder failure
    #[error("Decode error: {0}")]
    DecodeRuntime(String),

    /// More than one clip interval matched the same frame
    #[error("Scheduling fault at frame {frame}: {detail}")]
    SchedulingFault { frame: i64, detail: String },

    /// Pool underrun that did not resolve within the render timeout
    #[error("Buffer exhaustion: {0}")]
    BufferExhaustion(String),

    /// Mutation referencing an unknown clip, an occupied start, etc.
    #[error("Structural misuse: {0}")]
    StructuralMisuse(String),

    #[error("Invalid clip state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ClipState, to: ClipState },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
