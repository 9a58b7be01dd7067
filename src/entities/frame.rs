//! Raw frame buffers exchanged between decoders and track workflows
//!
//! **Why**: Decoders write into fixed-size blocks owned by a clip's buffer pool.
//! Video blocks hold packed pixels (RGB24 by default), audio blocks hold one
//! timeline frame worth of interleaved s16le samples.
//!
//! **Used by**: BufferPool (storage), decoder backends (fill), TrackWorkflow (output)
//!
//! # Fallback output
//!
//! When no clip is active the track hands out black (video) or silence (audio).
//! For the default project format these are process-wide immutable buffers,
//! created on first use and shared by every track.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::WorkflowSettings;

/// Kind of media a track (and every clip workflow on it) renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Video,
    Audio,
}

/// Fixed output format of a track, read once from the project settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OutputFormat {
    Video {
        width: u32,
        height: u32,
        /// Bytes per pixel
        pixel_size: u32,
        fps: f64,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        fps: f64,
    },
}

impl OutputFormat {
    /// Format derived from default settings
    pub fn default_for(kind: TrackType) -> Self {
        WorkflowSettings::default().output_format(kind)
    }

    pub fn kind(&self) -> TrackType {
        match self {
            OutputFormat::Video { .. } => TrackType::Video,
            OutputFormat::Audio { .. } => TrackType::Audio,
        }
    }

    pub fn fps(&self) -> f64 {
        match *self {
            OutputFormat::Video { fps, .. } | OutputFormat::Audio { fps, .. } => fps,
        }
    }

    /// Samples per channel in one timeline frame (0 for video)
    pub fn samples_per_frame(&self) -> usize {
        match *self {
            OutputFormat::Video { .. } => 0,
            OutputFormat::Audio { sample_rate, fps, .. } => {
                if fps <= 0.0 {
                    0
                } else {
                    (sample_rate as f64 / fps).round() as usize
                }
            }
        }
    }

    /// Size in bytes of one buffer in this format
    pub fn buffer_size(&self) -> usize {
        match *self {
            OutputFormat::Video {
                width,
                height,
                pixel_size,
                ..
            } => width as usize * height as usize * pixel_size as usize,
            // s16le interleaved
            OutputFormat::Audio { channels, .. } => self.samples_per_frame() * channels as usize * 2,
        }
    }
}

/// One decoded frame (video) or one frame-length block of samples (audio).
///
/// `pts` is the presentation timestamp in milliseconds reported by the decoder,
/// `pts_diff` the delta to the previous frame of the same decode run
/// (0 for the first frame after a flush).
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    format: OutputFormat,
    data: Vec<u8>,
    pts: i64,
    pts_diff: i64,
}

impl FrameBuffer {
    /// Zero-filled buffer (black for RGB, silence for s16le)
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            data: vec![0u8; format.buffer_size()],
            pts: 0,
            pts_diff: 0,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn kind(&self) -> TrackType {
        self.format.kind()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn pts_diff(&self) -> i64 {
        self.pts_diff
    }

    pub(crate) fn set_timing(&mut self, pts: i64, pts_diff: i64) {
        self.pts = pts;
        self.pts_diff = pts_diff;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        self.data.capacity()
    }
}

static BLACK_FRAME: Lazy<Arc<FrameBuffer>> =
    Lazy::new(|| Arc::new(FrameBuffer::new(OutputFormat::default_for(TrackType::Video))));

static SILENCE: Lazy<Arc<FrameBuffer>> =
    Lazy::new(|| Arc::new(FrameBuffer::new(OutputFormat::default_for(TrackType::Audio))));

/// Shared black frame in the default video format
pub fn black_output() -> Arc<FrameBuffer> {
    Arc::clone(&BLACK_FRAME)
}

/// Shared silent block in the default audio format
pub fn silent_output() -> Arc<FrameBuffer> {
    Arc::clone(&SILENCE)
}

/// Fallback buffer for a track format.
///
/// Default formats reuse the process-wide constants; any other format gets its
/// own zeroed buffer, which the caller is expected to keep for its lifetime.
pub fn fallback_output(format: &OutputFormat) -> Arc<FrameBuffer> {
    if *format == BLACK_FRAME.format() {
        black_output()
    } else if *format == SILENCE.format() {
        silent_output()
    } else {
        Arc::new(FrameBuffer::new(*format))
    }
}
