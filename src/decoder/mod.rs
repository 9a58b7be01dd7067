//! Decoder backend contract
//!
//! **Why**: The playback core never talks to a media library directly. A
//! backend is opened on a source, bound to the clip's [`FrameSink`], and then
//! pushes frames from its own thread: lock a slot, fill it, commit it.
//! A full pool blocks the backend in `lock` (backpressure).
//!
//! **Used by**: ClipWorkflow (one backend per decode session)
//!
//! Backends are created per session through a [`DecoderFactory`], so a
//! stopped clip can be re-initialized with a fresh decoder.

pub mod pattern;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crate::core::clip_workflow::FrameSink;
use crate::entities::clip::Clip;
use crate::entities::frame::{OutputFormat, TrackType};
use crate::error::Result;

/// Output configuration handed to `DecoderBackend::open`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderOptions {
    pub format: OutputFormat,
    /// First source frame of the placement
    pub begin: i64,
    /// One past the last source frame
    pub end: i64,
}

impl DecoderOptions {
    pub fn length(&self) -> i64 {
        (self.end - self.begin).max(0)
    }
}

/// One decode session of one source.
///
/// Positions are milliseconds relative to the placement's first frame.
pub trait DecoderBackend: Send {
    /// Open the source and prepare for `options.format` output
    fn open(&mut self, uri: &str, options: &DecoderOptions) -> Result<()>;

    /// Attach the frame sink; the backend may start its worker here and
    /// must call `FrameSink::signal_ready` once it can deliver frames
    fn bind(&mut self, sink: FrameSink) -> Result<()>;

    /// Requested position for the next frame. Called after the pool was
    /// flushed; slots locked afterwards also carry the target
    fn set_position(&mut self, position_ms: i64);

    /// Start pushing frames
    fn play(&mut self) -> Result<()>;

    /// Stop pushing and release the source. Must not return while the
    /// worker can still touch the sink
    fn stop(&mut self);

    fn is_ready(&self) -> bool;
}

/// Creates a backend for a clip
pub trait DecoderFactory: Send + Sync {
    fn create(&self, clip: &Clip, kind: TrackType) -> Result<Box<dyn DecoderBackend>>;
}

/// Dispatches on the URI scheme: `pattern://` to the synthetic backend,
/// everything else to FFmpeg when the `ffmpeg` feature is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn create(&self, clip: &Clip, kind: TrackType) -> Result<Box<dyn DecoderBackend>> {
        if clip.uri.starts_with(pattern::SCHEME) {
            return pattern::PatternDecoderFactory.create(clip, kind);
        }
        #[cfg(feature = "ffmpeg")]
        {
            ffmpeg::FfmpegDecoderFactory.create(clip, kind)
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(crate::error::WorkflowError::DecodeInit(format!(
                "No decoder for '{}' (built without ffmpeg)",
                clip.uri
            )))
        }
    }
}
