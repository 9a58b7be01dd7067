//! Clips, per-placement helpers and persisted placements
//!
//! **Why**: A `Clip` is the immutable media reference owned by the project.
//! A `ClipHelper` is one placement of it (own identity and trim window),
//! the unit a `ClipWorkflow` is bound to. `ClipPlacement` is the flat record
//! written when a track is saved.
//!
//! **Used by**: ClipWorkflow, TrackWorkflow (add/save/restore)

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

/// Immutable reference to source media with its default trim `[begin, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub uuid: Uuid,
    /// Source URI handed to the decoder backend
    pub uri: String,
    pub begin: i64,
    pub end: i64,
    /// Native frame rate of the source
    pub fps: f64,
}

impl Clip {
    pub fn new(uri: impl Into<String>, begin: i64, end: i64, fps: f64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            uri: uri.into(),
            begin,
            end,
            fps,
        }
    }

    pub fn length(&self) -> i64 {
        (self.end - self.begin).max(0)
    }
}

/// One placement of a clip on a track
#[derive(Debug, Clone)]
pub struct ClipHelper {
    uuid: Uuid,
    clip: Arc<Clip>,
    begin: i64,
    end: i64,
}

impl ClipHelper {
    /// Helper using the clip's own trim window
    pub fn new(clip: Arc<Clip>) -> Self {
        let (begin, end) = (clip.begin, clip.end);
        Self::with_trim(clip, begin, end)
    }

    pub fn with_trim(clip: Arc<Clip>, begin: i64, end: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            clip,
            begin,
            end,
        }
    }

    /// Rebuild a helper with a known identity (restore path)
    pub fn with_uuid(uuid: Uuid, clip: Arc<Clip>, begin: i64, end: i64) -> Self {
        Self { uuid, clip, begin, end }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn clip(&self) -> &Arc<Clip> {
        &self.clip
    }

    pub fn begin(&self) -> i64 {
        self.begin
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Placed length in frames
    pub fn length(&self) -> i64 {
        (self.end - self.begin).max(0)
    }
}

/// Persisted placement of one clip on a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipPlacement {
    /// Source clip identity
    pub uuid: Uuid,
    pub start_frame: i64,
    pub begin: i64,
    pub end: i64,
    pub helper_uuid: Uuid,
}

impl ClipPlacement {
    pub fn of(helper: &ClipHelper, start_frame: i64) -> Self {
        Self {
            uuid: helper.clip().uuid,
            start_frame,
            begin: helper.begin(),
            end: helper.end(),
            helper_uuid: helper.uuid(),
        }
    }
}

/// Receiver of placements during `TrackWorkflow::save`.
///
/// The track only projects its model into the sink; file layout is the
/// sink's business.
pub trait PlacementSink {
    fn write_placement(&mut self, placement: &ClipPlacement) -> Result<()>;
}

impl PlacementSink for Vec<ClipPlacement> {
    fn write_placement(&mut self, placement: &ClipPlacement) -> Result<()> {
        self.push(placement.clone());
        Ok(())
    }
}

/// Writes one JSON object per line
pub struct JsonPlacementWriter<W: Write> {
    out: W,
    written: usize,
}

impl<W: Write> JsonPlacementWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PlacementSink for JsonPlacementWriter<W> {
    fn write_placement(&mut self, placement: &ClipPlacement) -> Result<()> {
        serde_json::to_writer(&mut self.out, placement)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }
}

/// Parse JSON lines produced by `JsonPlacementWriter`
pub fn read_placements(text: &str) -> Result<Vec<ClipPlacement>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(WorkflowError::from))
        .collect()
}
