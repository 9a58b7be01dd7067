//! Timeline conductor
//!
//! **Why**: Tracks only know how to produce one buffer for one frame. Someone
//! has to own the global frame cursor, tick every track, collect the outputs
//! for compositing and decide when playback is over.
//!
//! **Used by**: host applications (viewer, export loop)
//!
//! # Tick
//!
//! `tick()` renders the current frame on every track, then advances the cursor
//! unless paused. A pending single step (`render_one_frame`) advances exactly
//! one frame while paused.
//!
//! # End of timeline
//!
//! Tracks emit `TrackEndReached` on the shared bus; the conductor records them
//! and stops once every track has ended. Moving the cursor re-arms all tracks.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::event_bus::EventBus;
use super::track_workflow::{TrackOutput, TrackWorkflow};
use super::workflow_events::{TrackEndReached, TrackEventEmitter};
use crate::config::WorkflowSettings;
use crate::decoder::DecoderFactory;
use crate::entities::clip::ClipHelper;
use crate::entities::frame::TrackType;
use crate::error::{Result, WorkflowError};

/// Every track's output for one timeline frame
#[derive(Debug, Clone)]
pub struct TimelineOutput {
    pub frame: i64,
    /// Video tracks, top first
    pub video: Vec<TrackOutput>,
    pub audio: Vec<TrackOutput>,
}

impl TimelineOutput {
    /// Topmost video track with real content
    pub fn top_video(&self) -> Option<&TrackOutput> {
        self.video.iter().find(|o| !o.is_fallback())
    }

    /// No track had content at this frame
    pub fn is_blank(&self) -> bool {
        self.video.iter().chain(self.audio.iter()).all(TrackOutput::is_fallback)
    }
}

pub struct MainWorkflow {
    settings: WorkflowSettings,
    factory: Arc<dyn DecoderFactory>,
    video: Vec<Arc<TrackWorkflow>>,
    audio: Vec<Arc<TrackWorkflow>>,
    bus: EventBus,
    ended: Arc<Mutex<HashSet<Uuid>>>,
    current_frame: i64,
    paused: bool,
    step_pending: bool,
}

impl std::fmt::Debug for MainWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainWorkflow")
            .field("video", &self.video.len())
            .field("audio", &self.audio.len())
            .field("current_frame", &self.current_frame)
            .field("paused", &self.paused)
            .finish()
    }
}

impl MainWorkflow {
    pub fn new(settings: WorkflowSettings, factory: Arc<dyn DecoderFactory>) -> Self {
        let bus = EventBus::new();
        let ended = Arc::new(Mutex::new(HashSet::new()));
        let sink = Arc::clone(&ended);
        bus.subscribe::<TrackEndReached, _>(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).insert(event.track_id);
        });
        info!(
            "MainWorkflow: {}x{} @ {} fps, {} buffers per clip",
            settings.width, settings.height, settings.fps, settings.nb_buffers
        );
        Self {
            settings,
            factory,
            video: Vec::new(),
            audio: Vec::new(),
            bus,
            ended,
            current_frame: 0,
            paused: false,
            step_pending: false,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Bus carrying `TrackEndReached`; hosts may subscribe too
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    // ========== Tracks ==========

    /// Append a track below the existing ones of its kind
    pub fn add_track(&mut self, kind: TrackType) -> Arc<TrackWorkflow> {
        let emitter = TrackEventEmitter::from_emitter(self.bus.emitter());
        let track = Arc::new(
            TrackWorkflow::new(kind, &self.settings, Arc::clone(&self.factory)).with_emitter(emitter),
        );
        debug!("MainWorkflow: added {:?} track {}", kind, track.id());
        self.tracks_mut(kind).push(Arc::clone(&track));
        track
    }

    pub fn add_video_track(&mut self) -> Arc<TrackWorkflow> {
        self.add_track(TrackType::Video)
    }

    pub fn add_audio_track(&mut self) -> Arc<TrackWorkflow> {
        self.add_track(TrackType::Audio)
    }

    pub fn remove_track(&mut self, id: Uuid) -> Result<()> {
        for kind in [TrackType::Video, TrackType::Audio] {
            let tracks = self.tracks_mut(kind);
            if let Some(pos) = tracks.iter().position(|t| t.id() == id) {
                let track = tracks.remove(pos);
                track.stop();
                self.ended.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                debug!("MainWorkflow: removed track {}", id);
                return Ok(());
            }
        }
        let err = WorkflowError::StructuralMisuse(format!("unknown track {id}"));
        warn!("MainWorkflow: {}", err);
        Err(err)
    }

    pub fn tracks(&self, kind: TrackType) -> &[Arc<TrackWorkflow>] {
        match kind {
            TrackType::Video => &self.video,
            TrackType::Audio => &self.audio,
        }
    }

    fn tracks_mut(&mut self, kind: TrackType) -> &mut Vec<Arc<TrackWorkflow>> {
        match kind {
            TrackType::Video => &mut self.video,
            TrackType::Audio => &mut self.audio,
        }
    }

    fn all_tracks(&self) -> impl Iterator<Item = &Arc<TrackWorkflow>> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn track(&self, id: Uuid) -> Option<Arc<TrackWorkflow>> {
        self.all_tracks().find(|t| t.id() == id).cloned()
    }

    /// Place a clip on track `track_id`
    pub fn add_clip(&self, track_id: Uuid, helper: ClipHelper, start: i64) -> Result<Uuid> {
        let track = self
            .track(track_id)
            .ok_or_else(|| WorkflowError::StructuralMisuse(format!("unknown track {track_id}")))?;
        track.add_clip(helper, start)
    }

    /// Longest track length in frames
    pub fn length(&self) -> i64 {
        self.all_tracks().map(|t| t.length()).max().unwrap_or(0)
    }

    // ========== Playback ==========

    pub fn current_frame(&self) -> i64 {
        self.current_frame
    }

    /// Move the cursor; every track re-evaluates its end state
    pub fn set_current_frame(&mut self, frame: i64) {
        self.current_frame = frame.max(0);
        self.ended.lock().unwrap_or_else(|e| e.into_inner()).clear();
        for track in self.all_tracks() {
            track.reset_end_reached();
        }
        debug!("MainWorkflow: cursor -> {}", self.current_frame);
    }

    /// Render the current frame on every track
    pub fn get_output(&self) -> TimelineOutput {
        let frame = self.current_frame;
        let paused = self.paused;
        TimelineOutput {
            frame,
            video: self.video.iter().map(|t| t.get_output(frame, frame, paused)).collect(),
            audio: self.audio.iter().map(|t| t.get_output(frame, frame, paused)).collect(),
        }
    }

    /// Render the current frame, then advance the cursor.
    /// Stops playback once every track reported its end.
    pub fn tick(&mut self) -> TimelineOutput {
        let output = self.get_output();
        if !self.paused || std::mem::take(&mut self.step_pending) {
            self.current_frame += 1;
        }
        if !self.paused && self.is_end_reached() {
            info!("MainWorkflow: end of timeline at frame {}", output.frame);
            self.stop();
        }
        output
    }

    /// Advance to the next frame without rendering
    pub fn next_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Every track has nothing left at or after the cursor
    pub fn is_end_reached(&self) -> bool {
        let ended = self.ended.lock().unwrap_or_else(|e| e.into_inner());
        self.all_tracks().all(|t| ended.contains(&t.id()))
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            for track in self.all_tracks() {
                track.pause();
            }
            debug!("MainWorkflow: paused at {}", self.current_frame);
        }
    }

    pub fn unpause(&mut self) {
        if self.paused {
            self.paused = false;
            self.step_pending = false;
            for track in self.all_tracks() {
                track.unpause();
            }
            debug!("MainWorkflow: resumed at {}", self.current_frame);
        }
    }

    /// While paused: the next tick consumes one frame and advances by one
    pub fn render_one_frame(&mut self) {
        if !self.paused {
            return;
        }
        self.step_pending = true;
        for track in self.all_tracks() {
            track.render_one_frame();
        }
    }

    pub fn set_full_speed_render(&mut self, value: bool) {
        self.settings.full_speed_render = value;
        for track in self.all_tracks() {
            track.set_full_speed_render(value);
        }
    }

    /// Stop every decoder and pause; the cursor stays where it is
    pub fn stop(&mut self) {
        self.paused = true;
        self.step_pending = false;
        for track in self.all_tracks() {
            track.stop();
        }
        debug!("MainWorkflow: stopped at {}", self.current_frame);
    }
}

impl Drop for MainWorkflow {
    fn drop(&mut self) {
        for track in self.all_tracks() {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DefaultDecoderFactory;
    use crate::entities::clip::Clip;
    use crate::utils::{frames_to_ms, init_test_logger};

    const FPS: f64 = 25.0;

    fn timeline() -> MainWorkflow {
        init_test_logger();
        let settings = WorkflowSettings {
            width: 8,
            height: 4,
            fps: FPS,
            nb_buffers: 3,
            preload_window: 5,
            full_speed_render: true,
            ..WorkflowSettings::default()
        };
        MainWorkflow::new(settings, Arc::new(DefaultDecoderFactory))
    }

    fn helper(uri: &str, begin: i64, end: i64) -> ClipHelper {
        ClipHelper::new(Arc::new(Clip::new(uri, begin, end, FPS)))
    }

    /// Test: Track stacking
    /// Validates: the top video track wins where it has content, lower tracks
    /// show through its gaps, audio is collected alongside
    #[test]
    fn test_top_video_and_audio() {
        let mut tl = timeline();
        let top = tl.add_video_track();
        let bottom = tl.add_video_track();
        let music = tl.add_audio_track();
        let a = tl.add_clip(top.id(), helper("pattern://top", 0, 5), 0).unwrap();
        let b = tl.add_clip(bottom.id(), helper("pattern://bottom", 100, 110), 0).unwrap();
        tl.add_clip(music.id(), helper("pattern://tone", 0, 10), 0).unwrap();
        assert_eq!(tl.length(), 10);

        for frame in 0..10 {
            let out = tl.tick();
            assert_eq!(out.frame, frame);
            assert_eq!(out.video.len(), 2);
            assert_eq!(out.audio.len(), 1);
            assert!(!out.audio[0].is_fallback());
            let shown = out.top_video().unwrap();
            if frame < 5 {
                assert_eq!(shown.clip(), Some(a));
                assert_eq!(shown.frame.pts(), frames_to_ms(frame, FPS));
            } else {
                assert_eq!(shown.clip(), Some(b));
                assert_eq!(shown.frame.pts(), frames_to_ms(100 + frame, FPS));
            }
        }
    }

    /// Test: End of timeline
    /// Validates: playback stops once every track ended; seeking back re-arms
    #[test]
    fn test_end_of_timeline() {
        let mut tl = timeline();
        let v = tl.add_video_track();
        tl.add_clip(v.id(), helper("pattern://v", 0, 3), 0).unwrap();
        let a = tl.add_audio_track();
        tl.add_clip(a.id(), helper("pattern://a", 0, 5), 0).unwrap();

        for _ in 0..5 {
            tl.tick();
            assert!(!tl.is_end_reached());
            assert!(!tl.is_paused());
        }
        let out = tl.tick();
        assert!(out.is_blank());
        assert!(tl.is_end_reached());
        assert!(tl.is_paused());

        tl.set_current_frame(1);
        assert!(!tl.is_end_reached());
        tl.unpause();
        let out = tl.tick();
        assert_eq!(out.video[0].frame.pts(), frames_to_ms(1, FPS));
        assert_eq!(tl.current_frame(), 2);
    }

    /// Test: Pause and single step
    /// Validates: paused ticks hold the frame, a step shows the next one
    #[test]
    fn test_pause_and_step() {
        let mut tl = timeline();
        let v = tl.add_video_track();
        tl.add_clip(v.id(), helper("pattern://v", 0, 50), 0).unwrap();

        for _ in 0..3 {
            tl.tick();
        }
        tl.pause();
        let held = tl.tick();
        assert_eq!(held.frame, 3);
        assert_eq!(tl.tick().video[0].frame.pts(), held.video[0].frame.pts());
        assert_eq!(tl.current_frame(), 3);

        tl.render_one_frame();
        let stepped = tl.tick();
        assert_eq!(stepped.video[0].frame.pts(), frames_to_ms(3, FPS));
        assert_eq!(tl.current_frame(), 4);
        assert_eq!(tl.tick().video[0].frame.pts(), frames_to_ms(4, FPS));

        tl.unpause();
        assert_eq!(tl.tick().video[0].frame.pts(), frames_to_ms(4, FPS));
        assert_eq!(tl.tick().video[0].frame.pts(), frames_to_ms(5, FPS));
    }

    #[test]
    fn test_track_management() {
        let mut tl = timeline();
        assert!(tl.is_end_reached());
        let v = tl.add_video_track();
        assert!(tl.track(v.id()).is_some());
        assert!(tl.add_clip(Uuid::new_v4(), helper("pattern://x", 0, 5), 0).is_err());
        assert!(tl.remove_track(Uuid::new_v4()).is_err());
        tl.remove_track(v.id()).unwrap();
        assert!(tl.tracks(TrackType::Video).is_empty());
        assert_eq!(tl.length(), 0);
    }

    #[test]
    fn test_host_can_subscribe() {
        let mut tl = timeline();
        tl.add_video_track();
        tl.get_output();
        let events = tl.events().poll();
        assert_eq!(events.len(), 1);
        assert!(crate::core::event_bus::downcast_event::<TrackEndReached>(&events[0]).is_some());
    }
}
