//! Per-track scheduler
//!
//! **Why**: A track holds clip placements keyed by start frame. On every tick
//! it decides which clip is active, warms up the next one, stops the rest and
//! returns exactly one buffer: the active clip's frame or black/silence.
//!
//! **Used by**: MainWorkflow (one per timeline track)
//!
//! # Tick
//!
//! `get_output(frame, sub_frame, paused)`:
//! 1. release the buffer returned by the previous tick
//! 2. read-lock the clip map
//! 3. report `TrackEndReached` once when nothing is left at or after `frame`
//! 4. detect discontinuities (seek, paused scrub) that need repositioning
//! 5. per clip in start order: render if active, preload if within the
//!    preload window, otherwise stop
//! 6. remember `sub_frame`, return the active frame or the fallback
//!
//! Structural mutators take the write lock and therefore never run during a
//! tick.

use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::clip_state::ClipState;
use super::clip_workflow::{ClipOutput, ClipWorkflow, GetMode, StackedBuffer};
use super::stacked_buffer::PoolStats;
use super::workflow_events::{TrackEndReached, TrackEventEmitter};
use crate::config::WorkflowSettings;
use crate::decoder::DecoderFactory;
use crate::entities::clip::{Clip, ClipHelper, ClipPlacement, PlacementSink};
use crate::entities::frame::{FrameBuffer, OutputFormat, TrackType, fallback_output};
use crate::error::{Result, WorkflowError};

/// No tick served yet
const NO_FRAME: i64 = i64::MIN;
const NO_INDEX: usize = usize::MAX;

/// Where a track output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Clip(Uuid),
    Fallback,
}

/// One tick's output of a track
#[derive(Debug, Clone)]
pub struct TrackOutput {
    pub frame: Arc<FrameBuffer>,
    pub source: OutputSource,
}

impl TrackOutput {
    pub fn is_fallback(&self) -> bool {
        self.source == OutputSource::Fallback
    }

    pub fn clip(&self) -> Option<Uuid> {
        match self.source {
            OutputSource::Clip(uuid) => Some(uuid),
            OutputSource::Fallback => None,
        }
    }
}

struct ClipEntry {
    start: i64,
    workflow: ClipWorkflow,
}

impl ClipEntry {
    fn end(&self) -> i64 {
        self.start + self.workflow.length()
    }

    fn contains(&self, frame: i64) -> bool {
        self.start <= frame && frame < self.end()
    }
}

/// Placements sorted by strictly increasing start frame
#[derive(Default)]
struct ClipMap {
    entries: Vec<ClipEntry>,
}

impl ClipMap {
    fn insert(&mut self, entry: ClipEntry) -> Result<()> {
        match self.entries.binary_search_by_key(&entry.start, |e| e.start) {
            Ok(_) => Err(WorkflowError::StructuralMisuse(format!(
                "start frame {} already occupied",
                entry.start
            ))),
            Err(pos) => {
                self.entries.insert(pos, entry);
                Ok(())
            }
        }
    }

    fn index_of(&self, uuid: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.workflow.uuid() == uuid)
    }

    fn get(&self, uuid: Uuid) -> Option<&ClipEntry> {
        self.index_of(uuid).map(|i| &self.entries[i])
    }

    fn has_start(&self, start: i64) -> bool {
        self.entries.binary_search_by_key(&start, |e| e.start).is_ok()
    }

    /// First clip (in start order) whose interval contains `frame`
    fn find_active(&self, frame: i64) -> Option<usize> {
        let upto = self.entries.partition_point(|e| e.start <= frame);
        self.entries[..upto].iter().position(|e| e.contains(frame))
    }

    /// Start of the last clip plus its length, 0 when empty
    fn length(&self) -> i64 {
        self.entries.last().map(ClipEntry::end).unwrap_or(0)
    }
}

pub struct TrackWorkflow {
    id: Uuid,
    kind: TrackType,
    settings: WorkflowSettings,
    factory: Arc<dyn DecoderFactory>,
    clips: RwLock<ClipMap>,
    length: AtomicI64,
    /// Index of the clip served by the last tick
    active: AtomicUsize,
    last_render: Mutex<Option<StackedBuffer>>,
    last_sub_frame: AtomicI64,
    render_one_frame: AtomicBool,
    /// Last tick peeked (`Get`) instead of consuming
    peeked: AtomicBool,
    end_signalled: AtomicBool,
    full_speed: AtomicBool,
    fallback: Arc<FrameBuffer>,
    emitter: TrackEventEmitter,
}

impl std::fmt::Debug for TrackWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackWorkflow")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("clips", &self.clip_count())
            .field("length", &self.length())
            .finish()
    }
}

impl TrackWorkflow {
    pub fn new(kind: TrackType, settings: &WorkflowSettings, factory: Arc<dyn DecoderFactory>) -> Self {
        let format = settings.output_format(kind);
        Self {
            id: Uuid::new_v4(),
            kind,
            settings: settings.clone(),
            factory,
            clips: RwLock::new(ClipMap::default()),
            length: AtomicI64::new(0),
            active: AtomicUsize::new(NO_INDEX),
            last_render: Mutex::new(None),
            last_sub_frame: AtomicI64::new(NO_FRAME),
            render_one_frame: AtomicBool::new(false),
            peeked: AtomicBool::new(false),
            end_signalled: AtomicBool::new(false),
            full_speed: AtomicBool::new(settings.full_speed_render),
            fallback: fallback_output(&format),
            emitter: TrackEventEmitter::dummy(),
        }
    }

    pub fn with_emitter(mut self, emitter: TrackEventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, ClipMap> {
        self.clips.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClipMap> {
        self.clips.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    pub fn format(&self) -> OutputFormat {
        self.settings.output_format(self.kind)
    }

    /// Black or silence in this track's format
    pub fn fallback(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.fallback)
    }

    // ========== Tick ==========

    /// Produce this track's buffer for `current_frame`.
    ///
    /// Never fails: clips that cannot render degrade to the fallback buffer.
    pub fn get_output(&self, current_frame: i64, sub_frame: i64, paused: bool) -> TrackOutput {
        self.last_render.lock().unwrap_or_else(|e| e.into_inner()).take();

        let map = self.read();
        self.check_end(&map, current_frame);

        let stepping = self.render_one_frame.swap(false, Ordering::SeqCst);
        let last = self.last_sub_frame.load(Ordering::SeqCst);
        let need_repositioning = !stepping
            && last != NO_FRAME
            && ((paused && sub_frame != last) || (sub_frame - last).abs() > 1);
        let mode = if paused && !stepping { GetMode::Get } else { GetMode::Pop };
        // A peek leaves the clip cursor on the shown frame; the next pop must
        // land exactly on its offset
        let exact = self.peeked.swap(mode == GetMode::Get, Ordering::SeqCst) && mode == GetMode::Pop;

        let mut active: Option<(usize, Option<StackedBuffer>)> = None;
        for (index, entry) in map.entries.iter().enumerate() {
            let workflow = &entry.workflow;
            if entry.contains(current_frame) {
                if let Some((winner, _)) = &active {
                    let fault = WorkflowError::SchedulingFault {
                        frame: current_frame,
                        detail: format!(
                            "clip {} overlaps clip {}",
                            workflow.uuid(),
                            map.entries[*winner].workflow.uuid()
                        ),
                    };
                    warn!("Track {}: {}", self.id, fault);
                    continue;
                }
                let offset = current_frame - entry.start;
                let buffer = self.render_clip(workflow, offset, mode, need_repositioning, exact);
                active = Some((index, buffer));
            } else if entry.start > current_frame && entry.start - current_frame < self.settings.preload_window {
                self.preload(workflow);
            } else if !workflow.state().is_idle() {
                workflow.stop();
            }
        }

        self.last_sub_frame.store(sub_frame, Ordering::SeqCst);
        let index = active.as_ref().map(|(i, _)| *i).unwrap_or(NO_INDEX);
        if self.active.swap(index, Ordering::SeqCst) != index && index != NO_INDEX {
            debug!(
                "Track {}: clip {} active at frame {}",
                self.id,
                map.entries[index].workflow.uuid(),
                current_frame
            );
        }

        match active {
            Some((index, Some(buffer))) => {
                let output = TrackOutput {
                    frame: buffer.snapshot(),
                    source: OutputSource::Clip(map.entries[index].workflow.uuid()),
                };
                *self.last_render.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffer);
                output
            }
            _ => TrackOutput {
                frame: self.fallback(),
                source: OutputSource::Fallback,
            },
        }
    }

    fn check_end(&self, map: &ClipMap, current_frame: i64) {
        let ended = match map.entries.last() {
            None => true,
            Some(last) => last.end() <= current_frame && last.workflow.state() != ClipState::Error,
        };
        if !ended {
            self.end_signalled.store(false, Ordering::SeqCst);
        } else if !self.end_signalled.swap(true, Ordering::SeqCst) {
            debug!("Track {}: end reached at frame {}", self.id, current_frame);
            self.emitter.emit(TrackEndReached {
                track_id: self.id,
                kind: self.kind,
                frame: current_frame,
            });
        }
    }

    fn preload(&self, workflow: &ClipWorkflow) {
        if workflow.state() == ClipState::Stopped {
            debug!("Track {}: preloading clip {}", self.id, workflow.uuid());
            if let Err(e) = workflow.initialize() {
                error!("Track {}: preload of clip {} failed: {}", self.id, workflow.uuid(), e);
            }
        }
    }

    /// Bring `workflow` to `offset` (clip-relative frames) and fetch its frame
    fn render_clip(
        &self,
        workflow: &ClipWorkflow,
        offset: i64,
        mode: GetMode,
        need_repositioning: bool,
        exact: bool,
    ) -> Option<StackedBuffer> {
        let lag = (workflow.cursor() - offset).abs();
        let drifted = lag > 1 || (exact && lag != 0);
        match workflow.state() {
            ClipState::Muted | ClipState::Error => return None,
            ClipState::EndReached if need_repositioning || drifted || workflow.needs_resync() => {
                workflow.stop();
            }
            _ => {}
        }

        let state = workflow.state();
        if matches!(state, ClipState::Stopped | ClipState::Initializing | ClipState::Ready) {
            if state == ClipState::Stopped {
                if let Err(e) = workflow.initialize() {
                    error!("Track {}: clip {} failed to start: {}", self.id, workflow.uuid(), e);
                    return None;
                }
            }
            if workflow.wait_for_complete_init() != ClipState::Ready {
                return None;
            }
            if offset != 0 || workflow.needs_resync() {
                workflow.set_time(workflow.offset_to_ms(offset));
            }
            if let Err(e) = workflow.start_render() {
                debug!("Track {}: clip {} not rendering: {}", self.id, workflow.uuid(), e);
                return None;
            }
        } else if state.is_rendering() && (need_repositioning || drifted || workflow.needs_resync()) {
            workflow.set_time(workflow.offset_to_ms(offset));
        }

        match workflow.get_output(mode) {
            ClipOutput::Frame(buffer) => Some(buffer),
            ClipOutput::EndReached | ClipOutput::Unavailable | ClipOutput::Stalled => None,
        }
    }

    // ========== Structure ==========

    /// Place `helper` at `start`. Returns the helper's uuid.
    pub fn add_clip(&self, helper: ClipHelper, start: i64) -> Result<Uuid> {
        if start < 0 {
            return Err(self.misuse(format!("negative start frame {start}")));
        }
        let uuid = helper.uuid();
        let workflow = ClipWorkflow::new(helper, self.kind, &self.settings, Arc::clone(&self.factory));
        workflow.set_full_speed_render(self.full_speed.load(Ordering::SeqCst));

        let mut map = self.write();
        if map.index_of(uuid).is_some() {
            return Err(self.misuse(format!("clip {uuid} already on track")));
        }
        map.insert(ClipEntry { start, workflow }).map_err(|e| self.logged(e))?;
        self.update_length(&map);
        debug!("Track {}: added clip {} at {}", self.id, uuid, start);
        Ok(uuid)
    }

    /// Remove a clip and stop its decoder. Returns its helper.
    pub fn remove_clip(&self, uuid: Uuid) -> Result<ClipHelper> {
        let mut map = self.write();
        let index = map
            .index_of(uuid)
            .ok_or_else(|| self.misuse(format!("remove of unknown clip {uuid}")))?;
        let entry = map.entries.remove(index);
        self.update_length(&map);
        drop(map);

        entry.workflow.stop();
        debug!("Track {}: removed clip {}", self.id, uuid);
        Ok(entry.workflow.helper().clone())
    }

    /// Change a clip's start. Trim is kept; the clip repositions on its next render.
    pub fn move_clip(&self, uuid: Uuid, new_start: i64) -> Result<()> {
        if new_start < 0 {
            return Err(self.misuse(format!("negative start frame {new_start}")));
        }
        let mut map = self.write();
        let index = map
            .index_of(uuid)
            .ok_or_else(|| self.misuse(format!("move of unknown clip {uuid}")))?;
        if map.entries[index].start == new_start {
            return Ok(());
        }
        if map.has_start(new_start) {
            return Err(self.misuse(format!("start frame {new_start} already occupied")));
        }
        let mut entry = map.entries.remove(index);
        let old_start = entry.start;
        entry.start = new_start;
        entry.workflow.request_resync();
        map.insert(entry)?;
        self.update_length(&map);
        debug!("Track {}: moved clip {} {} -> {}", self.id, uuid, old_start, new_start);
        Ok(())
    }

    pub fn mute_clip(&self, uuid: Uuid) -> Result<()> {
        let map = self.write();
        let entry = map
            .get(uuid)
            .ok_or_else(|| self.misuse(format!("mute of unknown clip {uuid}")))?;
        entry.workflow.mute();
        self.update_length(&map);
        Ok(())
    }

    pub fn unmute_clip(&self, uuid: Uuid) -> Result<()> {
        let map = self.write();
        let entry = map
            .get(uuid)
            .ok_or_else(|| self.misuse(format!("unmute of unknown clip {uuid}")))?;
        entry.workflow.unmute();
        self.update_length(&map);
        Ok(())
    }

    /// Remove every clip
    pub fn clear(&self) {
        self.last_render.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut map = self.write();
        let entries = std::mem::take(&mut map.entries);
        self.update_length(&map);
        drop(map);
        for entry in &entries {
            entry.workflow.stop();
        }
        self.active.store(NO_INDEX, Ordering::SeqCst);
        self.last_sub_frame.store(NO_FRAME, Ordering::SeqCst);
        self.peeked.store(false, Ordering::SeqCst);
        debug!("Track {}: cleared {} clips", self.id, entries.len());
    }

    fn update_length(&self, map: &ClipMap) {
        self.length.store(map.length(), Ordering::SeqCst);
    }

    fn misuse(&self, detail: String) -> WorkflowError {
        self.logged(WorkflowError::StructuralMisuse(detail))
    }

    fn logged(&self, err: WorkflowError) -> WorkflowError {
        warn!("Track {}: {}", self.id, err);
        err
    }

    // ========== Playback control ==========

    /// Stop every clip and release the outstanding output buffer
    pub fn stop(&self) {
        self.last_render.lock().unwrap_or_else(|e| e.into_inner()).take();
        let map = self.read();
        for entry in &map.entries {
            entry.workflow.stop();
        }
        self.last_sub_frame.store(NO_FRAME, Ordering::SeqCst);
        self.peeked.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        for entry in &self.read().entries {
            entry.workflow.pause();
        }
    }

    pub fn unpause(&self) {
        for entry in &self.read().entries {
            entry.workflow.unpause();
        }
    }

    /// Next paused tick consumes one frame instead of peeking
    pub fn render_one_frame(&self) {
        self.render_one_frame.store(true, Ordering::SeqCst);
    }

    pub fn set_full_speed_render(&self, value: bool) {
        self.full_speed.store(value, Ordering::SeqCst);
        for entry in &self.read().entries {
            entry.workflow.set_full_speed_render(value);
        }
    }

    /// Re-arm the end notification (after a seek back)
    pub fn reset_end_reached(&self) {
        self.end_signalled.store(false, Ordering::SeqCst);
    }

    pub fn is_end_reached(&self) -> bool {
        self.end_signalled.load(Ordering::SeqCst)
    }

    // ========== Queries ==========

    pub fn length(&self) -> i64 {
        self.length.load(Ordering::SeqCst)
    }

    pub fn clip_count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clip_count() == 0
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.read().index_of(uuid).is_some()
    }

    pub fn clip_helper(&self, uuid: Uuid) -> Option<ClipHelper> {
        self.read().get(uuid).map(|e| e.workflow.helper().clone())
    }

    pub fn clip_start(&self, uuid: Uuid) -> Option<i64> {
        self.read().get(uuid).map(|e| e.start)
    }

    pub fn clip_state(&self, uuid: Uuid) -> Option<ClipState> {
        self.read().get(uuid).map(|e| e.workflow.state())
    }

    pub fn clip_stats(&self, uuid: Uuid) -> Option<PoolStats> {
        self.read().get(uuid).map(|e| e.workflow.buffer_stats())
    }

    pub fn clip_error(&self, uuid: Uuid) -> Option<String> {
        self.read().get(uuid).and_then(|e| e.workflow.last_error())
    }

    /// Clip whose interval contains `frame` (first in start order)
    pub fn clip_at(&self, frame: i64) -> Option<Uuid> {
        let map = self.read();
        map.find_active(frame).map(|i| map.entries[i].workflow.uuid())
    }

    // ========== Persistence ==========

    /// Write every placement, in start order
    pub fn save(&self, sink: &mut dyn PlacementSink) -> Result<()> {
        let map = self.read();
        for entry in &map.entries {
            sink.write_placement(&ClipPlacement::of(entry.workflow.helper(), entry.start))?;
        }
        Ok(())
    }

    pub fn placements(&self) -> Vec<ClipPlacement> {
        let mut out = Vec::new();
        // Vec sink never fails
        let _ = self.save(&mut out);
        out
    }

    /// Re-add saved placements. `resolve` maps a clip uuid to the project's clip;
    /// unresolved or conflicting placements are skipped. Returns how many were added.
    pub fn restore<F>(&self, placements: &[ClipPlacement], resolve: F) -> usize
    where
        F: Fn(Uuid) -> Option<Arc<Clip>>,
    {
        let mut added = 0;
        for p in placements {
            let Some(clip) = resolve(p.uuid) else {
                warn!("Track {}: clip {} not found, placement skipped", self.id, p.uuid);
                continue;
            };
            let helper = ClipHelper::with_uuid(p.helper_uuid, clip, p.begin, p.end);
            if self.add_clip(helper, p.start_frame).is_ok() {
                added += 1;
            }
        }
        added
    }
}

impl Drop for TrackWorkflow {
    fn drop(&mut self) {
        self.last_render.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::EventBus;
    use crate::decoder::DefaultDecoderFactory;
    use crate::decoder::pattern::pattern_value;
    use crate::entities::clip::JsonPlacementWriter;
    use crate::utils::{frames_to_ms, init_test_logger};
    use std::collections::HashMap;

    const FPS: f64 = 25.0;

    fn settings() -> WorkflowSettings {
        WorkflowSettings {
            width: 8,
            height: 4,
            fps: FPS,
            nb_buffers: 3,
            preload_window: 10,
            full_speed_render: true,
            ..WorkflowSettings::default()
        }
    }

    fn track() -> TrackWorkflow {
        init_test_logger();
        TrackWorkflow::new(TrackType::Video, &settings(), Arc::new(DefaultDecoderFactory))
    }

    fn helper(uri: &str, begin: i64, end: i64) -> ClipHelper {
        ClipHelper::new(Arc::new(Clip::new(uri, begin, end, FPS)))
    }

    fn pts_at(track: &TrackWorkflow, frame: i64) -> Option<i64> {
        let out = track.get_output(frame, frame, false);
        (!out.is_fallback()).then(|| out.frame.pts())
    }

    /// Test: Gaps, clips and end of track
    /// Validates: [0,100) and [150,250) give clip A / fallback / clip B / fallback,
    /// and TrackEndReached fires exactly once
    #[test]
    fn test_clip_gap_scenario() {
        let bus = EventBus::new();
        let ended = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&ended);
        bus.subscribe::<TrackEndReached, _>(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let track = track().with_emitter(TrackEventEmitter::from_emitter(bus.emitter()));

        let a = track.add_clip(helper("pattern://a", 0, 100), 0).unwrap();
        let b = track.add_clip(helper("pattern://b", 0, 100), 150).unwrap();
        assert_eq!(track.length(), 250);

        let out = track.get_output(50, 50, false);
        assert_eq!(out.clip(), Some(a));
        assert_eq!(out.frame.pts(), frames_to_ms(50, FPS));
        assert!(out.frame.data().iter().all(|&v| v == pattern_value(50)));

        let out = track.get_output(120, 120, false);
        assert!(out.is_fallback());
        assert_eq!(out.frame.len(), 8 * 4 * 3);
        assert!(out.frame.data().iter().all(|&v| v == 0));
        assert_eq!(track.clip_state(a), Some(ClipState::Stopped));

        let out = track.get_output(200, 200, false);
        assert_eq!(out.clip(), Some(b));
        assert_eq!(out.frame.pts(), frames_to_ms(50, FPS));
        assert_eq!(ended.load(Ordering::SeqCst), 0);

        assert!(track.get_output(260, 260, false).is_fallback());
        assert!(track.get_output(261, 261, false).is_fallback());
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(track.is_end_reached());
        assert_eq!(track.clip_state(b), Some(ClipState::Stopped));
    }

    /// Test: Continuous playback
    /// Validates: consecutive ticks return consecutive frames across a cut
    #[test]
    fn test_sequential_playback_across_cut() {
        let track = track();
        track.add_clip(helper("pattern://a", 0, 20), 0).unwrap();
        track.add_clip(helper("pattern://b", 100, 120), 20).unwrap();

        for frame in 0..40 {
            let expected = if frame < 20 { frame } else { 100 + frame - 20 };
            assert_eq!(pts_at(&track, frame), Some(frames_to_ms(expected, FPS)), "frame {frame}");
        }
        assert!(track.get_output(40, 40, false).is_fallback());
    }

    /// Test: Paused peek
    /// Validates: two paused ticks on the same sub-frame return the same frame
    /// and leave no buffer borrowed
    #[test]
    fn test_pause_returns_same_frame() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 200), 0).unwrap();

        assert_eq!(pts_at(&track, 79), Some(frames_to_ms(79, FPS)));
        track.pause();
        let first = track.get_output(80, 80, true);
        let second = track.get_output(80, 80, true);
        assert_eq!(first.frame.pts(), frames_to_ms(80, FPS));
        assert_eq!(second.frame.pts(), first.frame.pts());
        assert_eq!(track.clip_stats(a).map(|s| s.borrowed), Some(0));

        track.render_one_frame();
        assert_eq!(track.get_output(80, 80, true).frame.pts(), frames_to_ms(80, FPS));
        assert_eq!(track.get_output(81, 81, true).frame.pts(), frames_to_ms(81, FPS));
        track.unpause();
    }

    /// Test: Resume after pause
    /// Validates: ticks after unpause show their own frame, not the one
    /// peeked while paused
    #[test]
    fn test_unpause_resumes_on_time() {
        let track = track();
        track.add_clip(helper("pattern://a", 0, 200), 0).unwrap();
        for frame in 0..80 {
            assert_eq!(pts_at(&track, frame), Some(frames_to_ms(frame, FPS)));
        }

        track.pause();
        for _ in 0..2 {
            assert_eq!(track.get_output(80, 80, true).frame.pts(), frames_to_ms(80, FPS));
        }
        track.unpause();

        for frame in 81..=85 {
            assert_eq!(pts_at(&track, frame), Some(frames_to_ms(frame, FPS)), "frame {frame}");
        }
    }

    /// Test: Edits during playback
    /// Validates: add/move/remove on another thread never disturb a running
    /// tick or the frames it returns
    #[test]
    fn test_mutations_while_ticking() {
        let track = track();
        track.add_clip(helper("pattern://main", 0, 900), 100).unwrap();
        assert_eq!(track.length(), 1000);

        std::thread::scope(|s| {
            let editor = s.spawn(|| {
                for i in 0..50 {
                    let uuid = track.add_clip(helper("pattern://edit", 0, 5), 10).unwrap();
                    track.move_clip(uuid, 20 + i % 5).unwrap();
                    assert_eq!(track.length(), 1000);
                    track.remove_clip(uuid).unwrap();
                }
            });
            for frame in 100..300 {
                assert_eq!(pts_at(&track, frame), Some(frames_to_ms(frame - 100, FPS)), "frame {frame}");
            }
            editor.join().unwrap();
        });

        assert_eq!(track.clip_count(), 1);
        assert_eq!(track.length(), 1000);
    }

    /// Test: Seek while paused
    /// Validates: scrubbing to a new sub-frame repositions the decoder
    #[test]
    fn test_paused_scrub_repositions() {
        let track = track();
        track.add_clip(helper("pattern://a", 0, 200), 0).unwrap();
        assert_eq!(pts_at(&track, 10), Some(frames_to_ms(10, FPS)));
        track.pause();
        assert_eq!(track.get_output(150, 150, true).frame.pts(), frames_to_ms(150, FPS));
        assert_eq!(track.get_output(40, 40, true).frame.pts(), frames_to_ms(40, FPS));
    }

    /// Test: Move forces resync
    /// Validates: after moving a clip by one frame the next tick shows the frame
    /// matching the new position, not the next buffered one
    #[test]
    fn test_move_clip_resyncs() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 100), 0).unwrap();
        for frame in 0..3 {
            assert_eq!(pts_at(&track, frame), Some(frames_to_ms(frame, FPS)));
        }

        track.move_clip(a, 1).unwrap();
        assert_eq!(track.clip_start(a), Some(1));
        assert_eq!(track.length(), 101);
        let h = track.clip_helper(a).unwrap();
        assert_eq!((h.begin(), h.end()), (0, 100));

        assert_eq!(pts_at(&track, 3), Some(frames_to_ms(2, FPS)));
        assert_eq!(pts_at(&track, 4), Some(frames_to_ms(3, FPS)));
    }

    /// Test: Seek while playing
    /// Validates: a jump of more than one frame repositions
    #[test]
    fn test_jump_repositions() {
        let track = track();
        track.add_clip(helper("pattern://a", 0, 300), 0).unwrap();
        assert_eq!(pts_at(&track, 0), Some(0));
        assert_eq!(pts_at(&track, 200), Some(frames_to_ms(200, FPS)));
        assert_eq!(pts_at(&track, 201), Some(frames_to_ms(201, FPS)));
        assert_eq!(pts_at(&track, 5), Some(frames_to_ms(5, FPS)));
    }

    /// Test: Decoder failure
    /// Validates: an errored clip degrades to fallback and never resumes by itself
    #[test]
    fn test_error_clip_stays_silent() {
        let track = track();
        let a = track.add_clip(helper("pattern://bad?fail_at=5", 0, 100), 0).unwrap();
        assert_eq!(pts_at(&track, 0), Some(0));
        for frame in 1..20 {
            let out = track.get_output(frame, frame, false);
            if frame >= 5 {
                assert!(out.is_fallback(), "frame {frame}");
            }
        }
        assert_eq!(track.clip_state(a), Some(ClipState::Error));
        assert!(track.clip_error(a).is_some());
        assert!(track.get_output(20, 20, false).is_fallback());
        assert_eq!(track.clip_state(a), Some(ClipState::Error));
    }

    /// Test: Open failure
    /// Validates: a clip that cannot open yields fallback without aborting the tick
    #[test]
    fn test_open_failure_falls_back() {
        let track = track();
        let a = track.add_clip(helper("pattern://x?fail_open=1", 0, 10), 0).unwrap();
        track.add_clip(helper("pattern://y", 0, 10), 10).unwrap();
        assert!(track.get_output(0, 0, false).is_fallback());
        assert_eq!(track.clip_state(a), Some(ClipState::Error));
        assert_eq!(pts_at(&track, 10), Some(0));
    }

    /// Test: Length bookkeeping
    /// Validates: add+remove restores the length; length is last start + its length
    #[test]
    fn test_length_after_mutations() {
        let track = track();
        assert_eq!(track.length(), 0);
        let a = track.add_clip(helper("pattern://a", 0, 100), 0).unwrap();
        assert_eq!(track.length(), 100);

        let b = track.add_clip(helper("pattern://b", 0, 100), 150).unwrap();
        assert_eq!(track.length(), 250);
        track.remove_clip(b).unwrap();
        assert_eq!(track.length(), 100);

        let c = track.add_clip(helper("pattern://c", 0, 10), 30).unwrap();
        assert_eq!(track.length(), 40);
        track.remove_clip(c).unwrap();
        assert_eq!(track.length(), 100);

        track.remove_clip(a).unwrap();
        assert_eq!(track.length(), 0);
        assert!(track.is_empty());
    }

    /// Test: Structural misuse
    /// Validates: unknown ids and occupied starts are rejected and change nothing
    #[test]
    fn test_structural_misuse() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 10), 0).unwrap();
        let b = track.add_clip(helper("pattern://b", 0, 10), 20).unwrap();

        let unknown = Uuid::new_v4();
        assert!(matches!(track.remove_clip(unknown), Err(WorkflowError::StructuralMisuse(_))));
        assert!(matches!(track.move_clip(unknown, 5), Err(WorkflowError::StructuralMisuse(_))));
        assert!(track.mute_clip(unknown).is_err());
        assert!(track.move_clip(a, 20).is_err());
        assert!(track.add_clip(helper("pattern://c", 0, 10), 20).is_err());
        assert!(track.add_clip(helper("pattern://c", 0, 10), -1).is_err());
        assert!(track.move_clip(b, 20).is_ok());

        assert_eq!(track.clip_count(), 2);
        assert_eq!(track.clip_start(a), Some(0));
        assert_eq!(track.clip_start(b), Some(20));
        assert_eq!(track.length(), 30);
    }

    /// Test: Preload window
    /// Validates: a clip starting within the window is initialized ahead of time,
    /// one further away stays stopped
    #[test]
    fn test_preload_window() {
        let track = track();
        let near = track.add_clip(helper("pattern://near", 0, 10), 20).unwrap();
        let far = track.add_clip(helper("pattern://far", 0, 10), 100).unwrap();

        assert!(track.get_output(15, 15, false).is_fallback());
        assert_ne!(track.clip_state(near), Some(ClipState::Stopped));
        assert_eq!(track.clip_state(far), Some(ClipState::Stopped));

        assert_eq!(pts_at(&track, 20), Some(0));
    }

    /// Test: Overlap
    /// Validates: the first clip in start order wins, the other is left alone
    #[test]
    fn test_overlap_first_match_wins() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 50), 0).unwrap();
        let b = track.add_clip(helper("pattern://b", 0, 50), 10).unwrap();
        let out = track.get_output(20, 20, false);
        assert_eq!(out.clip(), Some(a));
        assert_eq!(track.clip_at(20), Some(a));
        assert_eq!(track.clip_state(b), Some(ClipState::Stopped));
    }

    #[test]
    fn test_mute_unmute_clip() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 100), 0).unwrap();
        assert_eq!(pts_at(&track, 0), Some(0));

        track.mute_clip(a).unwrap();
        assert!(track.get_output(1, 1, false).is_fallback());
        assert_eq!(track.clip_state(a), Some(ClipState::Muted));

        for frame in 2..40 {
            assert!(track.get_output(frame, frame, false).is_fallback());
        }
        assert_eq!(track.clip_stats(a).map(|s| s.computed), Some(0));

        // nothing decoded while muted; the first tick after unmute seeks back
        track.unmute_clip(a).unwrap();
        assert_eq!(pts_at(&track, 40), Some(frames_to_ms(40, FPS)));
        assert_eq!(pts_at(&track, 41), Some(frames_to_ms(41, FPS)));
    }

    /// Test: Stop releases buffers
    /// Validates: after a track stop every pool is whole again
    #[test]
    fn test_stop_releases_output() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 100), 0).unwrap();
        let out = track.get_output(0, 0, false);
        assert!(!out.is_fallback());
        assert_eq!(track.clip_stats(a).map(|s| s.borrowed), Some(1));

        track.stop();
        let stats = track.clip_stats(a).unwrap();
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.available, stats.capacity);
        assert_eq!(track.clip_state(a), Some(ClipState::Stopped));
        // the caller's snapshot stays readable
        assert_eq!(out.frame.pts(), 0);
    }

    /// Test: Past the last frame
    /// Validates: the drained clip stops once the cursor leaves it and restarts
    /// from the right frame when the cursor goes back
    #[test]
    fn test_clip_restarts_after_seek_back() {
        let track = track();
        let a = track.add_clip(helper("pattern://a", 0, 5), 0).unwrap();
        for frame in 0..5 {
            assert_eq!(pts_at(&track, frame), Some(frames_to_ms(frame, FPS)));
        }
        assert!(track.get_output(5, 5, false).is_fallback());
        assert_eq!(track.clip_state(a), Some(ClipState::Stopped));
        assert_eq!(pts_at(&track, 1), Some(frames_to_ms(1, FPS)));
    }

    #[test]
    fn test_empty_track_signals_end_once() {
        let bus = EventBus::new();
        let track = track().with_emitter(TrackEventEmitter::from_emitter(bus.emitter()));
        assert!(track.get_output(0, 0, false).is_fallback());
        assert!(track.get_output(1, 1, false).is_fallback());
        assert_eq!(bus.poll().len(), 1);
        track.reset_end_reached();
        track.get_output(2, 2, false);
        assert_eq!(bus.poll().len(), 1);
    }

    /// Test: Save and restore
    /// Validates: placements round-trip through the JSON lines writer
    #[test]
    fn test_save_and_restore() {
        let track = track();
        let clip_a = Arc::new(Clip::new("pattern://a", 0, 100, FPS));
        let clip_b = Arc::new(Clip::new("pattern://b", 0, 100, FPS));
        let ha = ClipHelper::with_trim(Arc::clone(&clip_a), 10, 60);
        let hb = ClipHelper::new(Arc::clone(&clip_b));
        let (ua, ub) = (ha.uuid(), hb.uuid());
        track.add_clip(hb, 200).unwrap();
        track.add_clip(ha, 0).unwrap();

        let placements = track.placements();
        assert_eq!(placements.len(), 2);
        assert_eq!(placements[0].helper_uuid, ua);
        assert_eq!(placements[0].uuid, clip_a.uuid);
        assert_eq!((placements[0].start_frame, placements[0].begin, placements[0].end), (0, 10, 60));
        assert_eq!(placements[1].helper_uuid, ub);

        let mut writer = JsonPlacementWriter::new(Vec::new());
        track.save(&mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let parsed = crate::entities::clip::read_placements(&text).unwrap();

        let clips: HashMap<Uuid, Arc<Clip>> =
            [(clip_a.uuid, clip_a), (clip_b.uuid, clip_b)].into_iter().collect();
        let restored = self::track();
        assert_eq!(restored.restore(&parsed, |id| clips.get(&id).cloned()), 2);
        assert_eq!(restored.placements(), placements);
        assert_eq!(restored.length(), 300);
        assert_eq!(restored.restore(&parsed, |_| None), 0);
    }

    #[test]
    fn test_clear() {
        let track = track();
        track.add_clip(helper("pattern://a", 0, 10), 0).unwrap();
        track.get_output(0, 0, false);
        track.clear();
        assert!(track.is_empty());
        assert_eq!(track.length(), 0);
        assert!(track.get_output(0, 0, false).is_fallback());
    }

    #[test]
    fn test_audio_track_silence() {
        let track = TrackWorkflow::new(TrackType::Audio, &settings(), Arc::new(DefaultDecoderFactory));
        let out = track.get_output(0, 0, false);
        assert!(out.is_fallback());
        assert_eq!(out.frame.kind(), TrackType::Audio);
        assert_eq!(out.frame.len(), 1920 * 2 * 2);

        track.add_clip(helper("pattern://tone", 0, 10), 0).unwrap();
        let out = track.get_output(0, 0, false);
        assert_eq!(out.frame.kind(), TrackType::Audio);
        assert!(!out.is_fallback());
    }
}
