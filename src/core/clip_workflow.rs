//! Per-clip decode session: state machine plus buffer pool
//!
//! **Why**: A placed clip must be decodable ahead of time, seekable, pausable
//! and stoppable while its decoder runs on a foreign thread. ClipWorkflow
//! owns the state, the pool and the decoder backend; the backend only sees a
//! [`FrameSink`].
//!
//! **Used by**: TrackWorkflow (one per placed clip)
//!
//! # Threads
//!
//! - Scheduler thread: `initialize`, `start_render`, `get_output`, `set_time`,
//!   `pause`/`unpause`, `stop`
//! - Decoder thread: `FrameSink::lock` / `FrameSlot::commit` plus the
//!   readiness, end and failure signals
//!
//! Pause and unpause are only requested by the scheduler. The switch to
//! `Paused` / back to `Rendering` happens inside the decoder's next `lock`.
//!
//! # Lock order
//!
//! pool -> state, signal -> state. The state lock is a leaf: nothing else is
//! acquired while it is held.
//!
//! # Sessions
//!
//! Every initialize/stop bumps `session`. Sinks remember the session they were
//! bound in and turn into no-ops once it is gone, so a late callback from an
//! old decoder never touches a newer session.

use log::{debug, error, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::clip_state::ClipState;
use super::stacked_buffer::{BufferPool, Gate, Lease, PoolOutput, PoolStats};
use crate::config::WorkflowSettings;
use crate::decoder::{DecoderBackend, DecoderFactory, DecoderOptions};
use crate::entities::clip::ClipHelper;
use crate::entities::frame::{OutputFormat, TrackType};
use crate::error::{Result, WorkflowError};
use crate::utils::{frames_to_ms, ms_to_frames};

pub use super::stacked_buffer::{GetMode, Halt, StackedBuffer};

/// Result of `ClipWorkflow::get_output`
#[derive(Debug)]
pub enum ClipOutput {
    Frame(StackedBuffer),
    /// Decoder finished and every decoded frame was served
    EndReached,
    /// Stopped, muted or failed: nothing to show
    Unavailable,
    /// No frame within the render timeout (stuck decoder)
    Stalled,
}

struct ClipShared {
    uuid: Uuid,
    state: RwLock<ClipState>,
    pool: Arc<BufferPool>,
    session: AtomicU64,
    signal_lock: Mutex<()>,
    signal: Condvar,
    last_error: Mutex<Option<String>>,
    full_speed: AtomicBool,
}

impl ClipShared {
    fn write_state(&self) -> RwLockWriteGuard<'_, ClipState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ClipState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Validated transition on a held guard
    fn apply(&self, state: &mut ClipState, next: ClipState) -> bool {
        if *state == next {
            return true;
        }
        if state.can_transition_to(next) {
            trace!("Clip {}: {} -> {}", self.uuid, *state, next);
            *state = next;
            true
        } else {
            trace!("Clip {}: rejected {} -> {}", self.uuid, *state, next);
            false
        }
    }

    fn transition(&self, next: ClipState) -> bool {
        let mut state = self.write_state();
        self.apply(&mut state, next)
    }

    /// Transition only if `session` is still the live one
    fn transition_in(&self, session: u64, next: ClipState) -> bool {
        let mut state = self.write_state();
        self.session() == session && self.apply(&mut state, next)
    }

    /// Wake threads waiting for a state change
    fn notify_state(&self) {
        let _guard = self.signal_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.signal.notify_all();
    }

    fn fail(&self, session: u64, message: String) {
        if self.session() != session {
            return;
        }
        error!("Clip {}: {}", self.uuid, message);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
        if self.transition_in(session, ClipState::Error) {
            self.pool.halt(Halt::Error);
        }
        self.notify_state();
    }
}

/// Producer handle given to a decoder backend
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<ClipShared>,
    session: u64,
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("clip", &self.shared.uuid)
            .field("session", &self.session)
            .finish()
    }
}

impl FrameSink {
    /// Lock a free buffer for writing.
    ///
    /// Blocks while the pool is full or the clip is paused with a frame to
    /// show. `None` means the session is over and the backend must stop.
    pub fn lock(&self) -> Option<FrameSlot> {
        let shared = &self.shared;
        let session = self.session;
        let lease = shared
            .pool
            .take_available(|computed| {
                if shared.session() != session {
                    return Gate::Close;
                }
                let mut state = shared.write_state();
                match *state {
                    ClipState::PauseRequired => {
                        shared.apply(&mut state, ClipState::Paused);
                        if computed == 0 { Gate::Proceed } else { Gate::Hold }
                    }
                    ClipState::Paused => {
                        if computed == 0 { Gate::Proceed } else { Gate::Hold }
                    }
                    ClipState::UnpauseRequired => {
                        shared.apply(&mut state, ClipState::Rendering);
                        Gate::Proceed
                    }
                    ClipState::Ready | ClipState::Rendering => Gate::Proceed,
                    ClipState::Initializing => Gate::Hold,
                    ClipState::Stopped | ClipState::EndReached | ClipState::Muted | ClipState::Error => {
                        Gate::Close
                    }
                }
            })
            .ok()?;
        Some(FrameSlot {
            pool: Arc::clone(&shared.pool),
            lease: Some(lease),
        })
    }

    /// Decoder can deliver frames
    pub fn signal_ready(&self) {
        if self.shared.transition_in(self.session, ClipState::Ready) {
            debug!("Clip {}: decoder ready", self.shared.uuid);
        }
        self.shared.notify_state();
    }

    /// No more frames
    pub fn end_of_stream(&self) {
        if self.shared.transition_in(self.session, ClipState::EndReached) {
            debug!("Clip {}: end of stream", self.shared.uuid);
            self.shared.pool.halt(Halt::EndReached);
        }
        self.shared.notify_state();
    }

    /// Unrecoverable decode failure
    pub fn fail(&self, message: impl Into<String>) {
        self.shared.fail(self.session, message.into());
    }

    pub fn is_current(&self) -> bool {
        self.shared.session() == self.session
    }

    /// Decoder should skip real-time pacing
    pub fn full_speed(&self) -> bool {
        self.shared.full_speed.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> OutputFormat {
        self.shared.pool.format()
    }
}

/// One locked buffer; dropped without `commit` it goes back unused
pub struct FrameSlot {
    pool: Arc<BufferPool>,
    lease: Option<Lease>,
}

impl FrameSlot {
    /// Position (ms) the decoder must jump to before filling this slot
    pub fn seek_target(&self) -> Option<i64> {
        self.lease.as_ref().and_then(|l| l.seek)
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.lease.as_mut() {
            Some(lease) => lease.buffer.data_mut(),
            None => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.lease.as_ref().map(|l| l.buffer.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish the frame with its presentation timestamp (ms).
    /// Returns false if it was discarded by a seek or stop.
    pub fn commit(mut self, pts: i64) -> bool {
        match self.lease.take() {
            Some(lease) => self.pool.commit(lease.buffer, lease.generation, pts),
            None => false,
        }
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.cancel(lease.buffer, lease.generation, lease.seek);
        }
    }
}

/// Live decode session of one placed clip
pub struct ClipWorkflow {
    helper: ClipHelper,
    kind: TrackType,
    fps: f64,
    render_timeout: Duration,
    init_timeout: Duration,
    factory: Arc<dyn DecoderFactory>,
    shared: Arc<ClipShared>,
    decoder: Mutex<Option<Box<dyn DecoderBackend>>>,
    /// Clip-relative index of the next frame `Pop` returns
    cursor: AtomicI64,
    resync: AtomicBool,
}

impl std::fmt::Debug for ClipWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipWorkflow")
            .field("uuid", &self.helper.uuid())
            .field("state", &self.state())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl ClipWorkflow {
    pub fn new(
        helper: ClipHelper,
        kind: TrackType,
        settings: &WorkflowSettings,
        factory: Arc<dyn DecoderFactory>,
    ) -> Self {
        let format = settings.output_format(kind);
        let shared = Arc::new(ClipShared {
            uuid: helper.uuid(),
            state: RwLock::new(ClipState::Stopped),
            pool: Arc::new(BufferPool::new(format, settings.nb_buffers)),
            session: AtomicU64::new(0),
            signal_lock: Mutex::new(()),
            signal: Condvar::new(),
            last_error: Mutex::new(None),
            full_speed: AtomicBool::new(settings.full_speed_render),
        });
        Self {
            helper,
            kind,
            fps: settings.fps,
            render_timeout: Duration::from_millis(settings.render_timeout_ms),
            init_timeout: Duration::from_millis(settings.init_timeout_ms),
            factory,
            shared,
            decoder: Mutex::new(None),
            cursor: AtomicI64::new(0),
            resync: AtomicBool::new(false),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.helper.uuid()
    }

    pub fn helper(&self) -> &ClipHelper {
        &self.helper
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    pub fn state(&self) -> ClipState {
        self.shared.state()
    }

    /// Placed length in frames
    pub fn length(&self) -> i64 {
        self.helper.length()
    }

    // ========== Lifecycle ==========

    /// Stopped -> Initializing: create, open and bind a decoder.
    ///
    /// A backend failure moves the clip to `Error` and is returned for logging.
    pub fn initialize(&self) -> Result<()> {
        let session = {
            let mut state = self.shared.write_state();
            let from = *state;
            if !self.shared.apply(&mut state, ClipState::Initializing) {
                return Err(WorkflowError::InvalidTransition {
                    from,
                    to: ClipState::Initializing,
                });
            }
            self.shared.session.fetch_add(1, Ordering::SeqCst) + 1
        };
        debug!("Clip {}: initializing (session {})", self.uuid(), session);

        self.shared.pool.reopen();
        *self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.cursor.store(0, Ordering::SeqCst);

        let sink = FrameSink {
            shared: Arc::clone(&self.shared),
            session,
        };
        let options = DecoderOptions {
            format: self.shared.pool.format(),
            begin: self.helper.begin(),
            end: self.helper.end(),
        };
        let opened = self
            .factory
            .create(self.helper.clip(), self.kind)
            .and_then(|mut backend| {
                backend.open(&self.helper.clip().uri, &options)?;
                backend.bind(sink)?;
                Ok(backend)
            });

        match opened {
            Ok(backend) => {
                *self.decoder.lock().unwrap_or_else(|e| e.into_inner()) = Some(backend);
                Ok(())
            }
            Err(e) => {
                self.shared.fail(session, e.to_string());
                Err(e)
            }
        }
    }

    /// Block until the decoder left `Initializing` or `init_timeout` expired
    pub fn wait_for_complete_init(&self) -> ClipState {
        let deadline = Instant::now() + self.init_timeout;
        let mut guard = self.shared.signal_lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let state = self.shared.state();
            if state != ClipState::Initializing {
                return state;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Clip {}: decoder not ready after {:?}", self.uuid(), self.init_timeout);
                return state;
            }
            guard = self
                .shared
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Start pushing frames, initializing first if needed
    pub fn start_render(&self) -> Result<()> {
        match self.state() {
            ClipState::Stopped => {
                self.initialize()?;
                self.wait_for_complete_init();
            }
            ClipState::Initializing => {
                self.wait_for_complete_init();
            }
            _ => {}
        }

        let from = self.state();
        if from.is_rendering() {
            return Ok(());
        }
        if !self.shared.transition(ClipState::Rendering) {
            return Err(WorkflowError::InvalidTransition {
                from,
                to: ClipState::Rendering,
            });
        }
        self.shared.pool.notify();

        let played = match self.decoder.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            Some(backend) => backend.play(),
            None => Err(WorkflowError::DecodeInit("no decoder bound".into())),
        };
        if let Err(e) = played {
            self.shared.fail(self.shared.session(), e.to_string());
            return Err(e);
        }
        debug!("Clip {}: rendering", self.uuid());
        Ok(())
    }

    /// Any state -> Stopped. Unblocks waiters and joins the decoder.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.shared.write_state();
            self.shared.session.fetch_add(1, Ordering::SeqCst);
            let previous = *state;
            self.shared.apply(&mut state, ClipState::Stopped);
            previous
        };
        self.shared.pool.halt(Halt::Stopped);
        self.shared.notify_state();

        let backend = self.decoder.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut backend) = backend {
            backend.stop();
        }
        self.shared.pool.flush();
        self.cursor.store(0, Ordering::SeqCst);
        if previous != ClipState::Stopped {
            debug!("Clip {}: stopped (was {})", self.uuid(), previous);
        }
    }

    // ========== Output ==========

    /// Wait for the next decoded frame.
    ///
    /// Decode failures never surface here; they show up as `Unavailable`
    /// and in `state()` / `last_error()`.
    pub fn get_output(&self, mode: GetMode) -> ClipOutput {
        match self.state() {
            ClipState::Stopped | ClipState::Muted | ClipState::Error => return ClipOutput::Unavailable,
            _ => {}
        }
        match self.shared.pool.wait_output(mode, self.render_timeout) {
            PoolOutput::Frame(buffer) => {
                if mode == GetMode::Pop {
                    self.cursor.fetch_add(1, Ordering::SeqCst);
                }
                ClipOutput::Frame(buffer)
            }
            PoolOutput::Halted(Halt::EndReached) => ClipOutput::EndReached,
            PoolOutput::Halted(_) => ClipOutput::Unavailable,
            PoolOutput::Timeout => {
                let err = WorkflowError::BufferExhaustion(format!(
                    "clip {} produced no frame within {:?} (state {}, {:?})",
                    self.uuid(),
                    self.render_timeout,
                    self.state(),
                    self.shared.pool.stats()
                ));
                warn!("{}", err);
                ClipOutput::Stalled
            }
        }
    }

    /// Reposition to `position_ms` (clip-relative). Buffered frames are dropped.
    pub fn set_time(&self, position_ms: i64) {
        self.shared.pool.seek(position_ms);
        if let Some(backend) = self.decoder.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            backend.set_position(position_ms);
        }
        self.cursor.store(ms_to_frames(position_ms, self.fps), Ordering::SeqCst);
        self.resync.store(false, Ordering::SeqCst);
        debug!("Clip {}: set_time {}ms", self.uuid(), position_ms);
    }

    /// Clip-relative offset in frames to milliseconds
    pub fn offset_to_ms(&self, offset: i64) -> i64 {
        frames_to_ms(offset, self.fps)
    }

    /// Clip-relative frame index the next `Pop` is expected to return
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    // ========== Pause / mute ==========

    pub fn pause(&self) {
        let changed = {
            let mut state = self.shared.write_state();
            match *state {
                ClipState::Rendering => self.shared.apply(&mut state, ClipState::PauseRequired),
                ClipState::UnpauseRequired => self.shared.apply(&mut state, ClipState::Paused),
                _ => false,
            }
        };
        if changed {
            self.shared.pool.notify();
        }
    }

    pub fn unpause(&self) {
        let changed = {
            let mut state = self.shared.write_state();
            match *state {
                ClipState::Paused => self.shared.apply(&mut state, ClipState::UnpauseRequired),
                ClipState::PauseRequired => self.shared.apply(&mut state, ClipState::Rendering),
                _ => false,
            }
        };
        if changed {
            self.shared.pool.notify();
        }
    }

    /// Stop and produce nothing until `unmute`
    pub fn mute(&self) {
        self.stop();
        self.shared.transition(ClipState::Muted);
        debug!("Clip {}: muted", self.uuid());
    }

    /// Back to Stopped; the next render repositions
    pub fn unmute(&self) {
        if self.state() == ClipState::Muted {
            self.shared.transition(ClipState::Stopped);
            self.request_resync();
            debug!("Clip {}: unmuted", self.uuid());
        }
    }

    pub fn is_muted(&self) -> bool {
        self.state() == ClipState::Muted
    }

    // ========== Flags ==========

    pub fn request_resync(&self) {
        self.resync.store(true, Ordering::SeqCst);
    }

    pub fn needs_resync(&self) -> bool {
        self.resync.load(Ordering::SeqCst)
    }

    /// Read and clear the resync flag
    pub fn take_resync(&self) -> bool {
        self.resync.swap(false, Ordering::SeqCst)
    }

    pub fn set_full_speed_render(&self, value: bool) {
        self.shared.full_speed.store(value, Ordering::Relaxed);
    }

    pub fn is_full_speed_render(&self) -> bool {
        self.shared.full_speed.load(Ordering::Relaxed)
    }

    // ========== Diagnostics ==========

    pub fn buffer_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for ClipWorkflow {
    fn drop(&mut self) {
        self.stop();
    }
}
