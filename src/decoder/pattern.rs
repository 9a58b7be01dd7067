//! Synthetic decoder producing deterministic frames
//!
//! **Why**: Scheduling, seeking and failure handling must be testable without
//! media files. A `pattern://` source behaves like a real backend (own thread,
//! startup latency, real-time pacing, end of stream) and fills every byte
//! of frame `n` with `n % 251`.
//!
//! URI form: `pattern://label?init_delay_ms=N&fail_at=F&fail_open=1`
//!
//! - `init_delay_ms`: delay before the decoder reports ready
//! - `fail_at`: source frame at which decoding fails
//! - `fail_open`: `open` itself fails

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use log::{debug, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{DecoderBackend, DecoderFactory, DecoderOptions};
use crate::core::clip_workflow::FrameSink;
use crate::entities::clip::Clip;
use crate::entities::frame::TrackType;
use crate::error::{Result, WorkflowError};
use crate::utils::{frames_to_ms, ms_to_frames};

pub const SCHEME: &str = "pattern://";

/// Byte value of every sample of source frame `frame`
pub fn pattern_value(frame: i64) -> u8 {
    frame.rem_euclid(251) as u8
}

/// Parsed `pattern://` URI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternSource {
    pub label: String,
    pub init_delay: Duration,
    pub fail_at: Option<i64>,
    pub fail_open: bool,
}

impl PatternSource {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| WorkflowError::DecodeInit(format!("not a pattern source: {uri}")))?;
        let (label, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut source = PatternSource {
            label: label.to_string(),
            ..Default::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let bad = || WorkflowError::DecodeInit(format!("bad value for '{key}' in {uri}"));
            match key {
                "init_delay_ms" => {
                    source.init_delay = Duration::from_millis(value.parse().map_err(|_| bad())?)
                }
                "fail_at" => source.fail_at = Some(value.parse().map_err(|_| bad())?),
                "fail_open" => source.fail_open = matches!(value, "1" | "true"),
                _ => return Err(WorkflowError::DecodeInit(format!("unknown key '{key}' in {uri}"))),
            }
        }
        Ok(source)
    }
}

enum Command {
    Play,
    Stop,
}

/// Backend for `pattern://` sources
pub struct PatternDecoder {
    kind: TrackType,
    source: Option<PatternSource>,
    options: Option<DecoderOptions>,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    ready: Arc<AtomicBool>,
    start_ms: Arc<AtomicI64>,
}

impl PatternDecoder {
    pub fn new(kind: TrackType) -> Self {
        Self {
            kind,
            source: None,
            options: None,
            commands: None,
            worker: None,
            ready: Arc::new(AtomicBool::new(false)),
            start_ms: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl DecoderBackend for PatternDecoder {
    fn open(&mut self, uri: &str, options: &DecoderOptions) -> Result<()> {
        let source = PatternSource::parse(uri)?;
        if source.fail_open {
            return Err(WorkflowError::DecodeInit(format!("cannot open {uri}")));
        }
        if options.format.kind() != self.kind {
            return Err(WorkflowError::DecodeInit(format!(
                "{:?} decoder given {:?} output",
                self.kind,
                options.format.kind()
            )));
        }
        debug!("Pattern '{}' opened [{}, {})", source.label, options.begin, options.end);
        self.source = Some(source);
        self.options = Some(*options);
        Ok(())
    }

    fn bind(&mut self, sink: FrameSink) -> Result<()> {
        let (Some(source), Some(options)) = (self.source.clone(), self.options) else {
            return Err(WorkflowError::DecodeInit("bind before open".into()));
        };
        let (tx, rx) = unbounded();
        let ready = Arc::clone(&self.ready);
        let start_ms = Arc::clone(&self.start_ms);
        let worker = thread::Builder::new()
            .name(format!("pattern-{}", source.label))
            .spawn(move || run(sink, source, options, rx, ready, start_ms))?;
        self.commands = Some(tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn set_position(&mut self, position_ms: i64) {
        self.start_ms.store(position_ms, Ordering::SeqCst);
    }

    fn play(&mut self) -> Result<()> {
        self.commands
            .as_ref()
            .and_then(|tx| tx.send(Command::Play).ok())
            .ok_or_else(|| WorkflowError::DecodeRuntime("pattern decoder not running".into()))
    }

    fn stop(&mut self) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::Stop);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.ready.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for PatternDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True if the worker must exit
fn stop_requested(rx: &Receiver<Command>) -> bool {
    matches!(rx.try_recv(), Ok(Command::Stop) | Err(TryRecvError::Disconnected))
}

fn run(
    sink: FrameSink,
    source: PatternSource,
    options: DecoderOptions,
    rx: Receiver<Command>,
    ready: Arc<AtomicBool>,
    start_ms: Arc<AtomicI64>,
) {
    let mut playing = false;
    if !source.init_delay.is_zero() {
        match rx.recv_timeout(source.init_delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::Play) => playing = true,
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    ready.store(true, Ordering::SeqCst);
    sink.signal_ready();

    while !playing {
        match rx.recv() {
            Ok(Command::Play) => playing = true,
            Ok(Command::Stop) | Err(_) => return,
        }
    }

    let fps = options.format.fps();
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let mut frame = ms_to_frames(start_ms.load(Ordering::SeqCst), fps);
    trace!("Pattern '{}' playing from {}", source.label, frame);

    loop {
        if stop_requested(&rx) {
            return;
        }
        let Some(mut slot) = sink.lock() else {
            return;
        };
        if let Some(target) = slot.seek_target() {
            frame = ms_to_frames(target, fps);
            trace!("Pattern '{}' seek to {}", source.label, frame);
        }
        if frame >= options.length() {
            drop(slot);
            sink.end_of_stream();
            return;
        }
        let absolute = options.begin + frame;
        if source.fail_at.is_some_and(|f| absolute >= f) {
            drop(slot);
            sink.fail(format!("pattern '{}' failed at frame {}", source.label, absolute));
            return;
        }
        slot.data_mut().fill(pattern_value(absolute));
        slot.commit(frames_to_ms(absolute, fps));
        frame += 1;

        if !sink.full_speed() {
            match rx.recv_timeout(period) {
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Ok(Command::Play) | Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

/// Creates [`PatternDecoder`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternDecoderFactory;

impl DecoderFactory for PatternDecoderFactory {
    fn create(&self, clip: &Clip, kind: TrackType) -> Result<Box<dyn DecoderBackend>> {
        if !clip.uri.starts_with(SCHEME) {
            return Err(WorkflowError::DecodeInit(format!("not a pattern source: {}", clip.uri)));
        }
        Ok(Box::new(PatternDecoder::new(kind)))
    }
}
