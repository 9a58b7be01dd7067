//! FFmpeg-backed video decoder (feature `ffmpeg`)
//!
//! Decodes the best video stream of a file, scales every frame to the track's
//! RGB24 output size and pushes it through the clip's sink. The input is
//! checked in `open` and re-opened on the worker thread, which owns all FFmpeg
//! state for the session.
//!
//! Audio sources are not handled here: the factory reports them as
//! `DecodeInit` failures and the clip falls back to silence.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::{debug, warn};
use playa_ffmpeg as ffmpeg;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{DecoderBackend, DecoderFactory, DecoderOptions};
use crate::core::clip_workflow::FrameSink;
use crate::entities::clip::Clip;
use crate::entities::frame::{OutputFormat, TrackType};
use crate::error::{Result, WorkflowError};
use crate::utils::{frames_to_ms, ms_to_frames};

static FFMPEG_LOG_INIT: Once = Once::new();

fn quiet_ffmpeg() {
    FFMPEG_LOG_INIT.call_once(|| unsafe {
        ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
    });
}

fn init_err(context: &str, e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::DecodeInit(format!("{context}: {e}"))
}

fn runtime_err(context: &str, e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::DecodeRuntime(format!("{context}: {e}"))
}

enum Command {
    Play,
    Stop,
}

pub struct FfmpegDecoder {
    path: Option<PathBuf>,
    options: Option<DecoderOptions>,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    ready: Arc<AtomicBool>,
    start_ms: Arc<AtomicI64>,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            path: None,
            options: None,
            commands: None,
            worker: None,
            ready: Arc::new(AtomicBool::new(false)),
            start_ms: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderBackend for FfmpegDecoder {
    fn open(&mut self, uri: &str, options: &DecoderOptions) -> Result<()> {
        quiet_ffmpeg();
        if !matches!(options.format, OutputFormat::Video { pixel_size: 3, .. }) {
            return Err(WorkflowError::DecodeInit("ffmpeg backend outputs RGB24 video only".into()));
        }
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        let ictx = ffmpeg::format::input(&path).map_err(|e| init_err("open", e))?;
        ictx.streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| WorkflowError::DecodeInit(format!("no video stream in {}", path.display())))?;
        debug!("FFmpeg opened {} [{}, {})", path.display(), options.begin, options.end);
        self.path = Some(path);
        self.options = Some(*options);
        Ok(())
    }

    fn bind(&mut self, sink: FrameSink) -> Result<()> {
        let (Some(path), Some(options)) = (self.path.clone(), self.options) else {
            return Err(WorkflowError::DecodeInit("bind before open".into()));
        };
        let (tx, rx) = unbounded();
        let ready = Arc::clone(&self.ready);
        let start_ms = Arc::clone(&self.start_ms);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let worker = thread::Builder::new()
            .name(format!("ffmpeg-{name}"))
            .spawn(move || {
                if let Err(e) = run(&sink, &path, options, rx, ready, start_ms) {
                    sink.fail(e.to_string());
                }
            })?;
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
            .ok_or_else(|| WorkflowError::DecodeRuntime("ffmpeg decoder not running".into()))
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

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decoder state owned by the worker thread
/// Stream timestamp to a frame index at `fps`
fn pts_to_frame(pts: i64, time_base: f64, fps: f64) -> i64 {
    (pts as f64 * time_base * fps).round() as i64
}

/// Frame index at `fps` to a stream timestamp, 0 when either rate is unknown
fn frame_to_pts(frame: i64, time_base: f64, fps: f64) -> i64 {
    if time_base > 0.0 && fps > 0.0 {
        (frame as f64 / fps / time_base) as i64
    } else {
        0
    }
}

struct Session {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_idx: usize,
    /// Seconds per stream tick
    time_base: f64,
    fps: f64,
    width: usize,
    height: usize,
    drained: bool,
}

impl Session {
    fn open(path: &PathBuf, format: OutputFormat) -> Result<Self> {
        let OutputFormat::Video { width, height, .. } = format else {
            return Err(WorkflowError::DecodeInit("video output expected".into()));
        };
        let ictx = ffmpeg::format::input(path).map_err(|e| init_err("open", e))?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| WorkflowError::DecodeInit("no video stream".into()))?;
        let stream_idx = stream.index();
        let tb = stream.time_base();
        let time_base = tb.numerator() as f64 / tb.denominator().max(1) as f64;
        // Frame indices are counted at the timeline rate, the same grid the
        // run loop uses for the frames it wants
        let fps = format.fps();

        let mut decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| init_err("decoder context", e))?;
        unsafe {
            (*decoder_ctx.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*decoder_ctx.as_mut_ptr()).thread_count = 0;
        }
        let decoder = decoder_ctx.decoder().video().map_err(|e| init_err("video decoder", e))?;
        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| init_err("scaler", e))?;

        Ok(Self {
            ictx,
            decoder,
            scaler,
            stream_idx,
            time_base,
            fps,
            width: width as usize,
            height: height as usize,
            drained: false,
        })
    }

    fn frame_of(&self, pts: i64) -> i64 {
        pts_to_frame(pts, self.time_base, self.fps)
    }

    /// Seek to the keyframe before `frame`; frames before it are skipped by the caller
    fn seek(&mut self, frame: i64) {
        let target = frame_to_pts(frame, self.time_base, self.fps);
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.ictx.as_mut_ptr(),
                self.stream_idx as i32,
                target,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            warn!("FFmpeg seek to frame {} failed (ret={})", frame, ret);
        }
        self.decoder.flush();
        self.drained = false;
    }

    /// Next decoded frame with its source frame index, None at end of stream
    fn next_frame(&mut self) -> Result<Option<(ffmpeg::util::frame::video::Video, i64)>> {
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let index = decoded.pts().map(|pts| self.frame_of(pts)).unwrap_or(0);
                return Ok(Some((decoded, index)));
            }
            if self.drained {
                return Ok(None);
            }
            let next = self
                .ictx
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((idx, packet)) if idx == self.stream_idx => {
                    self.decoder.send_packet(&packet).map_err(|e| runtime_err("send packet", e))?;
                }
                Some(_) => {}
                None => {
                    self.drained = true;
                    let _ = self.decoder.send_eof();
                }
            }
        }
    }

    /// Scale `decoded` into `dst` (packed RGB24 rows)
    fn write_rgb(&mut self, decoded: &ffmpeg::util::frame::video::Video, dst: &mut [u8]) -> Result<()> {
        let mut rgb = ffmpeg::util::frame::video::Video::empty();
        self.scaler.run(decoded, &mut rgb).map_err(|e| runtime_err("scale", e))?;
        let stride = rgb.stride(0);
        let row = self.width * 3;
        let src = rgb.data(0);
        for (y, out) in dst.chunks_exact_mut(row).take(self.height).enumerate() {
            out.copy_from_slice(&src[y * stride..y * stride + row]);
        }
        Ok(())
    }
}

fn stop_requested(rx: &Receiver<Command>) -> bool {
    matches!(rx.try_recv(), Ok(Command::Stop) | Err(TryRecvError::Disconnected))
}

fn run(
    sink: &FrameSink,
    path: &PathBuf,
    options: DecoderOptions,
    rx: Receiver<Command>,
    ready: Arc<AtomicBool>,
    start_ms: Arc<AtomicI64>,
) -> Result<()> {
    let mut session = Session::open(path, options.format)?;
    ready.store(true, Ordering::SeqCst);
    sink.signal_ready();

    match rx.recv() {
        Ok(Command::Play) => {}
        Ok(Command::Stop) | Err(_) => return Ok(()),
    }

    let fps = options.format.fps();
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let mut wanted = options.begin + ms_to_frames(start_ms.load(Ordering::SeqCst), fps);
    session.seek(wanted);
    let mut next_due = Instant::now();

    loop {
        if stop_requested(&rx) {
            return Ok(());
        }
        let Some(mut slot) = sink.lock() else {
            return Ok(());
        };
        if let Some(target) = slot.seek_target() {
            wanted = options.begin + ms_to_frames(target, fps);
            session.seek(wanted);
        }
        let decoded = loop {
            match session.next_frame()? {
                Some((frame, index)) if index < wanted => drop(frame),
                other => break other,
            }
        };
        let Some((frame, index)) = decoded else {
            drop(slot);
            sink.end_of_stream();
            return Ok(());
        };
        if index >= options.end {
            drop(slot);
            sink.end_of_stream();
            return Ok(());
        }
        session.write_rgb(&frame, slot.data_mut())?;
        slot.commit(frames_to_ms(index, fps));
        wanted = index + 1;

        if !sink.full_speed() {
            next_due += period;
            let now = Instant::now();
            if next_due > now {
                thread::sleep(next_due - now);
            } else {
                next_due = now;
            }
        }
    }
}

/// Creates [`FfmpegDecoder`]s for video tracks
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegDecoderFactory;

impl DecoderFactory for FfmpegDecoderFactory {
    fn create(&self, clip: &Clip, kind: TrackType) -> Result<Box<dyn DecoderBackend>> {
        match kind {
            TrackType::Video => Ok(Box::new(FfmpegDecoder::new())),
            TrackType::Audio => Err(WorkflowError::DecodeInit(format!(
                "audio decoding not supported for {}",
                clip.uri
            ))),
        }
    }
}
