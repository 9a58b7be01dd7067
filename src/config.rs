//! Project/track configuration provider
//!
//! **Why**: Clip and track workflows need a fixed output format (frame size,
//! pixel size, rate, audio layout) and a few engine knobs. They read them once
//! at construction; persistence of these settings belongs to the host.
//!
//! **Used by**: ClipWorkflow, TrackWorkflow, MainWorkflow
//!
//! Lookup priority for `resolve`: explicit path → `TRACKFLOW_CONFIG` env var → defaults.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::entities::frame::{OutputFormat, TrackType};
use crate::error::WorkflowError;

/// Environment variable naming a settings file
pub const CONFIG_ENV: &str = "TRACKFLOW_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel (3 = RGB24)
    pub pixel_size: u32,
    pub fps: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Buffers per clip pool
    pub nb_buffers: usize,
    /// Frames of lookahead before a clip's decoder is started
    pub preload_window: i64,
    pub render_timeout_ms: u64,
    pub init_timeout_ms: u64,
    /// Decoders ignore real-time pacing
    pub full_speed_render: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_size: 3,
            fps: 30.0,
            sample_rate: 48000,
            channels: 2,
            nb_buffers: 5,
            preload_window: 60,
            render_timeout_ms: 2000,
            init_timeout_ms: 5000,
            full_speed_render: false,
        }
    }
}

impl WorkflowSettings {
    /// Output format for tracks of `kind`
    pub fn output_format(&self, kind: TrackType) -> OutputFormat {
        match kind {
            TrackType::Video => OutputFormat::Video {
                width: self.width,
                height: self.height,
                pixel_size: self.pixel_size,
                fps: self.fps,
            },
            TrackType::Audio => OutputFormat::Audio {
                sample_rate: self.sample_rate,
                channels: self.channels,
                fps: self.fps,
            },
        }
    }

    pub fn validate(&self) -> std::result::Result<(), WorkflowError> {
        let fail = |msg: &str| Err(WorkflowError::Config(msg.to_string()));
        if self.width == 0 || self.height == 0 || self.pixel_size == 0 {
            return fail("frame size must be non-zero");
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return fail("fps must be positive");
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return fail("audio layout must be non-zero");
        }
        if self.nb_buffers == 0 {
            return fail("nb_buffers must be at least 1");
        }
        if self.preload_window < 0 {
            return fail("preload_window must not be negative");
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write settings: {}", path.display()))
    }

    /// Settings from `explicit`, else from `$TRACKFLOW_CONFIG`, else defaults.
    /// An unreadable file is logged and replaced by defaults.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let path = explicit.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        match path {
            Some(path) => match Self::load(&path) {
                Ok(settings) => {
                    info!("Settings loaded from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("{:#}; using defaults", e);
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::resolve(None)
    }
}
