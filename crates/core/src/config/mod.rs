use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BeatReelError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub transition: TransitionConfig,
    pub render: RenderConfig,
    pub record: RecordingSettings,
}

impl AppConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.fft_size < 64 || !audio.fft_size.is_power_of_two() {
            return Err(BeatReelError::InvalidInput(
                "fft_size must be a power of two of at least 64",
            ));
        }
        if !(0.0..1.0).contains(&audio.smoothing) {
            return Err(BeatReelError::InvalidInput(
                "smoothing must lie in [0, 1)",
            ));
        }
        if audio.min_decibels >= audio.max_decibels {
            return Err(BeatReelError::InvalidInput(
                "min_decibels must be below max_decibels",
            ));
        }
        if audio.bass_bins == 0 || audio.bass_bins > audio.fft_size / 2 {
            return Err(BeatReelError::InvalidInput(
                "bass_bins must be between 1 and fft_size / 2",
            ));
        }
        if self.render.width == 0 || self.render.height == 0 {
            return Err(BeatReelError::InvalidInput(
                "render surface must have non-zero dimensions",
            ));
        }
        if self.render.refresh_hz == 0 || self.record.fps == 0 {
            return Err(BeatReelError::InvalidInput(
                "refresh rate and capture fps must be non-zero",
            ));
        }
        if self.transition.enter_ms == 0 {
            return Err(BeatReelError::InvalidInput("enter_ms must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration specific to spectral sampling and beat detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Transform window in samples. Produces `fft_size / 2` bins.
    pub fft_size: usize,
    /// Exponential smoothing applied across successive windows.
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// Number of low bins averaged into the bass signal.
    pub bass_bins: usize,
    /// Bass average (0-255 scale) that must be exceeded to emit a beat.
    pub beat_threshold: f32,
    pub min_beat_interval_ms: u64,
    /// Whether the host exposes a frequency analyser at all.
    pub spectral_analysis: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.85,
            min_decibels: -100.0,
            max_decibels: -30.0,
            bass_bins: 32,
            beat_threshold: 130.0,
            min_beat_interval_ms: 600,
            spectral_analysis: true,
        }
    }
}

impl AudioConfig {
    pub fn min_beat_interval(&self) -> Duration {
        Duration::from_millis(self.min_beat_interval_ms)
    }
}

/// Timing constants of the transition state machine and the glow fade-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    pub min_commit_interval_ms: u64,
    pub enter_ms: u64,
    pub stabilize_ms: u64,
    pub glow_fade_delay_ms: u64,
    pub glow_fade_step_ms: u64,
    pub glow_fade_factor: f32,
    pub glow_floor: f32,
    pub glow_lifetime_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            min_commit_interval_ms: 1200,
            enter_ms: 600,
            stabilize_ms: 300,
            glow_fade_delay_ms: 100,
            glow_fade_step_ms: 30,
            glow_fade_factor: 0.95,
            glow_floor: 0.1,
            glow_lifetime_ms: 2000,
        }
    }
}

impl TransitionConfig {
    pub fn enter(&self) -> Duration {
        Duration::from_millis(self.enter_ms)
    }

    /// Entering plus stabilizing.
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.enter_ms + self.stabilize_ms)
    }

    pub fn min_commit_interval(&self) -> Duration {
        Duration::from_millis(self.min_commit_interval_ms)
    }
}

/// Render surface geometry and the display refresh the tick loop runs at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 360,
            height: 640,
            refresh_hz: 60,
        }
    }
}

/// Configuration options for the recording subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub fps: u32,
    /// Start capturing automatically when playback begins.
    pub auto_record: bool,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            auto_record: true,
        }
    }
}
