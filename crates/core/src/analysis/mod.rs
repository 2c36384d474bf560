use std::{f32::consts::PI, fmt, sync::Arc, time::Duration};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{AnalysisNode, AudioConfig, BeatReelError, Result};

/// Byte-scaled magnitudes (0-255) for one transform window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioFrame {
    pub bins: Vec<u8>,
}

impl AudioFrame {
    pub fn silent(bins: usize) -> Self {
        Self {
            bins: vec![0; bins],
        }
    }

    /// Mean of the lowest `count` bins.
    pub fn bass_average(&self, count: usize) -> f32 {
        let band = &self.bins[..count.min(self.bins.len())];
        if band.is_empty() {
            return 0.0;
        }
        band.iter().map(|&value| f32::from(value)).sum::<f32>() / band.len() as f32
    }

    /// Down-samples the spectrum to `count` bars normalised to [0, 1], taking
    /// every n-th bin.
    pub fn bars(&self, count: usize) -> Vec<f32> {
        if count == 0 || self.bins.is_empty() {
            return Vec::new();
        }
        let step = (self.bins.len() / count).max(1);
        (0..count)
            .map(|i| {
                self.bins
                    .get(i * step)
                    .map(|&value| f32::from(value) / 255.0)
                    .unwrap_or(0.0)
            })
            .collect()
    }
}

/// Discrete beat signal. Consumed or dropped immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatEvent {
    pub timestamp: Duration,
    /// Strength in [0, 1].
    pub intensity: f32,
}

/// Threshold plus cooldown detector over the bass band.
///
/// The cooldown is measured from the last accepted beat and survives pauses.
#[derive(Debug, Clone)]
pub struct BeatDetector {
    threshold: f32,
    min_interval: Duration,
    bass_bins: usize,
    last_beat: Option<Duration>,
}

const INTENSITY_CEILING: f32 = 0.9;

impl BeatDetector {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            threshold: config.beat_threshold,
            min_interval: config.min_beat_interval(),
            bass_bins: config.bass_bins,
            last_beat: None,
        }
    }

    pub fn last_beat(&self) -> Option<Duration> {
        self.last_beat
    }

    pub fn detect(&mut self, frame: &AudioFrame, now: Duration) -> Option<BeatEvent> {
        let bass = frame.bass_average(self.bass_bins);
        self.detect_level(bass, now)
    }

    /// Same as [`detect`](Self::detect) for an already averaged bass level.
    pub fn detect_level(&mut self, bass: f32, now: Duration) -> Option<BeatEvent> {
        if bass <= self.threshold {
            return None;
        }
        if let Some(last) = self.last_beat {
            if now.saturating_sub(last) < self.min_interval {
                return None;
            }
        }

        let span = (255.0 - self.threshold).max(f32::EPSILON);
        let intensity = ((bass - self.threshold) / span).clamp(0.0, 1.0) * INTENSITY_CEILING;
        self.last_beat = Some(now);
        tracing::debug!(bass, intensity, at_ms = now.as_millis() as u64, "beat detected");
        Some(BeatEvent {
            timestamp: now,
            intensity,
        })
    }
}

/// Per-tick spectral sampling and beat detection.
///
/// Each call to [`sample`](Self::sample) transforms the newest window of the
/// analysis tap, smooths it against the previous window and scales the result
/// to bytes the same way a browser analyser does. When the host offers no
/// analyser the engine stays silent and never emits beats.
pub struct AudioAnalysisEngine {
    config: AudioConfig,
    node: Option<AnalysisNode>,
    detector: BeatDetector,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl AudioAnalysisEngine {
    /// Builds the engine from the outcome of tapping the audio graph.
    ///
    /// A failed tap is logged once and leaves the engine disabled. A window
    /// size the transform cannot use is an error either way.
    pub fn new(config: &AudioConfig, tap: Result<AnalysisNode>) -> Result<Self> {
        let node = match tap {
            Ok(node) => Some(node),
            Err(BeatReelError::AudioUnsupported) => {
                tracing::warn!("spectral analysis unavailable; beat detection disabled");
                None
            }
            Err(err) => {
                tracing::warn!(%err, "analysis tap failed; beat detection disabled");
                None
            }
        };
        Self::build(config, node)
    }

    pub fn with_node(config: &AudioConfig, node: AnalysisNode) -> Result<Self> {
        Self::build(config, Some(node))
    }

    fn build(config: &AudioConfig, node: Option<AnalysisNode>) -> Result<Self> {
        let size = config.fft_size;
        if size < 2 || !size.is_power_of_two() {
            return Err(BeatReelError::InvalidInput(
                "fft_size must be a power of two",
            ));
        }
        if config.bass_bins == 0 || config.bass_bins > size / 2 {
            return Err(BeatReelError::InvalidInput(
                "bass_bins must be between 1 and fft_size / 2",
            ));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let fft = FftResources {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Ok(Self {
            config: config.clone(),
            node,
            detector: BeatDetector::new(config),
            window: (0..size).map(|i| blackman_value(i, size)).collect(),
            smoothed: vec![0.0; size / 2],
            fft,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.node.is_some()
    }

    pub fn bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    pub fn detector(&self) -> &BeatDetector {
        &self.detector
    }

    /// Takes a frequency-domain snapshot of the newest window.
    pub fn sample(&mut self) -> Result<AudioFrame> {
        let Some(node) = self.node.as_ref() else {
            return Ok(AudioFrame::silent(self.bin_count()));
        };

        node.snapshot(&mut self.fft.input)?;
        for (sample, weight) in self.fft.input.iter_mut().zip(&self.window) {
            *sample *= weight;
        }
        self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        )?;

        let size = self.config.fft_size as f32;
        let tau = self.config.smoothing;
        let floor = self.config.min_decibels;
        let range = self.config.max_decibels - self.config.min_decibels;

        let bins = self
            .smoothed
            .iter_mut()
            .zip(&self.fft.spectrum)
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() / size;
                *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
                byte_from_magnitude(*smoothed, floor, range)
            })
            .collect();

        Ok(AudioFrame { bins })
    }

    /// Applies the bass threshold and cooldown to `frame`.
    pub fn detect_beat(&mut self, frame: &AudioFrame, now: Duration) -> Option<BeatEvent> {
        if !self.is_enabled() {
            return None;
        }
        self.detector.detect(frame, now)
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for AudioAnalysisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioAnalysisEngine")
            .field("fft_size", &self.config.fft_size)
            .field("enabled", &self.is_enabled())
            .field("detector", &self.detector)
            .finish()
    }
}

fn byte_from_magnitude(magnitude: f32, floor: f32, range: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - floor) / range;
    scaled.clamp(0.0, 255.0) as u8
}

fn blackman_value(index: usize, len: usize) -> f32 {
    let x = index as f32 / len as f32;
    0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioSource, NullOutput, SharedAudioGraph, SourceId};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn frame_with_bass(level: u8) -> AudioFrame {
        let mut frame = AudioFrame::silent(128);
        frame.bins[..32].fill(level);
        frame
    }

    #[test]
    fn quiet_bass_never_fires() {
        let mut detector = BeatDetector::new(&AudioConfig::default());
        for (i, level) in (0..=130u8).enumerate() {
            let now = ms(10_000 * i as u64);
            assert!(detector.detect(&frame_with_bass(level), now).is_none());
        }
    }

    #[test]
    fn beats_respect_the_cooldown() {
        let mut detector = BeatDetector::new(&AudioConfig::default());
        let mut emitted = Vec::new();
        for step in 0..400u64 {
            let level = if step % 3 == 0 { 200 } else { 180 };
            if let Some(beat) = detector.detect(&frame_with_bass(level), ms(step * 17)) {
                emitted.push(beat.timestamp);
            }
        }
        assert!(emitted.len() > 5);
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= ms(600));
        }
    }

    #[test]
    fn first_crossing_fires_and_suppresses_the_next() {
        let mut detector = BeatDetector::new(&AudioConfig::default());
        let samples = [(80.0, 0), (140.0, 100), (145.0, 650), (90.0, 1300)];
        let fired: Vec<_> = samples
            .iter()
            .filter_map(|&(bass, at)| detector.detect_level(bass, ms(at)))
            .collect();

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].timestamp, ms(100));
    }

    #[test]
    fn intensity_scales_to_ceiling() {
        let mut detector = BeatDetector::new(&AudioConfig::default());
        let beat = detector.detect(&frame_with_bass(255), ms(0)).unwrap();
        approx::assert_relative_eq!(beat.intensity, 0.9, epsilon = 1e-6);

        let beat = detector.detect_level(192.5, ms(1_000)).unwrap();
        approx::assert_relative_eq!(beat.intensity, 0.45, epsilon = 1e-6);
    }

    #[test]
    fn bars_pick_every_nth_bin() {
        let frame = AudioFrame {
            bins: (0..128).map(|i| i as u8).collect(),
        };
        let bars = frame.bars(64);
        assert_eq!(bars.len(), 64);
        approx::assert_relative_eq!(bars[1], 2.0 / 255.0);
    }

    fn engine_over(samples: Vec<f32>, sample_rate: u32) -> (SharedAudioGraph, AudioAnalysisEngine) {
        let config = AudioConfig::default();
        let mut graph = SharedAudioGraph::new(Box::new(NullOutput));
        let source = AudioSource::new(SourceId(7), sample_rate, samples);
        let handle = graph.acquire(&source).unwrap();
        let tap = graph.tap_analysis(&handle, config.fft_size);
        let engine = AudioAnalysisEngine::new(&config, tap).unwrap();
        (graph, engine)
    }

    #[test]
    fn silence_yields_an_empty_spectrum() {
        let (mut graph, mut engine) = engine_over(vec![0.0; 1024], 8_000);
        graph.pump(512).unwrap();
        let frame = engine.sample().unwrap();
        assert_eq!(frame.bins.len(), 128);
        assert!(frame.bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn low_sine_lights_up_the_bass_band() {
        let rate = 8_000;
        let samples: Vec<f32> = (0..rate)
            .map(|i| 0.8 * (2.0 * PI * 150.0 * i as f32 / rate as f32).sin())
            .collect();
        let (mut graph, mut engine) = engine_over(samples, rate);

        let mut frame = AudioFrame::default();
        for _ in 0..20 {
            graph.pump(256).unwrap();
            frame = engine.sample().unwrap();
        }

        let peak = frame.bins[..8].iter().copied().max().unwrap();
        assert!(peak > 200, "peak byte was {peak}");
        assert!(frame.bass_average(32) > frame.bins[96..].iter().map(|&b| f32::from(b)).sum::<f32>() / 32.0);
    }

    #[test]
    fn unsupported_host_never_emits() {
        let config = AudioConfig::default();
        let mut engine =
            AudioAnalysisEngine::new(&config, Err(BeatReelError::AudioUnsupported)).unwrap();
        assert!(!engine.is_enabled());
        let frame = engine.sample().unwrap();
        assert_eq!(frame, AudioFrame::silent(128));
        assert!(engine.detect_beat(&frame_with_bass(255), ms(0)).is_none());
    }

    #[test]
    fn rejects_window_sizes_the_transform_cannot_use() {
        for fft_size in [0, 1, 300] {
            let config = AudioConfig {
                fft_size,
                ..AudioConfig::default()
            };
            let err = AudioAnalysisEngine::new(&config, Err(BeatReelError::AudioUnsupported))
                .unwrap_err();
            assert!(matches!(err, BeatReelError::InvalidInput(_)), "fft_size {fft_size}");
        }

        let config = AudioConfig {
            fft_size: 64,
            bass_bins: 33,
            ..AudioConfig::default()
        };
        assert!(AudioAnalysisEngine::new(&config, Err(BeatReelError::AudioUnsupported)).is_err());
    }
}
