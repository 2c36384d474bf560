//! Playback session: one tick runs sample, detect, animate, render and capture
//! in that order.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    AppConfig, Artifact, AudioAnalysisEngine, AudioSource, BeatReceiver, BeatSignal,
    CaptureRecorder, FrameCompositor, FrameTicker, GraphHandle, NullOutput, Result,
    SharedAudioGraph, Surface, TransitionAnimator, VideoSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    /// The source ran out or playback was stopped; the graph is closed.
    Ended,
}

/// Owns every component of one slideshow run over one audio source.
pub struct BeatReelSession {
    config: AppConfig,
    graph: SharedAudioGraph,
    source: AudioSource,
    handle: Option<GraphHandle>,
    engine: Option<AudioAnalysisEngine>,
    signal: BeatSignal,
    receiver: BeatReceiver,
    animator: TransitionAnimator,
    compositor: FrameCompositor,
    surface: Surface,
    recorder: CaptureRecorder,
    state: PlaybackState,
    played: Duration,
    resumed_at: Option<Duration>,
    frames: u64,
    beats: u64,
}

impl BeatReelSession {
    pub fn new(
        config: AppConfig,
        graph: SharedAudioGraph,
        source: AudioSource,
        animator: TransitionAnimator,
        recorder: CaptureRecorder,
    ) -> Result<Self> {
        config.validate()?;
        let signal = BeatSignal::new();
        let receiver = signal.subscribe()?;
        let surface = FrameCompositor::surface(&config.render);
        Ok(Self {
            config,
            graph,
            source,
            handle: None,
            engine: None,
            signal,
            receiver,
            animator,
            compositor: FrameCompositor::new(),
            surface,
            recorder,
            state: PlaybackState::Stopped,
            played: Duration::ZERO,
            resumed_at: None,
            frames: 0,
            beats: 0,
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn animator(&self) -> &TransitionAnimator {
        &self.animator
    }

    pub fn animator_mut(&mut self) -> &mut TransitionAnimator {
        &mut self.animator
    }

    pub fn graph(&self) -> &SharedAudioGraph {
        &self.graph
    }

    /// Wiring acquired by the first `play`.
    pub fn handle(&self) -> Option<&GraphHandle> {
        self.handle.as_ref()
    }

    pub fn recorder(&self) -> &CaptureRecorder {
        &self.recorder
    }

    pub fn signal(&self) -> &BeatSignal {
        &self.signal
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// Beats emitted by the analysis engine so far.
    pub fn beats_detected(&self) -> u64 {
        self.beats
    }

    /// Audio time covered at `now`. Does not move while paused.
    pub fn position(&self, now: Duration) -> Duration {
        match self.resumed_at {
            Some(at) => self.played + now.saturating_sub(at),
            None => self.played,
        }
    }

    /// Starts or resumes playback. The first start wires the graph, taps the
    /// analyser once and begins recording when the playlist has images.
    pub fn play(&mut self, now: Duration) -> Result<()> {
        match self.state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Ended => {
                tracing::debug!("play ignored: session has ended");
                return Ok(());
            }
            PlaybackState::Stopped | PlaybackState::Paused => {}
        }

        let handle = self.graph.acquire(&self.source)?;
        if self.engine.is_none() {
            let tap = self.graph.tap_analysis(&handle, self.config.audio.fft_size);
            self.engine = Some(AudioAnalysisEngine::new(&self.config.audio, tap)?);
        }

        if self.state == PlaybackState::Stopped
            && self.config.record.auto_record
            && !self.animator.playlist().is_empty()
            && !self.recorder.is_recording()
        {
            let tap = self.graph.capture_stream(&handle)?;
            let video = VideoSource::of(&self.surface, self.config.record.fps);
            if let Err(err) = self.recorder.start(video, tap, now) {
                tracing::error!(error = %err, "recording could not start; playing without it");
            }
        }

        if self.state == PlaybackState::Paused {
            self.recorder.resume(now);
        }

        self.handle = Some(handle);
        self.resumed_at = Some(now);
        self.state = PlaybackState::Playing;
        tracing::info!(at_ms = self.played.as_millis() as u64, "playback started");
        Ok(())
    }

    /// Suspends ticks. Analysis and transition state are kept as they are,
    /// and the recording skips the paused span.
    pub fn pause(&mut self, now: Duration) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.recorder.pause(now);
        self.played = self.position(now);
        self.resumed_at = None;
        self.state = PlaybackState::Paused;
        tracing::info!(at_ms = self.played.as_millis() as u64, "playback paused");
    }

    /// Ends playback and finalizes the recording, if any.
    pub fn stop(&mut self, now: Duration) -> Option<Artifact> {
        if matches!(self.state, PlaybackState::Ended) {
            return None;
        }
        self.played = self.position(now);
        self.resumed_at = None;
        self.end()
    }

    fn end(&mut self) -> Option<Artifact> {
        self.state = PlaybackState::Ended;
        let artifact = if self.recorder.is_recording() {
            self.recorder.stop()
        } else {
            None
        };
        self.graph.teardown();
        tracing::info!(
            frames = self.frames,
            beats = self.beats,
            commits = self.animator.commits(),
            "playback ended"
        );
        artifact
    }

    /// Runs one tick at `now`. Returns the artifact when this tick ended playback.
    pub fn tick(&mut self, now: Duration) -> Result<Option<Artifact>> {
        if self.state != PlaybackState::Playing {
            return Ok(None);
        }

        let target = (self.position(now).as_secs_f64() * f64::from(self.source.sample_rate()))
            as usize;
        let due = target.saturating_sub(self.graph.position());
        if due > 0 {
            self.graph.pump(due)?;
        }

        if let Some(engine) = self.engine.as_mut() {
            let frame = engine.sample()?;
            if let Some(event) = engine.detect_beat(&frame, now) {
                self.beats += 1;
                self.signal.emit(event)?;
            }
        }
        if let Some(event) = self.receiver.take()? {
            self.animator.on_beat(event, now);
        }
        self.animator.advance(now);

        let input = self.animator.render_input(now);
        self.compositor
            .render(&mut self.surface, self.animator.current_asset(), &input)?;
        self.frames += 1;

        if self.recorder.is_recording() {
            if let Err(err) = self.recorder.capture(&self.surface, now) {
                tracing::warn!(error = %err, "frame capture failed");
            }
        }

        if self.graph.is_exhausted() {
            self.played = self.position(now);
            self.resumed_at = None;
            return Ok(self.end());
        }
        Ok(None)
    }
}

impl std::fmt::Debug for BeatReelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatReelSession")
            .field("state", &self.state)
            .field("graph", &self.graph)
            .field("animator", &self.animator)
            .field("recorder", &self.recorder)
            .field("frames", &self.frames)
            .finish()
    }
}

/// One detected beat, in a form suited to JSON reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatMark {
    pub timestamp_ms: u64,
    pub intensity: f32,
}

/// Runs analysis alone over `source`, ticking at the display refresh rate.
pub fn beat_report(config: &AppConfig, source: &AudioSource) -> Result<Vec<BeatMark>> {
    config.validate()?;
    let mut graph = if config.audio.spectral_analysis {
        SharedAudioGraph::new(Box::new(NullOutput))
    } else {
        SharedAudioGraph::without_spectral_analysis(Box::new(NullOutput))
    };
    let handle = graph.acquire(source)?;
    let tap = graph.tap_analysis(&handle, config.audio.fft_size);
    let mut engine = AudioAnalysisEngine::new(&config.audio, tap)?;
    let rate = f64::from(source.sample_rate());

    let mut marks = Vec::new();
    for now in FrameTicker::new(config.render.refresh_hz) {
        let target = (now.as_secs_f64() * rate) as usize;
        graph.pump(target.saturating_sub(graph.position()))?;
        let frame = engine.sample()?;
        if let Some(beat) = engine.detect_beat(&frame, now) {
            marks.push(BeatMark {
                timestamp_ms: beat.timestamp.as_millis() as u64,
                intensity: beat.intensity,
            });
        }
        if graph.is_exhausted() {
            break;
        }
    }
    graph.teardown();
    tracing::info!(beats = marks.len(), "beat report complete");
    Ok(marks)
}
