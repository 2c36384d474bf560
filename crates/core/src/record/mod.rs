//! Recording of the composited surface plus the mixed audio into one artifact.

mod ffmpeg;

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::{BeatReelError, CaptureTap, FramePacer, RecordingSettings, Result};

pub use ffmpeg::{is_ffmpeg_on_path, FfmpegCapture};

/// Container and codec combination, in selection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mp4H264,
    Mp4,
    WebmVp9,
    Webm,
    /// Whatever the backend produces when nothing else is supported.
    PlatformDefault,
}

impl ContainerFormat {
    pub const PRIORITY: [ContainerFormat; 5] = [
        ContainerFormat::Mp4H264,
        ContainerFormat::Mp4,
        ContainerFormat::WebmVp9,
        ContainerFormat::Webm,
        ContainerFormat::PlatformDefault,
    ];

    pub fn mime(self) -> &'static str {
        match self {
            ContainerFormat::Mp4H264 => "video/mp4; codecs=\"avc1.42E01E\"",
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::WebmVp9 => "video/webm; codecs=\"vp9\"",
            ContainerFormat::Webm => "video/webm",
            ContainerFormat::PlatformDefault => "",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4H264 | ContainerFormat::Mp4 => "mp4",
            ContainerFormat::WebmVp9 | ContainerFormat::Webm | ContainerFormat::PlatformDefault => {
                "webm"
            }
        }
    }
}

/// Shape of the captured frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSource {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl VideoSource {
    pub fn of(surface: &RgbaImage, fps: u32) -> Self {
        Self {
            width: surface.width(),
            height: surface.height(),
            fps: fps.max(1),
        }
    }
}

/// Encoder capability. Implementations decide which containers they can mux.
pub trait CaptureBackend: Send {
    fn name(&self) -> &str;

    fn supports(&self, format: ContainerFormat) -> bool;

    fn open(
        &mut self,
        format: ContainerFormat,
        video: &VideoSource,
        audio_sample_rate: u32,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// One open encoding stream. Segments come out in order, whenever the
/// encoder has produced them.
pub trait CaptureStream: Send {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    fn write_audio(&mut self, samples: &[f32]) -> Result<()>;

    /// Segments produced since the previous poll.
    fn poll_segments(&mut self) -> Vec<Vec<u8>>;

    /// Flushes the encoder and returns every segment not yet polled.
    fn finish(self: Box<Self>) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

/// Frames, audio and the ordered segment buffer of one recording.
pub struct RecordingSession {
    video: VideoSource,
    audio: CaptureTap,
    format: ContainerFormat,
    segments: Vec<Vec<u8>>,
    state: RecorderState,
    stream: Option<Box<dyn CaptureStream>>,
    pacer: FramePacer,
    audio_written: u64,
}

impl RecordingSession {
    pub fn video(&self) -> VideoSource {
        self.video
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn frames_written(&self) -> u64 {
        self.pacer.emitted()
    }

    /// Mono samples the encoder has accepted.
    pub fn audio_samples_written(&self) -> u64 {
        self.audio_written
    }

    /// Video stream time covered by the frames written so far.
    pub fn video_time(&self) -> Duration {
        self.pacer.covered()
    }

    /// Audio stream time covered by the samples written so far.
    pub fn audio_time(&self) -> Duration {
        let rate = u64::from(self.audio.sample_rate().max(1));
        Duration::from_nanos(self.audio_written.saturating_mul(1_000_000_000) / rate)
    }

    pub fn is_paused(&self) -> bool {
        self.pacer.is_paused()
    }

    fn flush_audio(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let samples = self.audio.drain()?;
        if samples.is_empty() {
            return Ok(());
        }
        if let Err(err) = stream.write_audio(&samples) {
            self.audio.requeue(samples)?;
            return Err(err);
        }
        self.audio_written += samples.len() as u64;
        Ok(())
    }

    /// Closes the stream, keeping every segment it still had buffered.
    fn close(&mut self) -> Result<()> {
        let flushed = self.flush_audio();
        let finished = match self.stream.take() {
            Some(stream) => stream.finish().map(|tail| self.segments.extend(tail)),
            None => Ok(()),
        };
        self.state = RecorderState::Stopped;
        flushed.and(finished)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.stream.is_some() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "recording session closed with an error");
            }
        }
    }
}

impl fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("video", &self.video)
            .field("format", &self.format)
            .field("segments", &self.segments.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Final immutable output of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Vec<u8>,
    format: ContainerFormat,
}

impl Artifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes the artifact next to `stem`, with the container's extension.
    pub fn save(&self, stem: impl AsRef<Path>) -> Result<PathBuf> {
        let path = stem.as_ref().with_extension(self.extension());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }
}

/// Owns at most one recording session at a time.
pub struct CaptureRecorder {
    backend: Box<dyn CaptureBackend>,
    settings: RecordingSettings,
    session: Option<RecordingSession>,
}

impl CaptureRecorder {
    pub fn new(backend: Box<dyn CaptureBackend>, settings: RecordingSettings) -> Self {
        Self {
            backend,
            settings,
            session: None,
        }
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    pub fn state(&self) -> RecorderState {
        self.session
            .as_ref()
            .map_or(RecorderState::Idle, RecordingSession::state)
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// First format in priority order the backend can produce, falling back
    /// to the platform default.
    pub fn select_format(&self) -> ContainerFormat {
        match ContainerFormat::PRIORITY
            .into_iter()
            .find(|&format| self.backend.supports(format))
        {
            Some(format) => format,
            None => {
                tracing::warn!(
                    backend = self.backend.name(),
                    error = %BeatReelError::RecorderUnavailable,
                    "falling back to the platform default container"
                );
                ContainerFormat::PlatformDefault
            }
        }
    }

    /// Opens a new session, discarding whatever the previous one buffered.
    pub fn start(
        &mut self,
        video: VideoSource,
        audio: CaptureTap,
        now: Duration,
    ) -> Result<ContainerFormat> {
        if let Some(previous) = self.session.take() {
            tracing::debug!(
                segments = previous.segments.len(),
                "discarding previous recording session"
            );
        }

        let format = self.select_format();
        let stream = self.backend.open(format, &video, audio.sample_rate())?;
        // samples delivered before this point belong to nobody
        audio.drain()?;

        tracing::info!(
            backend = self.backend.name(),
            ?format,
            width = video.width,
            height = video.height,
            fps = video.fps,
            "recording started"
        );
        self.session = Some(RecordingSession {
            video,
            audio,
            format,
            segments: Vec::new(),
            state: RecorderState::Recording,
            stream: Some(stream),
            pacer: FramePacer::new(video.fps, now),
            audio_written: 0,
        });
        Ok(format)
    }

    /// Appends an encoded segment to the active session.
    pub fn on_segment(&mut self, bytes: Vec<u8>) {
        match self.session.as_mut() {
            Some(session) if session.state == RecorderState::Recording => {
                tracing::trace!(len = bytes.len(), "segment received");
                session.segments.push(bytes);
            }
            _ => tracing::debug!(len = bytes.len(), "segment dropped: not recording"),
        }
    }

    /// Feeds the surface at `now` to the encoder, repeating it as often as
    /// the capture rate requires, then forwards pending audio and segments.
    pub fn capture(&mut self, surface: &RgbaImage, now: Duration) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.state != RecorderState::Recording {
            return Ok(());
        }

        session.flush_audio()?;
        let due = session.pacer.due(now);
        let mut failure = None;
        let mut produced = Vec::new();
        if let Some(stream) = session.stream.as_mut() {
            let mut written = 0;
            while written < due {
                if let Err(err) = stream.write_frame(surface) {
                    failure = Some(err);
                    break;
                }
                written += 1;
            }
            session.pacer.undo(due - written);
            produced = stream.poll_segments();
        }
        for segment in produced {
            self.on_segment(segment);
        }
        failure.map_or(Ok(()), Err)
    }

    /// Stops frame pacing at `now`. The stream stays open and the paused
    /// span is left out of the recording.
    pub fn pause(&mut self, now: Duration) {
        if let Some(session) = self.session.as_mut() {
            if session.state == RecorderState::Recording && !session.pacer.is_paused() {
                session.pacer.pause(now);
                tracing::debug!(at_ms = now.as_millis() as u64, "recording paused");
            }
        }
    }

    /// Continues frame pacing from `now`.
    pub fn resume(&mut self, now: Duration) {
        if let Some(session) = self.session.as_mut() {
            if session.pacer.is_paused() {
                session.pacer.resume(now);
                tracing::debug!(at_ms = now.as_millis() as u64, "recording resumed");
            }
        }
    }

    /// Finalizes the active session into an artifact. Returns `None` when
    /// nothing is recording.
    pub fn stop(&mut self) -> Option<Artifact> {
        let session = match self.session.as_mut() {
            Some(session) if session.state == RecorderState::Recording => session,
            _ => {
                tracing::warn!(error = %BeatReelError::RecorderNotStarted, "stop ignored");
                return None;
            }
        };

        if let Err(err) = session.close() {
            tracing::error!(error = %err, "encoder did not finish cleanly; keeping buffered segments");
        }

        let bytes = session.segments.concat();
        tracing::info!(
            format = ?session.format,
            segments = session.segments.len(),
            frames = session.frames_written(),
            bytes = bytes.len(),
            "recording stopped"
        );
        Some(Artifact {
            bytes,
            format: session.format,
        })
    }
}

impl fmt::Debug for CaptureRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRecorder")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{AudioSource, NullOutput, SharedAudioGraph, SourceId};

    #[derive(Default)]
    struct Log {
        frames: usize,
        audio: usize,
        finished: bool,
        reject: bool,
    }

    struct MemoryBackend {
        supported: Vec<ContainerFormat>,
        log: Arc<Mutex<Log>>,
        fail_finish: bool,
    }

    struct MemoryStream {
        log: Arc<Mutex<Log>>,
        pending: Vec<Vec<u8>>,
        fail_finish: bool,
    }

    impl CaptureBackend for MemoryBackend {
        fn name(&self) -> &str {
            "memory"
        }

        fn supports(&self, format: ContainerFormat) -> bool {
            self.supported.contains(&format)
        }

        fn open(
            &mut self,
            _format: ContainerFormat,
            _video: &VideoSource,
            _audio_sample_rate: u32,
        ) -> Result<Box<dyn CaptureStream>> {
            Ok(Box::new(MemoryStream {
                log: Arc::clone(&self.log),
                pending: vec![b"head".to_vec()],
                fail_finish: self.fail_finish,
            }))
        }
    }

    impl CaptureStream for MemoryStream {
        fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            if log.reject {
                return Err(BeatReelError::encode("queue full"));
            }
            log.frames += 1;
            drop(log);
            self.pending.push(vec![frame.get_pixel(0, 0).0[0]; 3]);
            Ok(())
        }

        fn write_audio(&mut self, samples: &[f32]) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            if log.reject {
                return Err(BeatReelError::encode("queue full"));
            }
            log.audio += samples.len();
            Ok(())
        }

        fn poll_segments(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.pending)
        }

        fn finish(self: Box<Self>) -> Result<Vec<Vec<u8>>> {
            self.log.lock().unwrap().finished = true;
            if self.fail_finish {
                return Err(BeatReelError::encode("muxer crashed"));
            }
            let mut tail = self.pending;
            tail.push(b"tail!".to_vec());
            Ok(tail)
        }
    }

    fn recorder(supported: &[ContainerFormat]) -> (CaptureRecorder, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = MemoryBackend {
            supported: supported.to_vec(),
            log: Arc::clone(&log),
            fail_finish: false,
        };
        (
            CaptureRecorder::new(Box::new(backend), RecordingSettings::default()),
            log,
        )
    }

    fn tap() -> (SharedAudioGraph, CaptureTap) {
        let mut graph = SharedAudioGraph::new(Box::new(NullOutput));
        let source = AudioSource::new(SourceId(1), 1_000, vec![0.25; 1_000]);
        let handle = graph.acquire(&source).unwrap();
        let tap = graph.capture_stream(&handle).unwrap();
        (graph, tap)
    }

    fn video() -> VideoSource {
        VideoSource {
            width: 4,
            height: 4,
            fps: 30,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn picks_the_highest_priority_supported_format() {
        let (recorder, _) = recorder(&[ContainerFormat::Webm, ContainerFormat::Mp4]);
        assert_eq!(recorder.select_format(), ContainerFormat::Mp4);
    }

    #[test]
    fn degrades_to_the_platform_default() {
        let (mut recorder, _) = recorder(&[]);
        let (_graph, tap) = tap();
        let format = recorder.start(video(), tap, ms(0)).unwrap();
        assert_eq!(format, ContainerFormat::PlatformDefault);
        assert_eq!(recorder.stop().unwrap().extension(), "webm");
    }

    #[test]
    fn artifact_length_is_the_sum_of_segments() {
        let (mut recorder, _) = recorder(&[ContainerFormat::Mp4H264]);
        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();

        let lengths = [5usize, 0, 17, 1];
        for len in lengths {
            recorder.on_segment(vec![7; len]);
        }
        let buffered: usize = recorder
            .session()
            .unwrap()
            .segments()
            .iter()
            .map(Vec::len)
            .sum();
        assert_eq!(buffered, 23);

        let artifact = recorder.stop().unwrap();
        // the memory stream adds its own head and tail segments on finish
        assert_eq!(artifact.len(), 23 + 4 + 5);
        assert_eq!(artifact.extension(), "mp4");
        assert_eq!(recorder.state(), RecorderState::Stopped);
    }

    #[test]
    fn stop_without_recording_is_a_no_op() {
        let (mut recorder, _) = recorder(&[ContainerFormat::Mp4]);
        assert!(recorder.stop().is_none());
        assert_eq!(recorder.state(), RecorderState::Idle);

        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();
        assert!(recorder.stop().is_some());
        assert!(recorder.stop().is_none());
    }

    #[test]
    fn restart_discards_previous_segments() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (_graph, tap) = tap();
        recorder.start(video(), tap.clone(), ms(0)).unwrap();
        recorder.on_segment(vec![1; 100]);

        recorder.start(video(), tap, ms(0)).unwrap();
        assert!(log.lock().unwrap().finished);
        assert!(recorder.session().unwrap().segments().is_empty());
        assert_eq!(recorder.stop().unwrap().len(), 4 + 5);
    }

    #[test]
    fn capture_paces_frames_at_the_recording_rate() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();

        let surface = RgbaImage::new(4, 4);
        for tick in 0..60u64 {
            recorder.capture(&surface, ms(tick * 1_000 / 60)).unwrap();
        }
        // one second of 60 Hz ticks at 30 fps
        let frames = log.lock().unwrap().frames;
        assert!((29..=31).contains(&frames), "frames {frames}");
        assert_eq!(recorder.session().unwrap().frames_written() as usize, frames);
        assert_eq!(recorder.session().unwrap().segments().len(), frames + 1);
    }

    #[test]
    fn capture_forwards_pumped_audio() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (mut graph, tap) = tap();
        graph.pump(100).unwrap();
        recorder.start(video(), tap, ms(0)).unwrap();

        graph.pump(250).unwrap();
        recorder.capture(&RgbaImage::new(4, 4), ms(0)).unwrap();
        assert_eq!(log.lock().unwrap().audio, 250);

        graph.pump(50).unwrap();
        recorder.stop().unwrap();
        assert_eq!(log.lock().unwrap().audio, 300);
    }

    #[test]
    fn rejected_writes_are_retried_on_the_next_capture() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (mut graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();
        graph.pump(100).unwrap();

        log.lock().unwrap().reject = true;
        assert!(recorder.capture(&RgbaImage::new(4, 4), ms(100)).is_err());
        let session = recorder.session().unwrap();
        assert_eq!(session.frames_written(), 0);
        assert_eq!(session.audio_samples_written(), 0);

        log.lock().unwrap().reject = false;
        graph.pump(20).unwrap();
        recorder.capture(&RgbaImage::new(4, 4), ms(100)).unwrap();
        assert_eq!(log.lock().unwrap().frames, 4);
        assert_eq!(log.lock().unwrap().audio, 120);
        assert_eq!(recorder.session().unwrap().frames_written(), 4);
    }

    #[test]
    fn paused_span_is_left_out_of_the_video() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();
        let surface = RgbaImage::new(4, 4);

        recorder.capture(&surface, ms(490)).unwrap();
        recorder.pause(ms(500));
        recorder.capture(&surface, ms(1_200)).unwrap();
        assert_eq!(log.lock().unwrap().frames, 15);
        assert!(recorder.is_recording());
        assert!(recorder.session().unwrap().is_paused());

        recorder.resume(ms(1_500));
        recorder.capture(&surface, ms(2_000)).unwrap();
        assert_eq!(log.lock().unwrap().frames, 31);
        assert_eq!(
            recorder.session().unwrap().video_time(),
            Duration::from_nanos(1_033_333_333)
        );
    }

    #[test]
    fn failed_finish_still_yields_buffered_segments() {
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = MemoryBackend {
            supported: vec![ContainerFormat::Webm],
            log: Arc::clone(&log),
            fail_finish: true,
        };
        let mut recorder = CaptureRecorder::new(Box::new(backend), RecordingSettings::default());
        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();
        recorder.on_segment(vec![9; 12]);

        let artifact = recorder.stop().unwrap();
        assert_eq!(artifact.len(), 12);
        assert_eq!(artifact.format(), ContainerFormat::Webm);
        assert!(log.lock().unwrap().finished);
    }

    #[test]
    fn dropping_a_recorder_finishes_the_stream() {
        let (mut recorder, log) = recorder(&[ContainerFormat::Mp4]);
        let (_graph, tap) = tap();
        recorder.start(video(), tap, ms(0)).unwrap();
        drop(recorder);
        assert!(log.lock().unwrap().finished);
    }

    #[test]
    fn formats_map_to_extensions() {
        assert_eq!(ContainerFormat::Mp4H264.extension(), "mp4");
        assert_eq!(ContainerFormat::WebmVp9.extension(), "webm");
        assert!(ContainerFormat::Mp4H264.mime().starts_with("video/mp4"));
        assert_eq!(ContainerFormat::PlatformDefault.mime(), "");
    }
}
