//! Core library for Beatreel.
//!
//! Turns an audio track and a set of images into a beat-synchronised slideshow
//! video. Each module owns one subsystem: the shared audio graph, spectral
//! analysis and beat detection, the transition state machine, the software
//! compositor and the recorder. [`BeatReelSession`] runs them together, one
//! tick at a time.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod record;
pub mod render;
pub mod scene;
pub mod session;
pub mod signal;
pub mod timeline;

pub use analysis::{AudioAnalysisEngine, AudioFrame, BeatDetector, BeatEvent};
pub use assets::{decode_image, ImageAsset, Playlist};
pub use audio::{
    AnalysisNode, AudioOutput, AudioSource, CaptureTap, GraphHandle, GraphState, NodeId,
    NullOutput, SharedAudioGraph, SourceId,
};
pub use config::{AppConfig, AudioConfig, RecordingSettings, RenderConfig, TransitionConfig};
pub use error::{BeatReelError, Result};
pub use record::{
    Artifact, CaptureBackend, CaptureRecorder, CaptureStream, ContainerFormat, FfmpegCapture,
    RecorderState, RecordingSession, VideoSource,
};
pub use render::{FrameCompositor, RenderInput, Surface, Wash};
pub use scene::{
    derive_params, AnimationParams, Direction, Ease, Glow, Phase, TransitionAnimator,
    TransitionState, Variant,
};
pub use session::{beat_report, BeatMark, BeatReelSession, PlaybackState};
pub use signal::{BeatReceiver, BeatSignal};
pub use timeline::{Clock, FramePacer, FrameTicker, GlowFade, PlaybackClock, SystemClock};
