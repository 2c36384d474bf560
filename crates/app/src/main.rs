use std::path::{Path, PathBuf};

use beatreel_core::{
    beat_report, decode_image, AppConfig, AudioSource, BeatMark, BeatReelError, BeatReelSession,
    CaptureRecorder, Clock, FfmpegCapture, FrameTicker, ImageAsset, NullOutput, PlaybackClock,
    Playlist, SharedAudioGraph, SourceId, TransitionAnimator,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> beatreel_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render(args) => run_render(&args),
        Commands::Beats { audio, output } => run_beats(&audio, output.as_deref()),
    }
}

fn run_render(args: &RenderArgs) -> beatreel_core::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(hz) = args.refresh {
        config.render.refresh_hz = hz;
    }
    config.validate()?;

    let source = read_wav(&args.audio)?;
    tracing::info!(
        audio = %args.audio.display(),
        sample_rate = source.sample_rate(),
        duration_s = source.duration().as_secs_f32(),
        images = args.images.len(),
        "rendering slideshow"
    );

    let playlist = Playlist::from_results(args.images.iter().map(|path| load_image(path)));
    if playlist.is_empty() {
        tracing::warn!("no usable images; the video will stay black and nothing is recorded");
    }
    let animator = match args.seed {
        Some(seed) => TransitionAnimator::with_seed(&config, playlist, seed),
        None => TransitionAnimator::new(&config, playlist),
    };
    let recorder = CaptureRecorder::new(Box::new(FfmpegCapture::probe()), config.record.clone());
    let graph = if config.audio.spectral_analysis {
        SharedAudioGraph::new(Box::new(NullOutput))
    } else {
        SharedAudioGraph::without_spectral_analysis(Box::new(NullOutput))
    };
    let mut session = BeatReelSession::new(config.clone(), graph, source, animator, recorder)?;

    let mut clock = PlaybackClock::start();
    session.play(clock.now())?;

    let mut artifact = None;
    for now in FrameTicker::new(config.render.refresh_hz) {
        clock.set(now);
        if let Some(done) = session.tick(clock.now())? {
            artifact = Some(done);
        }
        if !session.is_playing() {
            break;
        }
    }

    tracing::info!(
        frames = session.frames_rendered(),
        beats = session.beats_detected(),
        transitions = session.animator().commits(),
        "playback finished"
    );

    match artifact {
        Some(artifact) => {
            let path = artifact.save(&args.output)?;
            tracing::info!(
                path = %path.display(),
                bytes = artifact.len(),
                mime = artifact.mime(),
                "artifact written"
            );
        }
        None => tracing::warn!("no recording was produced"),
    }
    Ok(())
}

fn run_beats(audio: &Path, output: Option<&Path>) -> beatreel_core::Result<()> {
    let config = AppConfig::default();
    let source = read_wav(audio)?;
    let beats = beat_report(&config, &source)?;

    let report = BeatsReport {
        audio: audio.display().to_string(),
        sample_rate: source.sample_rate(),
        duration_ms: source.duration().as_millis() as u64,
        beats,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            tracing::info!(path = %path.display(), beats = report.beats.len(), "beat report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct BeatsReport {
    audio: String,
    sample_rate: u32,
    duration_ms: u64,
    beats: Vec<BeatMark>,
}

fn load_config(path: Option<&Path>) -> beatreel_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            AppConfig::from_json_file(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn load_image(path: &Path) -> beatreel_core::Result<ImageAsset> {
    let bytes = std::fs::read(path)?;
    decode_image(path.display().to_string(), &bytes)
}

/// Reads a WAV file and mixes it down to mono `f32`.
fn read_wav(path: &Path) -> beatreel_core::Result<AudioSource> {
    let wav_err = |e: hound::Error| BeatReelError::msg(format!("{}: {e}", path.display()));
    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << spec.bits_per_sample.saturating_sub(1).min(31)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
    };
    AudioSource::from_interleaved(SourceId(1), spec.sample_rate, spec.channels, &samples)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised slideshow videos", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a slideshow video whose transitions follow the beat.
    Render(RenderArgs),
    /// Detect beats in an audio file and print them as JSON.
    Beats {
        /// WAV file to analyse.
        #[arg(short, long)]
        audio: PathBuf,
        /// Write the report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// WAV file that drives playback and beat detection.
    #[arg(short, long)]
    audio: PathBuf,
    /// Images to cycle through, in order.
    #[arg(short, long, num_args = 1.., required = true)]
    images: Vec<PathBuf>,
    /// Output path without extension; the container decides it.
    #[arg(short, long)]
    output: PathBuf,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Tick rate of the render loop in Hz.
    #[arg(long)]
    refresh: Option<u32>,
    /// Seed for reproducible transition choices.
    #[arg(long)]
    seed: Option<u64>,
}
