//! Capture backend that pipes frames and audio through the system `ffmpeg`.
//!
//! Video goes in as raw RGBA on stdin. Audio goes in as mono `f32le` over a
//! loopback TCP connection that ffmpeg opens to us. The muxed container comes
//! back on stdout in fragmented form, so segments arrive while recording.

use std::{
    collections::HashSet,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use image::RgbaImage;

use super::{CaptureBackend, CaptureStream, ContainerFormat, VideoSource};
use crate::{BeatReelError, Result};

const READ_CHUNK: usize = 64 * 1024;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
// frames buffered ahead of ffmpeg's stdin before `write_frame` blocks
const FRAME_QUEUE: usize = 8;

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Backend over the `ffmpeg` binary found on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCapture {
    encoders: HashSet<String>,
}

impl FfmpegCapture {
    /// Asks ffmpeg which encoders it was built with. An absent binary leaves
    /// the backend with no encoders at all.
    pub fn probe() -> Self {
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .stderr(Stdio::null())
            .output();
        let encoders = match output {
            Ok(output) if output.status.success() => {
                parse_encoders(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::warn!(status = %output.status, "ffmpeg encoder probe failed");
                HashSet::new()
            }
            Err(err) => {
                tracing::warn!(error = %err, "ffmpeg not found on PATH");
                HashSet::new()
            }
        };
        tracing::debug!(count = encoders.len(), "ffmpeg encoders probed");
        Self { encoders }
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }
}

fn parse_encoders(listing: &str) -> HashSet<String> {
    // rows look like " V....D libx264   libx264 H.264 / AVC ..."
    listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let flags = cols.next()?;
            let name = cols.next()?;
            let kind = flags.chars().next()?;
            (flags.len() == 6 && matches!(kind, 'V' | 'A' | 'S') && name != "=")
                .then(|| name.to_string())
        })
        .collect()
}

fn codec_args(format: ContainerFormat) -> &'static [&'static str] {
    match format {
        ContainerFormat::Mp4H264 => &[
            "-c:v", "libx264", "-profile:v", "baseline", "-pix_fmt", "yuv420p", "-c:a", "aac",
        ],
        ContainerFormat::Mp4 => &["-c:v", "mpeg4", "-pix_fmt", "yuv420p", "-c:a", "aac"],
        ContainerFormat::WebmVp9 => &[
            "-c:v", "libvpx-vp9", "-pix_fmt", "yuv420p", "-c:a", "libopus", "-ar", "48000",
        ],
        ContainerFormat::Webm => &["-c:v", "libvpx", "-pix_fmt", "yuv420p", "-c:a", "libvorbis"],
        ContainerFormat::PlatformDefault => &[],
    }
}

fn mux_args(format: ContainerFormat) -> &'static [&'static str] {
    match format {
        // fragmented so the muxer can stream to a pipe
        ContainerFormat::Mp4H264 | ContainerFormat::Mp4 => &[
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-f",
            "mp4",
        ],
        ContainerFormat::WebmVp9 | ContainerFormat::Webm | ContainerFormat::PlatformDefault => {
            &["-f", "webm"]
        }
    }
}

impl CaptureBackend for FfmpegCapture {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supports(&self, format: ContainerFormat) -> bool {
        let required: &[&str] = match format {
            ContainerFormat::Mp4H264 => &["libx264", "aac"],
            ContainerFormat::Mp4 => &["mpeg4", "aac"],
            ContainerFormat::WebmVp9 => &["libvpx-vp9", "libopus"],
            ContainerFormat::Webm => &["libvpx", "libvorbis"],
            ContainerFormat::PlatformDefault => return !self.encoders.is_empty(),
        };
        required.iter().all(|name| self.has_encoder(name))
    }

    fn open(
        &mut self,
        format: ContainerFormat,
        video: &VideoSource,
        audio_sample_rate: u32,
    ) -> Result<Box<dyn CaptureStream>> {
        if video.width == 0 || video.height == 0 {
            return Err(BeatReelError::InvalidInput(
                "capture width/height must be non-zero",
            ));
        }
        if video.width % 2 != 0 || video.height % 2 != 0 {
            return Err(BeatReelError::InvalidInput(
                "capture width/height must be even for yuv420p output",
            ));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args([
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", video.width, video.height),
                "-r",
                &video.fps.to_string(),
                "-i",
                "pipe:0",
            ])
            .args([
                "-f",
                "f32le",
                "-ar",
                &audio_sample_rate.max(1).to_string(),
                "-ac",
                "1",
                "-i",
                &format!("tcp://127.0.0.1:{port}"),
            ])
            .args(codec_args(format))
            .args(["-shortest"])
            .args(mux_args(format))
            .arg("pipe:1");

        let mut child = cmd.spawn().map_err(|e| {
            BeatReelError::encode(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BeatReelError::encode("failed to open ffmpeg stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BeatReelError::encode("failed to open ffmpeg stdout"))?;

        let (video_tx, video_rx) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE);
        let video_thread = thread::spawn(move || write_video(stdin, video_rx));

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>();
        let audio_thread = thread::spawn(move || write_audio(listener, audio_rx));

        let (segment_tx, segment_rx) = mpsc::channel::<Vec<u8>>();
        let reader_thread = thread::spawn(move || read_segments(stdout, segment_tx));

        tracing::debug!(?format, port, "ffmpeg capture spawned");
        Ok(Box::new(FfmpegStream {
            child,
            video: *video,
            video_tx: Some(video_tx),
            audio_tx: Some(audio_tx),
            segments: segment_rx,
            threads: Some(Threads {
                video: video_thread,
                audio: audio_thread,
                reader: reader_thread,
            }),
        }))
    }
}

fn write_video(mut stdin: ChildStdin, frames: Receiver<Vec<u8>>) -> io::Result<()> {
    for frame in frames {
        stdin.write_all(&frame)?;
    }
    stdin.flush()
}

fn write_audio(listener: TcpListener, chunks: Receiver<Vec<u8>>) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let mut pending = Vec::new();
    let mut closed = false;
    let deadline = Instant::now() + ACCEPT_TIMEOUT;

    let mut socket: TcpStream = loop {
        match listener.accept() {
            Ok((socket, _)) => break socket,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        loop {
            match chunks.try_recv() {
                Ok(chunk) => pending.extend(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "ffmpeg never connected to the audio socket",
            ));
        }
        thread::sleep(Duration::from_millis(5));
    };

    socket.set_nonblocking(false)?;
    socket.write_all(&pending)?;
    if !closed {
        for chunk in chunks {
            socket.write_all(&chunk)?;
        }
    }
    socket.shutdown(std::net::Shutdown::Write)
}

fn read_segments(mut stdout: impl Read, segments: Sender<Vec<u8>>) -> io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stdout.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if segments.send(buf[..n].to_vec()).is_err() {
            return Ok(());
        }
    }
}

struct Threads {
    video: JoinHandle<io::Result<()>>,
    audio: JoinHandle<io::Result<()>>,
    reader: JoinHandle<io::Result<()>>,
}

struct FfmpegStream {
    child: Child,
    video: VideoSource,
    video_tx: Option<SyncSender<Vec<u8>>>,
    audio_tx: Option<Sender<Vec<u8>>>,
    segments: Receiver<Vec<u8>>,
    threads: Option<Threads>,
}

fn join(name: &str, handle: JoinHandle<io::Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result.map_err(|e| BeatReelError::encode(format!("ffmpeg {name}: {e}"))),
        Err(_) => Err(BeatReelError::encode(format!("ffmpeg {name} thread panicked"))),
    }
}

impl FfmpegStream {
    fn shutdown(&mut self) -> Result<()> {
        drop(self.video_tx.take());
        drop(self.audio_tx.take());
        let Some(threads) = self.threads.take() else {
            return Ok(());
        };
        let video = join("video writer", threads.video);
        let audio = join("audio writer", threads.audio);
        let status = self
            .child
            .wait()
            .map_err(|e| BeatReelError::encode(format!("failed to wait for ffmpeg: {e}")))?;
        let reader = join("reader", threads.reader);

        if !status.success() {
            return Err(BeatReelError::encode(format!(
                "ffmpeg exited with status {status}"
            )));
        }
        video.and(audio).and(reader)
    }
}

impl CaptureStream for FfmpegStream {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        if frame.width() != self.video.width || frame.height() != self.video.height {
            return Err(BeatReelError::encode(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                self.video.width,
                self.video.height
            )));
        }
        let Some(tx) = self.video_tx.as_ref() else {
            return Err(BeatReelError::encode("ffmpeg capture is already finished"));
        };
        tx.send(frame.as_raw().clone())
            .map_err(|_| BeatReelError::encode("ffmpeg video writer has stopped"))
    }

    fn write_audio(&mut self, samples: &[f32]) -> Result<()> {
        let Some(tx) = self.audio_tx.as_ref() else {
            return Err(BeatReelError::encode("ffmpeg capture is already finished"));
        };
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        tx.send(bytes)
            .map_err(|_| BeatReelError::encode("ffmpeg audio writer has stopped"))
    }

    fn poll_segments(&mut self) -> Vec<Vec<u8>> {
        self.segments.try_iter().collect()
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<Vec<u8>>> {
        let result = self.shutdown();
        let tail = self.segments.try_iter().collect();
        result.map(|()| tail)
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        if self.threads.is_some() {
            if let Err(err) = self.shutdown() {
                tracing::warn!(error = %err, "ffmpeg capture dropped without a clean finish");
            }
        }
    }
}
