use std::time::{Duration, Instant};

use crate::{Glow, TransitionConfig};

/// Source of "now" for the tick loop and every wall-clock timer.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Manually advanced clock. Drives offline renders and tests.
#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    elapsed: Duration,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    pub fn advance(&mut self, delta: Duration) {
        self.elapsed += delta;
    }

    pub fn set(&mut self, at: Duration) {
        self.elapsed = at;
    }
}

impl Clock for PlaybackClock {
    fn now(&self) -> Duration {
        self.elapsed
    }
}

/// Monotonic wall clock measured from construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Emits evenly spaced tick timestamps at a display refresh rate.
#[derive(Debug, Clone)]
pub struct FrameTicker {
    hz: u32,
    next: u64,
}

impl FrameTicker {
    pub fn new(hz: u32) -> Self {
        Self { hz: hz.max(1), next: 0 }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz as f64)
    }

    /// Timestamp of tick `index`.
    pub fn at(&self, index: u64) -> Duration {
        Duration::from_secs_f64(index as f64 / self.hz as f64)
    }

    pub fn ticks(&self) -> u64 {
        self.next
    }
}

impl Iterator for FrameTicker {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let at = self.at(self.next);
        self.next += 1;
        Some(at)
    }
}

/// Counts how many frames of a fixed-rate stream are due at a given time.
///
/// Time spent paused is cut out of the stream: resuming moves the origin
/// forward by the length of the pause, so no frames are owed for it.
#[derive(Debug, Clone)]
pub struct FramePacer {
    fps: u32,
    origin: Duration,
    emitted: u64,
    paused_at: Option<Duration>,
}

impl FramePacer {
    pub fn new(fps: u32, origin: Duration) -> Self {
        Self {
            fps: fps.max(1),
            origin,
            emitted: 0,
            paused_at: None,
        }
    }

    /// Frames to emit now so that `now` is covered. The first call always
    /// yields at least one frame. Nothing is due while paused.
    pub fn due(&mut self, now: Duration) -> u64 {
        if self.paused_at.is_some() {
            return 0;
        }
        let elapsed = now.saturating_sub(self.origin).as_secs_f64();
        let target = (elapsed * self.fps as f64).floor() as u64 + 1;
        let due = target.saturating_sub(self.emitted);
        self.emitted += due;
        due
    }

    /// Gives back frames that `due` handed out but were never delivered.
    pub fn undo(&mut self, frames: u64) {
        self.emitted = self.emitted.saturating_sub(frames);
    }

    pub fn pause(&mut self, now: Duration) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Duration) {
        if let Some(at) = self.paused_at.take() {
            self.origin += now.saturating_sub(at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Stream time covered by the frames emitted so far.
    pub fn covered(&self) -> Duration {
        Duration::from_nanos(self.emitted.saturating_mul(1_000_000_000) / u64::from(self.fps))
    }
}

/// Wall-clock fade-out of a glow after its transition settles.
///
/// Intensity drops by a fixed factor every step once the initial delay has
/// passed. The glow disappears when it falls to the floor or when the
/// lifetime, counted from the transition start, runs out. Evaluated purely
/// from the clock, so it keeps fading while ticks are suspended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlowFade {
    glow: Glow,
    fade_start: Duration,
    deadline: Duration,
    step: Duration,
    factor: f32,
    floor: f32,
}

impl GlowFade {
    pub fn new(glow: Glow, transition_start: Duration, settled_at: Duration, timing: &TransitionConfig) -> Self {
        Self {
            glow,
            fade_start: settled_at + Duration::from_millis(timing.glow_fade_delay_ms),
            deadline: transition_start + Duration::from_millis(timing.glow_lifetime_ms),
            step: Duration::from_millis(timing.glow_fade_step_ms.max(1)),
            factor: timing.glow_fade_factor,
            floor: timing.glow_floor,
        }
    }

    pub fn sample(&self, now: Duration) -> Option<Glow> {
        if now >= self.deadline {
            return None;
        }
        if now < self.fade_start {
            return Some(self.glow);
        }
        let steps = (now - self.fade_start).as_nanos() / self.step.as_nanos() + 1;
        let intensity = self.glow.intensity * self.factor.powi(steps.min(i32::MAX as u128) as i32);
        if intensity <= self.floor {
            return None;
        }
        Some(Glow {
            intensity,
            ..self.glow
        })
    }

    pub fn is_finished(&self, now: Duration) -> bool {
        self.sample(now).is_none()
    }
}
