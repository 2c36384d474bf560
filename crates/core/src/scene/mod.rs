//! Transition state, the parameters derived from it, and the animator that
//! drives both from beat events.

mod animator;
mod ease;

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::TransitionConfig;

pub use animator::TransitionAnimator;
pub use ease::Ease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Slide,
    Zoom,
    Rotate,
    Fade,
    Spiral,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::Slide,
        Variant::Zoom,
        Variant::Rotate,
        Variant::Fade,
        Variant::Spiral,
    ];
}

/// Side the incoming image travels towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
    Top,
    Bottom,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Left,
        Direction::Right,
        Direction::Top,
        Direction::Bottom,
    ];

    /// Unit vector pointing at where the image starts off-surface.
    pub fn origin(self) -> (f32, f32) {
        match self {
            Direction::Left => (1.0, 0.0),
            Direction::Right => (-1.0, 0.0),
            Direction::Top => (0.0, 1.0),
            Direction::Bottom => (0.0, -1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Entering,
    Stabilizing,
}

/// Radial highlight drawn behind the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Glow {
    pub color: [u8; 3],
    /// Peak alpha in [0, 1].
    pub intensity: f32,
    pub radius_px: f32,
}

pub const GLOW_PALETTE: [[u8; 3]; 7] = [
    [0xff, 0x00, 0x50],
    [0x00, 0xff, 0x88],
    [0x00, 0x88, 0xff],
    [0xff, 0x88, 0x00],
    [0x88, 0x00, 0xff],
    [0xff, 0xff, 0x00],
    [0xff, 0x00, 0x88],
];

impl Glow {
    pub fn for_beat(color: [u8; 3], beat_intensity: f32) -> Self {
        let beat_intensity = beat_intensity.clamp(0.0, 1.0);
        Self {
            color,
            intensity: 0.4 + 0.5 * beat_intensity,
            radius_px: 150.0 + 250.0 * beat_intensity,
        }
    }
}

/// Per-tick rendering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnimationParams {
    pub scale: f32,
    pub rotation_deg: f32,
    pub blur_px: f32,
    pub opacity: f32,
    pub shake_x: f32,
    pub shake_y: f32,
    /// Random positional jitter.
    pub offset_x: f32,
    pub offset_y: f32,
    /// Directional entry offset of a slide.
    pub entry_x: f32,
    pub entry_y: f32,
    pub glow: Option<Glow>,
}

impl AnimationParams {
    pub const IDENTITY: AnimationParams = AnimationParams {
        scale: 1.0,
        rotation_deg: 0.0,
        blur_px: 0.0,
        opacity: 1.0,
        shake_x: 0.0,
        shake_y: 0.0,
        offset_x: 0.0,
        offset_y: 0.0,
        entry_x: 0.0,
        entry_y: 0.0,
        glow: None,
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for AnimationParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Phase and metadata of the single in-flight transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionState {
    pub variant: Variant,
    pub direction: Direction,
    pub phase: Phase,
    pub start_time: Duration,
    /// Start time of the most recently completed transition.
    pub last_commit_time: Option<Duration>,
    /// Intensity of the beat that started the transition.
    pub intensity: f32,
    pub glow: Option<Glow>,
    /// Seeds the shake and jitter noise.
    pub jitter_seed: u64,
}

impl Default for TransitionState {
    fn default() -> Self {
        Self {
            variant: Variant::Slide,
            direction: Direction::Left,
            phase: Phase::Idle,
            start_time: Duration::ZERO,
            last_commit_time: None,
            intensity: 0.0,
            glow: None,
            jitter_seed: 0,
        }
    }
}

impl TransitionState {
    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.start_time)
    }
}

const SLIDE_TRAVEL: f32 = 1.5;
const SLIDE_JITTER_PX: f32 = 25.0;
const SHAKE_PX: f32 = 12.0;

/// Computes the rendering parameters of `state` at `now`.
///
/// Identity while idle, identity plus glow while stabilizing, and the
/// variant's eased curve while entering. Noise is derived from the state's
/// seed and the elapsed time, so equal inputs give equal output.
pub fn derive_params(
    state: &TransitionState,
    now: Duration,
    canvas_width: f32,
    timing: &TransitionConfig,
) -> AnimationParams {
    match state.phase {
        Phase::Idle => return AnimationParams::IDENTITY,
        Phase::Stabilizing => {
            return AnimationParams {
                glow: state.glow,
                ..AnimationParams::IDENTITY
            }
        }
        Phase::Entering => {}
    }

    let elapsed = state.elapsed(now);
    let progress = (elapsed.as_secs_f32() / timing.enter().as_secs_f32()).clamp(0.0, 1.0);
    let intensity = state.intensity;
    let cubic = Ease::InOutCubic.apply(progress);
    let mut noise = StdRng::seed_from_u64(state.jitter_seed ^ (elapsed.as_micros() as u64).rotate_left(21));

    let mut params = AnimationParams {
        glow: state.glow,
        ..AnimationParams::IDENTITY
    };

    match state.variant {
        Variant::Slide => {
            params.scale = 0.8 + 0.2 * cubic;
            let travel = (1.0 - Ease::OutCubic.apply(progress)) * SLIDE_TRAVEL * canvas_width;
            let (dx, dy) = state.direction.origin();
            params.entry_x = dx * travel;
            params.entry_y = dy * travel;
            let jitter = intensity * SLIDE_JITTER_PX * (1.0 - cubic);
            params.offset_x = centered(&mut noise) * jitter;
            params.offset_y = centered(&mut noise) * jitter;
        }
        Variant::Zoom => {
            let eased = Ease::OutBack.apply(progress);
            let from = 0.3 + 0.2 * intensity;
            params.scale = from + (1.0 - from) * eased;
            params.opacity = eased.clamp(0.0, 1.0);
        }
        Variant::Rotate => {
            let eased = Ease::OutElastic.apply(progress);
            params.rotation_deg = (360.0 + 180.0 * intensity) * (1.0 - eased);
            params.scale = 0.8 + 0.2 * progress;
        }
        Variant::Fade => {
            params.opacity = cubic;
            params.scale = 0.9 + 0.1 * cubic;
            params.blur_px = 20.0 * (1.0 - cubic);
        }
        Variant::Spiral => {
            params.rotation_deg = 720.0 * (1.0 - cubic);
            params.scale = 0.1 + 0.9 * cubic;
            params.opacity = cubic;
        }
    }

    if progress < 0.5 {
        let shake = intensity * SHAKE_PX * (1.0 - 2.0 * progress);
        params.shake_x = centered(&mut noise) * shake;
        params.shake_y = centered(&mut noise) * shake;
    }

    params
}

fn centered(rng: &mut StdRng) -> f32 {
    rng.gen::<f32>() - 0.5
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn entering(variant: Variant, intensity: f32) -> TransitionState {
        TransitionState {
            variant,
            direction: Direction::Left,
            phase: Phase::Entering,
            start_time: ms(1_000),
            last_commit_time: None,
            intensity,
            glow: Some(Glow::for_beat(GLOW_PALETTE[0], intensity)),
            jitter_seed: 42,
        }
    }

    fn derive(state: &TransitionState, at: u64) -> AnimationParams {
        derive_params(state, ms(at), 360.0, &TransitionConfig::default())
    }

    #[test]
    fn idle_is_identity() {
        let state = TransitionState::default();
        assert!(derive(&state, 12_345).is_identity());
    }

    #[test]
    fn stabilizing_keeps_only_the_glow() {
        let state = TransitionState {
            phase: Phase::Stabilizing,
            ..entering(Variant::Spiral, 0.9)
        };
        let params = derive(&state, 1_700);
        assert!(params.glow.is_some());
        assert_eq!(
            AnimationParams {
                glow: None,
                ..params
            },
            AnimationParams::IDENTITY
        );
    }

    #[test]
    fn zoom_starts_small_and_transparent() {
        let params = derive(&entering(Variant::Zoom, 0.5), 1_000);
        assert_relative_eq!(params.scale, 0.4, epsilon = 1e-5);
        assert_relative_eq!(params.opacity, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn zoom_may_overshoot_scale_but_not_opacity() {
        let state = entering(Variant::Zoom, 0.9);
        let overshoot = (0..600).step_by(10).map(|t| derive(&state, 1_000 + t));
        let mut saw_overshoot = false;
        for params in overshoot {
            assert!(params.opacity <= 1.0);
            saw_overshoot |= params.scale > 1.0;
        }
        assert!(saw_overshoot);
    }

    #[test]
    fn rotate_starts_with_extra_turns() {
        let params = derive(&entering(Variant::Rotate, 1.0), 1_000);
        assert_relative_eq!(params.rotation_deg, 540.0, epsilon = 1e-3);
        assert_relative_eq!(params.scale, 0.8, epsilon = 1e-6);
    }

    #[test]
    fn fade_begins_blurred() {
        let params = derive(&entering(Variant::Fade, 0.3), 1_000);
        assert_relative_eq!(params.blur_px, 20.0);
        assert_relative_eq!(params.opacity, 0.0);
        assert_relative_eq!(params.scale, 0.9);
    }

    #[test]
    fn spiral_converges_towards_identity() {
        let params = derive(&entering(Variant::Spiral, 0.3), 1_599);
        assert!(params.rotation_deg < 1.0);
        assert!(params.scale > 0.99);
    }

    #[test]
    fn slide_enters_from_its_direction() {
        let mut state = entering(Variant::Slide, 0.0);
        state.direction = Direction::Bottom;
        let params = derive(&state, 1_000);
        assert_relative_eq!(params.entry_y, -540.0, epsilon = 1e-3);
        assert_eq!(params.entry_x, 0.0);
        assert_relative_eq!(params.scale, 0.8);
    }

    #[test]
    fn shake_is_bounded_and_stops_halfway() {
        let state = entering(Variant::Fade, 1.0);
        for t in (0..300).step_by(7) {
            let params = derive(&state, 1_000 + t);
            let bound = 0.5 * 12.0 * (1.0 - 2.0 * t as f32 / 600.0) + 1e-4;
            assert!(params.shake_x.abs() <= bound);
            assert!(params.shake_y.abs() <= bound);
        }
        for t in (300..600).step_by(7) {
            let params = derive(&state, 1_000 + t);
            assert_eq!((params.shake_x, params.shake_y), (0.0, 0.0));
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let state = entering(Variant::Slide, 0.8);
        assert_eq!(derive(&state, 1_123), derive(&state, 1_123));
    }

    #[test]
    fn glow_scales_with_beat() {
        let glow = Glow::for_beat(GLOW_PALETTE[2], 1.0);
        assert_relative_eq!(glow.intensity, 0.9);
        assert_relative_eq!(glow.radius_px, 400.0);
    }
}
