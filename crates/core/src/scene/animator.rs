use std::time::Duration;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use super::{derive_params, AnimationParams, Direction, Glow, Phase, TransitionState, Variant, GLOW_PALETTE};
use crate::{
    AppConfig, BeatEvent, GlowFade, ImageAsset, Playlist, RenderInput, TransitionConfig, Wash,
};

/// Beat-driven state machine that owns the playlist cursor.
///
/// `Idle -> Entering` on an accepted beat, `Entering -> Stabilizing` once
/// the entry curve has run, `Stabilizing -> Idle` when the transition's total
/// duration has elapsed. Beats that arrive outside `Idle`, or too soon after
/// the previous commit, are dropped.
#[derive(Debug)]
pub struct TransitionAnimator {
    timing: TransitionConfig,
    canvas_width: f32,
    state: TransitionState,
    playlist: Playlist,
    afterglow: Option<GlowFade>,
    visible: bool,
    commits: u64,
    rng: StdRng,
}

impl TransitionAnimator {
    pub fn new(config: &AppConfig, playlist: Playlist) -> Self {
        Self::with_rng(config, playlist, StdRng::from_entropy())
    }

    /// Animator whose random choices are reproducible.
    pub fn with_seed(config: &AppConfig, playlist: Playlist, seed: u64) -> Self {
        Self::with_rng(config, playlist, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &AppConfig, playlist: Playlist, rng: StdRng) -> Self {
        Self {
            timing: config.transition.clone(),
            canvas_width: config.render.width as f32,
            state: TransitionState::default(),
            playlist,
            afterglow: None,
            visible: true,
            commits: 0,
            rng,
        }
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn current_asset(&self) -> Option<&ImageAsset> {
        self.playlist.current()
    }

    /// Number of transitions committed so far.
    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Offers a beat to the state machine. Returns whether it started a
    /// transition.
    pub fn on_beat(&mut self, event: BeatEvent, now: Duration) -> bool {
        self.advance(now);

        if self.state.phase != Phase::Idle {
            tracing::debug!(phase = ?self.state.phase, "beat dropped: transition in flight");
            return false;
        }
        if self.playlist.is_empty() {
            tracing::debug!("beat dropped: playlist is empty");
            return false;
        }
        if let Some(last) = self.state.last_commit_time {
            if now.saturating_sub(last) < self.timing.min_commit_interval() {
                tracing::debug!(
                    since_ms = now.saturating_sub(last).as_millis() as u64,
                    "beat dropped: previous transition too recent"
                );
                return false;
            }
        }

        self.commit(event, now);
        true
    }

    fn commit(&mut self, event: BeatEvent, now: Duration) {
        let variant = *Variant::ALL.choose(&mut self.rng).unwrap_or(&Variant::Slide);
        let direction = *Direction::ALL
            .choose(&mut self.rng)
            .unwrap_or(&Direction::Left);
        let color = *GLOW_PALETTE.choose(&mut self.rng).unwrap_or(&GLOW_PALETTE[0]);
        let intensity = event.intensity.clamp(0.0, 1.0);

        self.playlist.advance();
        self.visible = true;
        self.afterglow = None;
        self.commits += 1;
        self.state = TransitionState {
            variant,
            direction,
            phase: Phase::Entering,
            start_time: now,
            last_commit_time: self.state.last_commit_time,
            intensity,
            glow: Some(Glow::for_beat(color, intensity)),
            jitter_seed: self.rng.gen(),
        };

        tracing::info!(
            ?variant,
            ?direction,
            intensity,
            index = self.playlist.index(),
            "transition committed"
        );
    }

    /// Moves the phase forward to match `now`.
    pub fn advance(&mut self, now: Duration) {
        let elapsed = self.state.elapsed(now);

        if self.state.phase == Phase::Entering && elapsed >= self.timing.enter() {
            self.state = TransitionState {
                phase: Phase::Stabilizing,
                ..self.state
            };
        }

        if self.state.phase == Phase::Stabilizing && elapsed >= self.timing.total() {
            self.afterglow = self
                .state
                .glow
                .map(|glow| GlowFade::new(glow, self.state.start_time, now, &self.timing));
            self.state = TransitionState {
                phase: Phase::Idle,
                last_commit_time: Some(self.state.start_time),
                glow: None,
                ..self.state
            };
            tracing::debug!(index = self.playlist.index(), "transition settled");
        }
    }

    pub fn params(&self, now: Duration) -> AnimationParams {
        derive_params(&self.state, now, self.canvas_width, &self.timing)
    }

    /// Residual glow still fading after the last transition settled.
    pub fn afterglow(&self, now: Duration) -> Option<Glow> {
        self.afterglow.and_then(|fade| fade.sample(now))
    }

    /// Everything the compositor needs for the frame at `now`.
    pub fn render_input(&self, now: Duration) -> RenderInput {
        let wash = match self.state.phase {
            Phase::Idle => None,
            Phase::Entering | Phase::Stabilizing => Some(Wash {
                variant: self.state.variant,
                elapsed: self.state.elapsed(now),
            }),
        };
        RenderInput {
            params: self.params(now),
            afterglow: self.afterglow(now),
            wash,
            visible: self.visible,
        }
    }
}

#[cfg(test)]
mod tests {
    use image::RgbaImage;

    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn beat(at: u64, intensity: f32) -> BeatEvent {
        BeatEvent {
            timestamp: ms(at),
            intensity,
        }
    }

    fn playlist(ids: &[&str]) -> Playlist {
        Playlist::new(
            ids.iter()
                .map(|id| ImageAsset::new(*id, RgbaImage::new(2, 2)).unwrap())
                .collect(),
        )
    }

    fn animator(ids: &[&str]) -> TransitionAnimator {
        TransitionAnimator::with_seed(&AppConfig::default(), playlist(ids), 7)
    }

    fn current(animator: &TransitionAnimator) -> &str {
        animator.current_asset().unwrap().id()
    }

    #[test]
    fn beats_commit_only_after_the_commit_interval() {
        let mut animator = animator(&["A", "B", "C"]);

        assert!(animator.on_beat(beat(0, 0.9), ms(0)));
        assert_eq!(current(&animator), "B");

        assert!(animator.on_beat(beat(1_300, 0.9), ms(1_300)));
        assert_eq!(current(&animator), "C");

        assert!(!animator.on_beat(beat(1_900, 0.9), ms(1_900)));
        assert_eq!(current(&animator), "C");
        assert_eq!(animator.commits(), 2);
    }

    #[test]
    fn idle_but_recent_commit_is_dropped() {
        let mut animator = animator(&["A", "B"]);
        assert!(animator.on_beat(beat(0, 0.5), ms(0)));
        animator.advance(ms(1_000));
        assert_eq!(animator.phase(), Phase::Idle);

        assert!(!animator.on_beat(beat(1_100, 0.5), ms(1_100)));
        assert!(animator.on_beat(beat(1_200, 0.5), ms(1_200)));
    }

    #[test]
    fn phases_follow_the_timeline() {
        let mut animator = animator(&["A", "B"]);
        animator.on_beat(beat(100, 0.4), ms(100));
        assert_eq!(animator.phase(), Phase::Entering);

        animator.advance(ms(699));
        assert_eq!(animator.phase(), Phase::Entering);
        animator.advance(ms(700));
        assert_eq!(animator.phase(), Phase::Stabilizing);
        animator.advance(ms(999));
        assert_eq!(animator.phase(), Phase::Stabilizing);
        animator.advance(ms(1_000));
        assert_eq!(animator.phase(), Phase::Idle);
        assert_eq!(animator.state().last_commit_time, Some(ms(100)));
    }

    #[test]
    fn params_are_identity_exactly_when_idle() {
        let mut animator = animator(&["A", "B", "C"]);
        let mut beats = [0u64, 450, 1_250, 1_300, 2_600, 4_000].into_iter().peekable();

        for tick in 0..330u64 {
            let now = ms(tick * 16);
            while beats.peek().is_some_and(|&at| ms(at) <= now) {
                if let Some(at) = beats.next() {
                    animator.on_beat(beat(at, 0.7), now);
                }
            }
            animator.advance(now);
            let params = animator.params(now);
            assert_eq!(
                params.is_identity(),
                animator.phase() == Phase::Idle,
                "tick {tick} in {:?}",
                animator.phase()
            );
        }
    }

    #[test]
    fn random_beat_trains_keep_commits_apart() {
        let config = AppConfig::default();
        let interval = config.transition.min_commit_interval();
        let mut rng = StdRng::seed_from_u64(2024);

        for trial in 0..40u64 {
            let mut animator =
                TransitionAnimator::with_seed(&config, playlist(&["A", "B", "C"]), trial);
            let mut now = Duration::ZERO;
            let mut commits = Vec::new();
            for _ in 0..150 {
                now += ms(rng.gen_range(0..700));
                if rng.gen_bool(0.5) {
                    animator.advance(now);
                }
                if animator.on_beat(beat(now.as_millis() as u64, rng.gen()), now) {
                    commits.push(now);
                }
            }

            assert!(commits.len() > 1, "trial {trial}");
            assert_eq!(animator.commits() as usize, commits.len());
            for pair in commits.windows(2) {
                assert!(
                    pair[1] - pair[0] >= interval,
                    "trial {trial}: commits at {:?} and {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn index_tracks_commit_count() {
        let mut animator = animator(&["A", "B", "C", "D"]);
        for n in 0..11u64 {
            let at = n * 1_500;
            assert!(animator.on_beat(beat(at, 0.2), ms(at)));
        }
        assert_eq!(animator.playlist().index() as u64, animator.commits() % 4);
    }

    #[test]
    fn empty_playlist_drops_beats() {
        let mut animator = animator(&[]);
        assert!(!animator.on_beat(beat(0, 1.0), ms(0)));
        assert_eq!(animator.phase(), Phase::Idle);
        assert!(animator.current_asset().is_none());
    }

    #[test]
    fn state_survives_a_pause() {
        let mut animator = animator(&["A", "B"]);
        animator.on_beat(beat(0, 0.6), ms(0));
        animator.advance(ms(300));
        let before = *animator.state();

        // no ticks while paused; the next tick resumes from the same state
        assert_eq!(*animator.state(), before);
        animator.advance(ms(5_000));
        assert_eq!(animator.phase(), Phase::Idle);
    }

    #[test]
    fn afterglow_fades_after_settling() {
        let mut animator = animator(&["A", "B"]);
        animator.on_beat(beat(0, 1.0), ms(0));
        animator.advance(ms(900));

        let start = animator.afterglow(ms(950)).unwrap();
        assert!((start.intensity - 0.9).abs() < 1e-6);
        let later = animator.afterglow(ms(1_500)).unwrap();
        assert!(later.intensity < start.intensity);
        assert!(animator.afterglow(ms(2_000)).is_none());
        assert!(animator.params(ms(950)).is_identity());
    }

    #[test]
    fn render_input_carries_wash_during_transition() {
        let mut animator = animator(&["A", "B"]);
        assert!(animator.render_input(ms(0)).wash.is_none());

        animator.on_beat(beat(0, 0.5), ms(0));
        let input = animator.render_input(ms(40));
        assert_eq!(input.wash.unwrap().elapsed, ms(40));
        assert!(input.visible);
    }

    #[test]
    fn commit_restores_visibility() {
        let mut animator = animator(&["A", "B"]);
        animator.set_visible(false);
        animator.on_beat(beat(0, 0.5), ms(0));
        assert!(animator.is_visible());
    }
}
