use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::RandomConfig;

const MIN_GAME_BPM: f64 = 40.0;
const MAX_GAME_BPM: f64 = 200.0;
/// A fresh target should differ from the previous one by more than this.
const MIN_RETARGET_DISTANCE: f64 = 10.0;
const MAX_RETARGET_RETRIES: u32 = 5;
const PROGRESS_LOG_EVERY: u32 = 5;

/// Which matching game is being played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomKind {
    /// Hold the tempo near the target for a number of seconds.
    Gamified,
    /// Land a number of consecutive steps near the target.
    Simple,
}

/// Result of drawing a new target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPick {
    pub target: f64,
    /// Draws taken, including the accepted one.
    pub draws: u32,
}

/// Gamified target matching around the score tempo.
#[derive(Debug, Clone)]
pub struct RandomMode {
    config: RandomConfig,
    reference_bpm: f64,
    rng: StdRng,
    game_target: Option<f64>,
    target_assigned_at: Option<f64>,
    match_started_at: Option<f64>,
    consecutive_matches: u32,
    rounds_won: u32,
}

impl RandomMode {
    pub fn new(config: RandomConfig, reference_bpm: f64, rng: StdRng) -> Self {
        Self {
            config,
            reference_bpm,
            rng,
            game_target: None,
            target_assigned_at: None,
            match_started_at: None,
            consecutive_matches: 0,
            rounds_won: 0,
        }
    }

    pub fn with_seed(config: RandomConfig, reference_bpm: f64, seed: u64) -> Self {
        Self::new(config, reference_bpm, StdRng::seed_from_u64(seed))
    }

    pub fn kind(&self) -> RandomKind {
        if self.config.gamified {
            RandomKind::Gamified
        } else {
            RandomKind::Simple
        }
    }

    pub fn game_target(&self) -> Option<f64> {
        self.game_target
    }

    pub fn consecutive_matches(&self) -> u32 {
        self.consecutive_matches
    }

    pub fn rounds_won(&self) -> u32 {
        self.rounds_won
    }

    /// Applies new parameters. Switching game kind restarts the round.
    pub fn reconfigure(&mut self, config: RandomConfig) {
        let kind_changed = config.gamified != self.config.gamified;
        self.config = config;
        if kind_changed {
            tracing::info!(kind = ?self.kind(), "random game kind switched");
            self.game_target = None;
            self.match_started_at = None;
            self.consecutive_matches = 0;
        }
    }

    /// Counts consecutive matching steps in the simple game.
    pub fn on_step(&mut self, bpm: f64, now: f64) {
        if self.config.gamified {
            return;
        }
        let Some(target) = self.game_target else {
            return;
        };

        if (bpm - target).abs() < self.config.simple_threshold_bpm {
            self.consecutive_matches += 1;
            if self.consecutive_matches % PROGRESS_LOG_EVERY == 0 {
                tracing::info!(
                    matched = self.consecutive_matches,
                    needed = self.config.simple_steps,
                    "simple game progress"
                );
            }
            if self.consecutive_matches >= self.config.simple_steps {
                self.rounds_won += 1;
                tracing::info!(steps = self.consecutive_matches, "simple game round won");
                self.pick_new_target(now);
            }
        } else {
            if self.consecutive_matches > 0 {
                tracing::info!("simple game lost match");
            }
            self.consecutive_matches = 0;
        }
    }

    pub fn handle_step(&mut self, now: f64, current_bpm: f64) -> f64 {
        let Some(target) = self.game_target else {
            return self.pick_new_target(now).target;
        };
        let assigned = self.target_assigned_at.unwrap_or(now);

        if !self.config.gamified {
            if now - assigned > self.config.simple_timeout_seconds {
                tracing::info!(timeout = self.config.simple_timeout_seconds, "simple game timed out");
                return self.pick_new_target(now).target;
            }
            return target;
        }

        if now - assigned > self.config.timeout_seconds {
            tracing::info!(timeout = self.config.timeout_seconds, "game round timed out");
            return self.pick_new_target(now).target;
        }

        if (current_bpm - target).abs() < self.config.match_threshold_bpm {
            let started = *self.match_started_at.get_or_insert_with(|| {
                tracing::info!(target, "game matched, hold it");
                now
            });
            if now - started > self.config.hold_seconds {
                self.rounds_won += 1;
                tracing::info!(held = now - started, "game round won");
                return self.pick_new_target(now).target;
            }
        } else if self.match_started_at.take().is_some() {
            tracing::info!("game lost match");
        }
        target
    }

    /// Draws a target inside the span, retrying for one that is far enough
    /// from the previous target.
    pub fn pick_new_target(&mut self, now: f64) -> TargetPick {
        let span = self.reference_bpm * self.config.span_fraction.abs();
        let lo = (self.reference_bpm - span).max(MIN_GAME_BPM);
        let hi = (self.reference_bpm + span).min(MAX_GAME_BPM);

        let mut draws = 0;
        let target = loop {
            draws += 1;
            let candidate = if hi > lo {
                self.rng.random_range(lo..=hi)
            } else {
                hi.max(MIN_GAME_BPM)
            };
            match self.game_target {
                None => break candidate,
                Some(previous) if (candidate - previous).abs() > MIN_RETARGET_DISTANCE => {
                    break candidate
                }
                Some(_) if draws > MAX_RETARGET_RETRIES => break candidate,
                Some(_) => {}
            }
        };

        self.game_target = Some(target);
        self.target_assigned_at = Some(now);
        self.match_started_at = None;
        self.consecutive_matches = 0;
        tracing::info!(target, draws, "new game target");
        TargetPick { target, draws }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gamified() -> RandomMode {
        RandomMode::with_seed(RandomConfig::default(), 120.0, 7)
    }

    fn simple() -> RandomMode {
        RandomMode::with_seed(
            RandomConfig {
                gamified: false,
                simple_steps: 4,
                ..RandomConfig::default()
            },
            120.0,
            11,
        )
    }

    #[test]
    fn first_tick_assigns_target_within_span() {
        let mut mode = gamified();
        let target = mode.handle_step(0.0, 120.0);
        assert!((96.0..=144.0).contains(&target));
        assert_eq!(mode.game_target(), Some(target));
    }

    #[test]
    fn targets_respect_absolute_bounds() {
        let mut mode = RandomMode::with_seed(
            RandomConfig {
                span_fraction: 0.9,
                ..RandomConfig::default()
            },
            180.0,
            3,
        );
        for i in 0..200 {
            let pick = mode.pick_new_target(i as f64);
            assert!((40.0..=200.0).contains(&pick.target));
        }
    }

    #[test]
    fn retarget_moves_far_unless_retries_run_out() {
        for seed in 0..50 {
            let mut mode = RandomMode::with_seed(RandomConfig::default(), 120.0, seed);
            let mut previous = mode.pick_new_target(0.0).target;
            for round in 1..20 {
                let pick = mode.pick_new_target(round as f64);
                assert!(
                    (pick.target - previous).abs() > 10.0 || pick.draws == 6,
                    "seed {seed}: {previous} -> {} after {} draws",
                    pick.target,
                    pick.draws
                );
                assert!(pick.draws <= 6);
                previous = pick.target;
            }
        }
    }

    #[test]
    fn narrow_span_accepts_after_retries() {
        let mut mode = RandomMode::with_seed(
            RandomConfig {
                span_fraction: 0.01,
                ..RandomConfig::default()
            },
            120.0,
            5,
        );
        mode.pick_new_target(0.0);
        let pick = mode.pick_new_target(1.0);
        assert_eq!(pick.draws, 6);
        assert!((118.8..=121.2).contains(&pick.target));
    }

    #[test]
    fn gamified_round_is_won_after_holding() {
        let mut mode = gamified();
        let target = mode.handle_step(0.0, 120.0);

        assert_eq!(mode.handle_step(1.0, target + 1.0), target);
        assert_eq!(mode.handle_step(6.0, target - 1.0), target);
        assert_eq!(mode.handle_step(11.0, target), target);
        let next = mode.handle_step(11.5, target);
        assert_ne!(next, target);
        assert_eq!(mode.rounds_won(), 1);
    }

    #[test]
    fn losing_the_match_restarts_the_hold() {
        let mut mode = gamified();
        let target = mode.handle_step(0.0, 120.0);

        mode.handle_step(1.0, target);
        mode.handle_step(8.0, target + 20.0);
        mode.handle_step(9.0, target);
        assert_eq!(mode.handle_step(15.0, target), target);
        assert_eq!(mode.rounds_won(), 0);
    }

    #[test]
    fn gamified_round_times_out() {
        let mut mode = gamified();
        let target = mode.handle_step(0.0, 120.0);
        assert_eq!(mode.handle_step(19.0, target + 30.0), target);
        assert_ne!(mode.handle_step(20.5, target + 30.0), target);
        assert_eq!(mode.rounds_won(), 0);
    }

    #[test]
    fn simple_game_counts_consecutive_steps() {
        let mut mode = simple();
        let target = mode.handle_step(0.0, 120.0);

        mode.on_step(target + 1.0, 1.0);
        mode.on_step(target - 1.0, 2.0);
        assert_eq!(mode.consecutive_matches(), 2);
        mode.on_step(target + 30.0, 3.0);
        assert_eq!(mode.consecutive_matches(), 0);

        for i in 0..4 {
            mode.on_step(target, 4.0 + i as f64);
        }
        assert_eq!(mode.rounds_won(), 1);
        assert_ne!(mode.game_target(), Some(target));
        assert_eq!(mode.consecutive_matches(), 0);
    }

    #[test]
    fn simple_game_times_out_on_wall_clock() {
        let mut mode = simple();
        let target = mode.handle_step(0.0, 120.0);
        assert_eq!(mode.handle_step(29.0, 120.0), target);
        assert_ne!(mode.handle_step(31.0, 120.0), target);
    }

    #[test]
    fn simple_game_ignores_current_tempo() {
        let mut mode = simple();
        let target = mode.handle_step(0.0, 120.0);
        assert_eq!(mode.handle_step(5.0, target), target);
        assert_eq!(mode.rounds_won(), 0);
    }
}
