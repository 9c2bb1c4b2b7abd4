//! Smooths the raw cadence-derived target into the tempo the music plays at.

use crate::config::{clamp_alpha, EstimatorConfig};

/// Differences below this are snapped instead of smoothed.
const SNAP_THRESHOLD: f64 = 0.1;
/// Gap above which acceleration gets the adaptive boost.
const BOOST_START_BPM: f64 = 5.0;
const BOOST_PER_BPM: f64 = 0.1;
const BOOST_CAP: f64 = 4.0;
/// Alphas are tuned for a 50 Hz loop, so they are scaled back by that rate.
const RATE_SCALE: f64 = 25.0;
const HEARTBEAT_SECONDS: f64 = 0.1;
const SLIDE_LOG_BPM: f64 = 1.0;

/// Asymmetric exponential smoother with decay-on-stall and a startup ramp.
///
/// All times are seconds on the session clock.
#[derive(Debug, Clone)]
pub struct TempoEstimator {
    current_bpm: f64,
    target_bpm: f64,
    alpha_up: f64,
    alpha_down: f64,
    ramp_ticks: u32,
    ramp_max_bpm_per_sec: f64,
    last_update_time: f64,
    last_step_time: f64,
    step_count: u64,
    tick_count: u64,
    last_heartbeat: f64,
}

impl TempoEstimator {
    /// Starts at `initial_bpm` with the session clock at zero.
    pub fn new(initial_bpm: f64, config: &EstimatorConfig) -> Self {
        Self {
            current_bpm: initial_bpm,
            target_bpm: initial_bpm,
            alpha_up: clamp_alpha(config.alpha_up),
            alpha_down: clamp_alpha(config.alpha_down),
            ramp_ticks: config.ramp_ticks,
            ramp_max_bpm_per_sec: config.ramp_max_bpm_per_sec,
            last_update_time: 0.0,
            last_step_time: 0.0,
            step_count: 0,
            tick_count: 0,
            last_heartbeat: 0.0,
        }
    }

    pub fn current_bpm(&self) -> f64 {
        self.current_bpm
    }

    /// Target after decay was applied on the last tick.
    pub fn target_bpm(&self) -> f64 {
        self.target_bpm
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn alpha_up(&self) -> f64 {
        self.alpha_up
    }

    pub fn alpha_down(&self) -> f64 {
        self.alpha_down
    }

    /// Non-finite values are ignored and the previous rate is kept.
    pub fn set_alpha_up(&mut self, alpha: f64) {
        if alpha.is_finite() {
            self.alpha_up = clamp_alpha(alpha);
        } else {
            tracing::warn!(alpha, "ignoring non-finite alpha_up");
        }
    }

    pub fn set_alpha_down(&mut self, alpha: f64) {
        if alpha.is_finite() {
            self.alpha_down = clamp_alpha(alpha);
        } else {
            tracing::warn!(alpha, "ignoring non-finite alpha_down");
        }
    }

    /// Records a detected footstep; resets the decay timer.
    pub fn register_step(&mut self, now: f64) {
        self.last_step_time = now;
        self.step_count += 1;
    }

    /// Advances the smoother to `now` and returns the new current tempo.
    pub fn tick(&mut self, now: f64, mode_target: f64, manual_mode: bool) -> f64 {
        let dt = (now - self.last_update_time).max(0.0);
        self.last_update_time = now;
        self.tick_count += 1;

        if manual_mode {
            if mode_target.is_finite() && mode_target > 0.0 {
                self.current_bpm = mode_target;
            }
            self.target_bpm = mode_target;
            self.heartbeat(now);
            return self.current_bpm;
        }

        let target = self.decayed_target(now, mode_target);
        self.target_bpm = target;

        let previous = self.current_bpm;
        let candidate = self.smooth_towards(target, dt);
        if candidate.is_finite() && candidate > 0.0 {
            self.current_bpm = candidate;
        } else {
            tracing::debug!(candidate, "discarding non-positive smoothed tempo");
        }

        if (self.current_bpm - previous).abs() > SLIDE_LOG_BPM {
            tracing::info!(
                from = previous,
                to = self.current_bpm,
                target,
                "tempo sliding"
            );
        }
        self.heartbeat(now);
        self.current_bpm
    }

    /// Caps the target at the cadence implied by the time since the last step.
    fn decayed_target(&self, now: f64, mode_target: f64) -> f64 {
        if self.step_count == 0 {
            return mode_target;
        }

        let since_step = now - self.last_step_time;
        if since_step > 0.0 {
            let ceiling = 60.0 / since_step;
            if ceiling < mode_target {
                return ceiling;
            }
        }
        mode_target
    }

    fn smooth_towards(&self, target: f64, dt: f64) -> f64 {
        let diff = target - self.current_bpm;
        if diff.abs() < SNAP_THRESHOLD {
            return target;
        }

        let mut alpha = if diff > 0.0 {
            self.alpha_up
        } else {
            self.alpha_down
        };
        if diff > BOOST_START_BPM {
            alpha *= (1.0 + (diff - BOOST_START_BPM) * BOOST_PER_BPM).min(BOOST_CAP);
        }

        let mut step = diff * alpha * RATE_SCALE * dt;
        if self.tick_count <= u64::from(self.ramp_ticks) {
            let max_step = self.ramp_max_bpm_per_sec * dt;
            step = step.clamp(-max_step, max_step);
        }

        if step.abs() >= diff.abs() {
            target
        } else {
            self.current_bpm + step
        }
    }

    fn heartbeat(&mut self, now: f64) {
        if now - self.last_heartbeat >= HEARTBEAT_SECONDS {
            tracing::debug!(
                time = now,
                bpm = self.current_bpm,
                target = self.target_bpm,
                "tempo heartbeat"
            );
            self.last_heartbeat = now;
        }
    }
}
