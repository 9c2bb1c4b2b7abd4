use std::collections::VecDeque;

use crate::config::HybridConfig;

/// Cruise control: freezes the tempo once the cadence is steady and only
/// resumes tracking after a sustained deviation.
#[derive(Debug, Clone)]
pub struct HybridMode {
    config: HybridConfig,
    locked_bpm: Option<f64>,
    window: VecDeque<f64>,
    unlock_since: Option<f64>,
    last_step_bpm: f64,
}

impl HybridMode {
    pub fn new(config: HybridConfig, current_bpm: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(config.lock_steps),
            config,
            locked_bpm: None,
            unlock_since: None,
            last_step_bpm: current_bpm,
        }
    }

    pub fn locked_bpm(&self) -> Option<f64> {
        self.locked_bpm
    }

    pub fn is_locked(&self) -> bool {
        self.locked_bpm.is_some()
    }

    pub fn unlock_pending(&self) -> bool {
        self.unlock_since.is_some()
    }

    /// Applies new parameters without dropping the lock state.
    pub fn reconfigure(&mut self, config: HybridConfig) {
        while self.window.len() > config.lock_steps {
            self.window.pop_front();
        }
        self.config = config;
    }

    pub fn on_step(&mut self, bpm: f64) {
        self.last_step_bpm = bpm;
        if self.locked_bpm.is_some() {
            return;
        }

        self.window.push_back(bpm);
        while self.window.len() > self.config.lock_steps {
            self.window.pop_front();
        }
        if self.window.len() < self.config.lock_steps {
            return;
        }

        let (min, max) = self
            .window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if max - min < self.config.stability_threshold_bpm {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            self.locked_bpm = Some(mean);
            tracing::info!(locked = mean, spread = max - min, "hybrid locked");
        }
    }

    pub fn handle_step(&mut self, now: f64, current_bpm: f64) -> f64 {
        let Some(locked) = self.locked_bpm else {
            return self.last_step_bpm;
        };

        let deviation = (current_bpm - locked).abs();
        if deviation <= self.config.unlock_threshold_bpm {
            if self.unlock_since.take().is_some() {
                tracing::debug!(deviation, "hybrid deviation subsided");
            }
            return locked;
        }

        let since = *self.unlock_since.get_or_insert(now);
        if now - since > self.config.unlock_hold_seconds {
            tracing::info!(deviation, "hybrid unlocked");
            self.locked_bpm = None;
            self.unlock_since = None;
            self.window.clear();
            return self.last_step_bpm;
        }
        locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked_at_150() -> HybridMode {
        let mut mode = HybridMode::new(HybridConfig::default(), 120.0);
        for bpm in [150.0, 151.0, 149.0, 150.0, 151.0] {
            mode.on_step(bpm);
        }
        mode
    }

    #[test]
    fn locks_on_stable_window() {
        let mode = locked_at_150();
        let locked = mode.locked_bpm().expect("mode should lock");
        assert!((locked - 150.2).abs() < 1e-9);
    }

    #[test]
    fn follows_steps_while_unlocked() {
        let mut mode = HybridMode::new(HybridConfig::default(), 120.0);
        assert_eq!(mode.handle_step(0.0, 120.0), 120.0);
        for bpm in [140.0, 150.0, 160.0, 150.0, 170.0] {
            mode.on_step(bpm);
        }
        assert!(!mode.is_locked());
        assert_eq!(mode.handle_step(1.0, 150.0), 170.0);
    }

    #[test]
    fn spread_equal_to_threshold_does_not_lock() {
        let mut mode = HybridMode::new(HybridConfig::default(), 120.0);
        for bpm in [150.0, 151.0, 149.0, 150.0, 152.0] {
            mode.on_step(bpm);
        }
        assert!(!mode.is_locked());
    }

    #[test]
    fn holds_lock_regardless_of_new_steps() {
        let mut mode = locked_at_150();
        let locked = mode.locked_bpm().unwrap();
        mode.on_step(180.0);
        mode.on_step(90.0);
        assert_eq!(mode.handle_step(1.0, 150.0), locked);
        assert_eq!(mode.handle_step(2.0, 160.0), locked);
    }

    #[test]
    fn unlocks_after_sustained_deviation() {
        let mut mode = locked_at_150();
        let locked = mode.locked_bpm().unwrap();
        mode.on_step(180.0);

        assert_eq!(mode.handle_step(10.0, 170.0), locked);
        assert!(mode.unlock_pending());
        assert_eq!(mode.handle_step(11.0, 170.0), locked);
        assert_eq!(mode.handle_step(11.6, 170.0), 180.0);
        assert!(!mode.is_locked());
    }

    #[test]
    fn brief_deviation_cancels_unlock_timer() {
        let mut mode = locked_at_150();
        let locked = mode.locked_bpm().unwrap();

        mode.handle_step(10.0, 170.0);
        assert_eq!(mode.handle_step(11.0, 152.0), locked);
        assert!(!mode.unlock_pending());
        assert_eq!(mode.handle_step(12.0, 170.0), locked);
        assert_eq!(mode.handle_step(13.0, 170.0), locked);
        assert!(mode.is_locked());
    }
}
