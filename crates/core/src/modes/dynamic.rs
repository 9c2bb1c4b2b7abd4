use crate::predict::blend;

/// Follows the walker's reported cadence, optionally nudged by a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicMode {
    target_bpm: f64,
}

impl DynamicMode {
    /// Starts out holding `current_bpm` so entering the mode is seamless.
    pub fn new(current_bpm: f64) -> Self {
        Self {
            target_bpm: current_bpm,
        }
    }

    pub fn on_step(&mut self, bpm: f64, predicted: Option<f64>) {
        self.target_bpm = match predicted {
            Some(next) => {
                let blended = blend(next, bpm);
                tracing::debug!(raw = bpm, predicted = next, blended, "blending prediction");
                blended
            }
            None => bpm,
        };
    }

    pub fn handle_step(&self) -> f64 {
        self.target_bpm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_last_step() {
        let mut mode = DynamicMode::new(120.0);
        assert_eq!(mode.handle_step(), 120.0);
        mode.on_step(104.0, None);
        assert_eq!(mode.handle_step(), 104.0);
    }

    #[test]
    fn blends_prediction_with_raw_step() {
        let mut mode = DynamicMode::new(120.0);
        mode.on_step(100.0, Some(120.0));
        assert!((mode.handle_step() - 113.0).abs() < 1e-9);

        mode.on_step(100.0, None);
        assert_eq!(mode.handle_step(), 100.0);
    }
}
