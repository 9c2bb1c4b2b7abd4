use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Blend weight of the predicted tempo in dynamic mode.
pub const PREDICTION_WEIGHT: f64 = 0.65;

/// Activity the predictor was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Walk,
    Run,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictorError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model produced an unusable value: {0}")]
    InvalidOutput(f64),
}

/// Port for a trained next-step tempo model.
///
/// Implementations must tolerate calls before any data is buffered. The
/// engine treats every `Err` as "no prediction available" for that step.
pub trait TempoPredictor: Send {
    fn add_step(&mut self, walking_bpm: f64, instant_bpm: Option<f64>);

    fn predict_next(
        &mut self,
        smoothing_window: u32,
        stride: u32,
        run_type: RunType,
    ) -> Result<Option<f64>, PredictorError>;

    fn warmup(&mut self, initial_bpm: Option<f64>, run_type: RunType);
}

/// Combines a prediction with the raw step tempo.
pub fn blend(predicted: f64, raw_bpm: f64) -> f64 {
    PREDICTION_WEIGHT * predicted + (1.0 - PREDICTION_WEIGHT) * raw_bpm
}

/// Least-squares trend over the most recent steps.
#[derive(Debug, Clone)]
pub struct TrendPredictor {
    window: usize,
    history: VecDeque<f64>,
}

impl TrendPredictor {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            history: VecDeque::with_capacity(window),
        }
    }

    fn push(&mut self, bpm: f64) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(bpm);
    }
}

impl TempoPredictor for TrendPredictor {
    fn add_step(&mut self, walking_bpm: f64, _instant_bpm: Option<f64>) {
        if walking_bpm.is_finite() && walking_bpm > 0.0 {
            self.push(walking_bpm);
        }
    }

    fn predict_next(
        &mut self,
        _smoothing_window: u32,
        stride: u32,
        _run_type: RunType,
    ) -> Result<Option<f64>, PredictorError> {
        if self.history.len() < self.window {
            return Ok(None);
        }

        let n = self.history.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = self.history.iter().sum::<f64>() / n;
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in self.history.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        let slope = if den > 0.0 { num / den } else { 0.0 };
        let ahead = (n - 1.0 - mean_x) + f64::from(stride.max(1));
        let predicted = mean_y + slope * ahead;

        if predicted.is_finite() && predicted > 0.0 {
            Ok(Some(predicted))
        } else {
            Err(PredictorError::InvalidOutput(predicted))
        }
    }

    fn warmup(&mut self, initial_bpm: Option<f64>, run_type: RunType) {
        self.history.clear();
        if let Some(bpm) = initial_bpm.filter(|bpm| bpm.is_finite() && *bpm > 0.0) {
            for _ in 0..self.window {
                self.push(bpm);
            }
        }
        tracing::debug!(?run_type, ?initial_bpm, "trend predictor warmed up");
    }
}
