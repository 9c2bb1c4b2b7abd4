pub const MIN_MANUAL_BPM: f64 = 40.0;
pub const MAX_MANUAL_BPM: f64 = 240.0;

/// Operator-fixed tempo.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualMode {
    target_bpm: f64,
}

impl ManualMode {
    pub fn new(target_bpm: f64) -> Self {
        Self {
            target_bpm: clamp_manual(target_bpm),
        }
    }

    pub fn target_bpm(&self) -> f64 {
        self.target_bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) -> f64 {
        self.target_bpm = clamp_manual(bpm);
        tracing::info!(target = self.target_bpm, "manual target set");
        self.target_bpm
    }

    /// Applies a signed nudge and returns the clamped result.
    pub fn adjust(&mut self, delta: f64) -> f64 {
        self.set_bpm(self.target_bpm + delta)
    }

    pub fn handle_step(&self) -> f64 {
        self.target_bpm
    }
}

pub fn clamp_manual(bpm: f64) -> f64 {
    if bpm.is_nan() {
        return MIN_MANUAL_BPM;
    }
    bpm.clamp(MIN_MANUAL_BPM, MAX_MANUAL_BPM)
}
