use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ModeKind, Result, RunType, StepSyncError};

pub const MIN_ALPHA: f64 = 0.001;
pub const MAX_ALPHA: f64 = 1.0;

/// Top-level configuration for one walking session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub initial_mode: ModeKind,
    /// Operator tempo used by manual mode. Falls back to the score tempo.
    pub manual_bpm: Option<f64>,
    pub estimator: EstimatorConfig,
    pub hybrid: HybridConfig,
    pub random: RandomConfig,
    pub link: LinkConfig,
    pub scheduler: SchedulerConfig,
    pub prediction: PredictionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_mode: ModeKind::Dynamic,
            manual_bpm: None,
            estimator: EstimatorConfig::default(),
            hybrid: HybridConfig::default(),
            random: RandomConfig::default(),
            link: LinkConfig::default(),
            scheduler: SchedulerConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Reads a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bpm) = self.manual_bpm {
            if !(bpm.is_finite() && bpm > 0.0) {
                return Err(StepSyncError::Config(format!("manual_bpm must be positive, got {bpm}")));
            }
        }
        if self.estimator.tick_interval_ms == 0 {
            return Err(StepSyncError::Config("estimator.tick_interval_ms must be non-zero".into()));
        }
        if self.scheduler.poll_interval_us == 0 {
            return Err(StepSyncError::Config("scheduler.poll_interval_us must be non-zero".into()));
        }
        if self.link.max_step_bpm <= 0.0 {
            return Err(StepSyncError::Config("link.max_step_bpm must be positive".into()));
        }
        Ok(())
    }
}

/// Smoothing parameters of the tempo estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Attack rate used while the tempo rises.
    pub alpha_up: f64,
    /// Release rate used while the tempo falls.
    pub alpha_down: f64,
    /// Number of ticks after start during which steps are rate limited.
    pub ramp_ticks: u32,
    pub ramp_max_bpm_per_sec: f64,
    /// Period of the ingestion loop.
    pub tick_interval_ms: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha_up: 0.025,
            alpha_down: 0.025,
            ramp_ticks: 5,
            ramp_max_bpm_per_sec: 10.0,
            tick_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub lock_steps: usize,
    pub stability_threshold_bpm: f64,
    pub unlock_threshold_bpm: f64,
    pub unlock_hold_seconds: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            lock_steps: 5,
            stability_threshold_bpm: 3.0,
            unlock_threshold_bpm: 15.0,
            unlock_hold_seconds: 1.5,
        }
    }
}

impl HybridConfig {
    pub fn set_lock_steps(&mut self, steps: usize) {
        self.lock_steps = steps.max(2);
    }

    pub fn set_unlock_hold_seconds(&mut self, seconds: f64) {
        self.unlock_hold_seconds = seconds.max(0.5);
    }

    pub fn set_stability_threshold(&mut self, bpm: f64) {
        self.stability_threshold_bpm = bpm.max(1.0);
    }

    pub fn set_unlock_threshold(&mut self, bpm: f64) {
        self.unlock_threshold_bpm = bpm.max(5.0);
    }
}

/// Parameters of the target-matching game.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    /// Half-width of the target window as a fraction of the score tempo.
    pub span_fraction: f64,
    /// `true` selects the time-held game, `false` the step-counting one.
    pub gamified: bool,
    pub match_threshold_bpm: f64,
    pub hold_seconds: f64,
    pub timeout_seconds: f64,
    pub simple_threshold_bpm: f64,
    pub simple_steps: u32,
    pub simple_timeout_seconds: f64,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            span_fraction: 0.20,
            gamified: true,
            match_threshold_bpm: 5.0,
            hold_seconds: 10.0,
            timeout_seconds: 20.0,
            simple_threshold_bpm: 5.0,
            simple_steps: 20,
            simple_timeout_seconds: 30.0,
        }
    }
}

/// Serial link and sensor-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Delay before the handshake so the sensor can finish booting.
    pub settle_ms: u64,
    /// Time each handshake attempt waits for its acknowledgement.
    pub ack_wait_ms: u64,
    /// Sensor smoothing window. Only sent when it differs from the firmware default.
    pub smoothing_window: u32,
    /// Sensor update stride. Only sent when it differs from the firmware default.
    pub stride: u32,
    /// Samples faster than this are treated as noise.
    pub max_step_bpm: f64,
}

pub const FIRMWARE_DEFAULT_WINDOW: u32 = 3;
pub const FIRMWARE_DEFAULT_STRIDE: u32 = 2;

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            settle_ms: 500,
            ack_wait_ms: 100,
            smoothing_window: FIRMWARE_DEFAULT_WINDOW,
            stride: FIRMWARE_DEFAULT_STRIDE,
            max_step_bpm: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on a single sleep inside an event wait.
    pub poll_interval_us: u64,
    pub phase_correction: bool,
    pub phase_gain: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 1_000,
            phase_correction: false,
            phase_gain: 0.04,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub enabled: bool,
    pub window: usize,
    pub run_type: RunType,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 8,
            run_type: RunType::Walk,
        }
    }
}

pub fn clamp_alpha(alpha: f64) -> f64 {
    alpha.clamp(MIN_ALPHA, MAX_ALPHA)
}
