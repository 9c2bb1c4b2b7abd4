//! Tempo policies. Exactly one [`ModeState`] variant is live at a time and
//! the [`ModeEngine`] turns footsteps and ticks into a target tempo.

mod dynamic;
mod hybrid;
mod manual;
mod random;

use std::{fmt, str::FromStr};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use dynamic::DynamicMode;
pub use hybrid::HybridMode;
pub use manual::{clamp_manual, ManualMode, MAX_MANUAL_BPM, MIN_MANUAL_BPM};
pub use random::{RandomKind, RandomMode, TargetPick};

use crate::{
    config::{HybridConfig, PredictionConfig, RandomConfig, SessionConfig},
    predict::TempoPredictor,
    StepSyncError,
};

/// Selector for the operator-facing mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Dynamic,
    Manual,
    Hybrid,
    Random,
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dynamic => "dynamic",
            Self::Manual => "manual",
            Self::Hybrid => "hybrid",
            Self::Random => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for ModeKind {
    type Err = StepSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "manual" => Ok(Self::Manual),
            "hybrid" => Ok(Self::Hybrid),
            "random" => Ok(Self::Random),
            _ => Err(StepSyncError::InvalidInput("unknown tempo mode")),
        }
    }
}

/// The live policy together with its transient state.
#[derive(Debug, Clone)]
pub enum ModeState {
    Dynamic(DynamicMode),
    Manual(ManualMode),
    Hybrid(HybridMode),
    Random(RandomMode),
}

impl ModeState {
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Dynamic(_) => ModeKind::Dynamic,
            Self::Manual(_) => ModeKind::Manual,
            Self::Hybrid(_) => ModeKind::Hybrid,
            Self::Random(_) => ModeKind::Random,
        }
    }
}

/// Owns the active mode, the parameters every mode is rebuilt from, and the
/// optional prediction collaborator.
pub struct ModeEngine {
    state: ModeState,
    reference_bpm: f64,
    manual_bpm: f64,
    hybrid: HybridConfig,
    random: RandomConfig,
    prediction: PredictionConfig,
    sensor_window: u32,
    sensor_stride: u32,
    predictor: Option<Box<dyn TempoPredictor>>,
    rng_seed: Option<u64>,
}

impl ModeEngine {
    /// Builds the engine in `config.initial_mode`, holding `reference_bpm`.
    pub fn new(config: &SessionConfig, reference_bpm: f64) -> Self {
        let mut engine = Self {
            state: ModeState::Dynamic(DynamicMode::new(reference_bpm)),
            reference_bpm,
            manual_bpm: clamp_manual(config.manual_bpm.unwrap_or(reference_bpm)),
            hybrid: config.hybrid.clone(),
            random: config.random.clone(),
            prediction: config.prediction.clone(),
            sensor_window: config.link.smoothing_window,
            sensor_stride: config.link.stride,
            predictor: None,
            rng_seed: None,
        };
        engine.state = engine.enter(config.initial_mode, reference_bpm);
        engine
    }

    /// Makes the random game reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        if let ModeState::Random(_) = self.state {
            self.state = self.enter(ModeKind::Random, self.reference_bpm);
        }
        self
    }

    pub fn with_predictor(mut self, mut predictor: Box<dyn TempoPredictor>) -> Self {
        predictor.warmup(Some(self.reference_bpm), self.prediction.run_type);
        self.predictor = Some(predictor);
        self
    }

    pub fn kind(&self) -> ModeKind {
        self.state.kind()
    }

    pub fn state(&self) -> &ModeState {
        &self.state
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.state, ModeState::Manual(_))
    }

    pub fn manual_bpm(&self) -> f64 {
        self.manual_bpm
    }

    /// Switches policy. Only the entering mode's buffers start fresh; the
    /// live tempo carries over through `current_bpm`.
    pub fn switch(&mut self, kind: ModeKind, current_bpm: f64) {
        tracing::info!(from = %self.kind(), to = %kind, "switching tempo mode");
        self.state = self.enter(kind, current_bpm);
    }

    fn enter(&self, kind: ModeKind, current_bpm: f64) -> ModeState {
        match kind {
            ModeKind::Dynamic => ModeState::Dynamic(DynamicMode::new(current_bpm)),
            ModeKind::Manual => ModeState::Manual(ManualMode::new(self.manual_bpm)),
            ModeKind::Hybrid => ModeState::Hybrid(HybridMode::new(self.hybrid.clone(), current_bpm)),
            ModeKind::Random => {
                let rng = match self.rng_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                ModeState::Random(RandomMode::new(self.random.clone(), self.reference_bpm, rng))
            }
        }
    }

    /// Folds one detected footstep into the active mode.
    pub fn on_step(&mut self, bpm: f64, instant_bpm: Option<f64>, now: f64) {
        let predicted = self.observe_step(bpm, instant_bpm);
        match &mut self.state {
            ModeState::Dynamic(mode) => mode.on_step(bpm, predicted),
            ModeState::Manual(_) => {}
            ModeState::Hybrid(mode) => mode.on_step(bpm),
            ModeState::Random(mode) => mode.on_step(bpm, now),
        }
    }

    /// Target tempo for this tick.
    pub fn handle_step(&mut self, now: f64, current_bpm: f64, dt: f64) -> f64 {
        let target = match &mut self.state {
            ModeState::Dynamic(mode) => mode.handle_step(),
            ModeState::Manual(mode) => mode.handle_step(),
            ModeState::Hybrid(mode) => mode.handle_step(now, current_bpm),
            ModeState::Random(mode) => mode.handle_step(now, current_bpm),
        };
        tracing::trace!(mode = %self.state.kind(), now, dt, target, "mode tick");
        target
    }

    /// Feeds the predictor and, in dynamic mode, asks it for the next tempo.
    fn observe_step(&mut self, bpm: f64, instant_bpm: Option<f64>) -> Option<f64> {
        let predictor = self.predictor.as_mut()?;
        predictor.add_step(bpm, instant_bpm);
        if !matches!(self.state, ModeState::Dynamic(_)) {
            return None;
        }

        match predictor.predict_next(self.sensor_window, self.sensor_stride, self.prediction.run_type) {
            Ok(Some(next)) if next.is_finite() && next > 0.0 => Some(next),
            Ok(Some(next)) => {
                tracing::warn!(next, "predictor returned an unusable tempo");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, "prediction failed, using raw step tempo");
                None
            }
        }
    }

    pub fn set_manual_bpm(&mut self, bpm: f64) -> f64 {
        self.manual_bpm = clamp_manual(bpm);
        if let ModeState::Manual(mode) = &mut self.state {
            mode.set_bpm(self.manual_bpm);
        }
        self.manual_bpm
    }

    pub fn adjust_manual_bpm(&mut self, delta: f64) -> f64 {
        self.manual_bpm = match &mut self.state {
            ModeState::Manual(mode) => mode.adjust(delta),
            _ => clamp_manual(self.manual_bpm + delta),
        };
        self.manual_bpm
    }

    /// Edits the hybrid parameters and pushes them into the live mode.
    pub fn update_hybrid(&mut self, edit: impl FnOnce(&mut HybridConfig)) {
        edit(&mut self.hybrid);
        tracing::info!(config = ?self.hybrid, "hybrid parameters updated");
        if let ModeState::Hybrid(mode) = &mut self.state {
            mode.reconfigure(self.hybrid.clone());
        }
    }

    /// Edits the random-game parameters and pushes them into the live mode.
    pub fn update_random(&mut self, edit: impl FnOnce(&mut RandomConfig)) {
        edit(&mut self.random);
        tracing::info!(config = ?self.random, "random parameters updated");
        if let ModeState::Random(mode) = &mut self.state {
            mode.reconfigure(self.random.clone());
        }
    }

    /// Keeps the sensor parameters handed to the predictor in sync.
    pub fn set_sensor_params(&mut self, window: Option<u32>, stride: Option<u32>) {
        if let Some(window) = window {
            self.sensor_window = window;
        }
        if let Some(stride) = stride {
            self.sensor_stride = stride;
        }
    }
}

impl fmt::Debug for ModeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeEngine")
            .field("state", &self.state)
            .field("manual_bpm", &self.manual_bpm)
            .field("predictor", &self.predictor.is_some())
            .finish()
    }
}
