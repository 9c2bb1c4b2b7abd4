use std::str::FromStr;

use crate::{ModeKind, StepSyncError};

const DEFAULT_CALIBRATION_MARGIN: u32 = 200;

/// Operator instruction received on the runtime command channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    SetAlphaUp(f64),
    SetAlphaDown(f64),
    SetManualBpm(f64),
    AdjustManualBpm(f64),
    SetMode(ModeKind),
    SetHybridLockSteps(usize),
    SetHybridUnlockTime(f64),
    SetHybridStabilityThreshold(f64),
    SetHybridUnlockThreshold(f64),
    SetRandomSpan(f64),
    SetRandomGamified(bool),
    SetRandomSimpleThreshold(f64),
    SetRandomSimpleSteps(u32),
    SetRandomSimpleTimeout(f64),
    /// Forwarded to the sensor.
    SetWindow(u32),
    /// Forwarded to the sensor.
    SetStride(u32),
    /// Forwarded to the sensor.
    CalibrateWeight(u32),
    Quit,
}

impl EngineCommand {
    /// Parses one `KEY:VALUE` line (or the bare `QUIT` sentinel).
    pub fn parse(line: &str) -> Result<Self, StepSyncError> {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            return match line.to_ascii_uppercase().as_str() {
                "QUIT" => Ok(Self::Quit),
                _ => Err(StepSyncError::InvalidInput("command must be KEY:VALUE")),
            };
        };
        let value = value.trim();

        let command = match key.trim().to_ascii_uppercase().as_str() {
            "SET_ALPHA_UP" => Self::SetAlphaUp(real(value)?),
            "SET_ALPHA_DOWN" => Self::SetAlphaDown(real(value)?),
            "SET_MANUAL_BPM" => Self::SetManualBpm(real(value)?),
            "ADJUST_MANUAL_BPM" => Self::AdjustManualBpm(real(value)?),
            "SET_MODE" => Self::SetMode(value.parse()?),
            "SET_HYBRID_LOCK_STEPS" => Self::SetHybridLockSteps(number(value)?),
            "SET_HYBRID_UNLOCK_TIME" => Self::SetHybridUnlockTime(real(value)?),
            "SET_HYBRID_STABILITY_THRESHOLD" => Self::SetHybridStabilityThreshold(real(value)?),
            "SET_HYBRID_UNLOCK_THRESHOLD" => Self::SetHybridUnlockThreshold(real(value)?),
            "SET_RANDOM_SPAN" => Self::SetRandomSpan(real(value)?),
            "SET_RANDOM_GAMIFIED" => Self::SetRandomGamified(number::<u8>(value)? == 1),
            "SET_RANDOM_SIMPLE_THRESHOLD" => Self::SetRandomSimpleThreshold(real(value)?),
            "SET_RANDOM_SIMPLE_STEPS" => Self::SetRandomSimpleSteps(number(value)?),
            "SET_RANDOM_SIMPLE_TIMEOUT" => Self::SetRandomSimpleTimeout(real(value)?),
            "SET_WINDOW" => Self::SetWindow(number(value)?),
            "SET_STRIDE" => Self::SetStride(number(value)?),
            "CAL_WEIGHT" if value.is_empty() => Self::CalibrateWeight(DEFAULT_CALIBRATION_MARGIN),
            "CAL_WEIGHT" => Self::CalibrateWeight(number(value)?),
            "QUIT" => Self::Quit,
            _ => return Err(StepSyncError::InvalidInput("unknown command key")),
        };
        Ok(command)
    }

    /// Line to forward to the sensor, for commands the sensor handles.
    pub fn sensor_line(&self) -> Option<String> {
        match self {
            Self::SetWindow(window) => Some(format!("SET_WINDOW,{window}")),
            Self::SetStride(stride) => Some(format!("SET_STRIDE,{stride}")),
            Self::CalibrateWeight(margin) => Some(format!("CAL_WEIGHT,{margin}")),
            _ => None,
        }
    }
}

impl FromStr for EngineCommand {
    type Err = StepSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn number<T: FromStr>(value: &str) -> Result<T, StepSyncError> {
    value
        .parse()
        .map_err(|_| StepSyncError::InvalidInput("command value is not a number"))
}

/// Like [`number`], but also refuses `NaN` and infinities.
fn real(value: &str) -> Result<f64, StepSyncError> {
    let parsed: f64 = number(value)?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(StepSyncError::InvalidInput("command value must be finite"))
    }
}
