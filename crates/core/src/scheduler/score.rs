use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, StepSyncError};

/// One output event, timed relative to its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    /// Seconds after the previous event at the score's own tempo.
    #[serde(rename = "delay")]
    pub relative_delay: f64,
    /// Raw output message. `None` marks a timing-only event.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(rename = "reference", default)]
    pub is_reference_beat: bool,
}

impl TimedEvent {
    pub fn new(relative_delay: f64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_delay,
            payload: Some(payload.into()),
            is_reference_beat: false,
        }
    }

    pub fn meta(relative_delay: f64) -> Self {
        Self {
            relative_delay,
            payload: None,
            is_reference_beat: false,
        }
    }

    pub fn reference(mut self) -> Self {
        self.is_reference_beat = true;
        self
    }
}

/// An ordered, looping event sequence together with its native tempo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub reference_bpm: f64,
    pub events: Vec<TimedEvent>,
}

impl Score {
    pub fn new(reference_bpm: f64, events: Vec<TimedEvent>) -> Result<Self> {
        let score = Self {
            reference_bpm,
            events,
        };
        score.validate()?;
        Ok(score)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let score: Self = serde_json::from_str(text)?;
        score.validate()?;
        Ok(score)
    }

    /// A click on every beat; the downbeat of each bar is the reference.
    pub fn metronome(reference_bpm: f64, beats_per_bar: usize, bars: usize) -> Result<Self> {
        let interval = 60.0 / reference_bpm;
        let mut events = Vec::with_capacity(beats_per_bar * bars * 2);
        for _ in 0..bars {
            for beat in 0..beats_per_bar {
                let (note, velocity) = if beat == 0 { (76, 110) } else { (77, 80) };
                let on = TimedEvent::new(interval, vec![0x99, note, velocity]);
                events.push(if beat == 0 { on.reference() } else { on });
                events.push(TimedEvent::new(0.0, vec![0x89, note, 0]));
            }
        }
        Self::new(reference_bpm, events)
    }

    /// Length of one pass at the native tempo.
    pub fn duration_seconds(&self) -> f64 {
        self.events.iter().map(|e| e.relative_delay).sum()
    }

    fn validate(&self) -> Result<()> {
        if !(self.reference_bpm.is_finite() && self.reference_bpm > 0.0) {
            return Err(StepSyncError::Score(format!(
                "reference tempo must be positive, got {}",
                self.reference_bpm
            )));
        }
        if self.events.is_empty() {
            return Err(StepSyncError::Score("score has no events".into()));
        }
        if let Some(bad) = self
            .events
            .iter()
            .position(|e| !(e.relative_delay.is_finite() && e.relative_delay >= 0.0))
        {
            return Err(StepSyncError::Score(format!("event {bad} has an invalid delay")));
        }
        if self.duration_seconds() <= 0.0 {
            return Err(StepSyncError::Score("score has zero total duration".into()));
        }
        Ok(())
    }
}
