use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use crate::{Result, StepSyncError};

const PHASE_CORRECTION_MIN: f64 = 0.90;
const PHASE_CORRECTION_MAX: f64 = 1.10;

/// Point-in-time copy of the tempo shared between the ingestion loop and the
/// playback scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoSnapshot {
    pub current_bpm: f64,
    pub target_bpm: f64,
    pub reference_song_bpm: f64,
    /// `reference_song_bpm / current_bpm`, optionally phase corrected.
    pub tempo_factor: f64,
}

#[derive(Debug)]
struct TempoCell {
    snapshot: TempoSnapshot,
    /// Deadline of the last reference beat the scheduler armed.
    expected_reference: Option<Instant>,
    /// Phase correction computed for the latest target; 1.0 when none.
    correction: f64,
}

/// Phase correction settings applied when a new tempo is published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseCorrection {
    pub gain: f64,
}

impl PhaseCorrection {
    /// Correction factor for a reference beat that was due at `expected` and
    /// is being evaluated at `now`. Positive error means playback is late.
    pub fn factor(&self, now: Instant, expected: Instant) -> f64 {
        let error = if now >= expected {
            now.duration_since(expected).as_secs_f64()
        } else {
            -expected.duration_since(now).as_secs_f64()
        };
        (1.0 - self.gain * error).clamp(PHASE_CORRECTION_MIN, PHASE_CORRECTION_MAX)
    }
}

/// Thread-safe tempo cell jointly owned by both session loops.
///
/// Critical sections only copy a handful of floats; no lock is ever held
/// across a sleep or any I/O.
#[derive(Clone)]
pub struct SharedTempo {
    shared: Arc<Mutex<TempoCell>>,
    phase: Option<PhaseCorrection>,
}

impl SharedTempo {
    /// Creates a cell playing at the score's own tempo (factor 1.0).
    pub fn new(reference_song_bpm: f64) -> Result<Self> {
        if !(reference_song_bpm.is_finite() && reference_song_bpm > 0.0) {
            return Err(StepSyncError::InvalidInput("reference tempo must be positive"));
        }

        Ok(Self {
            shared: Arc::new(Mutex::new(TempoCell {
                snapshot: TempoSnapshot {
                    current_bpm: reference_song_bpm,
                    target_bpm: reference_song_bpm,
                    reference_song_bpm,
                    tempo_factor: 1.0,
                },
                expected_reference: None,
                correction: 1.0,
            })),
            phase: None,
        })
    }

    /// Enables phase correction, recomputed by [`SharedTempo::publish_target`].
    pub fn with_phase_correction(mut self, correction: PhaseCorrection) -> Self {
        self.phase = Some(correction);
        self
    }

    pub fn snapshot(&self) -> Result<TempoSnapshot> {
        Ok(self.lock()?.snapshot)
    }

    pub fn tempo_factor(&self) -> Result<f64> {
        Ok(self.lock()?.snapshot.tempo_factor)
    }

    pub fn current_bpm(&self) -> Result<f64> {
        Ok(self.lock()?.snapshot.current_bpm)
    }

    /// Publishes a new live tempo, keeping the phase correction computed
    /// for the current target. Returns `false` and leaves the cell untouched
    /// when `bpm` is not a positive number.
    pub fn publish(&self, bpm: f64, target_bpm: f64) -> Result<bool> {
        self.store(bpm, target_bpm, None)
    }

    /// Publishes the tempo for a freshly arrived target and re-measures the
    /// phase error against the last armed reference beat.
    pub fn publish_target(&self, bpm: f64, target_bpm: f64) -> Result<bool> {
        self.publish_target_at(bpm, target_bpm, Instant::now())
    }

    pub fn publish_target_at(&self, bpm: f64, target_bpm: f64, now: Instant) -> Result<bool> {
        self.store(bpm, target_bpm, Some(now))
    }

    fn store(&self, bpm: f64, target_bpm: f64, retarget_at: Option<Instant>) -> Result<bool> {
        if !(bpm.is_finite() && bpm > 0.0) {
            tracing::debug!(bpm, "ignoring non-positive tempo candidate");
            return Ok(false);
        }

        let mut cell = self.lock()?;
        if let (Some(now), Some(phase), Some(expected)) =
            (retarget_at, self.phase, cell.expected_reference)
        {
            cell.correction = phase.factor(now, expected);
            tracing::debug!(correction = cell.correction, "phase correction updated");
        }

        cell.snapshot.current_bpm = bpm;
        cell.snapshot.target_bpm = target_bpm;
        cell.snapshot.tempo_factor = cell.snapshot.reference_song_bpm / bpm * cell.correction;
        Ok(true)
    }

    /// Records when the scheduler expects the next reference beat to sound.
    pub fn mark_reference(&self, deadline: Instant) -> Result<()> {
        self.lock()?.expected_reference = Some(deadline);
        Ok(())
    }

    pub fn expected_reference(&self) -> Result<Option<Instant>> {
        Ok(self.lock()?.expected_reference)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TempoCell>> {
        self.shared
            .lock()
            .map_err(|_| StepSyncError::msg("shared tempo has been poisoned"))
    }
}

impl std::fmt::Debug for SharedTempo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTempo")
            .field("phase", &self.phase)
            .finish()
    }
}
