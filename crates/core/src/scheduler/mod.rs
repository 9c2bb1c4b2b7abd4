//! Background playback of a [`Score`] whose timing follows the live tempo.

mod score;

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub use score::{Score, TimedEvent};

use crate::{config::SchedulerConfig, CancelToken, Result, SharedTempo, StepSyncError};

/// Destination of event payloads.
pub trait EventSink: Send {
    fn dispatch(&mut self, payload: &[u8]) -> Result<()>;
}

/// Sink that only traces payloads.
#[derive(Debug, Default)]
pub struct LogSink {
    sent: u64,
}

impl EventSink for LogSink {
    fn dispatch(&mut self, payload: &[u8]) -> Result<()> {
        self.sent += 1;
        tracing::trace!(n = self.sent, ?payload, "event dispatched");
        Ok(())
    }
}

/// Sink that keeps every payload with its dispatch instant.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Instant, Vec<u8>)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn dispatch(&mut self, payload: &[u8]) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| StepSyncError::msg("recording sink has been poisoned"))?
            .push((Instant::now(), payload.to_vec()));
        Ok(())
    }
}

/// Totals reported when the playback thread exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub events_dispatched: u64,
    pub loops_completed: u64,
}

/// Handle to the running playback thread.
#[derive(Debug)]
pub struct PlaybackScheduler {
    handle: Option<JoinHandle<Result<PlaybackReport>>>,
    cancel: CancelToken,
}

impl PlaybackScheduler {
    /// Starts replaying `score` on its own thread until `cancel` fires.
    pub fn spawn(
        score: Score,
        tempo: SharedTempo,
        sink: Box<dyn EventSink>,
        cancel: CancelToken,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let poll = Duration::from_micros(config.poll_interval_us.max(1));
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let mut player = Player {
                    tempo,
                    sink,
                    cancel: thread_cancel,
                    poll,
                };
                let report = player.run(&score.events);
                if let Err(err) = &report {
                    tracing::error!(%err, "playback stopped");
                }
                report
            })?;

        Ok(Self {
            handle: Some(handle),
            cancel,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals cancellation and waits for the thread to exit.
    pub fn stop(mut self) -> Result<PlaybackReport> {
        self.cancel.cancel();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<PlaybackReport> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| StepSyncError::msg("playback thread panicked"))?,
            None => Ok(PlaybackReport::default()),
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
            let _ = self.join_inner();
        }
    }
}

struct Player {
    tempo: SharedTempo,
    sink: Box<dyn EventSink>,
    cancel: CancelToken,
    poll: Duration,
}

impl Player {
    fn run(&mut self, events: &[TimedEvent]) -> Result<PlaybackReport> {
        let mut report = PlaybackReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        'playback: loop {
            for event in events {
                if self.cancel.is_cancelled() || !self.wait(event)? {
                    break 'playback;
                }
                if let Some(payload) = &event.payload {
                    match self.sink.dispatch(payload) {
                        Ok(()) => report.events_dispatched += 1,
                        Err(err) => tracing::warn!(%err, "event dispatch failed"),
                    }
                }
            }
            report.loops_completed += 1;
            tracing::debug!(loops = report.loops_completed, "score finished, restarting");
        }

        tracing::info!(
            dispatched = report.events_dispatched,
            loops = report.loops_completed,
            "playback stopped"
        );
        Ok(report)
    }

    /// Sleeps until the event is due, rescaling the remaining wait whenever
    /// the tempo factor changes. Returns `false` when cancelled.
    fn wait(&mut self, event: &TimedEvent) -> Result<bool> {
        let mut factor = self.tempo.tempo_factor()?;
        let mut deadline = Instant::now() + seconds(event.relative_delay * factor);
        if event.is_reference_beat {
            self.tempo.mark_reference(deadline)?;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            thread::sleep(self.poll.min(deadline - now));

            let latest = self.tempo.tempo_factor()?;
            if latest != factor {
                let now = Instant::now();
                let remaining = deadline.saturating_duration_since(now).as_secs_f64();
                deadline = now + seconds(remaining * latest / factor);
                factor = latest;
                if event.is_reference_beat {
                    self.tempo.mark_reference(deadline)?;
                }
            }
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
