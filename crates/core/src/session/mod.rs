//! Session lifecycle: handshake, the ingestion/estimation loop, and the
//! playback thread that reads the tempo it publishes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, TryRecvError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    command::EngineCommand,
    config::SessionConfig,
    estimator::TempoEstimator,
    modes::{ModeEngine, ModeKind},
    predict::TempoPredictor,
    scheduler::{EventSink, PlaybackReport, PlaybackScheduler, Score},
    sensor::{LineTransport, SensorLink},
    tempo::{PhaseCorrection, SharedTempo},
    Result, StepSyncError,
};

/// Cooperative shutdown flag observed by both session loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Monotonic seconds since the session started.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn now_seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub ticks: u64,
    pub steps: u64,
    pub dropped_lines: u64,
    pub final_bpm: f64,
    pub final_mode: ModeKind,
    pub playback: PlaybackReport,
}

/// One walking session bound to a sensor transport.
pub struct Session<T> {
    config: SessionConfig,
    score: Score,
    link: SensorLink<T>,
    modes: ModeEngine,
    estimator: TempoEstimator,
    tempo: SharedTempo,
    sink: Option<Box<dyn EventSink>>,
    cancel: CancelToken,
    last_tick: f64,
    last_target: f64,
    ticks: u64,
    steps: u64,
}

impl<T: LineTransport> Session<T> {
    pub fn new(
        config: SessionConfig,
        score: Score,
        transport: T,
        sink: Box<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let reference_bpm = score.reference_bpm;

        let mut tempo = SharedTempo::new(reference_bpm)?;
        if config.scheduler.phase_correction {
            tempo = tempo.with_phase_correction(PhaseCorrection {
                gain: config.scheduler.phase_gain,
            });
        }

        tracing::info!(
            reference_bpm,
            mode = %config.initial_mode,
            events = score.events.len(),
            "session created"
        );

        Ok(Self {
            link: SensorLink::new(transport, &config.link),
            modes: ModeEngine::new(&config, reference_bpm),
            estimator: TempoEstimator::new(reference_bpm, &config.estimator),
            tempo,
            sink: Some(sink),
            cancel: CancelToken::new(),
            last_tick: 0.0,
            last_target: reference_bpm,
            ticks: 0,
            steps: 0,
            score,
            config,
        })
    }

    pub fn with_predictor(mut self, predictor: Box<dyn TempoPredictor>) -> Self {
        self.modes = self.modes.with_predictor(predictor);
        self
    }

    /// Seeds the random game for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.modes = self.modes.with_seed(seed);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn tempo(&self) -> SharedTempo {
        self.tempo.clone()
    }

    pub fn modes(&self) -> &ModeEngine {
        &self.modes
    }

    pub fn estimator(&self) -> &TempoEstimator {
        &self.estimator
    }

    /// Runs the session until `QUIT` arrives or the cancel token fires.
    ///
    /// Fails when the handshake cannot be completed (the playback thread is
    /// not started in that case) or when playback dies with an error.
    pub fn run(mut self, commands: &Receiver<String>) -> Result<SessionSummary> {
        let link_config = self.config.link.clone();
        self.link.handshake(&link_config)?;

        let sink = self
            .sink
            .take()
            .ok_or_else(|| StepSyncError::msg("session already ran"))?;
        let scheduler = PlaybackScheduler::spawn(
            self.score.clone(),
            self.tempo.clone(),
            sink,
            self.cancel.clone(),
            &self.config.scheduler,
        )?;
        tracing::info!("session running");

        let interval = Duration::from_millis(self.config.estimator.tick_interval_ms);
        let clock = SessionClock::start();
        let mut commands_open = true;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if commands_open {
                commands_open = self.poll_commands(commands, clock.now_seconds());
            }
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if !scheduler.is_running() {
                tracing::warn!("playback thread exited, ending session");
                break Ok(());
            }
            if let Err(err) = self.tick(clock.now_seconds()) {
                break Err(err);
            }
            thread::sleep(interval);
        };

        self.cancel.cancel();
        let playback = scheduler.stop()?;
        outcome?;

        let summary = SessionSummary {
            ticks: self.ticks,
            steps: self.steps,
            dropped_lines: self.link.dropped_lines(),
            final_bpm: self.estimator.current_bpm(),
            final_mode: self.modes.kind(),
            playback,
        };
        drop(self.link);
        tracing::info!(?summary, "session ended");
        Ok(summary)
    }

    /// Applies queued operator commands. Returns `false` once the channel is
    /// closed.
    fn poll_commands(&mut self, commands: &Receiver<String>, now: f64) -> bool {
        loop {
            match commands.try_recv() {
                Ok(line) => match EngineCommand::parse(&line) {
                    Ok(command) => {
                        self.apply_command(command, now);
                    }
                    Err(err) => tracing::warn!(%err, %line, "ignoring runtime command"),
                },
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("runtime command channel closed");
                    return false;
                }
            }
        }
    }

    /// Executes one operator command. Returns `true` for `QUIT`.
    pub fn apply_command(&mut self, command: EngineCommand, now: f64) -> bool {
        tracing::info!(?command, now, "runtime command");
        if let Some(line) = command.sensor_line() {
            self.link.send_runtime_command(&line);
        }

        match command {
            EngineCommand::SetAlphaUp(alpha) => self.estimator.set_alpha_up(alpha),
            EngineCommand::SetAlphaDown(alpha) => self.estimator.set_alpha_down(alpha),
            EngineCommand::SetManualBpm(bpm) => {
                self.modes.set_manual_bpm(bpm);
            }
            EngineCommand::AdjustManualBpm(delta) => {
                self.modes.adjust_manual_bpm(delta);
            }
            EngineCommand::SetMode(kind) => {
                self.modes.switch(kind, self.estimator.current_bpm());
            }
            EngineCommand::SetHybridLockSteps(steps) => {
                self.modes.update_hybrid(|hybrid| hybrid.set_lock_steps(steps));
            }
            EngineCommand::SetHybridUnlockTime(seconds) => {
                self.modes
                    .update_hybrid(|hybrid| hybrid.set_unlock_hold_seconds(seconds));
            }
            EngineCommand::SetHybridStabilityThreshold(bpm) => {
                self.modes
                    .update_hybrid(|hybrid| hybrid.set_stability_threshold(bpm));
            }
            EngineCommand::SetHybridUnlockThreshold(bpm) => {
                self.modes.update_hybrid(|hybrid| hybrid.set_unlock_threshold(bpm));
            }
            EngineCommand::SetRandomSpan(span) => {
                self.modes
                    .update_random(|random| random.span_fraction = span.clamp(0.0, 1.0));
            }
            EngineCommand::SetRandomGamified(gamified) => {
                self.modes.update_random(|random| random.gamified = gamified);
            }
            EngineCommand::SetRandomSimpleThreshold(bpm) => {
                self.modes
                    .update_random(|random| random.simple_threshold_bpm = bpm.max(0.0));
            }
            EngineCommand::SetRandomSimpleSteps(steps) => {
                self.modes
                    .update_random(|random| random.simple_steps = steps.max(1));
            }
            EngineCommand::SetRandomSimpleTimeout(seconds) => {
                self.modes
                    .update_random(|random| random.simple_timeout_seconds = seconds.max(0.0));
            }
            EngineCommand::SetWindow(window) => self.modes.set_sensor_params(Some(window), None),
            EngineCommand::SetStride(stride) => self.modes.set_sensor_params(None, Some(stride)),
            EngineCommand::CalibrateWeight(_) => {}
            EngineCommand::Quit => {
                self.cancel.cancel();
                return true;
            }
        }
        false
    }

    /// One iteration of the ingestion loop at session time `now`.
    pub fn tick(&mut self, now: f64) -> Result<f64> {
        let dt = (now - self.last_tick).max(0.0);
        self.last_tick = now;
        self.ticks += 1;

        let sample = self.link.drain_latest_step();
        if let Some(sample) = &sample {
            let bpm = sample
                .reported_bpm()
                .unwrap_or_else(|| self.estimator.current_bpm());
            self.steps += 1;
            self.estimator.register_step(now);
            self.modes
                .on_step(bpm, Some(sample.instantaneous_bpm), now);
            tracing::debug!(
                foot = %sample.foot,
                instant = sample.instantaneous_bpm,
                bpm,
                "step processed"
            );
        }

        let target = self
            .modes
            .handle_step(now, self.estimator.current_bpm(), dt);
        let bpm = self.estimator.tick(now, target, self.modes.is_manual());
        if sample.is_some() || target != self.last_target {
            self.tempo.publish_target(bpm, self.estimator.target_bpm())?;
        } else {
            self.tempo.publish(bpm, self.estimator.target_bpm())?;
        }
        self.last_target = target;
        Ok(bpm)
    }
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("modes", &self.modes)
            .field("estimator", &self.estimator)
            .field("ticks", &self.ticks)
            .field("steps", &self.steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        config::LinkConfig,
        scheduler::{LogSink, RecordingSink},
        sensor::ScriptedTransport,
        StepSyncError,
    };

    fn fast_config(mode: ModeKind) -> SessionConfig {
        SessionConfig {
            initial_mode: mode,
            link: LinkConfig {
                settle_ms: 0,
                ack_wait_ms: 1,
                ..LinkConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn session(mode: ModeKind, transport: ScriptedTransport) -> Session<ScriptedTransport> {
        let score = Score::metronome(120.0, 4, 1).unwrap();
        Session::new(fast_config(mode), score, transport, Box::new(LogSink::default()))
            .unwrap()
            .with_seed(1)
    }

    #[test]
    fn steps_pull_tempo_towards_cadence() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport.clone());

        let mut now = 0.0;
        for i in 0..300 {
            if i % 25 == 0 {
                transport.push_line(format!("{i},{},100.0,100.0", i % 2));
            }
            now += 0.02;
            session.tick(now).unwrap();
        }

        let bpm = session.estimator().current_bpm();
        assert!(bpm < 110.0, "tempo should approach 100, got {bpm}");
        assert!(bpm >= 100.0 - 1e-9);
        let snapshot = session.tempo().snapshot().unwrap();
        assert!((snapshot.tempo_factor - 120.0 / bpm).abs() < 1e-9);
    }

    #[test]
    fn malformed_lines_do_not_count_as_steps() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport.clone());
        transport.push_line("not,a,step");
        transport.push_line("1,0,999,999");
        session.tick(0.01).unwrap();
        assert_eq!(session.estimator().step_count(), 0);
    }

    #[test]
    fn manual_mode_ignores_steps() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Manual, transport.clone());
        session.apply_command(EngineCommand::SetManualBpm(90.0), 0.0);

        transport.push_line("1,0,150.0,150.0");
        assert_eq!(session.tick(0.01).unwrap(), 90.0);
        session.apply_command(EngineCommand::AdjustManualBpm(10.0), 0.02);
        assert_eq!(session.tick(0.03).unwrap(), 100.0);
    }

    #[test]
    fn mode_switch_keeps_current_tempo() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport.clone());
        transport.push_line("1,0,100.0,100.0");
        let mut now = 0.0;
        for _ in 0..10 {
            now += 0.02;
            session.tick(now).unwrap();
        }
        let before = session.estimator().current_bpm();

        session.apply_command(EngineCommand::SetMode(ModeKind::Hybrid), now);
        assert_eq!(session.modes().kind(), ModeKind::Hybrid);
        let after = session.tick(now + 0.02).unwrap();
        assert!((after - before).abs() < 5.0);
    }

    #[test]
    fn sensor_commands_are_forwarded() {
        let transport = ScriptedTransport::firmware();
        let mut session = session(ModeKind::Dynamic, transport.clone());
        session.apply_command(EngineCommand::SetWindow(6), 0.0);
        session.apply_command(EngineCommand::CalibrateWeight(150), 0.0);
        assert_eq!(transport.written(), vec!["SET_WINDOW,6", "CAL_WEIGHT,150"]);
    }

    #[test]
    fn quit_command_cancels() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport);
        let token = session.cancel_token();
        assert!(session.apply_command(EngineCommand::Quit, 0.0));
        assert!(token.is_cancelled());
    }

    #[test]
    fn non_finite_command_is_dropped_and_tempo_still_follows() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport.clone());
        let (tx, rx) = mpsc::channel();
        tx.send("SET_ALPHA_UP:NaN".to_string()).unwrap();
        tx.send("SET_RANDOM_SPAN:inf".to_string()).unwrap();
        assert!(session.poll_commands(&rx, 0.0));
        assert_eq!(session.estimator().alpha_up(), 0.025);

        let mut now = 0.0;
        for i in 0..500 {
            if i % 20 == 0 {
                transport.push_line(format!("{i},{},150.0,150.0", i % 2));
            }
            now += 0.02;
            session.tick(now).unwrap();
        }
        let bpm = session.estimator().current_bpm();
        assert!(bpm > 145.0, "tempo should follow 150 bpm steps, got {bpm}");
    }

    #[test]
    fn first_step_without_average_keeps_walking_tempo() {
        let transport = ScriptedTransport::silent();
        let mut session = session(ModeKind::Dynamic, transport.clone());
        transport.push_line("1,0,98.0,0");
        assert_eq!(session.tick(0.01).unwrap(), 120.0);
        assert_eq!(session.estimator().step_count(), 1);
    }

    #[test]
    fn phase_correction_only_moves_on_new_steps() {
        let transport = ScriptedTransport::silent();
        let mut config = fast_config(ModeKind::Dynamic);
        config.scheduler.phase_correction = true;
        let score = Score::metronome(120.0, 4, 1).unwrap();
        let mut session =
            Session::new(config, score, transport.clone(), Box::new(LogSink::default())).unwrap();
        let tempo = session.tempo();
        tempo
            .mark_reference(Instant::now() - Duration::from_millis(500))
            .unwrap();

        transport.push_line("1,0,120.0,120.0");
        session.tick(0.02).unwrap();
        let corrected = tempo.tempo_factor().unwrap();
        assert!(corrected < 1.0);

        let mut now = 0.02;
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(10));
            now += 0.02;
            session.tick(now).unwrap();
            assert_eq!(tempo.tempo_factor().unwrap(), corrected);
        }

        thread::sleep(Duration::from_millis(50));
        transport.push_line("2,1,120.0,120.0");
        session.tick(now + 0.02).unwrap();
        assert!(tempo.tempo_factor().unwrap() < corrected);
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn dispatch(&mut self, _payload: &[u8]) -> Result<()> {
            panic!("output device vanished");
        }
    }

    #[test]
    fn session_ends_when_playback_dies() {
        let score = Score::new(
            120.0,
            vec![crate::scheduler::TimedEvent::new(0.01, vec![0x99, 60, 100])],
        )
        .unwrap();
        let session = Session::new(
            fast_config(ModeKind::Dynamic),
            score,
            ScriptedTransport::firmware(),
            Box::new(FailingSink),
        )
        .unwrap();

        let (_tx, rx) = mpsc::channel::<String>();
        let started = Instant::now();
        let err = session.run(&rx).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("playback"));
    }

    #[test]
    fn handshake_failure_aborts_before_playback() {
        let sink = RecordingSink::new();
        let score = Score::metronome(120.0, 4, 1).unwrap();
        let session = Session::new(
            fast_config(ModeKind::Dynamic),
            score,
            ScriptedTransport::silent(),
            Box::new(sink.clone()),
        )
        .unwrap();

        let (_tx, rx) = mpsc::channel();
        let err = session.run(&rx).unwrap_err();
        assert!(matches!(err, StepSyncError::Handshake(_)));
        assert!(err.is_fatal());
        assert!(sink.is_empty());
    }

    #[test]
    fn full_session_runs_until_quit() {
        let transport = ScriptedTransport::firmware();
        let sink = RecordingSink::new();
        let score = Score::new(
            120.0,
            vec![crate::scheduler::TimedEvent::new(0.01, vec![0x99, 60, 100])],
        )
        .unwrap();
        let session = Session::new(
            fast_config(ModeKind::Dynamic),
            score,
            transport.clone(),
            Box::new(sink.clone()),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            for i in 0..10 {
                transport.push_line(format!("{},{},110.0,110.0", i * 500, i % 2));
                thread::sleep(Duration::from_millis(20));
            }
            tx.send("SET_ALPHA_UP:0.5".to_string()).unwrap();
            tx.send("QUIT".to_string()).unwrap();
        });

        let summary = session.run(&rx).expect("session should end cleanly");
        feeder.join().unwrap();

        assert!(summary.steps >= 1);
        assert!(summary.ticks > summary.steps);
        assert_eq!(summary.final_mode, ModeKind::Dynamic);
        assert!(summary.final_bpm < 120.0);
        assert!(summary.playback.events_dispatched >= 1);
        assert_eq!(summary.playback.events_dispatched, sink.len() as u64);
    }
}
