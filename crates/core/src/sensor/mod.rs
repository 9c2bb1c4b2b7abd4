//! Duplex link to the wearable step sensor: handshake, configuration and
//! ingestion of step lines.

mod sample;
mod scripted;
mod serial;

use std::{io, thread, time::Duration};

pub use sample::{Foot, SampleError, StepSample};
pub use scripted::{firmware_reply, ScriptedTransport};
pub use serial::SerialTransport;

use crate::{
    config::{LinkConfig, FIRMWARE_DEFAULT_STRIDE, FIRMWARE_DEFAULT_WINDOW},
    HandshakeError, HandshakeStage,
};

pub const CONFIG_RETRIES: u32 = 3;
pub const HANDSHAKE_RETRIES: u32 = 5;

/// Newline-delimited, bidirectional byte channel.
pub trait LineTransport: Send {
    /// Writes `line` followed by `\n`.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Returns the next complete inbound line, waiting at most `timeout`.
    /// A zero timeout only looks at what is already buffered.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Drops everything received so far.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl LineTransport for Box<dyn LineTransport> {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        (**self).write_line(line)
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        (**self).read_line(timeout)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

/// Protocol layer over a [`LineTransport`].
#[derive(Debug)]
pub struct SensorLink<T> {
    transport: T,
    settle: Duration,
    ack_wait: Duration,
    max_step_bpm: f64,
    dropped_lines: u64,
}

impl<T: LineTransport> SensorLink<T> {
    pub fn new(transport: T, config: &LinkConfig) -> Self {
        Self {
            transport,
            settle: Duration::from_millis(config.settle_ms),
            ack_wait: Duration::from_millis(config.ack_wait_ms),
            max_step_bpm: config.max_step_bpm,
            dropped_lines: 0,
        }
    }

    /// Lines skipped by [`SensorLink::drain_latest_step`] so far.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    /// Brings the sensor into streaming mode.
    ///
    /// Window/stride are only sent when they differ from the firmware
    /// defaults and their failure is merely logged. RESET and START must be
    /// acknowledged exactly or the session cannot start.
    pub fn handshake(&mut self, config: &LinkConfig) -> Result<(), HandshakeError> {
        thread::sleep(self.settle);
        if let Err(err) = self.transport.discard_input() {
            tracing::warn!(%err, "could not clear sensor input before handshake");
        }

        if config.smoothing_window != FIRMWARE_DEFAULT_WINDOW
            && !self.send_config_command("SET_WINDOW", config.smoothing_window, "ACK,WINDOW")
        {
            tracing::warn!(window = config.smoothing_window, "sensor kept its default smoothing window");
        }
        if config.stride != FIRMWARE_DEFAULT_STRIDE
            && !self.send_config_command("SET_STRIDE", config.stride, "ACK,STRIDE")
        {
            tracing::warn!(stride = config.stride, "sensor kept its default update stride");
        }

        self.send_handshake_command(HandshakeStage::Reset, "ACK,RESET")?;
        self.send_handshake_command(HandshakeStage::Start, "ACK,START")?;
        tracing::info!("sensor handshake completed");
        Ok(())
    }

    /// Sends `PREFIX,value` until a reply starting with `ack_prefix` arrives.
    pub fn send_config_command(&mut self, prefix: &str, value: u32, ack_prefix: &str) -> bool {
        let command = format!("{prefix},{value}");
        for attempt in 1..=CONFIG_RETRIES {
            tracing::debug!(%command, attempt, "sending sensor config");
            match self.exchange(&command) {
                Ok(Some(reply)) if reply.starts_with(ack_prefix) => {
                    tracing::info!(%command, %reply, "sensor config acknowledged");
                    return true;
                }
                Ok(reply) => {
                    tracing::debug!(%command, ?reply, expected = ack_prefix, "unexpected config reply");
                }
                Err(err) => tracing::warn!(%command, %err, "sensor config write failed"),
            }
        }
        tracing::warn!(%command, attempts = CONFIG_RETRIES, "sensor config not acknowledged");
        false
    }

    fn send_handshake_command(
        &mut self,
        stage: HandshakeStage,
        expected: &str,
    ) -> Result<(), HandshakeError> {
        let command = stage.to_string();
        let mut last_reply = None;
        for attempt in 1..=HANDSHAKE_RETRIES {
            match self.exchange(&command) {
                Ok(Some(reply)) if reply == expected => {
                    tracing::info!(%reply, attempt, "handshake acknowledged");
                    return Ok(());
                }
                Ok(reply) => {
                    tracing::debug!(%command, ?reply, attempt, "unexpected handshake reply");
                    last_reply = reply;
                }
                Err(err) => tracing::warn!(%command, %err, attempt, "handshake write failed"),
            }
        }

        tracing::warn!(%command, "handshake failed");
        Err(HandshakeError {
            stage,
            attempts: HANDSHAKE_RETRIES,
            last_reply,
        })
    }

    /// Writes one command, waits the ACK window, then reads one reply.
    fn exchange(&mut self, command: &str) -> io::Result<Option<String>> {
        self.transport.write_line(command)?;
        thread::sleep(self.ack_wait);
        let reply = self.transport.read_line(Duration::ZERO)?;
        Ok(reply.map(|line| line.trim().to_string()))
    }

    /// Consumes every buffered line and returns only the newest valid step.
    pub fn drain_latest_step(&mut self) -> Option<StepSample> {
        let mut latest = None;
        loop {
            let line = match self.transport.read_line(Duration::ZERO) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "sensor read failed");
                    break;
                }
            };

            match StepSample::parse(&line, self.max_step_bpm) {
                Ok(sample) => {
                    if latest.is_some() {
                        tracing::trace!("discarding stale step sample");
                    }
                    latest = Some(sample);
                }
                Err(err) => {
                    self.dropped_lines += 1;
                    tracing::debug!(%err, %line, "skipping sensor line");
                }
            }
        }
        latest
    }

    /// Fire-and-forget command used for live configuration.
    pub fn send_runtime_command(&mut self, command: &str) {
        match self.transport.write_line(command) {
            Ok(()) => tracing::info!(%command, "sent runtime command to sensor"),
            Err(err) => tracing::warn!(%command, %err, "runtime command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            settle_ms: 0,
            ack_wait_ms: 1,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn handshake_succeeds_against_firmware() {
        let transport = ScriptedTransport::firmware();
        let config = fast_config();
        let mut link = SensorLink::new(transport.clone(), &config);

        link.handshake(&config).expect("handshake should succeed");
        assert_eq!(transport.written(), vec!["RESET", "START"]);
    }

    #[test]
    fn non_default_window_and_stride_are_configured() {
        let transport = ScriptedTransport::firmware();
        let config = LinkConfig {
            smoothing_window: 5,
            stride: 1,
            ..fast_config()
        };
        let mut link = SensorLink::new(transport.clone(), &config);

        link.handshake(&config).unwrap();
        assert_eq!(
            transport.written(),
            vec!["SET_WINDOW,5", "SET_STRIDE,1", "RESET", "START"]
        );
    }

    #[test]
    fn config_failure_does_not_abort_handshake() {
        let transport = ScriptedTransport::with_responder(|cmd| match cmd {
            "RESET" => vec!["ACK,RESET".into()],
            "START" => vec!["ACK,START".into()],
            _ => vec!["ERR".into()],
        });
        let config = LinkConfig {
            smoothing_window: 7,
            ..fast_config()
        };
        let mut link = SensorLink::new(transport.clone(), &config);

        link.handshake(&config).expect("config failure must not be fatal");
        let written = transport.written();
        assert_eq!(written.iter().filter(|c| *c == "SET_WINDOW,7").count(), 3);
    }

    #[test]
    fn handshake_requires_exact_ack() {
        let transport = ScriptedTransport::with_responder(|cmd| vec![format!("ACK,{cmd},EXTRA")]);
        let config = fast_config();
        let mut link = SensorLink::new(transport, &config);

        let err = link.handshake(&config).unwrap_err();
        assert_eq!(err.stage, HandshakeStage::Reset);
        assert_eq!(err.last_reply.as_deref(), Some("ACK,RESET,EXTRA"));
    }

    #[test]
    fn handshake_gives_up_after_five_attempts() {
        let transport = ScriptedTransport::silent();
        let config = LinkConfig {
            settle_ms: 0,
            ..LinkConfig::default()
        };
        let mut link = SensorLink::new(transport.clone(), &config);

        let started = Instant::now();
        let err = link.handshake(&config).unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.stage, HandshakeStage::Reset);
        assert_eq!(err.attempts, 5);
        assert_eq!(transport.written().len(), 5);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[test]
    fn start_failure_is_reported() {
        let transport = ScriptedTransport::with_responder(|cmd| match cmd {
            "RESET" => vec!["ACK,RESET".into()],
            _ => Vec::new(),
        });
        let config = fast_config();
        let mut link = SensorLink::new(transport.clone(), &config);

        let err = link.handshake(&config).unwrap_err();
        assert_eq!(err.stage, HandshakeStage::Start);
        assert_eq!(transport.written().len(), 6);
    }

    #[test]
    fn drain_returns_newest_valid_sample() {
        let transport = ScriptedTransport::silent();
        transport.push_line("100,0,110.0,108.0");
        transport.push_line("garbage,line");
        transport.push_line("200,1,120.0,118.0");
        let mut link = SensorLink::new(transport.clone(), &fast_config());

        let sample = link.drain_latest_step().expect("a sample should be returned");
        assert_eq!(sample.sensor_timestamp, 200);
        assert_eq!(sample.foot, Foot::Right);
        assert_eq!(sample.reported_bpm(), Some(118.0));
        assert_eq!(link.dropped_lines(), 1);
        assert_eq!(transport.pending(), 0);
        assert!(link.drain_latest_step().is_none());
    }

    #[test]
    fn drain_skips_noise_after_valid_sample() {
        let transport = ScriptedTransport::silent();
        transport.push_line("100,0,110.0,108.0");
        transport.push_line("101,1,450.0,300.0");
        let mut link = SensorLink::new(transport, &fast_config());

        let sample = link.drain_latest_step().unwrap();
        assert_eq!(sample.sensor_timestamp, 100);
    }

    #[test]
    fn runtime_command_failures_are_absorbed() {
        let transport = ScriptedTransport::firmware();
        let mut link = SensorLink::new(transport.clone(), &fast_config());

        link.send_runtime_command("SET_WINDOW,4");
        transport.fail_writes(true);
        link.send_runtime_command("SET_STRIDE,3");
        assert_eq!(transport.written(), vec!["SET_WINDOW,4"]);
    }
}
