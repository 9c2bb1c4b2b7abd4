use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use stepsync_core::{
    CancelToken, LineTransport, LogSink, ModeKind, Score, ScriptedTransport, SerialTransport,
    Session, SessionConfig, SessionSummary, TrendPredictor,
};
use tracing_subscriber::EnvFilter;

fn main() -> stepsync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { score, port, baud, session } => run_live(&score, port, baud, &session),
        Commands::Simulate {
            cadence,
            reference_bpm,
            duration,
            session,
        } => run_simulation(cadence, reference_bpm, duration, &session),
        Commands::Ports => list_ports(),
    }
}

fn run_live(
    score_path: &Path,
    port: Option<String>,
    baud: Option<u32>,
    options: &SessionOptions,
) -> stepsync_core::Result<()> {
    let mut config = options.load_config()?;
    if let Some(port) = port {
        config.link.port = port;
    }
    if let Some(baud) = baud {
        config.link.baud_rate = baud;
    }

    let score = Score::load(score_path)?;
    tracing::info!(?score_path, port = %config.link.port, "starting live session");

    let transport = SerialTransport::open(&config.link.port, config.link.baud_rate)?;
    let session = options.build_session(config, score, transport)?;
    let commands = spawn_stdin_listener();
    let summary = session.run(&commands)?;
    report(&summary);
    Ok(())
}

fn run_simulation(
    cadence: f64,
    reference_bpm: f64,
    duration: f64,
    options: &SessionOptions,
) -> stepsync_core::Result<()> {
    let mut config = options.load_config()?;
    config.link.settle_ms = 0;
    config.link.ack_wait_ms = 5;

    let score = Score::metronome(reference_bpm, 4, 4)?;
    tracing::info!(cadence, reference_bpm, duration, "starting simulated session");

    let transport = ScriptedTransport::firmware();
    let session = options.build_session(config, score, transport.clone())?;
    let cancel = session.cancel_token();
    let walker = spawn_walker(transport, cadence, Duration::from_secs_f64(duration.max(0.0)), cancel);

    let commands = spawn_stdin_listener();
    let summary = session.run(&commands)?;
    if walker.join().is_err() {
        tracing::warn!("simulated walker panicked");
    }
    report(&summary);
    Ok(())
}

fn list_ports() -> stepsync_core::Result<()> {
    let ports = SerialTransport::list_ports()?;
    if ports.is_empty() {
        tracing::info!("no serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn report(summary: &SessionSummary) {
    tracing::info!(
        steps = summary.steps,
        ticks = summary.ticks,
        dropped = summary.dropped_lines,
        events = summary.playback.events_dispatched,
        final_bpm = summary.final_bpm,
        mode = %summary.final_mode,
        "session summary"
    );
}

/// Forwards operator lines from stdin to the session until EOF.
fn spawn_stdin_listener() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || forward_lines(io::stdin().lock(), &tx));
    if let Err(err) = spawned {
        tracing::warn!(%err, "runtime commands unavailable");
    }
    rx
}

fn forward_lines(input: impl BufRead, tx: &Sender<String>) {
    for line in input.lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(line.to_string()).is_err() {
            break;
        }
    }
}

/// Feeds step lines at a steady cadence, then cancels the session.
fn spawn_walker(
    transport: ScriptedTransport,
    cadence: f64,
    duration: Duration,
    cancel: CancelToken,
) -> thread::JoinHandle<()> {
    let interval = Duration::from_secs_f64(60.0 / cadence.max(1.0));
    thread::spawn(move || {
        let started = Instant::now();
        let mut foot = 0u8;
        while started.elapsed() < duration && !cancel.is_cancelled() {
            thread::sleep(interval);
            let timestamp = started.elapsed().as_millis();
            transport.push_line(format!("{timestamp},{foot},{cadence:.1},{cadence:.1}"));
            foot ^= 1;
        }
        cancel.cancel();
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Cadence-following tempo engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow a real step sensor while playing a score.
    Run {
        /// JSON score to loop.
        score: PathBuf,
        /// Serial port of the sensor.
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        #[command(flatten)]
        session: SessionOptions,
    },
    /// Drive the engine with a synthetic walker and a metronome score.
    Simulate {
        /// Walking cadence in steps per minute.
        #[arg(long, default_value_t = 100.0)]
        cadence: f64,
        /// Native tempo of the metronome.
        #[arg(long, default_value_t = 120.0)]
        reference_bpm: f64,
        /// Seconds to walk before the session ends.
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
        #[command(flatten)]
        session: SessionOptions,
    },
    /// List serial ports.
    Ports,
}

#[derive(Args, Debug)]
struct SessionOptions {
    /// JSON session configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Mode to start in (dynamic, manual, hybrid, random).
    #[arg(short, long)]
    mode: Option<ModeKind>,
    #[arg(long)]
    manual_bpm: Option<f64>,
    /// Blend a trend prediction into dynamic mode.
    #[arg(long)]
    predict: bool,
    /// Seed for the random mode.
    #[arg(long)]
    seed: Option<u64>,
}

impl SessionOptions {
    fn load_config(&self) -> stepsync_core::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.initial_mode = mode;
        }
        if self.manual_bpm.is_some() {
            config.manual_bpm = self.manual_bpm;
        }
        if self.predict {
            config.prediction.enabled = true;
        }
        Ok(config)
    }

    fn build_session<T: LineTransport>(
        &self,
        config: SessionConfig,
        score: Score,
        transport: T,
    ) -> stepsync_core::Result<Session<T>> {
        let prediction = config.prediction.enabled.then(|| config.prediction.window);
        let mut session = Session::new(config, score, transport, Box::new(LogSink::default()))?;
        if let Some(window) = prediction {
            session = session.with_predictor(Box::new(TrendPredictor::new(window)));
        }
        if let Some(seed) = self.seed {
            session = session.with_seed(seed);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_lines_are_trimmed_and_blank_lines_skipped() {
        let (tx, rx) = mpsc::channel();
        forward_lines(io::Cursor::new("SET_MODE:manual\n\n  QUIT  \n"), &tx);
        let lines: Vec<String> = rx.try_iter().collect();
        assert_eq!(lines, vec!["SET_MODE:manual", "QUIT"]);
    }

    #[test]
    fn cli_overrides_config_file_values() {
        let cli = Cli::parse_from([
            "stepsync",
            "simulate",
            "--cadence",
            "90",
            "--mode",
            "hybrid",
            "--predict",
        ]);
        let Commands::Simulate { cadence, session, .. } = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(cadence, 90.0);
        let config = session.load_config().unwrap();
        assert_eq!(config.initial_mode, ModeKind::Hybrid);
        assert!(config.prediction.enabled);
    }
}
