//! Core library for the StepSync cadence-following tempo engine.
//!
//! A wearable step sensor streams cadence readings over a serial link. The
//! session loop turns them into a target tempo through the active mode,
//! smooths that into the current tempo, and publishes it to a playback
//! thread that stretches the delays of a looping score accordingly.

pub mod command;
pub mod config;
pub mod error;
pub mod estimator;
pub mod modes;
pub mod predict;
pub mod scheduler;
pub mod sensor;
pub mod session;
pub mod tempo;

pub use command::EngineCommand;
pub use config::SessionConfig;
pub use error::{HandshakeError, HandshakeStage, Result, StepSyncError};
pub use estimator::TempoEstimator;
pub use modes::{ModeEngine, ModeKind};
pub use predict::{RunType, TempoPredictor, TrendPredictor};
pub use scheduler::{EventSink, LogSink, PlaybackScheduler, RecordingSink, Score, TimedEvent};
pub use sensor::{LineTransport, ScriptedTransport, SensorLink, SerialTransport, StepSample};
pub use session::{CancelToken, Session, SessionClock, SessionSummary};
pub use tempo::{SharedTempo, TempoSnapshot};
