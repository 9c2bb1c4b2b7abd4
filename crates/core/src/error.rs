use std::fmt;

/// Result alias that carries the custom [`StepSyncError`] type.
pub type Result<T> = std::result::Result<T, StepSyncError>;

/// Common error type for the core crate.
///
/// Only [`StepSyncError::Transport`] and [`StepSyncError::Handshake`] end a
/// session. Everything else the engine meets while running is absorbed and
/// logged at the point where it happens.
#[derive(Debug, thiserror::Error)]
pub enum StepSyncError {
    /// Free-form message, mostly used for poisoned shared state.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The sensor link could not be opened at all.
    #[error("failed to open sensor link {port}: {source}")]
    Transport {
        port: String,
        #[source]
        source: std::io::Error,
    },
    /// RESET or START was never acknowledged.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid score: {0}")]
    Score(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl StepSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns `true` for the error classes that abort a session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Handshake(_))
    }
}

impl From<&str> for StepSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for StepSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Handshake command whose acknowledgement never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Reset,
    Start,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => f.write_str("RESET"),
            Self::Start => f.write_str("START"),
        }
    }
}

/// Fatal handshake failure, returned instead of being raised mid-session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} handshake failed after {attempts} attempts (last reply: {last_reply:?})")]
pub struct HandshakeError {
    pub stage: HandshakeStage,
    pub attempts: u32,
    pub last_reply: Option<String>,
}
