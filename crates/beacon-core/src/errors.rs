//! Error taxonomy for the agent core.
//!
//! Leaf errors are a plain `thiserror` enum; call sites that chain several
//! fallible steps (config load, directory setup, startup) use
//! `anyhow::Result` with `.context(...)` and convert into it via `?` at the
//! boundary.

use std::fmt;

/// Sub-kinds of a transient network failure, surfaced so callers can log or
/// match on the specific cause without string-matching a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    ConnectionReset,
    Http5xx,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Timeout => write!(f, "timeout"),
            TransportKind::ConnectionReset => write!(f, "connection reset"),
            TransportKind::Http5xx => write!(f, "server error (5xx)"),
        }
    }
}

/// The agent's error taxonomy. Every operational failure a
/// producer-facing call can surface is one of these variants; everything
/// else (publisher-thread failures, messenger degradation) is logged via
/// `log` and counted, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("metric definition conflict for ({system}, {category}, {counter}): schema does not match the existing registration")]
    DefinitionConflict {
        system: String,
        category: String,
        counter: String,
    },

    #[error("sample does not match its metric definition: {0}")]
    ValidationFailed(String),

    #[error("publisher queue saturated: backpressure deadline elapsed")]
    QueueSaturated,

    #[error("messenger is degraded and discarding writes: {0}")]
    MessengerDegraded(String),

    #[error("could not acquire the repository lock within the deadline")]
    RepositoryLocked,

    #[error("transport error: {kind}")]
    Transport { kind: TransportKind },

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication denied")]
    AuthDenied,

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("session file failed frame validation: {0}")]
    Corrupt(String),

    #[error("required argument was null or empty: {0}")]
    ArgumentNullish(&'static str),

    #[error(transparent)]
    Framing(#[from] beacon_framing::FramingError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether a caller retrying the operation that produced this error is
    /// worth attempting, per the failure taxonomy's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transport { .. } | AgentError::RepositoryLocked)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Exit codes for the external packager CLI. Exposed as a typed
/// enum so a caller matches on names instead of duplicating the numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Configuration = 2,
    NoSessionsMatched = 3,
    Transport = 4,
    Authentication = 5,
    LocalIo = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}
