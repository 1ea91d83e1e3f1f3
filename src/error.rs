use thiserror::Error;
use tracing::warn;

/// Errors surfaced to a caller of a user-facing orchestrator operation
/// (`submit`, `modify`, `cancel`, admin actions). Corresponds to the
/// Validation and Admission classes of SPEC_FULL.md §7; these carry
/// caller-safe messages and never imply a state change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("invalid charging mode")]
    InvalidMode,

    #[error("requested kWh must be positive")]
    NonPositiveKwh,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown pile: {0}")]
    UnknownPile(String),

    #[error("session does not belong to the requesting user")]
    NotOwner,

    #[error("session is already in a terminal state")]
    AlreadyTerminal,

    #[error("mode change is only permitted while a session is station-waiting")]
    ModeChangeNotPermitted,

    #[error("station waiting area is at capacity")]
    WaitingAreaFull,

    #[error("user already has an active session")]
    UserHasActiveSession,

    #[error("pile is already running")]
    PileAlreadyRunning,

    #[error("pile has active sessions; pass force=true to override")]
    PileHasActiveSessionsNotForce,
}

impl OperationError {
    /// Logs this error at a severity matching its taxonomy class, following
    /// the severity-tagged logging the teacher's HTTP error boundary does.
    pub fn log(&self) {
        warn!(error = %self, "operation rejected");
    }
}

/// Errors surfaced from the dispatch engine itself (SPEC_FULL.md §4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown pile: {0}")]
    UnknownPile(String),

    #[error("pile {0} already registered")]
    PileAlreadyRegistered(String),

    #[error("pile {0} is not busy")]
    PileNotBusy(String),
}
