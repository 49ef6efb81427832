use ulid::Ulid;

use crate::model::Secs;

#[derive(Debug)]
pub enum EngineError {
    InvalidDuration(Secs),
    ContentNotFound(Ulid),
    ScheduleNotFound(Ulid),
    /// The single shift still overlaps this entry. Only raised when
    /// re-checking after a shift is enabled.
    ConflictUnresolved(Ulid),
    AlreadyExists(Ulid),
    InvalidContent(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDuration(secs) => {
                write!(f, "invalid duration: {secs}s (must be positive)")
            }
            EngineError::ContentNotFound(id) => write!(f, "content not found: {id}"),
            EngineError::ScheduleNotFound(id) => write!(f, "schedule not found: {id}"),
            EngineError::ConflictUnresolved(id) => {
                write!(f, "shifted slot still overlaps schedule: {id}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidContent(msg) => write!(f, "invalid content: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
