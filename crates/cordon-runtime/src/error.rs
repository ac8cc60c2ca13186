use std::fmt;

use cordon_store::StoreError;
use cordon_worker::WorkerError;

#[derive(Debug)]
pub enum RuntimeError {
    /// The identifier is malformed or has no metadata; never auto-created.
    SessionNotFound(String),
    /// Input rejected before any process boundary was crossed.
    Invalid(String),
    Store(StoreError),
    Worker(WorkerError),
}

impl RuntimeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::Invalid(message.into())
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            RuntimeError::Invalid(msg) => f.write_str(msg),
            RuntimeError::Store(err) => err.fmt(f),
            RuntimeError::Worker(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Store(err) => Some(err),
            RuntimeError::Worker(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => RuntimeError::SessionNotFound(id),
            other => RuntimeError::Store(other),
        }
    }
}

impl From<WorkerError> for RuntimeError {
    fn from(err: WorkerError) -> Self {
        RuntimeError::Worker(err)
    }
}
