use std::fmt;
use std::io;
use std::time::Duration;

use cordon_proto::RemoteExceptionPayload;

/// The session service raised inside the worker. The worker process itself
/// is still alive and reusable.
#[derive(Debug, Clone)]
pub struct RemoteInvocationError {
    command: String,
    payload: RemoteExceptionPayload,
}

impl RemoteInvocationError {
    pub fn new(command: impl Into<String>, payload: RemoteExceptionPayload) -> Self {
        RemoteInvocationError { command: command.into(), payload }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn remote_type(&self) -> &str {
        &self.payload.exc_type
    }

    pub fn remote_module(&self) -> &str {
        &self.payload.exc_module
    }

    pub fn remote_message(&self) -> &str {
        &self.payload.message
    }

    pub fn pretty_remote_traceback(&self) -> String {
        self.payload.pretty_traceback()
    }

    pub fn payload(&self) -> &RemoteExceptionPayload {
        &self.payload
    }
}

impl fmt::Display for RemoteInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = if self.payload.message.is_empty() {
            &self.payload.exc_type
        } else {
            &self.payload.message
        };
        write!(f, "{} failed: {}: {detail}", self.command, self.payload.exc_type)
    }
}

impl std::error::Error for RemoteInvocationError {}

#[derive(Debug)]
pub enum WorkerError {
    /// Local rejection: the worker was already stopped when the call was made.
    Stopped,
    /// The channel to the worker broke; the worker has been marked dead.
    Unavailable,
    /// No response within the configured window; the worker was destroyed
    /// while raising this.
    Timeout { command: String, timeout: Duration },
    Remote(RemoteInvocationError),
    /// The worker process could not be spawned.
    Spawn(io::Error),
    /// The worker answered with a payload the host could not decode.
    Protocol(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Stopped => f.write_str("session worker has been stopped"),
            WorkerError::Unavailable => f.write_str("session worker became unavailable"),
            WorkerError::Timeout { command, timeout } => {
                write!(f, "{command} timed out after {:.3} seconds", timeout.as_secs_f64())
            }
            WorkerError::Remote(err) => err.fmt(f),
            WorkerError::Spawn(err) => write!(f, "failed to spawn session worker: {err}"),
            WorkerError::Protocol(msg) => write!(f, "malformed worker response: {msg}"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Remote(err) => Some(err),
            WorkerError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RemoteInvocationError> for WorkerError {
    fn from(err: RemoteInvocationError) -> Self {
        WorkerError::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_and_accessors() {
        let payload = RemoteExceptionPayload::new("ValueError", "service", "boom", "trace");
        let err = RemoteInvocationError::new("call", payload);
        assert_eq!(err.remote_type(), "ValueError");
        assert_eq!(err.remote_message(), "boom");
        assert!(err.to_string().contains("call failed"));
        assert_eq!(err.pretty_remote_traceback(), "trace");
    }

    #[test]
    fn remote_error_synthesizes_traceback_when_absent() {
        let payload = RemoteExceptionPayload::new("Exception", "", "boom", "");
        let err = RemoteInvocationError::new("deploy", payload);
        assert_eq!(err.pretty_remote_traceback(), "Exception: boom");
    }

    #[test]
    fn timeout_display_names_the_command() {
        let err = WorkerError::Timeout {
            command: "dump_state".to_string(),
            timeout: Duration::from_secs(30),
        };
        let text = err.to_string();
        assert!(text.contains("dump_state"));
        assert!(text.contains("30"));
    }
}
