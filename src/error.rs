//! The errors produced while driving hosts.
//!
//! Everything below the experiment layer returns `RunnerError` so that callers can tell an
//! unreachable host apart from a command that ran and failed. Experiment scripts generally just
//! propagate a `failure::Error` and downcast when they care.

use std::time::Duration;

use failure_derive::Fail;

#[derive(Debug, Fail)]
pub enum RunnerError {
    /// The host could not be reached, or the transport to it broke.
    #[fail(display = "unable to reach {}: {}", host, reason)]
    Connection { host: String, reason: String },

    /// A command ran on the host and exited non-zero.
    #[fail(display = "{}: command exited with {}: {}", host, exit, command)]
    Execution {
        host: String,
        command: String,
        exit: i32,
    },

    /// An option is missing or invalid. Always raised before any host is touched.
    #[fail(display = "invalid configuration: {}", reason)]
    Configuration { reason: String },

    /// A process did not finish within the allowed time.
    #[fail(display = "{}: `{}` still running after {:?}", host, command, after)]
    Timeout {
        host: String,
        command: String,
        after: Duration,
    },

    /// An operation was invoked in a state that does not allow it.
    #[fail(display = "invalid state: {}", reason)]
    InvalidState { reason: String },
}

impl RunnerError {
    pub fn connection(host: &str, reason: impl ToString) -> Self {
        RunnerError::Connection {
            host: host.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl ToString) -> Self {
        RunnerError::Configuration {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_state(reason: impl ToString) -> Self {
        RunnerError::InvalidState {
            reason: reason.to_string(),
        }
    }

    /// The host this error pertains to, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            RunnerError::Connection { host, .. }
            | RunnerError::Execution { host, .. }
            | RunnerError::Timeout { host, .. } => Some(host),
            RunnerError::Configuration { .. } | RunnerError::InvalidState { .. } => None,
        }
    }
}
