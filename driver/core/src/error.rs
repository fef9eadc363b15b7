//! Driver Errors
//!
//! One umbrella error for every operation the driver exposes. The variants
//! follow the failure taxonomy:
//! - validation: malformed input, rejected before any engine call
//! - simulator: the engine finished a command with a non-ok status
//! - transport: the isolated context died or could not understand a request
//! - engine: low-level contract violations from the engine itself
//! - remote: worker-side failures that only survive the boundary as text

use thiserror::Error;

use crate::engine::StatusCode;
use crate::transport::{ErrorKind, TransportError};
use crate::word::ValidationError;

/// Errors returned by driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Malformed word, address or flag
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The engine reported a non-ok status; `message` is its diagnostic text
    #[error("{message}")]
    Simulator {
        /// Status with annotation bits masked off
        status: StatusCode,
        /// Trimmed engine output, or `error (<status>)` if there was none
        message: String,
    },

    /// The engine broke its call contract
    #[error("engine failure: {0}")]
    Engine(String),

    /// No engine handle is loaded
    #[error("no engine is loaded")]
    EngineUnavailable,

    /// An EXAMINE produced no value for the requested target
    #[error("EXAMINE {target} returned no value")]
    MissingValue {
        /// The examined target
        target: String,
    },

    /// Cross-boundary failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A worker-side error that has no richer caller-side form
    #[error("{kind} error in worker: {message}")]
    Remote {
        /// Category reported by the worker
        kind: ErrorKind,
        /// Worker-side message
        message: String,
    },
}

impl DriverError {
    /// Build a simulator error from a status and captured text
    #[must_use]
    pub fn simulator(status: StatusCode, text: &str) -> Self {
        let trimmed = text.trim();
        let message = if trimmed.is_empty() {
            format!("error ({status})")
        } else {
            trimmed.to_string()
        };
        Self::Simulator { status, message }
    }

    /// Whether this error came from the transport rather than the engine
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Remote {
                    kind: ErrorKind::Transport,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_message_uses_trimmed_text() {
        let err = DriverError::simulator(99, "  Unknown command\n");
        assert_eq!(err.to_string(), "Unknown command");
    }

    #[test]
    fn test_simulator_message_falls_back_to_code() {
        let err = DriverError::simulator(99, " \n ");
        assert_eq!(err.to_string(), "error (99)");
    }

    #[test]
    fn test_validation_is_transparent() {
        let err: DriverError = crate::word::normalize_address("12345").unwrap_err().into();
        assert!(err.to_string().starts_with("address"));
        assert!(!err.is_transport());
    }
}
