//! Custom error types for the sweep application.
//!
//! `DaqError` is the single error type for the library. It mirrors the four
//! failure classes a resistance sweep can run into, plus the ambient I/O and
//! configuration-loading errors:
//!
//! - **`Config`**: invalid or out-of-range configuration. Detected before or at
//!   sweep start and never retried.
//! - **`Command`**: a bus write/read failed. Transient; the sweep engine retries
//!   it with bounded backoff before giving up.
//! - **`Timeout`**: the instrument did not answer within its bound. Treated the
//!   same as `Command` for retry purposes.
//! - **`Computation`**: a reading or derived value was not a finite number.
//! - **`Storage`**: the result logger could not persist a point or summary.
//!
//! Faulted sweeps store an [`ErrorKind`] instead of the error itself so the
//! result stays `Clone` and serializable.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Command error on '{resource}': {message}")]
    Command { resource: String, message: String },

    #[error("Timeout on '{resource}' after {timeout:?} waiting for '{command}'")]
    Timeout {
        resource: String,
        command: String,
        timeout: Duration,
    },

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Serializable classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Command,
    Timeout,
    Computation,
    Storage,
    Io,
}

impl DaqError {
    pub fn command(resource: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::Command {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn timeout(resource: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        DaqError::Timeout {
            resource: resource.into(),
            command: command.into(),
            timeout,
        }
    }

    /// Whether the retry loop should try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::Command { .. } | DaqError::Timeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_) | DaqError::ConfigLoad(_) | DaqError::FeatureNotEnabled(_) => {
                ErrorKind::Config
            }
            DaqError::Command { .. } => ErrorKind::Command,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::Computation(_) => ErrorKind::Computation,
            DaqError::Storage(_) => ErrorKind::Storage,
            DaqError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::command("GPIB0::24::INSTR", "write failed");
        assert_eq!(
            err.to_string(),
            "Command error on 'GPIB0::24::INSTR': write failed"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(DaqError::command("dev", "nak").is_transient());
        assert!(DaqError::timeout("dev", ":READ?", Duration::from_secs(1)).is_transient());
        assert!(!DaqError::Config("levels empty".into()).is_transient());
        assert!(!DaqError::Computation("NaN".into()).is_transient());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            DaqError::timeout("dev", ":READ?", Duration::from_millis(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DaqError::FeatureNotEnabled("instrument_visa".into()).kind(),
            ErrorKind::Config
        );
    }
}
