//! Failure taxonomy shared by every coordination component.

use chrono::{DateTime, Utc};
use shared::FormatError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Lock, ledger or world absent. Expected in normal operation.
    #[error("{what} not found: {path}")]
    NotFound { what: &'static str, path: String },

    /// Storage unreachable or temporarily failing; worth retrying.
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),

    /// A lock or ledger file exists but cannot be understood.
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: FormatError,
    },

    /// The sync tool failed to start or exited with a non-zero status.
    #[error("{tool} failed{}: {message}", exit_suffix(.code))]
    ProcessFailure {
        tool: String,
        code: Option<i32>,
        message: String,
    },

    #[error("local filesystem error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Someone else currently holds occupancy of the world.
    #[error("{server_id} is locked by {owner} since {started_at}")]
    Locked {
        server_id: String,
        owner: String,
        started_at: DateTime<Utc>,
    },

    /// The remote lock could not be read, so it is unknown whether the world
    /// is free. Never treated as "free".
    #[error("lock state of {server_id} cannot be determined: {source}")]
    LockUnknown {
        server_id: String,
        #[source]
        source: Box<HostError>,
    },

    #[error("{0}")]
    InvalidInput(String),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {}", code),
        None => String::new(),
    }
}

impl HostError {
    pub fn not_found(what: &'static str, path: impl ToString) -> Self {
        HostError::NotFound {
            what,
            path: path.to_string(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        HostError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HostError::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HostError::Transient(_) => true,
            HostError::LockUnknown { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<shared::FormatError> for HostError {
    fn from(source: FormatError) -> Self {
        match source {
            FormatError::InvalidServerId(id) => {
                HostError::InvalidInput(format!("invalid server id {:?}", id))
            }
            source => HostError::Malformed {
                what: "record",
                source,
            },
        }
    }
}

/// Removal outcome for idempotent deletes. `existed == false` is still a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub existed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HostError::Transient("timeout".to_string()).is_retryable());
        assert!(!HostError::not_found("lock", "a/server.lock").is_retryable());

        let unknown = HostError::LockUnknown {
            server_id: "w".to_string(),
            source: Box::new(HostError::Transient("dns".to_string())),
        };
        assert!(unknown.is_retryable());
    }

    #[test]
    fn test_process_failure_message() {
        let err = HostError::ProcessFailure {
            tool: "rclone".to_string(),
            code: Some(7),
            message: "fatal".to_string(),
        };
        assert_eq!(err.to_string(), "rclone failed with exit code 7: fatal");

        let err = HostError::ProcessFailure {
            tool: "rclone".to_string(),
            code: None,
            message: "no such file".to_string(),
        };
        assert_eq!(err.to_string(), "rclone failed: no such file");
    }

    #[test]
    fn test_invalid_server_id_maps_to_invalid_input() {
        let err: HostError = shared::ServerId::new("a/b").unwrap_err().into();
        assert!(matches!(err, HostError::InvalidInput(_)));
    }
}
