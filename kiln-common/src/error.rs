use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::{Stage, StageFailure};

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Object File Error: {0}")]
    Object(#[from] Arc<object::read::Error>),

    #[error("Git Error: {0}")]
    Git(#[from] Arc<git2::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Generic Error: {0}")]
    Generic(String),

    #[error("IoError: {0}")]
    IoError(String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Integrity Error: {url}: expected sha256 {expected}, got {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Patch Error: patch '{patch_id}' did not apply cleanly: {reason}")]
    Patch { patch_id: String, reason: String },

    #[error("Fetch Error: failed to fetch '{url}' after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Unknown dependency '{name}' (required by {required_by})")]
    UnknownDependency { name: String, required_by: String },

    #[error("Missing platform fact '{fact}'")]
    MissingPlatformFact { fact: String },

    #[error("Template Error: {0}")]
    Template(String),

    #[error("[{formula}] {stage} stage failed: {failure}")]
    StageFailed {
        formula: String,
        stage: Stage,
        failure: StageFailure,
        output: String,
    },

    #[error("[{formula}] skipped: dependency '{dependency}' failed")]
    DependencyFailed { formula: String, dependency: String },

    #[error("Invalid build state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Verification failed: {}", .failed_checks.join(", "))]
    VerificationFailed { failed_checks: Vec<String> },
}

impl KilnError {
    /// Transient errors are the only ones a fetch retry loop may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            KilnError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| {
                        s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS
                    })
            }
            KilnError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for KilnError {
    fn from(err: semver::Error) -> Self {
        KilnError::SemVer(Arc::new(err))
    }
}

impl From<object::read::Error> for KilnError {
    fn from(err: object::read::Error) -> Self {
        KilnError::Object(Arc::new(err))
    }
}

impl From<git2::Error> for KilnError {
    fn from(err: git2::Error) -> Self {
        KilnError::Git(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_path_in_order() {
        let err = KilnError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn io_timeouts_are_transient_but_integrity_is_not() {
        let timeout: KilnError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(timeout.is_transient());
        let integrity = KilnError::Integrity {
            url: "file:///x".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!integrity.is_transient());
    }
}
