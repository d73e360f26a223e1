//! Error types for the refinery-core crate.
//!
//! Every error carries an [`ErrorKind`] so callers can map failures onto
//! the four categories surfaced by the API: validation, execution,
//! not-found, and authorization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The category an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    NotFound,
    Authorization,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Authorization => "authorization",
        };
        f.write_str(name)
    }
}

/// A single violated constraint reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Parameter or column the violation refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            target: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{target}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level error type for pipeline, dataset, and recipe operations.
#[derive(Debug, Error)]
pub enum RefineryError {
    #[error(
        "Validation failed at step {step_index} ({step_type}): {}",
        join_violations(.violations)
    )]
    Validation {
        step_index: usize,
        step_type: String,
        violations: Vec<Violation>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl RefineryError {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The category this error is reported under. Infrastructure failures
    /// (I/O, storage, serialization) surface as execution errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidInput(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Sqlite(rusqlite::Error::QueryReturnedNoRows) => ErrorKind::NotFound,
            Self::Execution(_) | Self::Config(_) | Self::Io(_) | Self::Serde(_) | Self::Sqlite(_) => {
                ErrorKind::Execution
            }
        }
    }

    /// All violations carried by a validation error; empty for other kinds.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// A type alias for results using [`RefineryError`].
pub type Result<T> = std::result::Result<T, RefineryError>;
