//! Error types for the trip supervisor
//!
//! `SupervisorError` covers caller mistakes and infrastructure errors.
//! Handler failures are not errors: they travel as `FailureKind` values
//! through the dispatch loop and end up in the trip state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {

    // =============================
    // Session / Caller Errors
    // =============================

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation '{operation}' is not valid in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: crate::models::Phase,
    },

    #[error("Invalid preference: {0}")]
    InvalidPreference(String),

    #[error("Illegal phase transition: {from} -> {to}")]
    IllegalTransition {
        from: crate::models::Phase,
        to: crate::models::Phase,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),
}

/// Classification of a handler failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Retryable: timeouts, rate limits, upstream hiccups
    Transient,
    /// Not retryable; fatal only in critical phases
    Permanent,
    /// Turn budget exceeded; always fatal
    Budget,
    /// Handler wrote fields it never declared; always fatal
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "TRANSIENT",
            FailureKind::Permanent => "PERMANENT",
            FailureKind::Budget => "BUDGET",
            FailureKind::Validation => "VALIDATION",
        };
        write!(f, "{}", s)
    }
}

/// A failure surfaced to the caller verbatim
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReport {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}
