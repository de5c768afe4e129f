//! Structured error model for step logic.
//!
//! [`StepError`] carries a scope that tells the runner whether the fault
//! concerns a single row (recoverable through the step's row error policy)
//! or the whole step-copy. Construct via the scope-specific factories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Blast radius of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Affects the row being processed only.
    Row,
    /// Affects the whole step-copy; processing cannot continue.
    Step,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Row => "row",
            Self::Step => "step",
        };
        f.write_str(s)
    }
}

/// Error raised by step logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{scope}] {code}: {message}")]
pub struct StepError {
    pub scope: ErrorScope,
    pub code: String,
    pub message: String,
    /// Names of the fields that caused a row-level error, if known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl StepError {
    fn new(scope: ErrorScope, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope,
            code: code.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Row-level error: only the current row is affected.
    #[must_use]
    pub fn row(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorScope::Row, code, message)
    }

    /// Unrecoverable processing fault.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorScope::Step, code, message)
    }

    /// Invalid step configuration, reported from factories or `init`.
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorScope::Step, code, format!("invalid configuration: {}", message.into()))
    }

    /// Record the fields responsible for a row-level error.
    #[must_use]
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn is_row_level(&self) -> bool {
        self.scope == ErrorScope::Row
    }

    /// Promote to a step-fatal error, keeping code and message.
    #[must_use]
    pub fn escalate(mut self) -> Self {
        self.scope = ErrorScope::Step;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_errors_are_row_level() {
        let err = StepError::row("BAD_VALUE", "qty must be positive").with_fields(["qty"]);
        assert!(err.is_row_level());
        assert_eq!(err.fields, vec!["qty".to_string()]);
    }

    #[test]
    fn escalate_keeps_code() {
        let err = StepError::row("BAD_VALUE", "nope").escalate();
        assert!(!err.is_row_level());
        assert_eq!(err.code, "BAD_VALUE");
    }

    #[test]
    fn config_errors_are_fatal() {
        let err = StepError::config("MISSING_ROWS", "rows are required");
        assert_eq!(err.scope, ErrorScope::Step);
        assert!(err.message.contains("rows are required"));
    }

    #[test]
    fn display_format() {
        let err = StepError::fatal("DISK_FULL", "no space left");
        assert_eq!(err.to_string(), "[step] DISK_FULL: no space left");
    }

    #[test]
    fn serde_roundtrip() {
        let err = StepError::row("X", "y").with_fields(["a", "b"]);
        let json = serde_json::to_string(&err).unwrap();
        let back: StepError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
