//! Error taxonomy for the runner.
//!
//! Errors are grouped the way the run orchestrator propagates them: a
//! handful of kinds abort the whole run before any action starts (`BaseError`
//! and its variants), while `RenderError`/`RunError` are scoped to a single
//! action and never escape the orchestrator directly. Each `BaseError`
//! variant carries a stable numeric code, used as the process exit status.

use std::fmt;

use thiserror::Error;

use crate::action::ActionStatus;

/// Stable numeric exit code attached to a top-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const BASE: Self = Self(101);
    pub const LOAD: Self = Self(102);
    pub const INTEGRITY: Self = Self(103);
    pub const SOURCE: Self = Self(104);
    pub const INTERACTION: Self = Self(105);
    pub const PACKAGE_REQUIREMENT: Self = Self(107);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Malformed workflow source. Carries the stack of imported files that led
/// to the failure, innermost last, the way nested `!import` clauses do.
#[derive(Debug)]
pub struct LoadError {
    pub message: String,
    pub stack: Vec<String>,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.stack.push(source.into());
        self
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.stack.is_empty() {
            write!(f, " (sources stack: {})", self.stack.join(" -> "))?;
        }
        Ok(())
    }
}

impl std::error::Error for LoadError {}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IntegrityError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SourceError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct InteractionError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PackageRequirementError(pub String);

/// Errors that abort the whole run before any action is scheduled.
#[derive(Debug, Error)]
pub enum BaseError {
    #[error("{0}")]
    Load(#[from] LoadError),
    #[error("{0}")]
    Integrity(#[from] IntegrityError),
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    Interaction(#[from] InteractionError),
    #[error("{0}")]
    PackageRequirement(#[from] PackageRequirementError),
}

impl BaseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Load(_) => ErrorCode::LOAD,
            Self::Integrity(_) => ErrorCode::INTEGRITY,
            Self::Source(_) => ErrorCode::SOURCE,
            Self::Interaction(_) => ErrorCode::INTERACTION,
            Self::PackageRequirement(_) => ErrorCode::PACKAGE_REQUIREMENT,
        }
    }
}

/// Template rendering failures. All surface externally as one kind, but the
/// subcause is kept for messages and tests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Action not found: {0}")]
    ActionNotFound(String),
    #[error("Outcome key {0:?} not found")]
    OutcomeKeyMissing(String),
    #[error("Context key not found: {0}")]
    ContextKeyMissing(String),
    #[error("Restricted builtin: {0}")]
    RestrictedBuiltin(String),
    #[error("Recursion depth exceeded")]
    RecursionDepthExceeded,
    #[error("{0}")]
    Other(String),
}

/// An action body reported failure; the message is whatever `fail()` (or an
/// uncaught error's string form) produced.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct RunError(pub String);

/// Raised by the orchestrator once the run completes with at least one
/// unresolved (non-warning) action failure.
#[derive(Debug, Error)]
#[error("execution failed: one or more actions did not complete successfully")]
pub struct ExecutionFailed;

/// Action API misuse, e.g. disabling an action that already started.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("cannot disable an action in status {0:?}; only PENDING actions may be disabled")]
    CannotDisable(ActionStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_formats_source_stack() {
        let err = LoadError::new("unrecognized root keys")
            .with_source("root.yml")
            .with_source("included.yml");
        let rendered = err.to_string();
        assert!(rendered.contains("unrecognized root keys"));
        assert!(rendered.contains("root.yml -> included.yml"));
    }

    #[test]
    fn base_error_codes_match_taxonomy() {
        assert_eq!(BaseError::from(IntegrityError("x".into())).code(), ErrorCode::INTEGRITY);
        assert_eq!(BaseError::from(SourceError("x".into())).code(), ErrorCode::SOURCE);
    }
}
