//! Structured error types for the Procfile front end.
//!
//! Parsing never stops at the first problem it finds, so [`ParseError`]
//! is usually seen wrapped in a `Vec` rather
//! than surfaced singly. Everything past the parser boundary (spawning,
//! signalling, I/O with a running child) is plain `anyhow::Error`, since
//! callers there want context chains, not a closed error enum.

use thiserror::Error;

/// A lexical failure while tokenising one logical line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{line}:{col}: {reason}")]
pub struct SyntaxError {
    pub line: usize,
    pub col: usize,
    pub reason: String,
}

impl SyntaxError {
    pub fn new(line: usize, col: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            col,
            reason: reason.into(),
        }
    }
}

/// A single invariant violation discovered while building the process graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{line}:{col}: {reason}")]
    Syntax {
        line: usize,
        col: usize,
        reason: String,
    },
    #[error("duplicate process name {name:?}")]
    DuplicateName { name: String },
    #[error("process {name:?} depends on unknown process {dependency:?}")]
    UnknownDependency { name: String, dependency: String },
    #[error("unknown option {key:?} for process {name:?}")]
    UnknownOption { name: String, key: String },
    #[error("invalid value {value:?} for option {key:?} on process {name:?}: {reason}")]
    InvalidOptionValue {
        name: String,
        key: String,
        value: String,
        reason: String,
    },
    #[error("process {name:?} declares a ready check but is a one-shot process")]
    ReadyOnOneShot { name: String },
    #[error("invalid glob pattern {pattern:?} on process {name:?}: {reason}")]
    InvalidGlob {
        name: String,
        pattern: String,
        reason: String,
    },
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

impl From<SyntaxError> for ParseError {
    fn from(err: SyntaxError) -> Self {
        ParseError::Syntax {
            line: err.line,
            col: err.col,
            reason: err.reason,
        }
    }
}

/// Raised by [`crate::parser::parse`] when one or more [`ParseError`]s were found.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} error(s) parsing Procfile", .0.len())]
pub struct ParseErrors(pub Vec<ParseError>);

impl ParseErrors {
    pub fn errors(&self) -> &[ParseError] {
        &self.0
    }
}
