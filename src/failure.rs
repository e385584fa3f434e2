//! Scenario failure taxonomy.
//!
//! Plain timeouts are not errors: `wait_for_line` returns `Ok(None)` and
//! `wait_for_idle` returns `Ok(false)`, and the scenario decides. Everything
//! here aborts the run.

use std::io;

use thiserror::Error;

use crate::signals::FaultKind;

#[derive(Debug, Error)]
pub enum TestFailure {
    /// A scenario assertion did not hold.
    #[error("{0}")]
    Assertion(String),

    /// The guest printed a fault marker; nothing after it can be trusted.
    #[error("{kind}: {line}")]
    Fatal { kind: FaultKind, line: String },

    #[error("{name} - Match timeout: {pattern}")]
    MatchTimeout { name: String, pattern: String },

    #[error("{name} - Unexpected match from \"{pattern}\" - {index}: {actual:?} != {expected:?}")]
    CaptureMismatch {
        name: String,
        pattern: String,
        index: usize,
        expected: String,
        actual: Option<String>,
    },

    #[error("Start timeout: {path}")]
    StartTimeout { path: String },

    #[error("Unexpected binary start: {actual:?} != {expected:?}")]
    UnexpectedBinary { expected: String, actual: String },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown character {0:?} in typed text")]
    UnsupportedCharacter(char),

    #[error("mouse button {0} out of range (expected 1..=3)")]
    InvalidButton(u8),

    #[error("pointer target ({x}, {y}) is too far from the current position")]
    PointerOutOfRange { x: i32, y: i32 },

    #[error("monitor channel failed: {0}")]
    Transport(#[from] io::Error),

    #[error("failed to start screen recorder: {0}")]
    Recorder(#[source] io::Error),
}

impl TestFailure {
    /// True for failures caused by the guest crashing rather than by an
    /// unmet expectation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TestFailure::Fatal { .. })
    }
}
