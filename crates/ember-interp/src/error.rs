//! Error types reported across the native engine interface.

use crate::value::Zval;
use std::fmt;
use thiserror::Error;

/// Result type for engine evaluation.
pub type EvalResult<T> = Result<T, EvalError>;

/// Syntax error raised while tokenizing or parsing a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {} on line {}", self.message, self.file, self.line)
    }
}

impl std::error::Error for ParseError {}

/// Failure of an engine entry point.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The script did not parse.
    #[error("Parse error: {0}")]
    Parse(ParseError),

    /// A throwable escaped to the top of the script.
    #[error("Uncaught {0}")]
    Thrown(Box<ThrownError>),

    /// The host requested cooperative cancellation.
    #[error("Execution interrupted")]
    Interrupted,

    /// `max_execution_steps` was reached.
    #[error("Maximum execution steps of {0} exceeded")]
    StepLimit(u64),

    /// Internal engine state is inconsistent. The instance must not be used
    /// any further.
    #[error("Engine fault: {0}")]
    Fatal(String),
}

impl EvalError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Details of an uncaught throwable.
#[derive(Debug)]
pub struct ThrownError {
    /// Class of the thrown object, e.g. `TypeError`.
    pub class: String,
    pub message: String,
    pub code: i64,
    pub file: String,
    pub line: u32,
    /// Rendered stack trace, innermost frame first.
    pub trace: String,
    /// The throwable object itself.
    pub value: Zval,
}

impl fmt::Display for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in {}:{}",
            self.class, self.message, self.file, self.line
        )
    }
}

/// Failure reported by a native (host) function.
#[derive(Debug)]
pub enum NativeFault {
    /// Throw a new instance of `class` with `message` and extra properties.
    Throw {
        class: String,
        message: String,
        props: Vec<(String, Zval)>,
    },
    /// Rethrow an existing throwable.
    Rethrow(Zval),
    /// The native side detected corruption; tears the engine down.
    Fatal(String),
    /// An engine-level failure raised while the native function called back
    /// into the script (interrupt, step limit); propagated unchanged.
    Abort(EvalError),
}

impl NativeFault {
    pub fn throw(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Throw {
            class: class.into(),
            message: message.into(),
            props: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::throw("TypeError", message)
    }
}

/// Misuse of the audited mutation API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("expected array, found {0}")]
    NotAnArray(&'static str),

    #[error("expected object, found {0}")]
    NotAnObject(&'static str),

    #[error("cannot add element to the array as the next element is already occupied")]
    NextIndexOccupied,
}
