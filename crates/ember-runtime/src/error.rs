//! Error types for ember-runtime
//!
//! Re-exports core errors from ember-core and adds lifecycle, script and
//! callback errors.

use crate::diagnostics::Diagnostics;
use ember_interp::{EvalError, ThrownError, Zval};
use std::fmt;
use thiserror::Error;

// Re-export core error types
pub use ember_core::{CoreError, CoreResult};

/// Class thrown into scripts when a host callback fails.
pub const HOST_EXCEPTION: &str = "HostException";

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum EmberError {
    /// Handle or conversion error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The context is already running a script
    #[error("Execution context is busy")]
    ContextBusy,

    /// The engine already has a context that has not been closed
    #[error("An execution context is already open on this engine")]
    ContextAlreadyOpen,

    /// Shutdown was requested while a context is still open
    #[error("Cannot shut down: an execution context is still open")]
    ContextStillOpen,

    /// An engine is already running on this thread
    #[error("An engine is already running on this thread")]
    AlreadyRunning,

    /// The context was closed
    #[error("Execution context is closed")]
    ContextClosed,

    /// The engine was shut down or terminated by a fault
    #[error("Engine is not running")]
    EngineNotRunning,

    /// The engine hit an internal fault and was terminated
    #[error("Engine fault: {0}")]
    EngineFault(String),

    /// Execution was cancelled through an interrupt handle
    #[error("Script execution interrupted")]
    Interrupted,

    /// `max_execution_steps` was exhausted
    #[error("Script exceeded the step limit of {0}")]
    StepLimit(u64),

    /// The script raised an error it did not catch
    #[error("{kind}: {message} in {file} on line {line}")]
    ScriptError {
        message: String,
        /// Throwable class, or the host kind tag for host exceptions
        kind: String,
        trace: Option<String>,
        file: String,
        line: u32,
    },

    /// No function with that name exists in the context
    #[error("Call to undefined function {0}()")]
    UnknownFunction(String),

    /// Arguments rejected before a host function was invoked
    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// A function or class could not be registered
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker pool queue is at capacity
    #[error("Worker queue is full")]
    QueueFull,

    /// The worker pool was shut down or its worker went away
    #[error("Worker pool is not running: {0}")]
    PoolClosed(&'static str),

    /// A job panicked on a worker thread
    #[error("Worker panic: {0}")]
    WorkerPanic(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EmberError {
    /// Create a script error from a kind and message
    pub fn script_error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptError {
            message: message.into(),
            kind: kind.into(),
            trace: None,
            file: String::new(),
            line: 0,
        }
    }

    /// Kind tag of a script error.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::ScriptError { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// True for errors raised by the script itself, as opposed to lifecycle
    /// or handle-safety errors.
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            Self::ScriptError { .. } | Self::Interrupted | Self::StepLimit(_)
        )
    }

    pub(crate) fn from_eval(err: EvalError) -> Self {
        match err {
            EvalError::Parse(parse) => Self::ScriptError {
                message: parse.message,
                kind: "ParseError".to_string(),
                trace: None,
                file: parse.file,
                line: parse.line,
            },
            EvalError::Thrown(thrown) => Self::from_thrown(*thrown),
            EvalError::Interrupted => Self::Interrupted,
            EvalError::StepLimit(limit) => Self::StepLimit(limit),
            EvalError::Fatal(message) => Self::EngineFault(message),
        }
    }

    fn from_thrown(thrown: ThrownError) -> Self {
        let kind = host_kind(&thrown.value).unwrap_or(thrown.class);
        Self::ScriptError {
            message: thrown.message,
            kind,
            trace: (!thrown.trace.is_empty()).then_some(thrown.trace),
            file: thrown.file,
            line: thrown.line,
        }
    }
}

/// Kind tag carried by a host exception object.
fn host_kind(value: &Zval) -> Option<String> {
    let obj = value.as_object()?.borrow();
    if !obj.class.eq_ignore_ascii_case(HOST_EXCEPTION) {
        return None;
    }
    obj.get("kind")
        .and_then(Zval::as_str)
        .filter(|kind| !kind.is_empty())
        .map(str::to_string)
}

/// Result type alias for runtime operations
pub type EmberResult<T> = Result<T, EmberError>;

/// A failed execution together with everything the script produced before
/// it failed.
#[derive(Debug)]
pub struct ScriptFailure {
    pub error: EmberError,
    pub diagnostics: Diagnostics,
}

impl ScriptFailure {
    pub fn new(error: EmberError, diagnostics: Diagnostics) -> Self {
        Self { error, diagnostics }
    }

    pub fn into_error(self) -> EmberError {
        self.error
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for ScriptFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<EmberError> for ScriptFailure {
    fn from(error: EmberError) -> Self {
        Self::new(error, Diagnostics::default())
    }
}

impl From<CoreError> for ScriptFailure {
    fn from(error: CoreError) -> Self {
        Self::from(EmberError::from(error))
    }
}

impl From<ScriptFailure> for EmberError {
    fn from(failure: ScriptFailure) -> Self {
        failure.error
    }
}

/// Failure reported by a host callback.
///
/// Scripts observe it as a `HostException` whose `kind` property holds
/// [`HostError::kind`]. Any `anyhow::Error` converts into it, so callbacks
/// can use `?` freely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: String,
    pub message: String,
}

impl HostError {
    pub const DEFAULT_KIND: &'static str = "HostError";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Error with the default kind tag.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Self::DEFAULT_KIND, message)
    }
}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the kind of a wrapped host error.
        match err.downcast::<HostError>() {
            Ok(host) => host,
            Err(err) => Self::msg(format!("{err:#}")),
        }
    }
}

impl From<EmberError> for HostError {
    fn from(err: EmberError) -> Self {
        match err {
            EmberError::ScriptError { kind, message, .. } => Self::new(kind, message),
            other => Self::msg(other.to_string()),
        }
    }
}

impl From<CoreError> for HostError {
    fn from(err: CoreError) -> Self {
        Self::new("ConversionError", err.to_string())
    }
}

/// Result of a host callback.
pub type HostResult<T = ember_core::HostValue> = Result<T, HostError>;
