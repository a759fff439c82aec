//! Error types for handle access and value conversion.

use crate::arena::ContextId;
use ember_interp::{AccessError, NativeFault};
use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures of handle dereferencing and conversion.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The handle outlived its context, or its borrow scope ended.
    #[error("Stale handle: value from context {context} is no longer alive")]
    StaleHandle { context: ContextId },

    /// The handle was issued by a different context.
    #[error("Foreign handle: issued by context {found}, used with context {expected}")]
    ForeignHandle { expected: ContextId, found: ContextId },

    /// A cycle was found where the target representation cannot express one.
    #[error("Cyclic value: {0} refers to one of its ancestors")]
    CyclicValue(String),

    /// The value cannot be represented in the target numeric type.
    #[error("Numeric overflow: {value} does not fit in {target}")]
    NumericOverflow { value: String, target: &'static str },

    /// Type conversion error
    #[error("Type error: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Nesting exceeded the configured maximum depth.
    #[error("Conversion exceeded maximum depth of {0}")]
    DepthExceeded(usize),

    /// An audited mutation was applied to the wrong kind of value.
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    /// The engine refused to build a value.
    #[error("Engine error: {0}")]
    Engine(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn overflow(value: impl ToString, target: &'static str) -> Self {
        Self::NumericOverflow {
            value: value.to_string(),
            target,
        }
    }

    /// True for handle-safety violations.
    pub fn is_handle_error(&self) -> bool {
        matches!(self, Self::StaleHandle { .. } | Self::ForeignHandle { .. })
    }
}

impl From<NativeFault> for CoreError {
    fn from(fault: NativeFault) -> Self {
        match fault {
            NativeFault::Throw { class, message, .. } => Self::Engine(format!("{class}: {message}")),
            NativeFault::Rethrow(value) => Self::Engine(format!("uncaught {}", value.type_name())),
            NativeFault::Fatal(message) => Self::Engine(message),
            NativeFault::Abort(err) => Self::Engine(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::overflow(u64::MAX, "i32");
        assert_eq!(
            err.to_string(),
            "Numeric overflow: 18446744073709551615 does not fit in i32"
        );
        assert!(!err.is_handle_error());

        let err = CoreError::StaleHandle {
            context: ContextId::from_raw(3),
        };
        assert_eq!(
            err.to_string(),
            "Stale handle: value from context #3 is no longer alive"
        );
        assert!(err.is_handle_error());
    }

    #[test]
    fn test_native_fault_conversion() {
        let err = CoreError::from(NativeFault::throw("Error", "Cannot instantiate"));
        assert_eq!(err.to_string(), "Engine error: Error: Cannot instantiate");
    }
}
