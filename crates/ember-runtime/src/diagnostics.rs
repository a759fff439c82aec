//! Script output and warnings, and where they go.
//!
//! Every execution returns the [`Diagnostics`] it produced and also hands
//! them to the engine's [`DiagnosticsSink`]. The default sink forwards to
//! `tracing` under the `ember::script` target.

use ember_core::ContextId;
use ember_interp::{Warning, WarningLevel};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Captured output and non-fatal warnings of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Everything the script echoed.
    pub output: String,
    pub warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.warnings.is_empty()
    }

    /// Append another batch, e.g. from an init script.
    pub fn extend(&mut self, other: Diagnostics) {
        self.output.push_str(&other.output);
        self.warnings.extend(other.warnings);
    }

    /// Warning messages, in the order they were raised.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(|w| w.message.as_str())
    }
}

/// Receiver of script diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, context: ContextId, diagnostics: &Diagnostics);
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn DiagnosticsSink>;

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&self, context: ContextId, diagnostics: &Diagnostics) {
        if !diagnostics.output.is_empty() {
            debug!(
                target: "ember::script",
                context = %context,
                bytes = diagnostics.output.len(),
                "{}",
                diagnostics.output
            );
        }
        for warning in &diagnostics.warnings {
            match warning.level {
                WarningLevel::Deprecated | WarningLevel::UserDeprecated => info!(
                    target: "ember::script",
                    context = %context,
                    file = %warning.file,
                    line = warning.line,
                    "{}",
                    warning.message
                ),
                _ => warn!(
                    target: "ember::script",
                    context = %context,
                    file = %warning.file,
                    line = warning.line,
                    level = warning.level.label(),
                    "{}",
                    warning.message
                ),
            }
        }
    }
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    batches: Mutex<Vec<(ContextId, Diagnostics)>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain the collected batches.
    pub fn take(&self) -> Vec<(ContextId, Diagnostics)> {
        std::mem::take(&mut *self.batches.lock())
    }

    /// All warnings collected so far.
    pub fn warnings(&self) -> Vec<Warning> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, d)| d.warnings.iter().cloned())
            .collect()
    }
}

impl DiagnosticsSink for CollectingSink {
    fn emit(&self, context: ContextId, diagnostics: &Diagnostics) {
        if !diagnostics.is_empty() {
            self.batches.lock().push((context, diagnostics.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning(message: &str) -> Warning {
        Warning {
            level: WarningLevel::UserWarning,
            message: message.to_string(),
            file: "main.php".to_string(),
            line: 1,
        }
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut first = Diagnostics {
            output: "a".into(),
            warnings: vec![warning("one")],
        };
        first.extend(Diagnostics {
            output: "b".into(),
            warnings: vec![warning("two")],
        });
        assert_eq!(first.output, "ab");
        assert_eq!(first.messages().collect::<Vec<_>>(), ["one", "two"]);
    }

    #[test]
    fn test_collecting_sink_skips_empty_batches() {
        let sink = CollectingSink::new();
        let context = ContextId::from_raw(7);
        sink.emit(context, &Diagnostics::default());
        sink.emit(
            context,
            &Diagnostics {
                output: String::new(),
                warnings: vec![warning("careful")],
            },
        );
        assert_eq!(sink.warnings().len(), 1);
        let batches = sink.take();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, context);
        assert!(sink.take().is_empty());
    }
}
