//! Module-level engine state: ini settings, built-in tables and the
//! interrupt flag shared by every request started from a [`Runtime`].

use crate::ast::{ClassDecl, StmtKind};
use crate::builtins::{self, BuiltinTable};
use crate::classes::PRELUDE;
use crate::error::{EvalError, EvalResult};
use crate::loader::SharedSourceProvider;
use crate::parser;
use indexmap::IndexMap;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Engine ini settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IniSettings {
    /// Significant digits when printing floats; below 1 prints the shortest
    /// round-trip representation.
    pub precision: i32,
    /// Upper bound on interpreter steps per entry call; 0 disables the limit.
    pub max_execution_steps: u64,
    /// Maximum nesting of script function calls.
    pub max_call_depth: usize,
    /// Echo warnings into the output buffer as well as recording them.
    pub display_errors: bool,
    extra: IndexMap<String, String>,
}

impl Default for IniSettings {
    fn default() -> Self {
        Self {
            precision: 14,
            max_execution_steps: 0,
            max_call_depth: 256,
            display_errors: false,
            extra: IndexMap::new(),
        }
    }
}

/// Invalid value for a recognised ini key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for ini setting '{key}'")]
pub struct IniError {
    pub key: String,
    pub value: String,
}

impl IniSettings {
    /// Apply one setting. Unknown keys are stored verbatim.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), IniError> {
        let invalid = || IniError {
            key: key.to_string(),
            value: value.to_string(),
        };
        let trimmed = value.trim();
        match key {
            "precision" => self.precision = trimmed.parse().map_err(|_| invalid())?,
            "max_execution_steps" => {
                self.max_execution_steps = trimmed.parse().map_err(|_| invalid())?
            }
            "max_call_depth" => {
                let depth: usize = trimmed.parse().map_err(|_| invalid())?;
                if depth == 0 {
                    return Err(invalid());
                }
                self.max_call_depth = depth;
            }
            "display_errors" => self.display_errors = parse_flag(trimmed).ok_or_else(invalid)?,
            _ => {
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Current value as the string `ini_get` reports.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "precision" => Some(self.precision.to_string()),
            "max_execution_steps" => Some(self.max_execution_steps.to_string()),
            "max_call_depth" => Some(self.max_call_depth.to_string()),
            "display_errors" => Some(if self.display_errors { "1" } else { "0" }.to_string()),
            _ => self.extra.get(key).cloned(),
        }
    }

    /// Apply ordered overrides, stopping at the first invalid entry.
    pub fn apply<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), IniError> {
        for (key, value) in overrides {
            self.set(key, value)?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Thread-safe handle used to request cooperative cancellation.
///
/// The interpreter polls the flag on every step and unwinds the running
/// script with [`EvalError::Interrupted`], clearing the flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt of the running script.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear a pending request.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Consume a pending request, returning whether one was set.
    pub(crate) fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Started engine module.
///
/// Owns the settings and read-only tables every request shares. One runtime
/// lives on one thread; requests borrow it only while starting.
pub struct Runtime {
    pub(crate) ini: IniSettings,
    pub(crate) loader: Option<SharedSourceProvider>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) builtins: Rc<BuiltinTable>,
    pub(crate) prelude: Rc<Vec<Rc<ClassDecl>>>,
    requests: Cell<u64>,
}

impl Runtime {
    /// Module startup.
    pub fn startup(ini: IniSettings, loader: Option<SharedSourceProvider>) -> EvalResult<Self> {
        let program = parser::parse(PRELUDE, "[prelude]")
            .map_err(|err| EvalError::fatal(format!("prelude failed to parse: {err}")))?;
        let prelude = program
            .stmts
            .into_iter()
            .filter_map(|stmt| match stmt.kind {
                StmtKind::Class(decl) => Some(decl),
                _ => None,
            })
            .collect::<Vec<_>>();

        let builtins = builtins::table();
        debug!(
            precision = ini.precision,
            max_call_depth = ini.max_call_depth,
            builtins = builtins.len(),
            "engine runtime started"
        );

        Ok(Self {
            ini,
            loader,
            interrupt: InterruptHandle::new(),
            builtins: Rc::new(builtins),
            prelude: Rc::new(prelude),
            requests: Cell::new(0),
        })
    }

    pub fn ini(&self) -> &IniSettings {
        &self.ini
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Number of requests started so far.
    pub fn requests_started(&self) -> u64 {
        self.requests.get()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        let id = self.requests.get() + 1;
        self.requests.set(id);
        id
    }

    /// Module shutdown.
    pub fn shutdown(self) {
        debug!(requests = self.requests.get(), "engine runtime shut down");
    }
}
