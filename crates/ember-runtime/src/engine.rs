//! Engine lifecycle.
//!
//! An [`Engine`] wraps one started engine runtime and lives on the thread
//! that started it. Each thread has a single engine slot: starting a second
//! engine while one is ready fails, and an engine owns at most one open
//! [`ExecutionContext`] at a time.
//!
//! # Example
//!
//! ```
//! use ember_runtime::{Engine, EngineConfig, HostValue};
//!
//! let engine = Engine::start(EngineConfig::new().ini("precision", "5")).unwrap();
//! let ctx = engine.new_context().unwrap();
//! let (value, diagnostics) = ctx.execute("<?php echo 'pi'; return pi();").unwrap();
//! assert_eq!(diagnostics.output, "pi");
//! assert!(matches!(value, HostValue::Float(_)));
//!
//! ctx.close().unwrap();
//! engine.shutdown().unwrap();
//! ```

use crate::bridge::{ClassTemplate, Extension, HostFunction};
use crate::config::EngineConfig;
use crate::context::{ContextInner, ExecutionContext};
use crate::diagnostics::{SharedSink, TracingSink};
use crate::error::{EmberError, EmberResult};
use ember_core::{Converter, CoreResult, EngineClass};
use ember_interp::{
    IncludePathLoader, InterruptHandle, Request, Runtime, SharedSourceProvider,
};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, error};

/// Lifecycle of the engine slot of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// No engine was started on this thread.
    Uninitialized,
    Ready,
    ShuttingDown,
    Shutdown,
}

thread_local! {
    static CURRENT: RefCell<Weak<EngineInner>> = RefCell::new(Weak::new());
    static LAST_STATE: Cell<EngineState> = const { Cell::new(EngineState::Uninitialized) };
}

fn current_engine() -> Option<Rc<EngineInner>> {
    CURRENT.with(|slot| slot.borrow().upgrade())
}

fn record_state(state: EngineState) {
    // The slot may already be gone during thread exit.
    let _ = LAST_STATE.try_with(|last| last.set(state));
}

type ClassFactory = fn() -> CoreResult<ClassTemplate>;

/// Builder for creating an Engine with custom configuration
#[derive(Clone)]
pub struct EngineBuilder {
    config: EngineConfig,
    extensions: Vec<Extension>,
    functions: Vec<HostFunction>,
    classes: Vec<ClassFactory>,
    sink: Option<SharedSink>,
    loader: Option<SharedSourceProvider>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            extensions: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            sink: None,
            loader: None,
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an extension to be available in all contexts
    pub fn extension(mut self, ext: Extension) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Register a host function to be available in all contexts
    pub fn function(mut self, function: HostFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Declare the engine class mirrored by `T` in every context.
    pub fn class<T: EngineClass>(mut self) -> Self {
        self.classes.push(ClassTemplate::of::<T>);
        self
    }

    /// Where script output and warnings go. Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Source provider for `include`/`require` and `execute_file`.
    ///
    /// Defaults to an [`IncludePathLoader`] over the configured include
    /// paths.
    pub fn source_provider(mut self, loader: SharedSourceProvider) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Check the configuration and function names without starting an
    /// engine.
    pub fn validate(&self) -> EmberResult<()> {
        self.config.validate()?;
        let mut functions = self.functions.clone();
        for ext in &self.extensions {
            functions.extend(ext.functions().iter().cloned());
        }
        check_unique(&functions)
    }

    /// Start the engine on the calling thread.
    pub fn start(self) -> EmberResult<Engine> {
        if current_engine().is_some_and(|engine| engine.state.get() == EngineState::Ready) {
            return Err(EmberError::AlreadyRunning);
        }
        self.config.validate()?;
        let ini = self.config.ini_settings()?;
        let classes = self
            .classes
            .iter()
            .map(|factory| factory())
            .collect::<CoreResult<Vec<_>>>()?;
        let mut functions = self.functions;
        for ext in &self.extensions {
            functions.extend(ext.functions().iter().cloned());
        }
        check_unique(&functions)?;

        let loader = self.loader.unwrap_or_else(|| {
            Arc::new(IncludePathLoader::new(self.config.include_paths.clone()))
        });
        let runtime = Runtime::startup(ini, Some(loader.clone())).map_err(EmberError::from_eval)?;
        let interrupt = runtime.interrupt_handle();
        let scripts = self
            .extensions
            .iter()
            .filter_map(|ext| ext.script().map(|s| (ext.name().to_string(), s.to_string())))
            .collect();

        let inner = Rc::new(EngineInner {
            state: Cell::new(EngineState::Ready),
            runtime: RefCell::new(Some(runtime)),
            converter: Converter::new(self.config.convert),
            config: self.config,
            loader,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            interrupt,
            functions: RefCell::new(functions),
            scripts: RefCell::new(scripts),
            classes: RefCell::new(classes),
            open: RefCell::new(Weak::new()),
            contexts_opened: Cell::new(0),
        });
        CURRENT.with(|slot| *slot.borrow_mut() = Rc::downgrade(&inner));
        record_state(EngineState::Ready);
        debug!(
            functions = inner.functions.borrow().len(),
            classes = inner.classes.borrow().len(),
            "engine started"
        );
        Ok(Engine { inner })
    }
}

fn check_unique(functions: &[HostFunction]) -> EmberResult<()> {
    for (i, f) in functions.iter().enumerate() {
        if functions[..i]
            .iter()
            .any(|other| other.name().eq_ignore_ascii_case(f.name()))
        {
            return Err(EmberError::Registration(format!(
                "function {}() is registered twice",
                f.name()
            )));
        }
    }
    Ok(())
}

/// Shared engine state; contexts keep it alive.
pub(crate) struct EngineInner {
    pub(crate) state: Cell<EngineState>,
    runtime: RefCell<Option<Runtime>>,
    pub(crate) config: EngineConfig,
    pub(crate) converter: Converter,
    pub(crate) loader: SharedSourceProvider,
    pub(crate) sink: SharedSink,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) functions: RefCell<Vec<HostFunction>>,
    /// Extension init scripts as (extension name, source).
    pub(crate) scripts: RefCell<Vec<(String, String)>>,
    pub(crate) classes: RefCell<Vec<ClassTemplate>>,
    open: RefCell<Weak<ContextInner>>,
    contexts_opened: Cell<u64>,
}

impl EngineInner {
    pub(crate) fn ensure_ready(&self) -> EmberResult<()> {
        match self.state.get() {
            EngineState::Ready => Ok(()),
            _ => Err(EmberError::EngineNotRunning),
        }
    }

    /// The context that has not been torn down yet, if any.
    pub(crate) fn open_context(&self) -> Option<Rc<ContextInner>> {
        self.open.borrow().upgrade().filter(|ctx| !ctx.is_torn_down())
    }

    pub(crate) fn start_request(&self) -> EmberResult<Request> {
        let runtime = self.runtime.borrow();
        let runtime = runtime.as_ref().ok_or(EmberError::EngineNotRunning)?;
        Request::new(runtime).map_err(EmberError::from_eval)
    }

    pub(crate) fn attach(&self, context: &Rc<ContextInner>) {
        *self.open.borrow_mut() = Rc::downgrade(context);
        self.contexts_opened.set(self.contexts_opened.get() + 1);
    }

    pub(crate) fn detach(&self, context: &ContextInner) {
        let mut open = self.open.borrow_mut();
        if std::ptr::eq(open.as_ptr(), context) {
            *open = Weak::new();
        }
    }

    /// Terminate after a fatal fault. The faulting context has already torn
    /// itself down.
    pub(crate) fn terminate(&self, reason: &str) {
        if self.state.get() == EngineState::Shutdown {
            return;
        }
        error!(reason, "engine fault, terminating engine");
        self.state.set(EngineState::ShuttingDown);
        if let Some(ctx) = self.open_context() {
            ctx.teardown();
        }
        self.stop();
    }

    fn shutdown(&self) -> EmberResult<()> {
        match self.state.get() {
            EngineState::Shutdown => return Ok(()),
            EngineState::Ready => {}
            _ => return Err(EmberError::EngineNotRunning),
        }
        if self.open_context().is_some() {
            return Err(EmberError::ContextStillOpen);
        }
        self.state.set(EngineState::ShuttingDown);
        self.stop();
        debug!(contexts = self.contexts_opened.get(), "engine shut down");
        Ok(())
    }

    fn stop(&self) {
        if let Some(runtime) = self.runtime.borrow_mut().take() {
            runtime.shutdown();
        }
        self.state.set(EngineState::Shutdown);
        let _ = CURRENT.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if std::ptr::eq(slot.as_ptr(), self) {
                *slot = Weak::new();
            }
        });
        record_state(EngineState::Shutdown);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if self.state.get() != EngineState::Shutdown {
            debug!("last engine reference dropped, shutting down");
            self.stop();
        }
    }
}

/// Scripting engine bound to the thread that started it.
///
/// Cloning yields another reference to the same engine. Engines are
/// `!Send`; use a [`WorkerPool`](crate::WorkerPool) to run scripts from
/// other threads.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl Engine {
    /// Start an engine with `config` on the calling thread.
    pub fn start(config: EngineConfig) -> EmberResult<Self> {
        Self::builder().config(config).start()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// State of the calling thread's engine slot.
    pub fn thread_state() -> EngineState {
        match current_engine() {
            Some(engine) => engine.state.get(),
            None => LAST_STATE.with(Cell::get),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.get()
    }

    /// Check if the engine is still running
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// True while a context of this engine has not been closed.
    pub fn has_open_context(&self) -> bool {
        self.inner.open_context().is_some()
    }

    /// Number of contexts opened so far.
    pub fn contexts_opened(&self) -> u64 {
        self.inner.contexts_opened.get()
    }

    /// Handle for interrupting scripts of this engine from any thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.inner.interrupt.clone()
    }

    /// Open a new execution context.
    ///
    /// Fails with `ContextAlreadyOpen` until the previous context is closed.
    pub fn new_context(&self) -> EmberResult<ExecutionContext> {
        self.inner.ensure_ready()?;
        if self.inner.open_context().is_some() {
            return Err(EmberError::ContextAlreadyOpen);
        }
        ExecutionContext::open(Rc::clone(&self.inner))
    }

    /// Shut the engine down. Fails with `ContextStillOpen` while a context
    /// is open; repeated calls are no-ops.
    pub fn shutdown(&self) -> EmberResult<()> {
        self.inner.shutdown()
    }

    /// Make a host function available to every context, including the one
    /// currently open.
    pub fn register(&self, function: HostFunction) -> EmberResult<()> {
        self.inner.ensure_ready()?;
        {
            let functions = self.inner.functions.borrow();
            let mut all: Vec<HostFunction> = functions.clone();
            all.push(function.clone());
            check_unique(&all)?;
        }
        if let Some(ctx) = self.inner.open_context() {
            ExecutionContext::from_inner(ctx).register(function.clone())?;
        }
        debug!(function = %function.name(), "host function registered");
        self.inner.functions.borrow_mut().push(function);
        Ok(())
    }

    /// Register an extension's functions and init script. Applies to
    /// contexts opened afterwards.
    pub fn register_extension(&self, ext: Extension) -> EmberResult<()> {
        self.inner.ensure_ready()?;
        {
            let functions = self.inner.functions.borrow();
            let mut all: Vec<HostFunction> = functions.clone();
            all.extend(ext.functions().iter().cloned());
            check_unique(&all)?;
        }
        debug!(
            extension = %ext.name(),
            functions = ext.functions().len(),
            "extension registered"
        );
        self.inner
            .functions
            .borrow_mut()
            .extend(ext.functions().iter().cloned());
        if let Some(script) = ext.script() {
            self.inner
                .scripts
                .borrow_mut()
                .push((ext.name().to_string(), script.to_string()));
        }
        Ok(())
    }

    /// Declare the engine class mirrored by `T` in contexts opened
    /// afterwards.
    pub fn register_class<T: EngineClass>(&self) -> EmberResult<()> {
        self.inner.ensure_ready()?;
        let template = ClassTemplate::of::<T>()?;
        debug!(class = %template.name, "class registered");
        self.inner.classes.borrow_mut().push(template);
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("open_context", &self.has_open_context())
            .field("contexts_opened", &self.contexts_opened())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Arity;
    use ember_core::HostValue;

    #[test]
    fn test_engine_builder_defaults() {
        let builder = EngineBuilder::default();
        assert!(builder.extensions.is_empty());
        assert!(builder.functions.is_empty());
        assert!(builder.sink.is_none());
        assert_eq!(builder.config, EngineConfig::default());
    }

    #[test]
    fn test_duplicate_names_rejected_at_start() {
        let f = || HostFunction::new("twice", Arity::Exact(1), |args| Ok(args[0].clone()));
        let err = Engine::builder()
            .function(f())
            .extension(Extension::new("dup").function(f()))
            .start()
            .unwrap_err();
        assert!(matches!(err, EmberError::Registration(_)));
        assert_ne!(Engine::thread_state(), EngineState::Ready);
    }

    #[test]
    fn test_drop_vacates_thread_slot() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        assert_eq!(Engine::thread_state(), EngineState::Ready);
        drop(engine);
        assert_eq!(Engine::thread_state(), EngineState::Shutdown);

        let engine = Engine::start(EngineConfig::default()).unwrap();
        let ctx = engine.new_context().unwrap();
        let (value, _) = ctx.execute("<?php return 1 + 1;").unwrap();
        assert_eq!(value, HostValue::Int(2));
    }

    #[test]
    fn test_clone_shares_engine() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        let other = engine.clone();
        let _ctx = engine.new_context().unwrap();
        assert!(other.has_open_context());
        assert!(matches!(other.new_context(), Err(EmberError::ContextAlreadyOpen)));
    }
}
