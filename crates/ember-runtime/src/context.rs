//! Execution contexts.
//!
//! An [`ExecutionContext`] is one request-scoped sandbox: its own globals,
//! functions, classes and object store, plus the [`HandleArena`] holding
//! every [`ValueHandle`] it issued. Closing it releases the engine request
//! and makes all of those handles stale at once.
//!
//! A context is either idle, running a script, or torn down. Anything that
//! needs the engine while a script runs (for example a host callback that
//! tries to execute in its own context) fails with `ContextBusy`.

use crate::bridge::{self, Arity, CallbackEnv, HostFunction, host_exception_class};
use crate::diagnostics::Diagnostics;
use crate::engine::EngineInner;
use crate::error::{EmberError, EmberResult, HostResult, ScriptFailure};
use ember_core::{
    ContextId, ConvertOptions, CoreError, EngineClass, FromHost, HandleArena, HostKey, HostValue,
    ValueHandle, typed,
};
use ember_interp::{ArrayKey, EvalResult, InterruptHandle, Request, Zval};
use indexmap::IndexMap;
use scopeguard::guard;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Default file name reported for inline sources.
const INLINE_FILE: &str = "main.php";

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Idle,
    Running,
    TornDown,
}

/// Outcome of running script code: the converted result and the
/// diagnostics it produced, or the failure with the partial diagnostics.
pub type ExecResult<T = HostValue> = Result<(T, Diagnostics), ScriptFailure>;

pub(crate) struct ContextInner {
    id: ContextId,
    engine: Rc<EngineInner>,
    state: Cell<ContextState>,
    request: RefCell<Option<Request>>,
    arena: Rc<HandleArena>,
    env: CallbackEnv,
    /// Host functions by lowercase name, for host-side argument checks.
    host_functions: RefCell<IndexMap<String, HostFunction>>,
}

impl ContextInner {
    pub(crate) fn is_torn_down(&self) -> bool {
        self.state.get() == ContextState::TornDown
    }

    /// Run `f` against the request with the context marked as running.
    fn run<T>(&self, f: impl FnOnce(&mut Request) -> EmberResult<T>) -> EmberResult<T> {
        match self.state.get() {
            ContextState::TornDown => return Err(EmberError::ContextClosed),
            ContextState::Running => return Err(EmberError::ContextBusy),
            ContextState::Idle => {}
        }
        self.engine.ensure_ready()?;

        self.state.set(ContextState::Running);
        let state = guard(&self.state, |state| {
            if state.get() == ContextState::Running {
                state.set(ContextState::Idle);
            }
        });
        let result = {
            let mut slot = self
                .request
                .try_borrow_mut()
                .map_err(|_| EmberError::ContextBusy)?;
            let request = slot.as_mut().ok_or(EmberError::ContextClosed)?;
            f(request)
        };
        drop(state);

        if let Err(EmberError::EngineFault(reason)) = &result {
            self.fault(reason);
        }
        result
    }

    /// Run script code, collecting diagnostics whether or not it succeeds.
    fn run_script(
        &self,
        f: impl FnOnce(&mut Request) -> EvalResult<Zval>,
    ) -> Result<(Zval, Diagnostics), ScriptFailure> {
        let (result, diagnostics) = self.run(|request| {
            let result = f(request);
            let diagnostics = Diagnostics {
                output: request.take_output(),
                warnings: request.take_warnings(),
            };
            Ok((result, diagnostics))
        })?;
        self.engine.sink.emit(self.id, &diagnostics);

        match result {
            Ok(value) => Ok((value, diagnostics)),
            Err(err) => {
                let err = EmberError::from_eval(err);
                if let EmberError::EngineFault(reason) = &err {
                    self.fault(reason);
                }
                Err(ScriptFailure::new(err, diagnostics))
            }
        }
    }

    /// Like `run_script`, with a fallible preparation step that converts
    /// arguments before the script is entered.
    fn run_script_with<P, F>(&self, prepare: P) -> Result<(Zval, Diagnostics), ScriptFailure>
    where
        P: FnOnce(&mut Request) -> EmberResult<F>,
        F: FnOnce(&mut Request) -> EvalResult<Zval>,
    {
        let mut prepared = None;
        let result = self.run_script(|request| match prepare(request) {
            Ok(call) => call(request),
            Err(err) => {
                prepared = Some(err);
                Ok(Zval::Null)
            }
        });
        match prepared {
            Some(err) => Err(ScriptFailure::new(
                err,
                result.map(|(_, d)| d).unwrap_or_default(),
            )),
            None => result,
        }
    }

    fn to_host(&self, value: &Zval, options: ConvertOptions) -> EmberResult<HostValue> {
        let converter = ember_core::Converter::new(options);
        Ok(converter.to_host(value, self.id)?)
    }

    fn issue(&self, value: Zval) -> EmberResult<ValueHandle> {
        Ok(ValueHandle::engine(&self.arena, value)?)
    }

    /// Engine value behind `handle`, which must belong to this context.
    /// Host handles are converted into the engine.
    fn resolve(&self, request: &mut Request, handle: &ValueHandle) -> EmberResult<Zval> {
        match handle.host_value() {
            Some(value) => Ok(self.env.converter.to_engine(value, request, self.id)?),
            None => Ok(handle.engine_value(self.id)?),
        }
    }

    fn install(&self, request: &mut Request, function: &HostFunction) -> EmberResult<()> {
        request
            .define_function(function.native(self.env))
            .map_err(|e| EmberError::Registration(e.to_string()))?;
        self.host_functions
            .borrow_mut()
            .insert(function.name().to_ascii_lowercase(), function.clone());
        Ok(())
    }

    /// Release the request and invalidate every handle.
    pub(crate) fn teardown(&self) {
        if self.is_torn_down() {
            return;
        }
        self.state.set(ContextState::TornDown);
        let handles = self.arena.close();
        let report = self
            .request
            .try_borrow_mut()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(Request::shutdown)
            .unwrap_or_default();
        self.engine.detach(self);
        debug!(
            context = %self.id,
            handles,
            objects = report.objects_released,
            arrays = report.arrays_cleared,
            resources = report.resources_closed,
            "context closed"
        );
    }

    fn fault(&self, reason: &str) {
        self.teardown();
        self.engine.terminate(reason);
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A sandbox for running scripts on an [`Engine`](crate::Engine).
///
/// `!Send`: contexts, like engines, stay on their thread.
///
/// ```compile_fail
/// use ember_runtime::{Engine, EngineConfig};
///
/// let engine = Engine::start(EngineConfig::default()).unwrap();
/// let ctx = engine.new_context().unwrap();
/// std::thread::spawn(move || {
///     let _ = ctx.execute("<?php return 1;"); // Error: ExecutionContext is !Send
/// });
/// ```
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

impl ExecutionContext {
    pub(crate) fn open(engine: Rc<EngineInner>) -> EmberResult<Self> {
        let request = engine.start_request()?;
        let id = ContextId::next();
        let inner = Rc::new(ContextInner {
            id,
            env: CallbackEnv {
                context: id,
                converter: engine.converter,
            },
            engine,
            state: Cell::new(ContextState::Idle),
            request: RefCell::new(Some(request)),
            arena: HandleArena::new(id),
            host_functions: RefCell::new(IndexMap::new()),
        });
        let ctx = Self { inner };

        // A failed setup drops `ctx`, which tears the request down.
        ctx.inner.run(|request| {
            request
                .declare_class(host_exception_class())
                .map_err(|e| EmberError::Registration(e.to_string()))?;
            for class in ctx.inner.engine.classes.borrow().iter() {
                class.declare(request, &ctx.inner.env)?;
            }
            for function in ctx.inner.engine.functions.borrow().iter() {
                ctx.inner.install(request, function)?;
            }
            Ok(())
        })?;
        let scripts = ctx.inner.engine.scripts.borrow().clone();
        for (extension, source) in scripts {
            let file = format!("[{extension}]");
            ctx.inner
                .run_script(|request| request.eval(&source, &file))
                .map_err(ScriptFailure::into_error)?;
        }

        ctx.inner.engine.attach(&ctx.inner);
        debug!(context = %id, "context opened");
        Ok(ctx)
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn state(&self) -> ContextState {
        self.inner.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_torn_down()
    }

    /// Run `source` and convert its return value.
    pub fn execute(&self, source: &str) -> ExecResult {
        self.execute_named(source, INLINE_FILE)
    }

    /// Run `source`, reporting `file` in errors and traces.
    pub fn execute_named(&self, source: &str, file: &str) -> ExecResult {
        let (value, diagnostics) = self.inner.run_script(|request| request.eval(source, file))?;
        self.finish(&value, diagnostics)
    }

    /// Load `path` through the engine's source provider and run it.
    pub fn execute_file(&self, path: &str) -> ExecResult {
        if self.inner.engine.loader.resolve(path, None).is_none() {
            return Err(EmberError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("script not found: {path}"),
            ))
            .into());
        }
        let (value, diagnostics) = self.inner.run_script(|request| request.eval_file(path))?;
        self.finish(&value, diagnostics)
    }

    /// Run `source` and keep the result engine-owned.
    pub fn execute_handle(&self, source: &str) -> ExecResult<ValueHandle> {
        let (value, diagnostics) = self
            .inner
            .run_script(|request| request.eval(source, INLINE_FILE))?;
        match self.inner.issue(value) {
            Ok(handle) => Ok((handle, diagnostics)),
            Err(err) => Err(ScriptFailure::new(err, diagnostics)),
        }
    }

    fn finish(&self, value: &Zval, diagnostics: Diagnostics) -> ExecResult {
        match self.inner.to_host(value, self.inner.env.converter.options()) {
            Ok(host) => Ok((host, diagnostics)),
            Err(err) => Err(ScriptFailure::new(err, diagnostics)),
        }
    }

    /// Install `value` as the global variable `$name`.
    pub fn bind_global(&self, name: &str, value: impl Into<HostValue>) -> EmberResult<()> {
        let value = value.into();
        let name = name.trim_start_matches('$');
        self.inner.run(|request| {
            let zval = self.inner.env.converter.to_engine(&value, request, self.inner.id)?;
            request.set_global(name, zval);
            Ok(())
        })
    }

    /// Install the value behind `handle` as the global `$name`, without a
    /// copy through the host.
    pub fn bind_handle(&self, name: &str, handle: &ValueHandle) -> EmberResult<()> {
        let name = name.trim_start_matches('$');
        self.check_handle(handle)?;
        self.inner.run(|request| {
            let zval = self.inner.resolve(request, handle)?;
            request.set_global(name, zval);
            Ok(())
        })
    }

    /// Current value of the global `$name`.
    pub fn global(&self, name: &str) -> EmberResult<Option<HostValue>> {
        let name = name.trim_start_matches('$');
        let value = self.inner.run(|request| Ok(request.get_global(name)))?;
        value
            .map(|zval| self.inner.to_host(&zval, self.inner.env.converter.options()))
            .transpose()
    }

    /// Handle to the current value of the global `$name`.
    pub fn global_handle(&self, name: &str) -> EmberResult<Option<ValueHandle>> {
        let name = name.trim_start_matches('$');
        let value = self.inner.run(|request| Ok(request.get_global(name)))?;
        value.map(|zval| self.inner.issue(zval)).transpose()
    }

    /// Remove the global `$name`, returning whether it existed.
    pub fn unset_global(&self, name: &str) -> EmberResult<bool> {
        let name = name.trim_start_matches('$');
        self.inner
            .run(|request| Ok(request.unset_global(name).is_some()))
    }

    /// Copy a host value into the engine.
    pub fn to_engine(&self, value: &HostValue) -> EmberResult<ValueHandle> {
        let zval = self.inner.run(|request| {
            Ok(self.inner.env.converter.to_engine(value, request, self.inner.id)?)
        })?;
        self.inner.issue(zval)
    }

    /// Convert a handle of this context to a host value.
    pub fn to_host(&self, handle: &ValueHandle) -> EmberResult<HostValue> {
        if let Some(value) = handle.host_value() {
            return Ok(value.clone());
        }
        let zval = handle.engine_value(self.inner.id)?;
        self.ensure_open()?;
        self.inner.to_host(&zval, self.inner.env.converter.options())
    }

    /// Tree-shaped JSON for a handle; cycles fail with `CyclicValue`.
    pub fn to_json(&self, handle: &ValueHandle) -> EmberResult<serde_json::Value> {
        let options = ConvertOptions {
            max_depth: self.inner.env.converter.options().max_depth,
            ..ConvertOptions::json()
        };
        let host = match handle.host_value() {
            Some(value) => value.clone(),
            None => {
                let zval = handle.engine_value(self.inner.id)?;
                self.ensure_open()?;
                self.inner.to_host(&zval, options)?
            }
        };
        Ok(host.to_json()?)
    }

    /// Extract a Rust value from a handle.
    pub fn extract<T: FromHost>(&self, handle: &ValueHandle) -> EmberResult<T> {
        Ok(T::from_host(&self.to_host(handle)?)?)
    }

    /// Extract an instance of a registered engine class.
    pub fn extract_class<T: EngineClass>(&self, handle: &ValueHandle) -> EmberResult<T> {
        Ok(typed::extract_class(&self.to_host(handle)?)?)
    }

    /// Create an engine object of class `T::CLASS` from `value`.
    pub fn instantiate<T: EngineClass>(&self, value: &T) -> EmberResult<ValueHandle> {
        let object = typed::class_object(value)?;
        self.to_engine(&HostValue::Object(object))
    }

    /// Callable handle for the named function.
    pub fn function(&self, name: &str) -> EmberResult<ValueHandle> {
        let callable = self.inner.run(|request| {
            request
                .lookup_function(name)
                .ok_or_else(|| EmberError::UnknownFunction(name.to_string()))
        })?;
        self.inner.issue(callable)
    }

    /// Call a callable handle (closure, named function, `[object, method]`)
    /// with host arguments.
    pub fn call(&self, callable: &ValueHandle, args: &[HostValue]) -> ExecResult {
        self.check_handle(callable)?;
        let (value, diagnostics) = self.inner.run_script_with(|request| {
            let callable = self.inner.resolve(request, callable)?;
            let args = self.convert_args(request, args)?;
            Ok(move |request: &mut Request| request.call(&callable, &args))
        })?;
        self.finish(&value, diagnostics)
    }

    /// Call a function by name. Arguments for host functions are checked
    /// before the engine is entered.
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> ExecResult {
        let host = self
            .inner
            .host_functions
            .borrow()
            .get(&name.to_ascii_lowercase())
            .cloned();
        if let Some(function) = host {
            function
                .check_args(args)
                .map_err(EmberError::ArgumentMismatch)?;
        }
        let (value, diagnostics) = self.inner.run_script_with(|request| {
            if !request.has_function(name) {
                return Err(EmberError::UnknownFunction(name.to_string()));
            }
            let args = self.convert_args(request, args)?;
            Ok(move |request: &mut Request| request.call_function(name, &args))
        })?;
        self.finish(&value, diagnostics)
    }

    fn convert_args(&self, request: &mut Request, args: &[HostValue]) -> EmberResult<Vec<Zval>> {
        args.iter()
            .map(|arg| {
                Ok(self
                    .inner
                    .env
                    .converter
                    .to_engine(arg, request, self.inner.id)?)
            })
            .collect()
    }

    /// Insert into an array, returning a handle to the updated array.
    ///
    /// Arrays are values: the handle passed in keeps the old contents.
    pub fn array_insert(
        &self,
        target: &ValueHandle,
        key: impl Into<HostKey>,
        value: &HostValue,
    ) -> EmberResult<ValueHandle> {
        let key = match key.into() {
            HostKey::Int(i) => ArrayKey::Int(i),
            HostKey::Str(s) => ArrayKey::from_str_key(&s),
        };
        self.check_handle(target)?;
        let updated = self.inner.run(|request| {
            let mut array = self.inner.resolve(request, target)?;
            let member = self.inner.env.converter.to_engine(value, request, self.inner.id)?;
            request
                .array_insert(&mut array, key, member)
                .map_err(CoreError::from)?;
            Ok(array)
        })?;
        self.inner.issue(updated)
    }

    /// Append to an array, returning the updated array and the new key.
    pub fn array_push(
        &self,
        target: &ValueHandle,
        value: &HostValue,
    ) -> EmberResult<(ValueHandle, HostKey)> {
        self.check_handle(target)?;
        let (updated, key) = self.inner.run(|request| {
            let mut array = self.inner.resolve(request, target)?;
            let member = self.inner.env.converter.to_engine(value, request, self.inner.id)?;
            let key = request
                .array_push(&mut array, member)
                .map_err(CoreError::from)?;
            Ok((array, key))
        })?;
        let key = match key {
            ArrayKey::Int(i) => HostKey::Int(i),
            ArrayKey::Str(s) => HostKey::Str(s.to_string()),
        };
        Ok((self.inner.issue(updated)?, key))
    }

    /// Set a property on an object in place. Objects are shared, so every
    /// holder of the object observes the change.
    pub fn set_property(&self, object: &ValueHandle, name: &str, value: &HostValue) -> EmberResult<()> {
        self.check_handle(object)?;
        self.inner.run(|request| {
            let target = self.inner.resolve(request, object)?;
            let member = self.inner.env.converter.to_engine(value, request, self.inner.id)?;
            request
                .set_property(&target, name, member)
                .map_err(CoreError::from)?;
            Ok(())
        })
    }

    /// Create an engine resource of `kind` carrying `payload`.
    pub fn create_resource<T: Any>(&self, kind: &str, payload: T) -> EmberResult<ValueHandle> {
        let resource = self
            .inner
            .run(|request| Ok(request.new_resource(kind, Some(Box::new(payload)))))?;
        self.inner.issue(resource)
    }

    /// Borrow the payload of a resource created by this context.
    pub fn with_resource<T: Any, R>(
        &self,
        handle: &ValueHandle,
        f: impl FnOnce(&T) -> R,
    ) -> EmberResult<R> {
        let value = handle.engine_value(self.inner.id)?;
        self.ensure_open()?;
        let Zval::Resource(resource) = &value else {
            return Err(CoreError::type_mismatch("resource", value.type_name()).into());
        };
        if !resource.is_open() {
            return Err(CoreError::type_mismatch("open resource", "closed resource").into());
        }
        resource.with_payload(f).ok_or_else(|| {
            CoreError::type_mismatch(
                format!("resource payload of type {}", std::any::type_name::<T>()),
                format!("{} resource", resource.kind),
            )
            .into()
        })
    }

    /// Install a host function in this context only.
    pub fn register(&self, function: HostFunction) -> EmberResult<()> {
        self.inner
            .run(|request| self.inner.install(request, &function))?;
        debug!(context = %self.inner.id, function = %function.name(), "host function registered");
        Ok(())
    }

    /// Install a context-local function whose arguments arrive as borrowed
    /// handles, valid only until the function returns.
    pub fn register_borrowed<F>(&self, name: &str, arity: Arity, f: F) -> EmberResult<()>
    where
        F: Fn(&[ValueHandle]) -> HostResult + 'static,
    {
        let native = bridge::borrowed_native(
            name,
            arity,
            Rc::clone(&self.inner.arena),
            self.inner.env,
            Rc::new(f),
        );
        self.inner.run(|request| {
            request
                .define_function(native)
                .map_err(|e| EmberError::Registration(e.to_string()))
        })?;
        debug!(context = %self.inner.id, function = name, "borrowed host function registered");
        Ok(())
    }

    /// A non-owning reference, e.g. for use inside callbacks.
    pub fn weak(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.inner.engine.interrupt.clone()
    }

    /// Number of handles currently issued by this context.
    pub fn live_handles(&self) -> usize {
        self.inner.arena.live()
    }

    /// Tear the context down, invalidating all of its handles. Idempotent;
    /// fails with `ContextBusy` while a script is running.
    pub fn close(&self) -> EmberResult<()> {
        match self.inner.state.get() {
            ContextState::TornDown => Ok(()),
            ContextState::Running => Err(EmberError::ContextBusy),
            ContextState::Idle => {
                self.inner.teardown();
                Ok(())
            }
        }
    }

    /// Engine handles of a torn-down context report `StaleHandle` ahead of
    /// any lifecycle error.
    fn check_handle(&self, handle: &ValueHandle) -> EmberResult<()> {
        if handle.host_value().is_none() {
            handle.engine_value(self.inner.id)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> EmberResult<()> {
        if self.inner.is_torn_down() {
            return Err(EmberError::ContextClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("live_handles", &self.inner.arena.live())
            .finish()
    }
}

/// Non-owning reference to an [`ExecutionContext`].
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    /// The context, unless it was dropped.
    pub fn upgrade(&self) -> Option<ExecutionContext> {
        self.inner.upgrade().map(ExecutionContext::from_inner)
    }

    /// True once the context is torn down or dropped.
    pub fn is_closed(&self) -> bool {
        self.inner
            .upgrade()
            .is_none_or(|inner| inner.is_torn_down())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;

    #[test]
    fn test_state_transitions() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        let ctx = engine.new_context().unwrap();
        assert_eq!(ctx.state(), ContextState::Idle);

        let (value, _) = ctx.execute("<?php return 'done';").unwrap();
        assert_eq!(value, HostValue::from("done"));
        assert_eq!(ctx.state(), ContextState::Idle);

        ctx.close().unwrap();
        assert_eq!(ctx.state(), ContextState::TornDown);
        ctx.close().unwrap();
        let err = ctx.execute("<?php return 1;").unwrap_err();
        assert!(matches!(err.error, EmberError::ContextClosed));
    }

    #[test]
    fn test_script_error_returns_to_idle() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        let ctx = engine.new_context().unwrap();
        let failure = ctx
            .execute("<?php echo 'partial'; throw new InvalidArgumentException('bad input');")
            .unwrap_err();
        assert_eq!(failure.diagnostics.output, "partial");
        assert_eq!(failure.error.kind(), Some("InvalidArgumentException"));
        assert_eq!(ctx.state(), ContextState::Idle);
        assert!(ctx.execute("<?php return 1;").is_ok());
    }

    #[test]
    fn test_run_script_with_reports_preparation_errors() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        let ctx = engine.new_context().unwrap();
        let failure = ctx.call_function("no_such_function", &[]).unwrap_err();
        assert!(matches!(failure.error, EmberError::UnknownFunction(ref n) if n == "no_such_function"));
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_weak_context() {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        let ctx = engine.new_context().unwrap();
        let weak = ctx.weak();
        assert!(!weak.is_closed());
        assert_eq!(weak.upgrade().map(|c| c.id()), Some(ctx.id()));
        drop(ctx);
        assert!(weak.is_closed());
        assert!(weak.upgrade().is_none());
        assert!(!engine.has_open_context());
    }
}
