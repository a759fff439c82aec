//! Host functions callable from scripts.
//!
//! A [`HostFunction`] is installed into a context as a native engine
//! function. Each call converts the script's arguments to [`HostValue`]s,
//! checks arity and declared parameter types, runs the host closure and
//! converts the result back. A failing closure becomes a `HostException`
//! inside the script, carrying the error message and its kind tag.
//!
//! # Example
//!
//! ```
//! use ember_runtime::{Arity, Engine, HostFunction, HostValue};
//!
//! let engine = Engine::start(Default::default()).unwrap();
//! engine
//!     .register(HostFunction::new("double", Arity::Exact(1), |args| {
//!         Ok(HostValue::Int(args[0].as_i64().unwrap_or(0) * 2))
//!     }))
//!     .unwrap();
//!
//! let ctx = engine.new_context().unwrap();
//! let (value, _) = ctx.execute("<?php return double(21);").unwrap();
//! assert_eq!(value, HostValue::Int(42));
//! ctx.close().unwrap();
//! ```

use crate::error::{EmberError, EmberResult, HOST_EXCEPTION, HostError, HostResult};
use ember_core::{
    BorrowScope, ContextId, Converter, CoreResult, EngineClass, HandleArena, HostValue,
    ValueHandle, typed,
};
use ember_interp::{EvalError, NativeClass, NativeFault, NativeFunction, Request, Zval};
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// Accepted argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive bounds.
    Range(usize, usize),
}

impl Arity {
    /// Minimum and optional maximum.
    pub fn bounds(self) -> (usize, Option<usize>) {
        match self {
            Self::Exact(n) => (n, Some(n)),
            Self::AtLeast(n) => (n, None),
            Self::Range(min, max) => (min, Some(max.max(min))),
        }
    }

    pub fn accepts(self, count: usize) -> bool {
        let (min, max) = self.bounds();
        count >= min && max.is_none_or(|max| count <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        match *self {
            Self::Exact(n) => write!(f, "exactly {n} argument{}", plural(n)),
            Self::AtLeast(n) => write!(f, "at least {n} argument{}", plural(n)),
            Self::Range(min, max) => write!(f, "between {min} and {max} arguments"),
        }
    }
}

/// Declared type of a host function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    /// Int or float.
    Number,
    String,
    /// Any array, whether converted as a map or a list.
    Array,
    Object,
    Callable,
    Resource,
    Nullable(Box<ParamType>),
}

impl ParamType {
    pub fn nullable(self) -> Self {
        match self {
            Self::Nullable(_) | Self::Any => self,
            other => Self::Nullable(Box::new(other)),
        }
    }

    pub fn accepts(&self, value: &HostValue) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Nullable(_), HostValue::Null) => true,
            (Self::Nullable(inner), other) => inner.accepts(other),
            (Self::Bool, HostValue::Bool(_)) => true,
            (Self::Int, HostValue::Int(_)) => true,
            (Self::Float, HostValue::Float(_)) => true,
            (Self::Number, HostValue::Int(_) | HostValue::Float(_)) => true,
            (Self::String, HostValue::String(_)) => true,
            (Self::Array, HostValue::List(_) | HostValue::Map(_) | HostValue::BackRef(_)) => true,
            (Self::Object, HostValue::Object(_)) => true,
            (Self::Callable, HostValue::Callable(_)) => true,
            (Self::Resource, HostValue::Resource(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("mixed"),
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Number => f.write_str("int|float"),
            Self::String => f.write_str("string"),
            Self::Array => f.write_str("array"),
            Self::Object => f.write_str("object"),
            Self::Callable => f.write_str("callable"),
            Self::Resource => f.write_str("resource"),
            Self::Nullable(inner) => write!(f, "?{inner}"),
        }
    }
}

/// Host closure behind a [`HostFunction`].
pub type HostHandler = Arc<dyn Fn(&mut HostCall<'_>, &[HostValue]) -> HostResult + Send + Sync>;

/// A host function exposed to scripts under a fixed name.
///
/// Cloning is cheap. The closure must be `Send + Sync` so one definition
/// can be installed in every engine of a worker pool.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    arity: Arity,
    params: Vec<ParamType>,
    handler: HostHandler,
}

impl HostFunction {
    /// Function receiving its converted arguments.
    pub fn new<F>(name: impl Into<String>, arity: Arity, f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult + Send + Sync + 'static,
    {
        Self::with_call(name, arity, move |_call, args| f(args))
    }

    /// Function that can also call back into the script through
    /// [`HostCall`].
    pub fn with_call<F>(name: impl Into<String>, arity: Arity, f: F) -> Self
    where
        F: Fn(&mut HostCall<'_>, &[HostValue]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            params: Vec::new(),
            handler: Arc::new(f),
        }
    }

    /// Declare parameter types, checked positionally before the call.
    /// Arguments beyond the declared list are unchecked.
    pub fn params(mut self, params: impl IntoIterator<Item = ParamType>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn param_types(&self) -> &[ParamType] {
        &self.params
    }

    /// Validate arguments the way a script call would.
    pub fn check_args(&self, args: &[HostValue]) -> Result<(), String> {
        if !self.arity.accepts(args.len()) {
            return Err(format!(
                "{}() expects {}, {} given",
                self.name,
                self.arity,
                args.len()
            ));
        }
        self.check_types(args)
    }

    fn check_types(&self, args: &[HostValue]) -> Result<(), String> {
        for (index, (param, arg)) in self.params.iter().zip(args).enumerate() {
            if !param.accepts(arg) {
                return Err(format!(
                    "{}(): Argument #{} must be of type {}, {} given",
                    self.name,
                    index + 1,
                    param,
                    arg.type_name()
                ));
            }
        }
        Ok(())
    }

    /// Native engine function dispatching to this host function.
    pub(crate) fn native(&self, env: CallbackEnv) -> NativeFunction {
        let (min, max) = self.arity.bounds();
        let function = self.clone();
        NativeFunction::new(self.name.clone(), move |request, args| {
            function.dispatch(request, args, &env)
        })
        .arity(min, max)
    }

    fn dispatch(
        &self,
        request: &mut Request,
        args: &[Zval],
        env: &CallbackEnv,
    ) -> Result<Zval, NativeFault> {
        trace!(function = %self.name, args = args.len(), "host call");
        let host_args = args
            .iter()
            .map(|arg| env.converter.to_host(arg, env.context))
            .collect::<CoreResult<Vec<_>>>()
            .map_err(|e| NativeFault::throw("Error", format!("{}(): {e}", self.name)))?;
        self.check_types(&host_args).map_err(NativeFault::type_error)?;

        let mut call = HostCall::new(request, env, &self.name);
        let result = (self.handler)(&mut call, &host_args);
        let HostCall { abort, rethrow, .. } = call;
        if let Some(err) = abort {
            return Err(NativeFault::Abort(err));
        }
        match result {
            Ok(value) => env
                .converter
                .to_engine(&value, request, env.context)
                .map_err(|e| NativeFault::throw("Error", format!("{}(): {e}", self.name))),
            Err(err) => match rethrow {
                // The closure passed a script exception through unchanged.
                Some((exception, raised)) if raised == err => Err(NativeFault::Rethrow(exception)),
                _ => Err(host_exception(&self.name, err)),
            },
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn host_exception(function: &str, err: HostError) -> NativeFault {
    debug!(function, kind = %err.kind, message = %err.message, "host function failed");
    NativeFault::Throw {
        class: HOST_EXCEPTION.to_string(),
        message: err.message,
        props: vec![("kind".to_string(), Zval::string(&err.kind))],
    }
}

/// Declaration of the class scripts see for host failures.
pub(crate) fn host_exception_class() -> NativeClass {
    NativeClass::new(HOST_EXCEPTION)
        .extends("RuntimeException")
        .prop("kind", Zval::string(""))
}

/// What a native function needs to convert values for its context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallbackEnv {
    pub context: ContextId,
    pub converter: Converter,
}

/// Access to the running script from inside a host function.
pub struct HostCall<'a> {
    request: &'a mut Request,
    env: &'a CallbackEnv,
    function: &'a str,
    rethrow: Option<(Zval, HostError)>,
    abort: Option<EvalError>,
}

impl<'a> HostCall<'a> {
    fn new(request: &'a mut Request, env: &'a CallbackEnv, function: &'a str) -> Self {
        Self {
            request,
            env,
            function,
            rethrow: None,
            abort: None,
        }
    }

    /// Context the script runs in.
    pub fn context_id(&self) -> ContextId {
        self.env.context
    }

    /// Name of the host function being called.
    pub fn function(&self) -> &str {
        self.function
    }

    /// Call a script callable (closure, function name or `[object, method]`)
    /// with host arguments.
    ///
    /// An exception thrown by the callable comes back as a [`HostError`]
    /// whose kind is the exception class; returning that same error from the
    /// host function rethrows the original exception. Interrupts and step
    /// limits unwind the whole script regardless of what the host function
    /// returns.
    pub fn invoke(&mut self, callable: &HostValue, args: &[HostValue]) -> HostResult {
        if self.abort.is_some() {
            return Err(HostError::new("Aborted", "script execution is unwinding"));
        }
        let callable = self.to_engine(callable)?;
        let args = args
            .iter()
            .map(|arg| self.to_engine(arg))
            .collect::<HostResult<Vec<_>>>()?;
        match self.request.invoke(&callable, args) {
            Ok(value) => Ok(self.env.converter.to_host(&value, self.env.context)?),
            Err(NativeFault::Rethrow(exception)) => {
                let err = describe_exception(&exception);
                self.rethrow = Some((exception, err.clone()));
                Err(err)
            }
            Err(NativeFault::Abort(err)) => {
                let host = HostError::new("Aborted", err.to_string());
                self.abort = Some(err);
                Err(host)
            }
            Err(NativeFault::Fatal(message)) => {
                let host = HostError::new("Aborted", message.clone());
                self.abort = Some(EvalError::Fatal(message));
                Err(host)
            }
            Err(NativeFault::Throw { class, message, .. }) => Err(HostError::new(class, message)),
        }
    }

    /// Report an unrecoverable failure. The script unwinds without running
    /// catch blocks, the context is torn down and the engine terminates;
    /// later calls fail with `EngineNotRunning`.
    pub fn fault(&mut self, message: impl Into<String>) -> HostError {
        let message = message.into();
        self.abort = Some(EvalError::Fatal(message.clone()));
        HostError::new("EngineFault", message)
    }

    /// True when a named function exists in the context.
    pub fn has_function(&self, name: &str) -> bool {
        self.request.has_function(name)
    }

    fn to_engine(&mut self, value: &HostValue) -> HostResult<Zval> {
        Ok(self
            .env
            .converter
            .to_engine(value, self.request, self.env.context)?)
    }
}

fn describe_exception(exception: &Zval) -> HostError {
    match exception.as_object() {
        Some(obj) => {
            let obj = obj.borrow();
            let message = obj.get("message").and_then(Zval::as_str).unwrap_or_default();
            HostError::new(obj.class.to_string(), message)
        }
        None => HostError::msg(format!("uncaught {}", exception.type_name())),
    }
}

/// Handler of a context-local function receiving borrowed handles.
pub(crate) type BorrowedHandler = Rc<dyn Fn(&[ValueHandle]) -> HostResult>;

/// Native function lending its arguments as borrowed handles that go
/// stale when the call returns.
pub(crate) fn borrowed_native(
    name: &str,
    arity: Arity,
    arena: Rc<HandleArena>,
    env: CallbackEnv,
    handler: BorrowedHandler,
) -> NativeFunction {
    let (min, max) = arity.bounds();
    let function = name.to_string();
    NativeFunction::new(name, move |request, args| {
        let result = {
            let scope = BorrowScope::new(&arena);
            let handles = args
                .iter()
                .map(|arg| scope.borrow(arg.clone()))
                .collect::<CoreResult<Vec<_>>>()
                .map_err(|e| NativeFault::Fatal(e.to_string()))?;
            handler(&handles)
        };
        match result {
            Ok(value) => env
                .converter
                .to_engine(&value, request, env.context)
                .map_err(|e| NativeFault::throw("Error", format!("{function}(): {e}"))),
            Err(err) => Err(host_exception(&function, err)),
        }
    })
    .arity(min, max)
}

/// A named group of host functions plus an optional script run in every
/// new context after the functions are installed.
#[derive(Clone, Debug)]
pub struct Extension {
    name: String,
    functions: Vec<HostFunction>,
    script: Option<String>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            script: None,
        }
    }

    /// Get the name of this extension
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_functions(mut self, functions: Vec<HostFunction>) -> Self {
        self.functions = functions;
        self
    }

    pub fn function(mut self, function: HostFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Script source (with `<?php` tag) executed in each new context.
    pub fn with_script(mut self, source: impl Into<String>) -> Self {
        self.script = Some(source.into());
        self
    }

    pub fn functions(&self) -> &[HostFunction] {
        &self.functions
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }
}

/// Engine class declared from a Rust type, instantiated per context.
#[derive(Debug, Clone)]
pub(crate) struct ClassTemplate {
    pub name: String,
    pub props: IndexMap<String, HostValue>,
}

impl ClassTemplate {
    pub fn of<T: EngineClass>() -> CoreResult<Self> {
        let object = typed::class_object(&T::default())?;
        Ok(Self {
            name: object.class,
            props: object.properties,
        })
    }

    pub fn declare(&self, request: &mut Request, env: &CallbackEnv) -> EmberResult<()> {
        let mut class = NativeClass::new(self.name.clone());
        for (name, default) in &self.props {
            let value = env.converter.to_engine(default, request, env.context)?;
            class = class.prop(name.clone(), value);
        }
        request
            .declare_class(class)
            .map_err(|e| EmberError::Registration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HostCallable, HostObject};

    #[test]
    fn test_arity_bounds() {
        assert!(Arity::Exact(1).accepts(1));
        assert!(!Arity::Exact(1).accepts(2));
        assert!(Arity::AtLeast(1).accepts(9));
        assert!(!Arity::AtLeast(1).accepts(0));
        assert!(Arity::Range(1, 3).accepts(3));
        assert!(!Arity::Range(1, 3).accepts(4));
        assert_eq!(Arity::Range(2, 1).bounds(), (2, Some(2)));
        assert_eq!(Arity::Exact(1).to_string(), "exactly 1 argument");
        assert_eq!(Arity::AtLeast(2).to_string(), "at least 2 arguments");
    }

    #[test]
    fn test_param_types() {
        assert!(ParamType::Number.accepts(&HostValue::Float(1.5)));
        assert!(!ParamType::Int.accepts(&HostValue::Float(1.0)));
        assert!(ParamType::Array.accepts(&HostValue::list([1i64])));
        assert!(ParamType::Object.accepts(&HostValue::Object(HostObject::new("stdClass"))));
        assert!(ParamType::Callable.accepts(&HostValue::Callable(HostCallable::named("strlen"))));

        let maybe_string = ParamType::String.nullable();
        assert!(maybe_string.accepts(&HostValue::Null));
        assert!(maybe_string.accepts(&HostValue::from("x")));
        assert!(!maybe_string.accepts(&HostValue::Int(1)));
        assert_eq!(maybe_string.to_string(), "?string");
        assert_eq!(ParamType::Any.nullable(), ParamType::Any);
    }

    #[test]
    fn test_check_args() {
        let f = HostFunction::new("scale", Arity::Range(1, 2), |args| Ok(args[0].clone()))
            .params([ParamType::Number, ParamType::Int]);
        assert!(f.check_args(&[HostValue::Float(2.0)]).is_ok());
        assert_eq!(
            f.check_args(&[]).unwrap_err(),
            "scale() expects between 1 and 2 arguments, 0 given"
        );
        assert_eq!(
            f.check_args(&[HostValue::Int(1), HostValue::from("two")])
                .unwrap_err(),
            "scale(): Argument #2 must be of type int, string given"
        );
    }

    #[test]
    fn test_extension_builder() {
        let ext = Extension::new("greetings")
            .function(HostFunction::new("hello", Arity::Exact(0), |_| {
                Ok(HostValue::from("hello"))
            }))
            .with_script("<?php function greet($n) { return hello() . ' ' . $n; }");
        assert_eq!(ext.name(), "greetings");
        assert_eq!(ext.functions().len(), 1);
        assert!(ext.script().is_some_and(|s| s.contains("greet")));
    }

    #[test]
    fn test_host_function_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HostFunction>();
        assert_send_sync::<Extension>();
    }
}
