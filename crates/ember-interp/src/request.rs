//! Request lifecycle and the native interface used by the binding.
//!
//! A [`Request`] is the engine-side state behind one execution context:
//! globals, function and class tables, the object/resource/callable stores
//! and the output and warning buffers. Dropping or shutting down a request
//! breaks reference cycles between its values and releases them en masse.

use crate::ast::FunctionDecl;
use crate::builtins::BuiltinTable;
use crate::classes::{ClassEntry, NativeClass};
use crate::error::{AccessError, EvalError, EvalResult, NativeFault};
use crate::interpreter::Unwind;
use crate::loader::SharedSourceProvider;
use crate::runtime::{IniSettings, InterruptHandle, Runtime};
use crate::value::{
    separate_array, ArrayKey, ArrayRef, CallableKind, ObjectRef, ZArray, ZCallable, ZObject,
    ZResource, Zval,
};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Host function callable from scripts.
pub type NativeHandler = Rc<dyn Fn(&mut Request, &[Zval]) -> Result<Zval, NativeFault>>;

/// A function implemented by the host, installed with
/// [`Request::define_function`].
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub(crate) handler: NativeHandler,
}

impl NativeFunction {
    /// Variadic function accepting any number of arguments.
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&mut Request, &[Zval]) -> Result<Zval, NativeFault> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            min_args: 0,
            max_args: None,
            handler: Rc::new(handler),
        }
    }

    /// Restrict the accepted argument count; checked before the handler runs.
    pub fn arity(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) enum Function {
    User(Rc<FunctionDecl>),
    Native(Rc<NativeFunction>),
}

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningLevel {
    Warning,
    Notice,
    Deprecated,
    UserWarning,
    UserNotice,
    UserDeprecated,
}

impl WarningLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Warning | Self::UserWarning => "Warning",
            Self::Notice | Self::UserNotice => "Notice",
            Self::Deprecated | Self::UserDeprecated => "Deprecated",
        }
    }
}

/// Non-fatal diagnostic raised while a script ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: WarningLevel,
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in {} on line {}",
            self.level.label(),
            self.message,
            self.file,
            self.line
        )
    }
}

/// One activation record.
pub(crate) struct Frame {
    /// Name shown in stack traces.
    pub function: Rc<str>,
    /// Class scope for `self::` and `parent::`.
    pub class: Option<Rc<ClassEntry>>,
    /// Late static binding target for `static::`.
    pub static_class: Option<Rc<ClassEntry>>,
    pub this: Option<ObjectRef>,
    pub locals: FxHashMap<Rc<str>, Zval>,
    pub args: Vec<Zval>,
    pub file: Rc<str>,
    pub line: u32,
    /// Expression evaluation depth within this frame.
    pub nesting: usize,
}

impl Frame {
    pub(crate) fn new(function: Rc<str>, file: Rc<str>, line: u32) -> Self {
        Self {
            function,
            class: None,
            static_class: None,
            this: None,
            locals: FxHashMap::default(),
            args: Vec::new(),
            file,
            line,
            nesting: 0,
        }
    }
}

/// Counts reported by [`Request::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub objects_released: usize,
    pub arrays_cleared: usize,
    pub resources_closed: usize,
}

/// Per-context engine state.
pub struct Request {
    pub(crate) id: u64,
    pub(crate) ini: IniSettings,
    pub(crate) loader: Option<SharedSourceProvider>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) builtins: Rc<BuiltinTable>,
    pub(crate) functions: FxHashMap<Rc<str>, Function>,
    pub(crate) classes: FxHashMap<Rc<str>, Rc<ClassEntry>>,
    pub(crate) constants: IndexMap<Rc<str>, Zval>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) included: FxHashSet<String>,
    pub(crate) output: String,
    pub(crate) warnings: Vec<Warning>,
    pub(crate) steps: u64,
    objects: FxHashMap<u32, Weak<RefCell<ZObject>>>,
    resources: FxHashMap<u32, Weak<ZResource>>,
    callables: FxHashMap<u32, Weak<ZCallable>>,
    host_arrays: Vec<Weak<RefCell<ZArray>>>,
    next_object_id: u32,
    next_resource_id: u32,
    prune_at: usize,
}

const MAIN: &str = "{main}";

impl Request {
    /// Request startup: declares the built-in classes.
    pub fn new(runtime: &Runtime) -> EvalResult<Self> {
        let mut request = Self {
            id: runtime.next_request_id(),
            ini: runtime.ini.clone(),
            loader: runtime.loader.clone(),
            interrupt: runtime.interrupt.clone(),
            builtins: runtime.builtins.clone(),
            functions: FxHashMap::default(),
            classes: FxHashMap::default(),
            constants: IndexMap::new(),
            frames: vec![Frame::new(Rc::from(MAIN), Rc::from("[no file]"), 0)],
            included: FxHashSet::default(),
            output: String::new(),
            warnings: Vec::new(),
            steps: 0,
            objects: FxHashMap::default(),
            resources: FxHashMap::default(),
            callables: FxHashMap::default(),
            host_arrays: Vec::new(),
            next_object_id: 1,
            next_resource_id: 1,
            prune_at: 64,
        };

        for decl in runtime.prelude.iter() {
            request
                .declare_script_class(decl)
                .map_err(|unwind| request.finish(unwind))?;
        }
        debug!(request = request.id, "request started");
        Ok(request)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ini(&self) -> &IniSettings {
        &self.ini
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Compile and run `source` in the global scope. `file` names the
    /// script in errors and traces.
    pub fn eval(&mut self, source: &str, file: &str) -> EvalResult<Zval> {
        let program = crate::parser::parse(source, file).map_err(EvalError::Parse)?;
        self.enter(|req| req.run_main(&program, file))
    }

    /// Load `path` through the source provider and run it in the global
    /// scope.
    pub fn eval_file(&mut self, path: &str) -> EvalResult<Zval> {
        let loader = self
            .loader
            .clone()
            .ok_or_else(|| EvalError::fatal("no source provider configured"))?;
        let source = loader.fetch(path, None).map_err(|err| {
            EvalError::Parse(crate::error::ParseError {
                message: format!("Failed opening required '{path}': {err}"),
                file: path.to_string(),
                line: 0,
            })
        })?;
        self.included.insert(source.name.clone());
        self.eval(&source.text, &source.name)
    }

    /// Invoke a callable value (closure, function name, `[object, method]`).
    pub fn call(&mut self, callable: &Zval, args: &[Zval]) -> EvalResult<Zval> {
        let callable = callable.clone();
        let args = args.to_vec();
        self.enter(move |req| req.call_value(&callable, args))
    }

    /// Invoke a named function.
    pub fn call_function(&mut self, name: &str, args: &[Zval]) -> EvalResult<Zval> {
        let name: Rc<str> = Rc::from(name);
        let args = args.to_vec();
        self.enter(move |req| req.call_function_value(&name, args))
    }

    /// Call from inside a native function; failures propagate to the
    /// calling script.
    pub fn invoke(&mut self, callable: &Zval, args: Vec<Zval>) -> Result<Zval, NativeFault> {
        self.call_value(callable, args).map_err(NativeFault::from)
    }

    fn enter<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Unwind>) -> EvalResult<T> {
        let depth = self.frames.len();
        if depth == 1 {
            self.steps = 0;
        }
        let result = f(self);
        self.frames.truncate(depth.max(1));
        result.map_err(|unwind| self.finish(unwind))
    }

    pub fn set_global(&mut self, name: &str, value: Zval) {
        self.frames[0].locals.insert(Rc::from(name), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Zval> {
        self.frames[0].locals.get(name).cloned()
    }

    pub fn unset_global(&mut self, name: &str) -> Option<Zval> {
        self.frames[0].locals.remove(name)
    }

    /// Names of all global variables.
    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.frames[0].locals.keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    /// Install a host function. Fails when the name is already taken.
    pub fn define_function(&mut self, function: NativeFunction) -> Result<(), EvalError> {
        let lower: Rc<str> = Rc::from(function.name.to_ascii_lowercase());
        if self.functions.contains_key(&lower) || self.builtins.contains_key(&*lower) {
            return Err(EvalError::fatal(format!(
                "Cannot redeclare function {}()",
                function.name
            )));
        }
        debug!(request = self.id, function = %function.name, "native function defined");
        self.functions.insert(lower, Function::Native(Rc::new(function)));
        Ok(())
    }

    pub fn has_function(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.functions.contains_key(lower.as_str()) || self.builtins.contains_key(lower.as_str())
    }

    /// Callable value referring to the named function, if it exists.
    pub fn lookup_function(&mut self, name: &str) -> Option<Zval> {
        let lower = name.to_ascii_lowercase();
        let canonical: Rc<str> = match self.functions.get(lower.as_str()) {
            Some(Function::User(decl)) => decl.name.clone(),
            Some(Function::Native(native)) => Rc::from(native.name.as_str()),
            None => Rc::from(self.builtins.get(lower.as_str())?.name),
        };
        Some(Zval::Callable(self.alloc_callable(CallableKind::Named(canonical))))
    }

    /// Declare a host class.
    pub fn declare_class(&mut self, class: NativeClass) -> Result<(), EvalError> {
        let lower: Rc<str> = Rc::from(class.name.to_ascii_lowercase());
        if self.classes.contains_key(&lower) {
            return Err(EvalError::fatal(format!(
                "Cannot declare class {}, because the name is already in use",
                class.name
            )));
        }
        let parent = match &class.parent {
            Some(parent) => Some(self.find_class(parent).ok_or_else(|| {
                EvalError::fatal(format!("Class \"{parent}\" not found"))
            })?),
            None => None,
        };
        debug!(request = self.id, class = %class.name, "native class declared");
        self.classes
            .insert(lower, Rc::new(ClassEntry::from_native(&class, parent)));
        Ok(())
    }

    pub fn class_exists(&self, name: &str) -> bool {
        self.find_class(name).is_some()
    }

    pub(crate) fn find_class(&self, name: &str) -> Option<Rc<ClassEntry>> {
        self.classes.get(name.to_ascii_lowercase().as_str()).cloned()
    }

    /// True when `value` is an object of `class` or a subclass.
    pub fn instance_of(&self, value: &Zval, class: &str) -> bool {
        match value {
            Zval::Object(obj) => {
                let class_name = obj.borrow().class.clone();
                match self.find_class(&class_name) {
                    Some(entry) => entry.is_subclass_of(class),
                    None => class_name.eq_ignore_ascii_case(class),
                }
            }
            Zval::Callable(_) => class.eq_ignore_ascii_case("Closure"),
            _ => false,
        }
    }

    /// New empty array tracked for teardown.
    pub fn new_array(&mut self) -> Zval {
        let array: ArrayRef = Rc::new(RefCell::new(ZArray::new()));
        self.host_arrays.push(Rc::downgrade(&array));
        Zval::Array(array)
    }

    /// New object with the declared defaults of `class` and no constructor
    /// call. Undeclared classes produce a plain object of that name.
    pub fn new_object(&mut self, class: &str) -> Result<Zval, NativeFault> {
        match self.find_class(class) {
            Some(entry) => {
                let obj = self
                    .instantiate_defaults(&entry)
                    .map_err(NativeFault::from)?;
                Ok(Zval::Object(obj))
            }
            None => Ok(Zval::Object(self.alloc_object(Rc::from(class)))),
        }
    }

    /// New resource of `kind` carrying an optional host payload.
    pub fn new_resource(&mut self, kind: &str, payload: Option<Box<dyn Any>>) -> Zval {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        let resource = Rc::new(ZResource::new(id, kind, payload));
        self.resources.insert(id, Rc::downgrade(&resource));
        debug!(request = self.id, resource = id, kind, "resource created");
        Zval::Resource(resource)
    }

    /// Insert into the array held in `target`, separating it first.
    pub fn array_insert(&mut self, target: &mut Zval, key: ArrayKey, value: Zval) -> Result<(), AccessError> {
        let array = separate_array(target)
            .ok_or_else(|| AccessError::NotAnArray(target.value_type().name()))?;
        self.track_array(&array);
        debug!(request = self.id, key = %key, "array_insert");
        array.borrow_mut().insert(key, value);
        Ok(())
    }

    /// Append to the array held in `target`, returning the new key.
    pub fn array_push(&mut self, target: &mut Zval, value: Zval) -> Result<ArrayKey, AccessError> {
        let array = separate_array(target)
            .ok_or_else(|| AccessError::NotAnArray(target.value_type().name()))?;
        self.track_array(&array);
        let key = array
            .borrow_mut()
            .push(value)
            .map_err(|_| AccessError::NextIndexOccupied)?;
        debug!(request = self.id, key = %key, "array_push");
        Ok(key)
    }

    /// Set a property on an object in place.
    pub fn set_property(&mut self, object: &Zval, name: &str, value: Zval) -> Result<(), AccessError> {
        let Zval::Object(obj) = object else {
            return Err(AccessError::NotAnObject(object.value_type().name()));
        };
        debug!(request = self.id, property = name, "set_property");
        obj.borrow_mut().set(name, value);
        Ok(())
    }

    fn track_array(&mut self, array: &ArrayRef) {
        if !self.host_arrays.iter().any(|weak| std::ptr::eq(weak.as_ptr(), Rc::as_ptr(array))) {
            self.host_arrays.push(Rc::downgrade(array));
        }
    }

    pub fn lookup_object(&self, id: u32) -> Option<Zval> {
        self.objects.get(&id)?.upgrade().map(Zval::Object)
    }

    pub fn lookup_resource(&self, id: u32) -> Option<Zval> {
        self.resources.get(&id)?.upgrade().map(Zval::Resource)
    }

    pub fn lookup_callable(&self, id: u32) -> Option<Zval> {
        self.callables.get(&id)?.upgrade().map(Zval::Callable)
    }

    /// Number of live objects in the store.
    pub fn live_objects(&self) -> usize {
        self.objects.values().filter(|w| w.strong_count() > 0).count()
    }

    pub(crate) fn alloc_object(&mut self, class: Rc<str>) -> ObjectRef {
        let id = self.next_id();
        let obj = Rc::new(RefCell::new(ZObject {
            id,
            class,
            props: IndexMap::new(),
        }));
        self.objects.insert(id, Rc::downgrade(&obj));
        self.maybe_prune();
        obj
    }

    pub(crate) fn alloc_callable(&mut self, kind: CallableKind) -> Rc<ZCallable> {
        let id = self.next_id();
        let callable = Rc::new(ZCallable { id, kind });
        self.callables.insert(id, Rc::downgrade(&callable));
        self.maybe_prune();
        callable
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_object_id;
        self.next_object_id = self.next_object_id.wrapping_add(1).max(1);
        id
    }

    fn maybe_prune(&mut self) {
        let total = self.objects.len() + self.callables.len();
        if total < self.prune_at {
            return;
        }
        self.objects.retain(|_, weak| weak.strong_count() > 0);
        self.callables.retain(|_, weak| weak.strong_count() > 0);
        self.resources.retain(|_, weak| weak.strong_count() > 0);
        self.host_arrays.retain(|weak| weak.strong_count() > 0);
        self.prune_at = ((self.objects.len() + self.callables.len()) * 2).max(64);
    }

    /// Drain the output buffer.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Drain recorded warnings.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn push_warning(&mut self, level: WarningLevel, message: String) {
        let (file, line) = {
            let frame = self.current_frame();
            (frame.file.to_string(), frame.line)
        };
        let warning = Warning {
            level,
            message,
            file,
            line,
        };
        if self.ini.display_errors {
            self.output.push_str(&format!("\n{warning}\n"));
        }
        self.warnings.push(warning);
    }

    pub(crate) fn current_frame(&self) -> &Frame {
        // The global frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Request shutdown: drops globals, breaks cycles through objects and
    /// host-built arrays, and closes resources.
    pub fn shutdown(mut self) -> ShutdownReport {
        let report = self.teardown();
        debug!(
            request = self.id,
            objects = report.objects_released,
            arrays = report.arrays_cleared,
            resources = report.resources_closed,
            "request shut down"
        );
        report
    }

    fn teardown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        self.frames.truncate(1);
        self.frames[0].locals.clear();
        self.constants.clear();

        // Hold every live object first: releasing one object's props may
        // drop the last reference to another.
        let live: Vec<_> = self.objects.values().filter_map(Weak::upgrade).collect();
        for obj in &live {
            // Take the props out before dropping them so nested drops
            // never observe a borrowed object.
            let props = match obj.try_borrow_mut() {
                Ok(mut obj) => std::mem::take(&mut obj.props),
                Err(_) => continue,
            };
            drop(props);
            report.objects_released += 1;
        }
        drop(live);

        let live: Vec<_> = self.host_arrays.iter().filter_map(Weak::upgrade).collect();
        for array in &live {
            let entries = match array.try_borrow_mut() {
                Ok(mut array) => std::mem::take(&mut *array),
                Err(_) => continue,
            };
            drop(entries);
            report.arrays_cleared += 1;
        }
        drop(live);
        for weak in self.resources.values() {
            if let Some(resource) = weak.upgrade() {
                if resource.close() {
                    report.resources_closed += 1;
                }
            }
        }

        self.objects.clear();
        self.callables.clear();
        self.resources.clear();
        self.host_arrays.clear();
        self.functions.clear();
        self.classes.clear();
        report
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.objects.is_empty() || !self.host_arrays.is_empty() {
            self.teardown();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("globals", &self.frames[0].locals.len())
            .field("functions", &self.functions.len())
            .field("classes", &self.classes.len())
            .finish_non_exhaustive()
    }
}
