//! Function, method and callable invocation.

use crate::ast::{Expr, FunctionDecl, Param, TypeHint};
use crate::builtins::{Args, Builtin};
use crate::classes::{ClassEntry, Method};
use crate::interpreter::{Exec, Flow};
use crate::ops::{self, Num};
use crate::parser::is_lvalue;
use crate::request::{Frame, Function, NativeFunction, Request};
use crate::value::{CallableKind, ObjectRef, ZArray, Zval};
use std::rc::Rc;

/// Scope a user function runs in.
pub(crate) struct CallScope<'a> {
    pub this: Option<ObjectRef>,
    pub class: Option<Rc<ClassEntry>>,
    pub static_class: Option<Rc<ClassEntry>>,
    pub captured: &'a [(Rc<str>, Zval)],
    /// Name shown in traces: `f`, `Class->method`, `Class::method`.
    pub display: Rc<str>,
}

impl CallScope<'_> {
    fn function(display: Rc<str>) -> Self {
        CallScope {
            this: None,
            class: None,
            static_class: None,
            captured: &[],
            display,
        }
    }
}

fn arity_message(name: &str, min: usize, max: Option<usize>, given: usize) -> String {
    let (qualifier, count) = match max {
        Some(max) if max == min => ("exactly", min),
        _ if given < min => ("at least", min),
        Some(max) => ("at most", max),
        None => ("at least", min),
    };
    format!(
        "{name}() expects {qualifier} {count} argument{}, {given} given",
        if count == 1 { "" } else { "s" }
    )
}

impl Request {
    fn check_arity(
        &mut self,
        name: &str,
        min: usize,
        max: Option<usize>,
        given: usize,
    ) -> Exec<()> {
        if given < min || max.is_some_and(|max| given > max) {
            let message = arity_message(name, min, max, given);
            return Err(self.throw_error("ArgumentCountError", message));
        }
        Ok(())
    }

    fn check_depth(&mut self) -> Exec<()> {
        let max = self.ini.max_call_depth;
        if self.frames.len() > max {
            return Err(self.throw_error(
                "Error",
                format!("Maximum function nesting level of '{max}' reached, aborting!"),
            ));
        }
        Ok(())
    }

    /// Call a function by name. `arg_exprs` are the argument expressions
    /// when called from script, used for by-reference write-back.
    pub(crate) fn call_named(
        &mut self,
        name: &str,
        mut args: Vec<Zval>,
        arg_exprs: Option<&[Expr]>,
    ) -> Exec<Zval> {
        let lower = name.to_ascii_lowercase();
        if let Some(function) = self.functions.get(lower.as_str()).cloned() {
            return match function {
                Function::User(decl) => {
                    let display = decl.name.clone();
                    self.call_user(&decl, args, CallScope::function(display))
                }
                Function::Native(native) => self.call_native(&native, args),
            };
        }
        if let Some(builtin) = self.builtins.get(lower.as_str()).copied() {
            let result = self.call_builtin(builtin, &mut args)?;
            if let (Some(index), Some(exprs)) = (builtin.by_ref, arg_exprs) {
                if let (Some(expr), Some(value)) = (exprs.get(index), args.get(index)) {
                    if is_lvalue(expr) {
                        self.write_back(expr, value.clone())?;
                    }
                }
            }
            return Ok(result);
        }
        Err(self.throw_error("Error", format!("Call to undefined function {name}()")))
    }

    pub(crate) fn call_function_value(&mut self, name: &Rc<str>, args: Vec<Zval>) -> Exec<Zval> {
        self.call_named(name, args, None)
    }

    fn call_builtin(&mut self, builtin: Builtin, args: &mut [Zval]) -> Exec<Zval> {
        self.check_arity(builtin.name, builtin.min, builtin.max, args.len())?;
        let mut call = Args::new(builtin.name, args);
        (builtin.func)(self, &mut call).map_err(|fault| self.raise(fault))
    }

    fn call_native(&mut self, native: &Rc<NativeFunction>, args: Vec<Zval>) -> Exec<Zval> {
        self.check_arity(&native.name, native.min_args, native.max_args, args.len())?;
        self.check_depth()?;
        let (file, line) = {
            let frame = self.current_frame();
            (frame.file.clone(), frame.line)
        };
        let mut frame = Frame::new(Rc::from(native.name.as_str()), file, line);
        frame.args = args.clone();
        self.frames.push(frame);
        let handler = native.handler.clone();
        let result = handler(self, &args).map_err(|fault| self.raise(fault));
        self.frames.pop();
        result
    }

    /// Invoke any callable value.
    pub(crate) fn call_value(&mut self, callee: &Zval, args: Vec<Zval>) -> Exec<Zval> {
        match callee {
            Zval::Callable(callable) => {
                let callable = callable.clone();
                match &callable.kind {
                    CallableKind::Closure(closure) => {
                        let class = closure.scope.as_ref().and_then(|s| self.find_class(s));
                        let static_class = closure
                            .this
                            .as_ref()
                            .and_then(|this| {
                                let name = this.borrow().class.clone();
                                self.find_class(&name)
                            })
                            .or_else(|| class.clone());
                        let scope = CallScope {
                            this: closure.this.clone(),
                            class,
                            static_class,
                            captured: &closure.captured,
                            display: Rc::from("{closure}"),
                        };
                        self.call_user(&closure.decl, args, scope)
                    }
                    CallableKind::Named(name) => self.call_named(name, args, None),
                    CallableKind::Method { object, method } => {
                        self.call_method_named(object.clone(), method, args)
                    }
                }
            }
            Zval::Str(name) => match name.split_once("::") {
                Some((class, method)) => self.call_static(class, method, args),
                None => self.call_named(name, args, None),
            },
            Zval::Array(array) => {
                let pair = {
                    let array = array.borrow();
                    (array.len() == 2)
                        .then(|| (array.values().next().cloned(), array.values().nth(1).cloned()))
                };
                match pair {
                    Some((Some(Zval::Object(obj)), Some(Zval::Str(method)))) => {
                        self.call_method_named(obj, &method, args)
                    }
                    Some((Some(Zval::Str(class)), Some(Zval::Str(method)))) => {
                        self.call_static(&class, &method, args)
                    }
                    _ => Err(self.throw_error(
                        "Error",
                        "Array callback must have exactly two elements",
                    )),
                }
            }
            Zval::Object(obj) => self.call_method_named(obj.clone(), "__invoke", args),
            _ => Err(self.throw_error("Error", "Value not callable")),
        }
    }

    /// True when `value` can be invoked by [`Request::call_value`].
    pub(crate) fn is_callable(&self, value: &Zval) -> bool {
        match value {
            Zval::Callable(_) => true,
            Zval::Str(name) => match name.split_once("::") {
                Some((class, method)) => self
                    .find_class(class)
                    .is_some_and(|c| c.find_method(method).is_some()),
                None => self.has_function(name),
            },
            Zval::Array(array) => {
                let array = array.borrow();
                if array.len() != 2 {
                    return false;
                }
                let mut values = array.values();
                match (values.next(), values.next()) {
                    (Some(Zval::Object(obj)), Some(Zval::Str(method))) => {
                        let class = obj.borrow().class.clone();
                        self.find_class(&class)
                            .is_some_and(|c| c.find_method(method).is_some())
                    }
                    (Some(Zval::Str(class)), Some(Zval::Str(method))) => self
                        .find_class(class)
                        .is_some_and(|c| c.find_method(method).is_some()),
                    _ => false,
                }
            }
            Zval::Object(obj) => {
                let class = obj.borrow().class.clone();
                self.find_class(&class)
                    .is_some_and(|c| c.find_method("__invoke").is_some())
            }
            _ => false,
        }
    }

    pub(crate) fn call_method_on(
        &mut self,
        target: &Zval,
        method: &str,
        args: Vec<Zval>,
    ) -> Exec<Zval> {
        match target {
            Zval::Object(obj) => self.call_method_named(obj.clone(), method, args),
            Zval::Callable(_) if method.eq_ignore_ascii_case("__invoke") => {
                self.call_value(target, args)
            }
            Zval::Callable(_) if method.eq_ignore_ascii_case("call") => {
                let mut args = args.into_iter();
                let _bound = args.next();
                self.call_value(target, args.collect())
            }
            other => Err(self.throw_error(
                "Error",
                format!(
                    "Call to a member function {method}() on {}",
                    other.type_name()
                ),
            )),
        }
    }

    pub(crate) fn call_method_named(
        &mut self,
        obj: ObjectRef,
        name: &str,
        args: Vec<Zval>,
    ) -> Exec<Zval> {
        let class_name = obj.borrow().class.clone();
        if let Some(entry) = self.find_class(&class_name) {
            if let Some(method) = entry.find_method(name) {
                return self.call_method(obj, &entry, &method, args);
            }
            if let Some(magic) = entry.find_method("__call") {
                let list = Zval::array(args.into_iter().collect());
                return self.call_method(obj, &entry, &magic, vec![Zval::string(name), list]);
            }
        }
        Err(self.throw_error(
            "Error",
            format!("Call to undefined method {class_name}::{name}()"),
        ))
    }

    /// Call `method` on `obj`, whose class is `entry`.
    pub(crate) fn call_method(
        &mut self,
        obj: ObjectRef,
        entry: &Rc<ClassEntry>,
        method: &Rc<Method>,
        args: Vec<Zval>,
    ) -> Exec<Zval> {
        let declaring = self.find_class(&method.class);
        let (this, display) = if method.decl.is_static {
            (None, format!("{}::{}", method.class, method.decl.name))
        } else {
            (Some(obj), format!("{}->{}", method.class, method.decl.name))
        };
        let scope = CallScope {
            this,
            class: declaring,
            static_class: Some(entry.clone()),
            captured: &[],
            display: Rc::from(display),
        };
        self.call_user(&method.decl, args, scope)
    }

    /// Resolve a class reference as written in source. The flag is true
    /// for `self`/`parent`, which forward late static binding.
    pub(crate) fn resolve_class_ref(&mut self, name: &str) -> Exec<(Rc<ClassEntry>, bool)> {
        let frame = self.current_frame();
        let resolved = match name.to_ascii_lowercase().as_str() {
            "self" => frame.class.clone().map(|c| (c, true)).ok_or(
                "Cannot use \"self\" when no class scope is active".to_string(),
            ),
            "parent" => frame
                .class
                .as_ref()
                .and_then(|c| c.parent.clone())
                .map(|c| (c, true))
                .ok_or("Cannot use \"parent\" when current class scope has no parent".to_string()),
            "static" => frame.static_class.clone().map(|c| (c, false)).ok_or(
                "Cannot use \"static\" when no class scope is active".to_string(),
            ),
            _ => self
                .find_class(name)
                .map(|c| (c, false))
                .ok_or(format!("Class \"{name}\" not found")),
        };
        resolved.map_err(|message| self.throw_error("Error", message))
    }

    /// `Class::method(...)`, including `parent::` and `self::` forwarding.
    pub(crate) fn call_static(
        &mut self,
        class: &str,
        method_name: &str,
        args: Vec<Zval>,
    ) -> Exec<Zval> {
        let (entry, forwarding) = self.resolve_class_ref(class)?;
        let Some(method) = entry.find_method(method_name) else {
            return Err(self.throw_error(
                "Error",
                format!("Call to undefined method {}::{method_name}()", entry.name),
            ));
        };

        if method.decl.is_static {
            let static_class = if forwarding {
                self.current_frame().static_class.clone().or(Some(entry.clone()))
            } else {
                Some(entry.clone())
            };
            let scope = CallScope {
                this: None,
                class: self.find_class(&method.class),
                static_class,
                captured: &[],
                display: Rc::from(format!("{}::{}", method.class, method.decl.name)),
            };
            return self.call_user(&method.decl, args, scope);
        }

        let this = self
            .current_frame()
            .this
            .clone()
            .filter(|this| self.instance_of(&Zval::Object(this.clone()), &entry.name));
        match this {
            Some(this) => {
                let class_name = this.borrow().class.clone();
                let object_class = self.find_class(&class_name).unwrap_or(entry);
                self.call_method(this, &object_class, &method, args)
            }
            None => Err(self.throw_error(
                "Error",
                format!(
                    "Non-static method {}::{}() cannot be called statically",
                    method.class, method.decl.name
                ),
            )),
        }
    }

    /// Run a script-defined function in a fresh frame.
    pub(crate) fn call_user(
        &mut self,
        decl: &Rc<FunctionDecl>,
        args: Vec<Zval>,
        scope: CallScope<'_>,
    ) -> Exec<Zval> {
        self.check_depth()?;
        if decl.is_abstract {
            return Err(self.throw_error(
                "Error",
                format!("Cannot call abstract method {}()", scope.display.replace("->", "::")),
            ));
        }
        let caller = {
            let frame = self.current_frame();
            (frame.file.clone(), frame.line)
        };

        let mut frame = Frame::new(scope.display, decl.file.clone(), decl.line);
        frame.class = scope.class;
        frame.static_class = scope.static_class;
        frame.this = scope.this;
        for (name, value) in scope.captured {
            frame.locals.insert(name.clone(), value.clone());
        }
        frame.args = args.clone();

        self.frames.push(frame);
        let result = self.run_user(decl, args, &caller);
        self.frames.pop();
        result
    }

    fn run_user(
        &mut self,
        decl: &FunctionDecl,
        args: Vec<Zval>,
        caller: &(Rc<str>, u32),
    ) -> Exec<Zval> {
        let name = self.current_frame().function.replace("->", "::");
        self.bind_params(decl, &name, args, caller)?;
        let value = match self.exec_block(&decl.body)? {
            Flow::Return(value) => value,
            _ => Zval::Null,
        };
        match &decl.ret {
            Some(hint) => self.check_return(&name, hint, value),
            None => Ok(value),
        }
    }

    fn bind_params(
        &mut self,
        decl: &FunctionDecl,
        name: &str,
        args: Vec<Zval>,
        caller: &(Rc<str>, u32),
    ) -> Exec<()> {
        let required = decl.required_params();
        if args.len() < required {
            let qualifier = if decl.params.len() > required { "at least" } else { "exactly" };
            return Err(self.throw_error(
                "ArgumentCountError",
                format!(
                    "Too few arguments to function {name}(), {} passed in {} on line {} and {qualifier} {required} expected",
                    args.len(),
                    caller.0,
                    caller.1
                ),
            ));
        }

        let mut rest = args.into_iter();
        for (index, param) in decl.params.iter().enumerate() {
            if param.variadic {
                let mut list = ZArray::new();
                for (offset, value) in rest.by_ref().enumerate() {
                    let value = self.check_param(name, index + offset, param, value, caller)?;
                    // A fresh list cannot collide.
                    let _ = list.push(value);
                }
                self.assign_local(&param.name, Zval::array(list));
                break;
            }
            let value = match rest.next() {
                Some(value) => self.check_param(name, index, param, value, caller)?,
                None => match &param.default {
                    Some(default) => self.eval_expr(default)?,
                    None => Zval::Null,
                },
            };
            if param.promoted {
                if let Some(this) = self.current_frame().this.clone() {
                    this.borrow_mut().set(&param.name, value.clone());
                }
            }
            self.current_frame_mut()
                .locals
                .insert(param.name.clone(), value);
        }
        Ok(())
    }

    fn check_param(
        &mut self,
        function: &str,
        index: usize,
        param: &Param,
        value: Zval,
        caller: &(Rc<str>, u32),
    ) -> Exec<Zval> {
        let Some(hint) = &param.ty else {
            return Ok(value);
        };
        match self.coerce(hint, value) {
            Ok(value) => Ok(value),
            Err(given) => Err(self.throw_error(
                "TypeError",
                format!(
                    "{function}(): Argument #{} (${}) must be of type {}, {given} given, called in {} on line {}",
                    index + 1,
                    param.name,
                    hint.render(),
                    caller.0,
                    caller.1
                ),
            )),
        }
    }

    fn check_return(&mut self, function: &str, hint: &TypeHint, value: Zval) -> Exec<Zval> {
        if hint.names.len() == 1 && hint.names[0].eq_ignore_ascii_case("void") {
            return Ok(Zval::Null);
        }
        match self.coerce(hint, value) {
            Ok(value) => Ok(value),
            Err(given) => Err(self.throw_error(
                "TypeError",
                format!(
                    "{function}(): Return value must be of type {}, {given} returned",
                    hint.render()
                ),
            )),
        }
    }

    /// Coercive type check. On failure returns the type name of `value`.
    pub(crate) fn coerce(&self, hint: &TypeHint, value: Zval) -> Result<Zval, String> {
        let names: Vec<String> = hint.names.iter().map(|n| n.to_ascii_lowercase()).collect();
        let has = |name: &str| names.iter().any(|n| n == name);

        if value.is_null() && (hint.nullable || has("null") || has("mixed")) {
            return Ok(value);
        }
        if names.iter().any(|name| self.type_accepts(name, &value)) {
            return Ok(value);
        }
        if let Zval::Int(i) = value {
            if has("float") {
                return Ok(Zval::Float(i as f64));
            }
        }
        if matches!(value, Zval::Bool(_) | Zval::Int(_) | Zval::Float(_) | Zval::Str(_)) {
            for scalar in ["int", "float", "string", "bool"] {
                if has(scalar) {
                    if let Some(converted) = self.juggle(scalar, &value) {
                        return Ok(converted);
                    }
                }
            }
        }
        Err(value.type_name())
    }

    fn type_accepts(&self, name: &str, value: &Zval) -> bool {
        match (name, value) {
            ("mixed", _) => true,
            ("int", Zval::Int(_))
            | ("float", Zval::Float(_))
            | ("string", Zval::Str(_))
            | ("bool", Zval::Bool(_))
            | ("false", Zval::Bool(false))
            | ("true", Zval::Bool(true))
            | ("array" | "iterable", Zval::Array(_))
            | ("null", Zval::Null)
            | ("object", Zval::Object(_) | Zval::Callable(_))
            | ("callable", Zval::Callable(_)) => true,
            ("callable", other) => self.is_callable(other),
            ("self" | "static", Zval::Object(_)) => {
                let frame = self.current_frame();
                let scope = if name == "self" { &frame.class } else { &frame.static_class };
                scope
                    .as_ref()
                    .is_some_and(|class| self.instance_of(value, &class.name))
            }
            (
                "int" | "float" | "string" | "bool" | "false" | "true" | "array" | "iterable"
                | "null" | "object" | "void" | "never" | "self" | "static",
                _,
            ) => false,
            (class, value) => self.instance_of(value, class),
        }
    }

    fn juggle(&self, scalar: &str, value: &Zval) -> Option<Zval> {
        match (scalar, value) {
            ("int", Zval::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Some(Zval::Int(ops::float_to_int(*f)))
            }
            ("int", Zval::Str(s)) => match ops::parse_numeric(s)? {
                (Num::Int(i), true) => Some(Zval::Int(i)),
                (Num::Float(f), true) if f.fract() == 0.0 => Some(Zval::Int(ops::float_to_int(f))),
                _ => None,
            },
            ("int", Zval::Bool(b)) => Some(Zval::Int(i64::from(*b))),
            ("float", Zval::Str(s)) => match ops::parse_numeric(s)? {
                (n, true) => Some(Zval::Float(n.to_f64())),
                _ => None,
            },
            ("float", Zval::Bool(b)) => Some(Zval::Float(if *b { 1.0 } else { 0.0 })),
            ("string", Zval::Int(i)) => Some(Zval::from(i.to_string())),
            ("string", Zval::Float(f)) => Some(Zval::from(ops::format_float(*f, self.ini.precision))),
            ("string", Zval::Bool(b)) => Some(Zval::string(if *b { "1" } else { "" })),
            ("bool", Zval::Int(_) | Zval::Float(_) | Zval::Str(_)) => {
                Some(Zval::Bool(value.to_bool()))
            }
            _ => None,
        }
    }
}
