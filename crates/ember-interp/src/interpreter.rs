//! Tree-walking evaluator.
//!
//! Statements and expressions run directly against the request state.
//! Script-level exceptions and engine aborts travel as [`Unwind`] through
//! `Result`; `try`/`catch` intercepts only the former.

use crate::ast::{
    ArrayItem, BinaryOp, ClassDecl, Expr, FunctionDecl, Interpolated, Program, Stmt, StmtKind,
    UnaryOp,
};
use crate::builtins;
use crate::classes::{ClassEntry, PropInit};
use crate::error::{EvalError, NativeFault, ThrownError};
use crate::lexer::CastKind;
use crate::ops;
use crate::parser::MAX_NESTING;
use crate::request::{Frame, Function, Request, WarningLevel};
use crate::value::{
    separate_array, ArrayKey, CallableKind, Closure, ObjectRef, ZArray, Zval,
};
use std::rc::Rc;

/// Completion of a statement.
pub(crate) enum Flow {
    Normal,
    Return(Zval),
    Break(u32),
    Continue(u32),
}

/// Non-local exit from script code.
#[derive(Debug)]
pub(crate) enum Unwind {
    /// A throwable object in flight; catchable by scripts.
    Throw(Zval),
    /// Interrupt, step limit or engine fault; never catchable.
    Abort(EvalError),
}

pub(crate) type Exec<T> = Result<T, Unwind>;

impl From<Unwind> for NativeFault {
    fn from(unwind: Unwind) -> Self {
        match unwind {
            Unwind::Throw(value) => NativeFault::Rethrow(value),
            Unwind::Abort(err) => NativeFault::Abort(err),
        }
    }
}

/// What a loop does after one pass of its body.
enum LoopStep {
    Next,
    Exit,
    Leave(Flow),
}

fn loop_step(flow: Flow) -> LoopStep {
    match flow {
        Flow::Normal | Flow::Continue(1) => LoopStep::Next,
        Flow::Break(1) => LoopStep::Exit,
        Flow::Break(n) => LoopStep::Leave(Flow::Break(n - 1)),
        Flow::Continue(n) => LoopStep::Leave(Flow::Continue(n - 1)),
        ret @ Flow::Return(_) => LoopStep::Leave(ret),
    }
}

/// Root of an assignable location.
enum Base {
    Var(Rc<str>),
    This,
    Value(Zval),
}

enum Seg {
    Index(Option<ArrayKey>),
    Prop(Rc<str>),
}

/// Assignable location with every offset already evaluated.
struct Target {
    base: Base,
    segs: Vec<Seg>,
}

enum Mode {
    Write(Zval),
    Unset,
}

enum Step {
    Done,
    /// Remove the slot from its holder.
    Remove,
    /// An object was reached at segment `.1`; continue inside it.
    Enter(ObjectRef, usize),
}

/// Where the slot under mutation lives while it is detached.
enum Holder {
    Local(Rc<str>),
    Prop(ObjectRef, Rc<str>),
    Temp,
}

fn fault(class: &str, message: impl Into<String>) -> NativeFault {
    NativeFault::throw(class, message)
}

fn occupied() -> NativeFault {
    fault(
        "Error",
        "Cannot add element to the array as the next element is already occupied",
    )
}

/// Walk `segs[i..]` from `slot`, applying `mode` at the end.
///
/// Never touches objects other than to report them, so no object borrow is
/// held when the caller continues inside one.
fn walk(
    slot: &mut Zval,
    segs: &[Seg],
    i: usize,
    mode: &Mode,
    warnings: &mut Vec<String>,
) -> Result<Step, NativeFault> {
    let Some(seg) = segs.get(i) else {
        return Ok(match mode {
            Mode::Write(value) => {
                *slot = value.clone();
                Step::Done
            }
            Mode::Unset => Step::Remove,
        });
    };

    let key = match seg {
        Seg::Prop(name) => {
            return match (slot, mode) {
                (Zval::Object(obj), _) => Ok(Step::Enter(obj.clone(), i)),
                (_, Mode::Unset) => Ok(Step::Done),
                (other, Mode::Write(_)) => Err(fault(
                    "Error",
                    format!(
                        "Attempt to assign property \"{name}\" on {}",
                        other.type_name()
                    ),
                )),
            };
        }
        Seg::Index(key) => key,
    };

    let unset = matches!(mode, Mode::Unset);
    match slot {
        Zval::Null if unset => return Ok(Step::Done),
        Zval::Null | Zval::Array(_) => {}
        Zval::Bool(false) if !unset => {
            warnings.push("Deprecated: Automatic conversion of false to array is deprecated".into());
            *slot = Zval::Null;
        }
        Zval::Object(_) | Zval::Callable(_) => {
            return Err(fault(
                "Error",
                format!("Cannot use object of type {} as array", slot.type_name()),
            ));
        }
        Zval::Str(_) if unset => return Err(fault("Error", "Cannot unset string offsets")),
        Zval::Str(_) => {
            return Err(fault("Error", "String offset assignment is not supported"));
        }
        _ if unset => {
            return Err(fault("Error", "Cannot unset offset in a non-array variable"));
        }
        _ => return Err(fault("Error", "Cannot use a scalar value as an array")),
    }

    let Some(array) = separate_array(slot) else {
        return Err(fault("Error", "Cannot use a scalar value as an array"));
    };
    let mut table = array.borrow_mut();
    let last = i + 1 == segs.len();
    match (mode, key) {
        (Mode::Unset, None) => Err(fault("Error", "Cannot use [] for unsetting")),
        (Mode::Unset, Some(key)) if last => {
            table.remove(key);
            Ok(Step::Done)
        }
        (Mode::Unset, Some(key)) => match table.get_mut(key) {
            Some(child) => walk(child, segs, i + 1, mode, warnings),
            None => Ok(Step::Done),
        },
        (Mode::Write(value), Some(key)) if last => {
            table.insert(key.clone(), value.clone());
            Ok(Step::Done)
        }
        (Mode::Write(value), None) if last => {
            table.push(value.clone()).map_err(|_| occupied())?;
            Ok(Step::Done)
        }
        (Mode::Write(_), Some(key)) => {
            let child = table.entry_or_null(key.clone());
            walk(child, segs, i + 1, mode, warnings)
        }
        (Mode::Write(_), None) => {
            let key = table.push(Zval::Null).map_err(|_| occupied())?;
            let child = table.entry_or_null(key);
            walk(child, segs, i + 1, mode, warnings)
        }
    }
}

fn undefined_key(key: &ArrayKey) -> String {
    match key {
        ArrayKey::Int(i) => format!("Undefined array key {i}"),
        ArrayKey::Str(s) => format!("Undefined array key \"{s}\""),
    }
}

impl Request {
    /// Build the throwable described by `fault`.
    pub(crate) fn raise(&mut self, fault: NativeFault) -> Unwind {
        match fault {
            NativeFault::Throw {
                class,
                message,
                props,
            } => match self.create_throwable(&class, message) {
                Ok(value) => {
                    if let Zval::Object(obj) = &value {
                        let mut obj = obj.borrow_mut();
                        for (name, prop) in props {
                            obj.set(&name, prop);
                        }
                    }
                    Unwind::Throw(value)
                }
                Err(unwind) => unwind,
            },
            NativeFault::Rethrow(value) => Unwind::Throw(value),
            NativeFault::Fatal(message) => Unwind::Abort(EvalError::Fatal(message)),
            NativeFault::Abort(err) => Unwind::Abort(err),
        }
    }

    pub(crate) fn throw_error(&mut self, class: &str, message: impl Into<String>) -> Unwind {
        self.raise(NativeFault::throw(class, message))
    }

    fn create_throwable(&mut self, class: &str, message: String) -> Exec<Zval> {
        let entry = match self.find_class(class) {
            Some(entry) if entry.is_throwable() => entry,
            _ => self.find_class("Error").ok_or_else(|| {
                Unwind::Abort(EvalError::fatal("built-in class Error is not declared"))
            })?,
        };
        // Built without a constructor call so raising never re-enters the
        // call-depth check.
        let obj = self.instantiate_defaults(&entry)?;
        self.stamp_throwable(&obj);
        obj.borrow_mut().set("message", Zval::from(message));
        Ok(Zval::Object(obj))
    }

    /// Run a fallible value operation, recording its warnings.
    pub(crate) fn op<T>(
        &mut self,
        f: impl FnOnce(&mut Vec<String>) -> Result<T, NativeFault>,
    ) -> Exec<T> {
        let mut warnings = Vec::new();
        let result = f(&mut warnings);
        self.flush_warnings(warnings);
        result.map_err(|fault| self.raise(fault))
    }

    pub(crate) fn flush_warnings(&mut self, warnings: Vec<String>) {
        for message in warnings {
            match message.strip_prefix("Deprecated: ") {
                Some(rest) => self.push_warning(WarningLevel::Deprecated, rest.to_string()),
                None => self.push_warning(WarningLevel::Warning, message),
            }
        }
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.push_warning(WarningLevel::Warning, message.into());
    }

    fn tick(&mut self) -> Exec<()> {
        self.steps += 1;
        let max = self.ini.max_execution_steps;
        if max > 0 && self.steps > max {
            return Err(Unwind::Abort(EvalError::StepLimit(max)));
        }
        if self.interrupt.is_interrupted() && self.interrupt.take() {
            return Err(Unwind::Abort(EvalError::Interrupted));
        }
        Ok(())
    }

    fn set_line(&mut self, line: u32) {
        self.current_frame_mut().line = line;
    }

    /// String conversion honouring `__toString`.
    pub(crate) fn stringify(&mut self, value: &Zval) -> Exec<Rc<str>> {
        if let Zval::Object(obj) = value {
            let class = obj.borrow().class.clone();
            let entry = self.find_class(&class);
            if let Some((entry, method)) =
                entry.and_then(|e| e.find_method("__toString").map(|m| (e, m)))
            {
                let result = self.call_method(obj.clone(), &entry, &method, Vec::new())?;
                return match result {
                    Zval::Str(s) => Ok(s),
                    other => Err(self.throw_error(
                        "TypeError",
                        format!(
                            "{class}::__toString(): Return value must be of type string, {} returned",
                            other.type_name()
                        ),
                    )),
                };
            }
        }
        let precision = self.ini.precision;
        self.op(|w| ops::to_str(value, precision, w))
    }

    fn array_key(&mut self, value: &Zval) -> Exec<ArrayKey> {
        self.op(|w| ops::to_array_key(value, w))
    }

    pub(crate) fn run_main(&mut self, program: &Program, file: &str) -> Exec<Zval> {
        let saved = {
            let frame = &mut self.frames[0];
            let saved = (frame.file.clone(), frame.line);
            frame.file = Rc::from(file);
            saved
        };
        let result = self.run_program(program);
        let frame = &mut self.frames[0];
        frame.file = saved.0;
        frame.line = saved.1;
        Ok(match result? {
            Flow::Return(value) => value,
            _ => Zval::Null,
        })
    }

    fn run_program(&mut self, program: &Program) -> Exec<Flow> {
        self.hoist(&program.stmts)?;
        self.exec_block(&program.stmts)
    }

    /// Turn an unwind that escaped every frame into the entry-point error.
    pub(crate) fn finish(&mut self, unwind: Unwind) -> EvalError {
        match unwind {
            Unwind::Abort(err) => err,
            Unwind::Throw(value) => {
                let thrown = self.describe_throwable(value);
                if self.ini.display_errors {
                    self.output.push_str(&format!(
                        "PHP Fatal error:  Uncaught {}: {} in {}:{}\nStack trace:\n{}\n  thrown in {} on line {}\n",
                        thrown.class,
                        thrown.message,
                        thrown.file,
                        thrown.line,
                        thrown.trace,
                        thrown.file,
                        thrown.line
                    ));
                }
                EvalError::Thrown(Box::new(thrown))
            }
        }
    }

    fn describe_throwable(&self, value: Zval) -> ThrownError {
        let precision = self.ini.precision;
        let text = |v: Option<&Zval>| -> String {
            v.and_then(|v| ops::to_str(v, precision, &mut Vec::new()).ok())
                .map(|s| s.to_string())
                .unwrap_or_default()
        };
        match value.as_object().cloned() {
            Some(obj) => {
                let obj = obj.borrow();
                let class = obj.class.to_string();
                let message = text(obj.get("message"));
                let code = obj.get("code").map(ops::to_int).unwrap_or(0);
                let file = text(obj.get("file"));
                let line = obj.get("line").map(ops::to_int).unwrap_or(0);
                let trace = text(obj.get("trace"));
                drop(obj);
                ThrownError {
                    class,
                    message,
                    code,
                    file,
                    line: u32::try_from(line).unwrap_or(0),
                    trace,
                    value,
                }
            }
            None => ThrownError {
                class: "Error".into(),
                message: format!("Can only throw objects, {} given", value.type_name()),
                code: 0,
                file: String::new(),
                line: 0,
                trace: String::new(),
                value,
            },
        }
    }

    /// Stack trace of the current call chain, innermost first.
    pub(crate) fn render_trace(&self) -> String {
        let count = self.frames.len();
        let mut lines = Vec::with_capacity(count);
        for (depth, index) in (1..count).rev().enumerate() {
            let caller = &self.frames[index - 1];
            lines.push(format!(
                "#{depth} {}({}): {}()",
                caller.file, caller.line, self.frames[index].function
            ));
        }
        lines.push(format!("#{} {{main}}", count - 1));
        lines.join("\n")
    }

    /// Declare unconditional functions and classes before running `stmts`.
    fn hoist(&mut self, stmts: &[Stmt]) -> Exec<()> {
        let mut pending: Vec<&Rc<ClassDecl>> = Vec::new();
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Function(decl) => self.declare_user_function(decl)?,
                StmtKind::Class(decl) => pending.push(decl),
                _ => {}
            }
        }

        let mut progress = true;
        while progress {
            progress = false;
            let mut index = 0;
            while index < pending.len() {
                let decl = pending[index];
                let ready = decl
                    .parent
                    .as_ref()
                    .is_none_or(|parent| self.class_exists(parent));
                if ready {
                    self.declare_script_class(decl)?;
                    pending.swap_remove(index);
                    progress = true;
                } else {
                    index += 1;
                }
            }
        }
        Ok(())
    }

    fn declare_user_function(&mut self, decl: &Rc<FunctionDecl>) -> Exec<()> {
        let lower: Rc<str> = Rc::from(decl.name.to_ascii_lowercase());
        if let Some(Function::User(existing)) = self.functions.get(&lower) {
            if Rc::ptr_eq(existing, decl) {
                return Ok(());
            }
        }
        if self.functions.contains_key(&lower) || self.builtins.contains_key(&*lower) {
            return Err(self.throw_error(
                "Error",
                format!("Cannot redeclare function {}()", decl.name),
            ));
        }
        self.functions.insert(lower, Function::User(decl.clone()));
        Ok(())
    }

    pub(crate) fn declare_script_class(&mut self, decl: &Rc<ClassDecl>) -> Exec<()> {
        let lower: Rc<str> = Rc::from(decl.name.to_ascii_lowercase());
        if let Some(existing) = self.classes.get(&lower) {
            if existing.decl.as_ref().is_some_and(|d| Rc::ptr_eq(d, decl)) {
                return Ok(());
            }
            return Err(self.throw_error(
                "Error",
                format!(
                    "Cannot declare class {}, because the name is already in use",
                    decl.name
                ),
            ));
        }
        let parent = match &decl.parent {
            Some(name) => match self.find_class(name) {
                Some(parent) => Some(parent),
                None => {
                    return Err(self.throw_error("Error", format!("Class \"{name}\" not found")));
                }
            },
            None => None,
        };
        let entry = ClassEntry::from_decl(decl, parent);
        if !decl.is_abstract {
            let missing = entry.unimplemented_abstract();
            if !missing.is_empty() {
                return Err(self.throw_error(
                    "Error",
                    format!(
                        "Class {} contains {} abstract method{} and must therefore be declared abstract or implement the remaining methods ({})",
                        decl.name,
                        missing.len(),
                        if missing.len() == 1 { "" } else { "s" },
                        missing.join(", ")
                    ),
                ));
            }
        }
        self.classes.insert(lower, Rc::new(entry));
        Ok(())
    }

    pub(crate) fn exec_block(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Exec<Flow> {
        self.tick()?;
        self.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval_expr(expr)?;
            }
            StmtKind::Echo(exprs) => {
                for expr in exprs {
                    let value = self.eval_expr(expr)?;
                    let text = self.stringify(&value)?;
                    self.output.push_str(&text);
                }
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Zval::Null,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If {
                cond,
                then,
                elifs,
                els,
            } => {
                if self.eval_expr(cond)?.to_bool() {
                    return self.exec_block(then);
                }
                for (cond, body) in elifs {
                    if self.eval_expr(cond)?.to_bool() {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = els {
                    return self.exec_block(body);
                }
            }
            StmtKind::While { cond, body } => loop {
                self.tick()?;
                if !self.eval_expr(cond)?.to_bool() {
                    break;
                }
                match loop_step(self.exec_block(body)?) {
                    LoopStep::Next => {}
                    LoopStep::Exit => break,
                    LoopStep::Leave(flow) => return Ok(flow),
                }
            },
            StmtKind::DoWhile { body, cond } => loop {
                self.tick()?;
                match loop_step(self.exec_block(body)?) {
                    LoopStep::Next => {}
                    LoopStep::Exit => break,
                    LoopStep::Leave(flow) => return Ok(flow),
                }
                if !self.eval_expr(cond)?.to_bool() {
                    break;
                }
            },
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                for expr in init {
                    self.eval_expr(expr)?;
                }
                loop {
                    self.tick()?;
                    let mut go = true;
                    for expr in cond {
                        go = self.eval_expr(expr)?.to_bool();
                    }
                    if !go {
                        break;
                    }
                    match loop_step(self.exec_block(body)?) {
                        LoopStep::Next => {}
                        LoopStep::Exit => break,
                        LoopStep::Leave(flow) => return Ok(flow),
                    }
                    for expr in step {
                        self.eval_expr(expr)?;
                    }
                }
            }
            StmtKind::Foreach {
                subject,
                key,
                value,
                body,
            } => {
                let subject = self.eval_expr(subject)?;
                return self.exec_foreach(subject, key.as_ref(), value, body);
            }
            StmtKind::Break(levels) => return Ok(Flow::Break(*levels)),
            StmtKind::Continue(levels) => return Ok(Flow::Continue(*levels)),
            StmtKind::Function(decl) => self.declare_user_function(decl)?,
            StmtKind::Class(decl) => self.declare_script_class(decl)?,
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                let result = match self.exec_block(body) {
                    Err(Unwind::Throw(exception)) => {
                        let handler = catches.iter().find(|catch| {
                            catch
                                .types
                                .iter()
                                .any(|ty| self.instance_of(&exception, ty))
                        });
                        match handler {
                            Some(catch) => {
                                if let Some(var) = &catch.var {
                                    self.current_frame_mut()
                                        .locals
                                        .insert(var.clone(), exception);
                                }
                                self.exec_block(&catch.body)
                            }
                            None => Err(Unwind::Throw(exception)),
                        }
                    }
                    other => other,
                };
                if let Some(finally) = finally {
                    if matches!(result, Err(Unwind::Abort(_))) {
                        return result;
                    }
                    match self.exec_block(finally)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                return result;
            }
            StmtKind::Throw(expr) => {
                let value = self.eval_expr(expr)?;
                return Err(self.throw_value(value));
            }
            StmtKind::Unset(targets) => {
                for expr in targets {
                    let target = self.resolve_target(expr)?;
                    self.store(&target, Mode::Unset)?;
                }
            }
            StmtKind::Block(stmts) => return self.exec_block(stmts),
            StmtKind::Nop => {}
        }
        Ok(Flow::Normal)
    }

    fn exec_foreach(
        &mut self,
        subject: Zval,
        key_var: Option<&Rc<str>>,
        value_var: &Rc<str>,
        body: &[Stmt],
    ) -> Exec<Flow> {
        // Iterate a snapshot: the subject holds its own reference, so
        // writes in the body separate the variable from it.
        let entries: Box<dyn Fn(usize) -> Option<(Zval, Zval)>> = match &subject {
            Zval::Array(array) => {
                let array = array.clone();
                Box::new(move |i| {
                    array
                        .borrow()
                        .get_index(i)
                        .map(|(k, v)| (k.to_zval(), v.clone()))
                })
            }
            Zval::Object(obj) => {
                let props: Vec<(Zval, Zval)> = obj
                    .borrow()
                    .props
                    .iter()
                    .map(|(k, v)| (Zval::Str(k.clone()), v.clone()))
                    .collect();
                Box::new(move |i| props.get(i).cloned())
            }
            other => {
                self.warn(format!(
                    "foreach() argument must be of type array|object, {} given",
                    other.type_name()
                ));
                return Ok(Flow::Normal);
            }
        };

        let mut index = 0;
        while let Some((key, value)) = entries(index) {
            index += 1;
            self.tick()?;
            let frame = self.current_frame_mut();
            if let Some(key_var) = key_var {
                frame.locals.insert(key_var.clone(), key);
            }
            frame.locals.insert(value_var.clone(), value);
            match loop_step(self.exec_block(body)?) {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Leave(flow) => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn throw_value(&mut self, value: Zval) -> Unwind {
        match &value {
            Zval::Object(_) if self.instance_of(&value, crate::classes::THROWABLE) => {
                Unwind::Throw(value)
            }
            _ => self.throw_error("Error", "Can only throw objects"),
        }
    }

    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> Exec<Zval> {
        if self.current_frame().nesting >= MAX_NESTING {
            return Err(self.throw_error(
                "Error",
                format!("Maximum expression nesting level of '{MAX_NESTING}' reached, aborting!"),
            ));
        }
        self.current_frame_mut().nesting += 1;
        let result = self.eval_node(expr);
        let frame = self.current_frame_mut();
        frame.nesting = frame.nesting.saturating_sub(1);
        result
    }

    fn eval_node(&mut self, expr: &Expr) -> Exec<Zval> {
        match expr {
            Expr::Null => Ok(Zval::Null),
            Expr::Bool(b) => Ok(Zval::Bool(*b)),
            Expr::Int(i) => Ok(Zval::Int(*i)),
            Expr::Float(f) => Ok(Zval::Float(*f)),
            Expr::Str(s) => Ok(Zval::Str(s.clone())),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        Interpolated::Lit(text) => out.push_str(text),
                        Interpolated::Expr(expr) => {
                            let value = self.eval_expr(expr)?;
                            out.push_str(&self.stringify(&value)?);
                        }
                    }
                }
                Ok(Zval::from(out))
            }
            Expr::Var(name) => self.read_var(name),
            Expr::Const(name) => self.constant(name),
            Expr::ClassConst { class, name } => self.class_constant(class, name),
            Expr::Array(items) => self.build_array(items),
            Expr::Index { base, index } => {
                let Some(index) = index else {
                    return Err(self.throw_error("Error", "Cannot use [] for reading"));
                };
                let container = self.eval_expr(base)?;
                let key = self.eval_expr(index)?;
                Ok(self.offset_get(&container, &key, false)?.unwrap_or_default())
            }
            Expr::Prop {
                base,
                name,
                nullsafe,
            } => {
                let object = self.eval_expr(base)?;
                if *nullsafe && object.is_null() {
                    return Ok(Zval::Null);
                }
                Ok(self.prop_get(&object, name, false)?.unwrap_or_default())
            }
            Expr::Call { name, args, line } => {
                self.set_line(*line);
                let values = self.eval_args(args)?;
                self.set_line(*line);
                self.call_named(name, values, Some(args.as_slice()))
            }
            Expr::CallValue { callee, args, line } => {
                let callee = self.eval_expr(callee)?;
                let values = self.eval_args(args)?;
                self.set_line(*line);
                self.call_value(&callee, values)
            }
            Expr::MethodCall {
                object,
                method,
                args,
                nullsafe,
                line,
            } => {
                let target = self.eval_expr(object)?;
                if *nullsafe && target.is_null() {
                    return Ok(Zval::Null);
                }
                let values = self.eval_args(args)?;
                self.set_line(*line);
                self.call_method_on(&target, method, values)
            }
            Expr::StaticCall {
                class,
                method,
                args,
                line,
            } => {
                let values = self.eval_args(args)?;
                self.set_line(*line);
                self.call_static(class, method, values)
            }
            Expr::New { class, args, line } => {
                self.set_line(*line);
                let (entry, _) = self.resolve_class_ref(class)?;
                let values = self.eval_args(args)?;
                self.set_line(*line);
                Ok(Zval::Object(self.instantiate(&entry, values)?))
            }
            Expr::Closure(decl) => Ok(self.make_closure(decl)),
            Expr::Unary(op, operand) => {
                let value = self.eval_expr(operand)?;
                match op {
                    UnaryOp::Not => Ok(Zval::Bool(!value.to_bool())),
                    UnaryOp::Neg => self.op(|w| ops::negate(&value, w)),
                    UnaryOp::Plus => {
                        self.op(|w| ops::arith(BinaryOp::Mul, &value, &Zval::Int(1), w))
                    }
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_expr(lhs)?;
                let rhs = self.eval_expr(rhs)?;
                self.binary(*op, &lhs, &rhs)
            }
            Expr::And(lhs, rhs) => {
                Ok(Zval::Bool(self.eval_expr(lhs)?.to_bool() && self.eval_expr(rhs)?.to_bool()))
            }
            Expr::Or(lhs, rhs) => {
                Ok(Zval::Bool(self.eval_expr(lhs)?.to_bool() || self.eval_expr(rhs)?.to_bool()))
            }
            Expr::Xor(lhs, rhs) => {
                let lhs = self.eval_expr(lhs)?.to_bool();
                Ok(Zval::Bool(lhs ^ self.eval_expr(rhs)?.to_bool()))
            }
            Expr::Coalesce(lhs, rhs) => match self.quiet_read(lhs)? {
                Some(value) if !value.is_null() => Ok(value),
                _ => self.eval_expr(rhs),
            },
            Expr::Ternary { cond, then, els } => {
                let cond = self.eval_expr(cond)?;
                if cond.to_bool() {
                    match then {
                        Some(then) => self.eval_expr(then),
                        None => Ok(cond),
                    }
                } else {
                    self.eval_expr(els)
                }
            }
            Expr::Assign(target, value) => {
                let target = self.resolve_target(target)?;
                let value = self.eval_expr(value)?;
                self.store(&target, Mode::Write(value.clone()))?;
                Ok(value)
            }
            Expr::CompoundAssign(op, target, value) => {
                let target = self.resolve_target(target)?;
                let current = self.load(&target)?;
                let rhs = self.eval_expr(value)?;
                let result = self.binary(*op, &current, &rhs)?;
                self.store(&target, Mode::Write(result.clone()))?;
                Ok(result)
            }
            Expr::CoalesceAssign(target, value) => {
                if let Some(current) = self.quiet_read(target)? {
                    if !current.is_null() {
                        return Ok(current);
                    }
                }
                let target = self.resolve_target(target)?;
                let value = self.eval_expr(value)?;
                self.store(&target, Mode::Write(value.clone()))?;
                Ok(value)
            }
            Expr::IncDec {
                target,
                prefix,
                increment,
            } => {
                let target = self.resolve_target(target)?;
                let current = self.load(&target)?;
                let updated = self.op(|w| ops::inc_dec(&current, *increment, w))?;
                self.store(&target, Mode::Write(updated.clone()))?;
                Ok(if *prefix { updated } else { current })
            }
            Expr::Isset(targets) => {
                for target in targets {
                    match self.quiet_read(target)? {
                        Some(value) if !value.is_null() => {}
                        _ => return Ok(Zval::Bool(false)),
                    }
                }
                Ok(Zval::Bool(true))
            }
            Expr::Empty(target) => {
                let value = self.quiet_read(target)?;
                Ok(Zval::Bool(value.is_none_or(|v| !v.to_bool())))
            }
            Expr::Cast(kind, operand) => {
                let value = self.eval_expr(operand)?;
                self.cast(*kind, value)
            }
            Expr::InstanceOf(operand, class) => {
                let value = self.eval_expr(operand)?;
                let name = match &**class {
                    "self" | "static" | "parent" => self.resolve_class_ref(class)?.0.name.clone(),
                    _ => class.clone(),
                };
                Ok(Zval::Bool(self.instance_of(&value, &name)))
            }
            Expr::Include {
                path,
                require,
                once,
            } => {
                let path = self.eval_expr(path)?;
                let path = self.stringify(&path)?;
                self.include(&path, *require, *once)
            }
            Expr::Print(operand) => {
                let value = self.eval_expr(operand)?;
                let text = self.stringify(&value)?;
                self.output.push_str(&text);
                Ok(Zval::Int(1))
            }
            Expr::Throw(operand) => {
                let value = self.eval_expr(operand)?;
                Err(self.throw_value(value))
            }
        }
    }

    pub(crate) fn eval_args(&mut self, args: &[Expr]) -> Exec<Vec<Zval>> {
        args.iter().map(|arg| self.eval_expr(arg)).collect()
    }

    pub(crate) fn binary(&mut self, op: BinaryOp, lhs: &Zval, rhs: &Zval) -> Exec<Zval> {
        match op {
            BinaryOp::Concat => {
                let mut out = self.stringify(lhs)?.to_string();
                out.push_str(&self.stringify(rhs)?);
                Ok(Zval::from(out))
            }
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Pow => self.op(|w| ops::arith(op, lhs, rhs, w)),
            _ => Ok(ops::comparison(op, lhs, rhs)),
        }
    }

    fn read_var(&mut self, name: &str) -> Exec<Zval> {
        if name == "this" {
            return match &self.current_frame().this {
                Some(this) => Ok(Zval::Object(this.clone())),
                None => Err(self.throw_error("Error", "Using $this when not in object context")),
            };
        }
        match self.current_frame().locals.get(name) {
            Some(value) => Ok(value.clone()),
            None => {
                self.warn(format!("Undefined variable ${name}"));
                Ok(Zval::Null)
            }
        }
    }

    fn constant(&mut self, name: &str) -> Exec<Zval> {
        let frame = self.current_frame();
        match name {
            "__LINE__" => return Ok(Zval::Int(i64::from(frame.line))),
            "__FILE__" => return Ok(Zval::Str(frame.file.clone())),
            "__DIR__" => {
                let dir = std::path::Path::new(&*frame.file)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Ok(Zval::from(if dir.is_empty() { ".".to_string() } else { dir }));
            }
            "__CLASS__" => {
                return Ok(frame
                    .class
                    .as_ref()
                    .map(|c| Zval::Str(c.name.clone()))
                    .unwrap_or_else(|| Zval::string("")));
            }
            "__FUNCTION__" | "__METHOD__" => {
                let function = &frame.function;
                let name = if &**function == "{main}" {
                    String::new()
                } else if name == "__FUNCTION__" {
                    function
                        .rsplit(['>', ':'])
                        .next()
                        .unwrap_or_default()
                        .to_string()
                } else {
                    function.replace("->", "::")
                };
                return Ok(Zval::from(name));
            }
            _ => {}
        }
        if let Some(value) = self.constants.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = builtins::constant(name) {
            return Ok(value);
        }
        Err(self.throw_error("Error", format!("Undefined constant \"{name}\"")))
    }

    fn class_constant(&mut self, class: &str, name: &str) -> Exec<Zval> {
        let (entry, _) = self.resolve_class_ref(class)?;
        if name == "class" {
            return Ok(Zval::Str(entry.name.clone()));
        }
        let found = entry
            .find_const(name)
            .map(|(expr, declaring)| (expr.clone(), declaring.clone()));
        match found {
            Some((expr, declaring)) => self.eval_in_class(&expr, &declaring),
            None => Err(self.throw_error(
                "Error",
                format!("Undefined constant {}::{name}", entry.name),
            )),
        }
    }

    /// Evaluate a declaration-time expression with `class` as scope.
    fn eval_in_class(&mut self, expr: &Expr, class: &Rc<str>) -> Exec<Zval> {
        match expr {
            Expr::Null => return Ok(Zval::Null),
            Expr::Bool(b) => return Ok(Zval::Bool(*b)),
            Expr::Int(i) => return Ok(Zval::Int(*i)),
            Expr::Float(f) => return Ok(Zval::Float(*f)),
            Expr::Str(s) => return Ok(Zval::Str(s.clone())),
            _ => {}
        }
        let (file, line) = {
            let frame = self.current_frame();
            (frame.file.clone(), frame.line)
        };
        let entry = self.find_class(class);
        let mut frame = Frame::new(class.clone(), file, line);
        frame.static_class = entry.clone();
        frame.class = entry;
        self.frames.push(frame);
        let result = self.eval_expr(expr);
        self.frames.pop();
        result
    }

    fn build_array(&mut self, items: &[ArrayItem]) -> Exec<Zval> {
        let mut array = ZArray::with_capacity(items.len());
        for item in items {
            let value = self.eval_expr(&item.value)?;
            if item.spread {
                let Zval::Array(source) = value else {
                    return Err(self.throw_error("Error", "Only arrays can be unpacked"));
                };
                let entries: Vec<(ArrayKey, Zval)> = source
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, value) in entries {
                    match key {
                        ArrayKey::Int(_) => {
                            if array.push(value).is_err() {
                                return Err(self.raise(occupied()));
                            }
                        }
                        key => array.insert(key, value),
                    }
                }
                continue;
            }
            match &item.key {
                Some(key) => {
                    let key = self.eval_expr(key)?;
                    let key = self.array_key(&key)?;
                    array.insert(key, value);
                }
                None => {
                    if array.push(value).is_err() {
                        return Err(self.raise(occupied()));
                    }
                }
            }
        }
        Ok(Zval::array(array))
    }

    fn make_closure(&mut self, decl: &Rc<FunctionDecl>) -> Zval {
        let frame = self.current_frame();
        let captured: Vec<(Rc<str>, Zval)> = if decl.is_arrow {
            frame
                .locals
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        } else {
            let mut captured = Vec::with_capacity(decl.uses.len());
            let mut missing = Vec::new();
            for name in &decl.uses {
                match frame.locals.get(name) {
                    Some(value) => captured.push((name.clone(), value.clone())),
                    None => {
                        missing.push(name.clone());
                        captured.push((name.clone(), Zval::Null));
                    }
                }
            }
            for name in missing {
                self.warn(format!("Undefined variable ${name}"));
            }
            captured
        };
        let frame = self.current_frame();
        let this = if decl.is_static { None } else { frame.this.clone() };
        let scope = frame.class.as_ref().map(|c| c.name.clone());
        let callable = self.alloc_callable(CallableKind::Closure(Closure {
            decl: decl.clone(),
            captured,
            this,
            scope,
        }));
        Zval::Callable(callable)
    }

    fn cast(&mut self, kind: CastKind, value: Zval) -> Exec<Zval> {
        Ok(match kind {
            CastKind::Int => Zval::Int(ops::to_int(&value)),
            CastKind::Float => Zval::Float(ops::to_float(&value)),
            CastKind::String => Zval::Str(self.stringify(&value)?),
            CastKind::Bool => Zval::Bool(value.to_bool()),
            CastKind::Array => match value {
                Zval::Array(_) => value,
                Zval::Null => Zval::empty_array(),
                Zval::Object(obj) => Zval::array(
                    obj.borrow()
                        .props
                        .iter()
                        .map(|(k, v)| (ArrayKey::from_str_key(k), v.clone()))
                        .collect(),
                ),
                other => Zval::array(ZArray::from_iter([other])),
            },
            CastKind::Object => match value {
                Zval::Object(_) | Zval::Callable(_) => value,
                Zval::Array(array) => {
                    let obj = self.alloc_object(Rc::from("stdClass"));
                    {
                        let mut obj = obj.borrow_mut();
                        for (key, value) in array.borrow().iter() {
                            obj.set(&key.to_string(), value.clone());
                        }
                    }
                    Zval::Object(obj)
                }
                Zval::Null => Zval::Object(self.alloc_object(Rc::from("stdClass"))),
                other => {
                    let obj = self.alloc_object(Rc::from("stdClass"));
                    obj.borrow_mut().set("scalar", other);
                    Zval::Object(obj)
                }
            },
        })
    }

    /// Read `container[key]`. `None` when the offset is missing (a warning
    /// is recorded unless `quiet`).
    pub(crate) fn offset_get(
        &mut self,
        container: &Zval,
        key: &Zval,
        quiet: bool,
    ) -> Exec<Option<Zval>> {
        match container {
            Zval::Array(_) => {
                let key = self.array_key(key)?;
                self.offset_get_key(container, &key, quiet)
            }
            Zval::Str(s) => {
                let index = match key {
                    Zval::Int(i) => *i,
                    Zval::Str(k) => match ops::parse_numeric(k) {
                        Some((ops::Num::Int(i), true)) => i,
                        _ if quiet => return Ok(None),
                        _ => {
                            return Err(self.throw_error(
                                "TypeError",
                                "Cannot access offset of type string on string",
                            ));
                        }
                    },
                    other => ops::to_int(other),
                };
                let len = s.len() as i64;
                let pos = if index < 0 { len + index } else { index };
                if pos < 0 || pos >= len {
                    if !quiet {
                        self.warn(format!("Uninitialized string offset {index}"));
                        return Ok(Some(Zval::string("")));
                    }
                    return Ok(None);
                }
                let byte = s.as_bytes()[pos as usize];
                Ok(Some(Zval::from(
                    String::from_utf8_lossy(&[byte]).into_owned(),
                )))
            }
            _ => {
                let key = self.array_key(key)?;
                self.offset_get_key(container, &key, quiet)
            }
        }
    }

    fn offset_get_key(
        &mut self,
        container: &Zval,
        key: &ArrayKey,
        quiet: bool,
    ) -> Exec<Option<Zval>> {
        match container {
            Zval::Array(array) => {
                let found = array.borrow().get(key).cloned();
                if found.is_none() && !quiet {
                    self.warn(undefined_key(key));
                }
                Ok(found)
            }
            Zval::Str(_) => self.offset_get(container, &key.to_zval(), quiet),
            Zval::Object(_) | Zval::Callable(_) => {
                if quiet {
                    return Ok(None);
                }
                Err(self.throw_error(
                    "Error",
                    format!("Cannot use object of type {} as array", container.type_name()),
                ))
            }
            other => {
                if !quiet {
                    self.warn(format!(
                        "Trying to access array offset on value of type {}",
                        other.type_name()
                    ));
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn prop_get(
        &mut self,
        object: &Zval,
        name: &str,
        quiet: bool,
    ) -> Exec<Option<Zval>> {
        match object {
            Zval::Object(obj) => {
                let found = obj.borrow().get(name).cloned();
                if found.is_none() && !quiet {
                    let class = obj.borrow().class.clone();
                    self.warn(format!("Undefined property: {class}::${name}"));
                }
                Ok(found)
            }
            other => {
                if !quiet {
                    self.warn(format!(
                        "Attempt to read property \"{name}\" on {}",
                        other.type_name()
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Read without undefined warnings, as `isset`, `empty` and `??` do.
    fn quiet_read(&mut self, expr: &Expr) -> Exec<Option<Zval>> {
        match expr {
            Expr::Var(name) if &**name == "this" => {
                Ok(self.current_frame().this.clone().map(Zval::Object))
            }
            Expr::Var(name) => Ok(self.current_frame().locals.get(name).cloned()),
            Expr::Index {
                base,
                index: Some(index),
            } => {
                let Some(container) = self.quiet_read(base)? else {
                    return Ok(None);
                };
                let key = self.eval_expr(index)?;
                self.offset_get(&container, &key, true)
            }
            Expr::Prop { base, name, .. } => {
                let Some(object) = self.quiet_read(base)? else {
                    return Ok(None);
                };
                self.prop_get(&object, name, true)
            }
            other => self.eval_expr(other).map(Some),
        }
    }

    fn resolve_target(&mut self, expr: &Expr) -> Exec<Target> {
        let mut pending: Vec<Result<Option<&Expr>, &Rc<str>>> = Vec::new();
        let mut current = expr;
        let base = loop {
            match current {
                Expr::Var(name) if &**name == "this" => break Base::This,
                Expr::Var(name) => break Base::Var(name.clone()),
                Expr::Index { base, index } => {
                    pending.push(Ok(index.as_deref()));
                    current = base;
                }
                Expr::Prop { base, name, .. } => {
                    pending.push(Err(name));
                    current = base;
                }
                other => break Base::Value(self.eval_expr(other)?),
            }
        };

        let mut segs = Vec::with_capacity(pending.len());
        for seg in pending.into_iter().rev() {
            segs.push(match seg {
                Ok(Some(index)) => {
                    let key = self.eval_expr(index)?;
                    Seg::Index(Some(self.array_key(&key)?))
                }
                Ok(None) => Seg::Index(None),
                Err(name) => Seg::Prop(name.clone()),
            });
        }
        Ok(Target { base, segs })
    }

    /// Current value at `target`, with read warnings.
    fn load(&mut self, target: &Target) -> Exec<Zval> {
        let mut current = match &target.base {
            Base::Var(name) => self.read_var(name)?,
            Base::This => self.read_var("this")?,
            Base::Value(value) => value.clone(),
        };
        for seg in &target.segs {
            current = match seg {
                Seg::Index(Some(key)) => self
                    .offset_get_key(&current, key, false)?
                    .unwrap_or_default(),
                Seg::Index(None) => {
                    return Err(self.throw_error("Error", "Cannot use [] for reading"));
                }
                Seg::Prop(name) => self.prop_get(&current, name, false)?.unwrap_or_default(),
            };
        }
        Ok(current)
    }

    fn store(&mut self, target: &Target, mode: Mode) -> Exec<()> {
        let (mut holder, mut root, mut existed) = match &target.base {
            Base::Var(name) => {
                let taken = self
                    .current_frame_mut()
                    .locals
                    .get_mut(name)
                    .map(std::mem::take);
                let existed = taken.is_some();
                (Holder::Local(name.clone()), taken.unwrap_or_default(), existed)
            }
            Base::This => {
                if target.segs.is_empty() {
                    let message = match mode {
                        Mode::Write(_) => "Cannot re-assign $this",
                        Mode::Unset => "Cannot unset $this",
                    };
                    return Err(self.throw_error("Error", message));
                }
                let this = self.read_var("this")?;
                (Holder::Temp, this, true)
            }
            Base::Value(value) => (Holder::Temp, value.clone(), true),
        };

        let mut start = 0;
        loop {
            let mut warnings = Vec::new();
            let step = walk(&mut root, &target.segs, start, &mode, &mut warnings);
            let remove = matches!(step, Ok(Step::Remove));
            let keep = !remove && (existed || matches!(mode, Mode::Write(_)));
            match &holder {
                Holder::Local(name) => {
                    let locals = &mut self.current_frame_mut().locals;
                    if keep {
                        locals.insert(name.clone(), root);
                    } else {
                        locals.remove(name);
                    }
                }
                Holder::Prop(obj, name) => {
                    let mut obj = obj.borrow_mut();
                    if keep {
                        obj.set(name, root);
                    } else {
                        obj.props.shift_remove(&**name);
                    }
                }
                Holder::Temp => {}
            }
            self.flush_warnings(warnings);

            match step {
                Err(fault) => return Err(self.raise(fault)),
                Ok(Step::Done | Step::Remove) => return Ok(()),
                Ok(Step::Enter(obj, index)) => {
                    let Some(Seg::Prop(name)) = target.segs.get(index) else {
                        return Ok(());
                    };
                    let taken = obj.borrow_mut().props.get_mut(&**name).map(std::mem::take);
                    existed = taken.is_some();
                    root = taken.unwrap_or_default();
                    holder = Holder::Prop(obj, name.clone());
                    start = index + 1;
                }
            }
        }
    }

    /// Assign to a plain local variable.
    pub(crate) fn assign_local(&mut self, name: &str, value: Zval) {
        self.current_frame_mut().locals.insert(Rc::from(name), value);
    }

    /// Write back a by-reference argument of a built-in.
    pub(crate) fn write_back(&mut self, expr: &Expr, value: Zval) -> Exec<()> {
        let target = self.resolve_target(expr)?;
        self.store(&target, Mode::Write(value))
    }

    /// Object of `entry` with declared defaults and no constructor call.
    pub(crate) fn instantiate_defaults(&mut self, entry: &Rc<ClassEntry>) -> Exec<ObjectRef> {
        let obj = self.alloc_object(entry.name.clone());
        for (name, init, declaring) in entry.prop_layout() {
            let value = match init {
                PropInit::Value(value) => value,
                PropInit::Expr(None) => Zval::Null,
                PropInit::Expr(Some(expr)) => self.eval_in_class(&expr, &declaring)?,
            };
            obj.borrow_mut().props.insert(name, value);
        }
        Ok(obj)
    }

    /// `new Class(...args)`.
    pub(crate) fn instantiate(
        &mut self,
        entry: &Rc<ClassEntry>,
        args: Vec<Zval>,
    ) -> Exec<ObjectRef> {
        if entry.is_abstract {
            return Err(self.throw_error(
                "Error",
                format!("Cannot instantiate abstract class {}", entry.name),
            ));
        }
        let obj = self.instantiate_defaults(entry)?;
        if entry.is_throwable() {
            self.stamp_throwable(&obj);
        }
        if let Some(ctor) = entry.find_method("__construct") {
            self.call_method(obj.clone(), entry, &ctor, args)?;
        }
        Ok(obj)
    }

    /// Record where a throwable was created.
    fn stamp_throwable(&self, obj: &ObjectRef) {
        let frame = self.current_frame();
        let trace = self.render_trace();
        let mut obj = obj.borrow_mut();
        obj.set("file", Zval::Str(frame.file.clone()));
        obj.set("line", Zval::Int(i64::from(frame.line)));
        obj.set("trace", Zval::from(trace));
    }

    fn include(&mut self, path: &str, require: bool, once: bool) -> Exec<Zval> {
        let kind = match (require, once) {
            (true, true) => "require_once",
            (true, false) => "require",
            (false, true) => "include_once",
            (false, false) => "include",
        };
        let referrer = self.current_frame().file.clone();
        let fetched = match &self.loader {
            Some(loader) => loader.fetch(path, Some(&*referrer)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file or directory",
            )),
        };
        let source = match fetched {
            Ok(source) => source,
            Err(err) => {
                if require {
                    return Err(self.throw_error(
                        "Error",
                        format!("Failed opening required '{path}': {err}"),
                    ));
                }
                self.warn(format!("{kind}({path}): Failed to open stream: {err}"));
                self.warn(format!("{kind}(): Failed opening '{path}' for inclusion"));
                return Ok(Zval::Bool(false));
            }
        };

        if once && self.included.contains(&source.name) {
            return Ok(Zval::Bool(true));
        }
        self.included.insert(source.name.clone());

        let program = match crate::parser::parse(&source.text, &source.name) {
            Ok(program) => program,
            Err(err) => {
                let unwind = self.throw_error("ParseError", err.message.clone());
                if let Unwind::Throw(Zval::Object(obj)) = &unwind {
                    let mut obj = obj.borrow_mut();
                    obj.set("file", Zval::from(err.file.clone()));
                    obj.set("line", Zval::Int(i64::from(err.line)));
                }
                return Err(unwind);
            }
        };

        let saved = {
            let frame = self.current_frame_mut();
            let saved = (frame.file.clone(), frame.line);
            frame.file = Rc::from(source.name.as_str());
            saved
        };
        let result = self.run_program(&program);
        let frame = self.current_frame_mut();
        frame.file = saved.0;
        frame.line = saved.1;
        Ok(match result? {
            Flow::Return(value) => value,
            _ => Zval::Int(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EvalError;
    use crate::runtime::{IniSettings, Runtime};
    use crate::request::Request;
    use crate::value::Zval;

    fn run(src: &str) -> (Zval, String) {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let value = request.eval(src, "test.php").unwrap();
        (value, request.take_output())
    }

    fn output(src: &str) -> String {
        run(src).1
    }

    fn fails(src: &str) -> EvalError {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        request.eval(src, "test.php").unwrap_err()
    }

    #[test]
    fn test_arithmetic_and_echo() {
        assert_eq!(output("<?php echo 1 + 2 * 3, ' ', 7 / 2, ' ', 2 ** 10;"), "7 3.5 1024");
        assert_eq!(output("<?php echo PHP_INT_MAX + 1;"), "9.2233720368548E+18");
        assert_eq!(output("<?php $x = 'a'; $x .= 'b'; echo \"[$x]\";"), "[ab]");
    }

    #[test]
    fn test_string_interpolation() {
        let src = r#"<?php
            $o = new stdClass();
            $o->name = 'ada';
            $a = ['k' => 'v', 2 => 'two', 'rows' => [['id' => 7]]];
            $i = 2;
            echo "{$o->name}|$o->name|$a[k]|$a[2]|$a[$i]|{$a['rows'][0]['id']}|{$o->name}s";
        "#;
        assert_eq!(output(src), "ada|ada|v|two|two|7|adas");
    }

    #[test]
    fn test_control_flow() {
        let src = r#"<?php
            $out = '';
            for ($i = 0; $i < 10; $i++) {
                if ($i % 2 == 0) { continue; }
                if ($i > 7) { break; }
                $out .= $i;
            }
            $n = 0;
            while (true) { $n++; if ($n >= 3) break; }
            do { $n--; } while ($n > 0);
            echo $out, '|', $n;
        "#;
        assert_eq!(output(src), "1357|0");
    }

    #[test]
    fn test_nested_array_writes_and_cow() {
        let src = r#"<?php
            $a = [];
            $a['x'][] = 1;
            $a['x'][] = 2;
            $b = $a;
            $b['x'][0] = 99;
            unset($a['missing']);
            return [$a['x'][0], $b['x'][0], count($a['x'])];
        "#;
        let (value, _) = run(src);
        let array = value.as_array().unwrap().borrow();
        let items: Vec<i64> = array.values().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(items, vec![1, 99, 2]);
    }

    #[test]
    fn test_foreach_iterates_snapshot() {
        let src = r#"<?php
            $a = [1, 2, 3];
            foreach ($a as $k => $v) { $a[] = $v; echo "$k=$v,"; }
            echo count($a);
        "#;
        assert_eq!(output(src), "0=1,1=2,2=3,6");
    }

    #[test]
    fn test_classes_and_inheritance() {
        let src = r#"<?php
            class Animal {
                public function __construct(protected string $name) {}
                public function speak() { return $this->name . ' makes ' . $this->sound(); }
                protected function sound() { return '...'; }
            }
            class Dog extends Animal {
                const LEGS = 4;
                protected function sound() { return 'woof'; }
                public function legs() { return static::LEGS; }
            }
            $d = new Dog('Rex');
            echo $d->speak(), ' ', $d->legs(), ' ', $d instanceof Animal ? 'yes' : 'no';
        "#;
        assert_eq!(output(src), "Rex makes woof 4 yes");
    }

    #[test]
    fn test_object_property_writes() {
        let src = r#"<?php
            $o = new stdClass;
            $o->list[] = 'a';
            $o->inner = new stdClass;
            $o->inner->count = 1;
            $o->inner->count += 2;
            $p = $o;
            $p->name = 'shared';
            return $o->name . count($o->list) . $o->inner->count;
        "#;
        assert_eq!(run(src).0.as_str(), Some("shared13"));
    }

    #[test]
    fn test_self_referencing_object_write() {
        let src = r#"<?php
            $o = new stdClass;
            $o->self = $o;
            $o->self->self->value = 5;
            return $o->value;
        "#;
        assert_eq!(run(src).0.as_int(), Some(5));
    }

    #[test]
    fn test_closures_capture_by_value() {
        let src = r#"<?php
            $factor = 3;
            $mul = function ($x) use ($factor) { return $x * $factor; };
            $add = fn($x) => $x + $factor;
            $factor = 100;
            return $mul(2) + $add(1);
        "#;
        assert_eq!(run(src).0.as_int(), Some(6 + 4));
    }

    #[test]
    fn test_try_catch_finally() {
        let src = r#"<?php
            function risky($n) {
                if ($n === 0) { throw new InvalidArgumentException('zero', 7); }
                return 10 / $n;
            }
            $log = '';
            try {
                risky(0);
            } catch (LogicException $e) {
                $log .= get_class($e) . ':' . $e->getMessage() . ':' . $e->getCode();
            } finally {
                $log .= ':finally';
            }
            try { intdiv(1, 0); } catch (DivisionByZeroError $e) { $log .= '|' . $e->getMessage(); }
            return $log;
        "#;
        assert_eq!(
            run(src).0.as_str(),
            Some("InvalidArgumentException:zero:7:finally|Division by zero")
        );
    }

    #[test]
    fn test_uncaught_exception_reports_location() {
        let err = fails("<?php\nfunction f() {\n  throw new RuntimeException('boom');\n}\nf();");
        let EvalError::Thrown(thrown) = err else {
            panic!("expected thrown error, got {err:?}");
        };
        assert_eq!(thrown.class, "RuntimeException");
        assert_eq!(thrown.message, "boom");
        assert_eq!(thrown.line, 3);
        assert_eq!(thrown.trace, "#0 test.php(5): f()\n#1 {main}");
    }

    #[test]
    fn test_argument_validation() {
        let err = fails("<?php function f(int $x) { return $x; } f('abc');");
        let EvalError::Thrown(thrown) = err else { panic!() };
        assert_eq!(thrown.class, "TypeError");
        assert!(thrown
            .message
            .starts_with("f(): Argument #1 ($x) must be of type int, string given"));

        let err = fails("<?php function g($a, $b) {} g(1);");
        let EvalError::Thrown(thrown) = err else { panic!() };
        assert_eq!(thrown.class, "ArgumentCountError");
        assert!(thrown.message.contains("1 passed"));
        assert!(thrown.message.ends_with("exactly 2 expected"));

        assert_eq!(run("<?php function h(int $x) { return $x; } return h('5');").0.as_int(), Some(5));
    }

    #[test]
    fn test_undefined_variable_warns() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let value = request.eval("<?php return $nope ?? 'dflt';", "t.php").unwrap();
        assert_eq!(value.as_str(), Some("dflt"));
        assert!(request.take_warnings().is_empty());

        request.eval("<?php\necho $nope;", "t.php").unwrap();
        let warnings = request.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].to_string(), "Warning: Undefined variable $nope in t.php on line 2");
    }

    #[test]
    fn test_step_limit_aborts() {
        let mut ini = IniSettings::default();
        ini.max_execution_steps = 1000;
        let runtime = Runtime::startup(ini, None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let err = request.eval("<?php while (true) {}", "t.php").unwrap_err();
        assert!(matches!(err, EvalError::StepLimit(1000)));
        // The request stays usable.
        assert_eq!(request.eval("<?php return 1;", "t.php").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_interrupt_is_not_catchable() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        runtime.interrupt_handle().interrupt();
        let err = request
            .eval("<?php try { while (true) {} } finally { echo 'no'; }", "t.php")
            .unwrap_err();
        assert!(matches!(err, EvalError::Interrupted));
        assert_eq!(request.take_output(), "");
    }

    #[test]
    fn test_call_depth_limit() {
        let mut ini = IniSettings::default();
        ini.max_call_depth = 20;
        let runtime = Runtime::startup(ini, None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let err = request
            .eval("<?php function r($n) { return r($n + 1); } r(0);", "t.php")
            .unwrap_err();
        let EvalError::Thrown(thrown) = err else { panic!() };
        assert_eq!(thrown.message, "Maximum function nesting level of '20' reached, aborting!");
    }

    #[test]
    fn test_expression_nesting_limit() {
        let inner = format!("1{}", "+1".repeat(100));
        let deep = format!("({inner}){}", "+1".repeat(100));

        let err = fails(&format!("<?php return {deep};"));
        let EvalError::Thrown(thrown) = err else { panic!() };
        assert_eq!(thrown.class, "Error");
        assert_eq!(thrown.message, "Maximum expression nesting level of '128' reached, aborting!");

        // Catchable, and the frame's depth unwinds with the exception.
        let src = format!(
            "<?php try {{ $x = {deep}; }} catch (Error $e) {{ echo 'caught '; }} return {inner};"
        );
        let (value, out) = run(&src);
        assert_eq!(out, "caught ");
        assert_eq!(value.as_int(), Some(101));
    }

    #[test]
    fn test_abstract_class_rules() {
        let err = fails("<?php abstract class A {} new A();");
        let EvalError::Thrown(thrown) = err else { panic!() };
        assert_eq!(thrown.message, "Cannot instantiate abstract class A");
    }
}
