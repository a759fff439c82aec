//! Class table entries and the built-in class prelude.

use crate::ast::{ClassDecl, Expr, FunctionDecl};
use crate::value::Zval;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Built-in classes, declared in every request before user code runs.
pub(crate) const PRELUDE: &str = r#"<?php
class stdClass {}

abstract class Throwable {
    protected $message = '';
    protected $code = 0;
    protected string $file = '';
    protected int $line = 0;
    protected string $trace = '';
    protected $previous = null;

    public function __construct($message = '', $code = 0, $previous = null) {
        $this->message = $message;
        $this->code = $code;
        $this->previous = $previous;
    }

    public function getMessage() { return $this->message; }
    public function getCode() { return $this->code; }
    public function getPrevious() { return $this->previous; }
    public function getFile() { return $this->file; }
    public function getLine() { return $this->line; }
    public function getTraceAsString() { return $this->trace; }

    public function __toString() {
        return get_class($this) . ': ' . $this->message . ' in ' . $this->file . ':' . $this->line;
    }
}

class Exception extends Throwable {}
class Error extends Throwable {}

class ErrorException extends Exception {}
class LogicException extends Exception {}
class BadFunctionCallException extends LogicException {}
class BadMethodCallException extends BadFunctionCallException {}
class DomainException extends LogicException {}
class InvalidArgumentException extends LogicException {}
class LengthException extends LogicException {}
class OutOfRangeException extends LogicException {}
class RuntimeException extends Exception {}
class OutOfBoundsException extends RuntimeException {}
class OverflowException extends RuntimeException {}
class RangeException extends RuntimeException {}
class UnderflowException extends RuntimeException {}
class UnexpectedValueException extends RuntimeException {}

class TypeError extends Error {}
class ValueError extends Error {}
class ArithmeticError extends Error {}
class DivisionByZeroError extends ArithmeticError {}
class ArgumentCountError extends TypeError {}
class ParseError extends Error {}
"#;

/// Root of every throwable class.
pub const THROWABLE: &str = "Throwable";

/// A method together with the class that declared it.
#[derive(Debug)]
pub struct Method {
    pub decl: Rc<FunctionDecl>,
    pub class: Rc<str>,
}

/// How a declared property gets its initial value.
#[derive(Debug, Clone)]
pub(crate) enum PropInit {
    /// Constant expression from a script declaration; `None` means null.
    Expr(Option<Expr>),
    /// Value supplied by the host.
    Value(Zval),
}

/// Class declared by the host through the native interface.
#[derive(Debug, Clone, Default)]
pub struct NativeClass {
    pub name: String,
    pub parent: Option<String>,
    /// Declared properties with their default values, in order.
    pub props: Vec<(String, Zval)>,
}

impl NativeClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn prop(mut self, name: impl Into<String>, default: Zval) -> Self {
        self.props.push((name.into(), default));
        self
    }
}

/// Entry of the request class table.
#[derive(Debug)]
pub struct ClassEntry {
    pub name: Rc<str>,
    pub parent: Option<Rc<ClassEntry>>,
    pub is_abstract: bool,
    pub(crate) decl: Option<Rc<ClassDecl>>,
    pub(crate) props: Vec<(Rc<str>, PropInit)>,
    pub(crate) consts: Vec<(Rc<str>, Expr)>,
    pub(crate) methods: FxHashMap<Rc<str>, Rc<Method>>,
}

impl ClassEntry {
    /// Build an entry from a script declaration. `parent` must already be
    /// resolved.
    pub(crate) fn from_decl(decl: &Rc<ClassDecl>, parent: Option<Rc<ClassEntry>>) -> Self {
        let mut props: Vec<(Rc<str>, PropInit)> = decl
            .props
            .iter()
            .map(|p| (p.name.clone(), PropInit::Expr(p.default.clone())))
            .collect();

        let mut methods = FxHashMap::default();
        for method in &decl.methods {
            // Promoted constructor parameters become declared properties.
            if method.name.eq_ignore_ascii_case("__construct") {
                for param in method.params.iter().filter(|p| p.promoted) {
                    props.push((param.name.clone(), PropInit::Expr(None)));
                }
            }
            methods.insert(
                Rc::from(method.name.to_ascii_lowercase()),
                Rc::new(Method {
                    decl: method.clone(),
                    class: decl.name.clone(),
                }),
            );
        }

        Self {
            name: decl.name.clone(),
            parent,
            is_abstract: decl.is_abstract,
            decl: Some(decl.clone()),
            props,
            consts: decl.consts.clone(),
            methods,
        }
    }

    pub(crate) fn from_native(class: &NativeClass, parent: Option<Rc<ClassEntry>>) -> Self {
        Self {
            name: Rc::from(class.name.as_str()),
            parent,
            is_abstract: false,
            decl: None,
            props: class
                .props
                .iter()
                .map(|(name, value)| (Rc::from(name.as_str()), PropInit::Value(value.clone())))
                .collect(),
            consts: Vec::new(),
            methods: FxHashMap::default(),
        }
    }

    /// Ancestors starting with `self`.
    pub fn lineage(&self) -> impl Iterator<Item = &ClassEntry> {
        std::iter::successors(Some(self), |class| class.parent.as_deref())
    }

    /// True when this class is `name` or extends it (case-insensitive).
    pub fn is_subclass_of(&self, name: &str) -> bool {
        self.lineage().any(|class| class.name.eq_ignore_ascii_case(name))
    }

    pub fn is_throwable(&self) -> bool {
        self.is_subclass_of(THROWABLE)
    }

    /// Resolve a method through the inheritance chain.
    pub fn find_method(&self, name: &str) -> Option<Rc<Method>> {
        let lower = name.to_ascii_lowercase();
        self.lineage()
            .find_map(|class| class.methods.get(lower.as_str()).cloned())
    }

    pub(crate) fn find_const(&self, name: &str) -> Option<(&Expr, &Rc<str>)> {
        self.lineage().find_map(|class| {
            class
                .consts
                .iter()
                .find(|(const_name, _)| &**const_name == name)
                .map(|(_, expr)| (expr, &class.name))
        })
    }

    /// Declared properties, ancestors first; a redeclaration keeps the
    /// ancestor's position and takes the subclass default.
    pub(crate) fn prop_layout(&self) -> Vec<(Rc<str>, PropInit, Rc<str>)> {
        let chain: Vec<&ClassEntry> = self.lineage().collect();
        let mut layout: Vec<(Rc<str>, PropInit, Rc<str>)> = Vec::new();
        for class in chain.into_iter().rev() {
            for (name, init) in &class.props {
                match layout.iter_mut().find(|(existing, _, _)| existing == name) {
                    Some(slot) => {
                        slot.1 = init.clone();
                        slot.2 = class.name.clone();
                    }
                    None => layout.push((name.clone(), init.clone(), class.name.clone())),
                }
            }
        }
        layout
    }

    /// Abstract methods left without an implementation.
    pub(crate) fn unimplemented_abstract(&self) -> Vec<String> {
        let mut seen: Vec<Rc<str>> = Vec::new();
        let mut missing = Vec::new();
        for class in self.lineage() {
            for (lower, method) in &class.methods {
                if seen.contains(lower) {
                    continue;
                }
                seen.push(lower.clone());
                if method.decl.is_abstract {
                    missing.push(format!("{}::{}", method.class, method.decl.name));
                }
            }
        }
        missing.sort();
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
    use crate::parser::parse;

    fn class_decls(src: &str) -> Vec<Rc<ClassDecl>> {
        parse(src, "t")
            .unwrap()
            .stmts
            .into_iter()
            .filter_map(|s| match s.kind {
                StmtKind::Class(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_inheritance_lookup() {
        let decls = class_decls(
            "class A { public $x = 1; public $y; function hello() {} }
             class B extends A { public $x = 2; public $z; function __construct(public $w) {} }",
        );
        let a = Rc::new(ClassEntry::from_decl(&decls[0], None));
        let b = ClassEntry::from_decl(&decls[1], Some(a));

        assert!(b.is_subclass_of("a"));
        assert!(!b.is_throwable());
        assert_eq!(&*b.find_method("HELLO").unwrap().class, "A");

        let names: Vec<String> = b.prop_layout().iter().map(|(n, _, _)| n.to_string()).collect();
        assert_eq!(names, vec!["x", "y", "z", "w"]);
    }

    #[test]
    fn test_abstract_methods_reported() {
        let decls = class_decls(
            "abstract class Shape { abstract function area(); function name() {} }
             class Blob extends Shape {}
             class Square extends Shape { function area() { return 4; } }",
        );
        let shape = Rc::new(ClassEntry::from_decl(&decls[0], None));
        let blob = ClassEntry::from_decl(&decls[1], Some(shape.clone()));
        let square = ClassEntry::from_decl(&decls[2], Some(shape));
        assert_eq!(blob.unimplemented_abstract(), vec!["Shape::area".to_string()]);
        assert!(square.unimplemented_abstract().is_empty());
    }

    #[test]
    fn test_prelude_parses() {
        let decls = class_decls(PRELUDE);
        assert!(decls.iter().any(|c| &*c.name == "DivisionByZeroError"));
    }
}
