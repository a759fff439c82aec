//! Syntax tree produced by the parser.

use crate::lexer::CastKind;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Echo(Vec<Expr>),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        elifs: Vec<(Expr, Vec<Stmt>)>,
        els: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        init: Vec<Expr>,
        cond: Vec<Expr>,
        step: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Foreach {
        subject: Expr,
        key: Option<Rc<str>>,
        value: Rc<str>,
        body: Vec<Stmt>,
    },
    Break(u32),
    Continue(u32),
    Function(Rc<FunctionDecl>),
    Class(Rc<ClassDecl>),
    Try {
        body: Vec<Stmt>,
        catches: Vec<Catch>,
        finally: Option<Vec<Stmt>>,
    },
    Throw(Expr),
    Unset(Vec<Expr>),
    Block(Vec<Stmt>),
    Nop,
}

#[derive(Debug, Clone)]
pub struct Catch {
    pub types: Vec<Rc<str>>,
    pub var: Option<Rc<str>>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct TypeHint {
    pub nullable: bool,
    pub names: Vec<Rc<str>>,
}

impl TypeHint {
    /// Render as written, e.g. `?int` or `int|string`.
    pub fn render(&self) -> String {
        let joined = self
            .names
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("|");
        if self.nullable {
            format!("?{joined}")
        } else {
            joined
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Rc<str>,
    pub ty: Option<TypeHint>,
    pub default: Option<Expr>,
    pub variadic: bool,
    /// Constructor parameter promoted to a property of the same name.
    pub promoted: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: Rc<str>,
    pub params: Vec<Param>,
    pub ret: Option<TypeHint>,
    pub body: Vec<Stmt>,
    pub uses: Vec<Rc<str>>,
    pub is_arrow: bool,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Script the declaration was parsed from.
    pub file: Rc<str>,
    pub line: u32,
}

impl FunctionDecl {
    /// Number of parameters without a default value.
    pub fn required_params(&self) -> usize {
        self.params
            .iter()
            .take_while(|p| p.default.is_none() && !p.variadic)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct PropDecl {
    pub name: Rc<str>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: Rc<str>,
    pub parent: Option<Rc<str>>,
    pub is_abstract: bool,
    pub props: Vec<PropDecl>,
    pub consts: Vec<(Rc<str>, Expr)>,
    pub methods: Vec<Rc<FunctionDecl>>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct ArrayItem {
    pub key: Option<Expr>,
    pub value: Expr,
    pub spread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Identical,
    NotIdentical,
    Lt,
    Gt,
    Le,
    Ge,
    Spaceship,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Concat => ".",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Identical => "===",
            Self::NotIdentical => "!==",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Spaceship => "<=>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

/// Piece of a double-quoted string.
#[derive(Debug, Clone)]
pub enum Interpolated {
    Lit(Rc<str>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Template(Vec<Interpolated>),
    Var(Rc<str>),
    Const(Rc<str>),
    ClassConst {
        class: Rc<str>,
        name: Rc<str>,
    },
    Array(Vec<ArrayItem>),
    /// `base[index]`; `index` is `None` for the append form `base[]`.
    Index {
        base: Box<Expr>,
        index: Option<Box<Expr>>,
    },
    Prop {
        base: Box<Expr>,
        name: Rc<str>,
        nullsafe: bool,
    },
    Call {
        name: Rc<str>,
        args: Vec<Expr>,
        line: u32,
    },
    CallValue {
        callee: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },
    MethodCall {
        object: Box<Expr>,
        method: Rc<str>,
        args: Vec<Expr>,
        nullsafe: bool,
        line: u32,
    },
    StaticCall {
        class: Rc<str>,
        method: Rc<str>,
        args: Vec<Expr>,
        line: u32,
    },
    New {
        class: Rc<str>,
        args: Vec<Expr>,
        line: u32,
    },
    Closure(Rc<FunctionDecl>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Xor(Box<Expr>, Box<Expr>),
    Coalesce(Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Option<Box<Expr>>,
        els: Box<Expr>,
    },
    Assign(Box<Expr>, Box<Expr>),
    CompoundAssign(BinaryOp, Box<Expr>, Box<Expr>),
    CoalesceAssign(Box<Expr>, Box<Expr>),
    IncDec {
        target: Box<Expr>,
        prefix: bool,
        increment: bool,
    },
    Isset(Vec<Expr>),
    Empty(Box<Expr>),
    Cast(CastKind, Box<Expr>),
    InstanceOf(Box<Expr>, Rc<str>),
    Include {
        path: Box<Expr>,
        require: bool,
        once: bool,
    },
    Print(Box<Expr>),
    Throw(Box<Expr>),
}
