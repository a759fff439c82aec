//! Recursive-descent parser producing [`Program`] trees.

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{Lexer, Spanned, TemplatePart, Token};
use std::rc::Rc;

/// Tokenize and parse `source`. `file` is used in error locations.
pub fn parse(source: &str, file: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source, file).tokenize()?;
    Parser::new(tokens, file).program()
}

/// Deepest syntactic nesting accepted. Parenthesized and nested
/// expressions, nested statements and left-deep operator chains all count.
pub(crate) const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    file: String,
    file_name: Rc<str>,
}

type PResult<T> = Result<T, ParseError>;

const RESERVED_NAMES: &[&str] = &[
    "abstract", "and", "as", "break", "case", "catch", "class", "const", "continue", "declare",
    "do", "echo", "else", "elseif", "extends", "final", "finally", "fn", "for", "foreach",
    "function", "if", "implements", "include", "include_once", "instanceof", "interface", "new",
    "or", "print", "private", "protected", "public", "require", "require_once", "return",
    "static", "throw", "try", "unset", "use", "var", "while", "xor",
];

impl Parser {
    fn new(tokens: Vec<Spanned>, file: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            file: file.to_string(),
            file_name: Rc::from(file),
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map(|s| s.line).unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> PResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected_expecting(describe(token)))
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        self.is_kw_at(0, kw)
    }

    fn is_kw_at(&self, offset: usize, kw: &str) -> bool {
        matches!(self.peek_at(offset), Token::Ident(name) if name.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected_expecting(format!("\"{kw}\"")))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            file: self.file.clone(),
            line: self.line(),
        }
    }

    fn too_deep(&self) -> ParseError {
        self.error(format!("maximum nesting level of {MAX_NESTING} exceeded"))
    }

    /// Run `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Count one more link of a left-deep operator chain.
    fn link(&self, links: &mut usize) -> PResult<()> {
        *links += 1;
        if self.depth + *links > MAX_NESTING {
            return Err(self.too_deep());
        }
        Ok(())
    }

    fn unexpected(&self) -> ParseError {
        self.error(format!("syntax error, unexpected {}", describe(self.peek())))
    }

    fn unexpected_expecting(&self, expected: impl AsRef<str>) -> ParseError {
        self.error(format!(
            "syntax error, unexpected {}, expecting {}",
            describe(self.peek()),
            expected.as_ref()
        ))
    }

    fn ident(&mut self) -> PResult<Rc<str>> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.pos += 1;
                Ok(Rc::from(name))
            }
            _ => Err(self.unexpected_expecting("identifier")),
        }
    }

    /// Name of a declared function, class or method; reserved words rejected.
    fn decl_name(&mut self) -> PResult<Rc<str>> {
        if let Token::Ident(name) = self.peek() {
            if RESERVED_NAMES.iter().any(|kw| name.eq_ignore_ascii_case(kw)) {
                return Err(self.unexpected_expecting("identifier"));
            }
        }
        self.ident()
    }

    fn variable(&mut self) -> PResult<Rc<str>> {
        match self.peek().clone() {
            Token::Variable(name) => {
                self.pos += 1;
                Ok(Rc::from(name))
            }
            _ => Err(self.unexpected_expecting("variable")),
        }
    }

    fn end_statement(&mut self) -> PResult<()> {
        if self.eat(&Token::Semicolon) || self.check(&Token::Eof) {
            Ok(())
        } else {
            Err(self.unexpected_expecting("\";\""))
        }
    }

    fn program(mut self) -> PResult<Program> {
        let mut stmts = Vec::new();
        while !self.check(&Token::Eof) {
            stmts.push(self.statement()?);
        }
        Ok(Program { stmts })
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.unexpected());
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    /// Either a braced block or a single statement.
    fn body(&mut self) -> PResult<Vec<Stmt>> {
        if self.check(&Token::LBrace) {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = self.nested(Self::statement_kind)?;
        Ok(Stmt { kind, line })
    }

    fn statement_kind(&mut self) -> PResult<StmtKind> {
        if self.eat(&Token::Semicolon) {
            return Ok(StmtKind::Nop);
        }
        if self.check(&Token::LBrace) {
            return Ok(StmtKind::Block(self.block()?));
        }

        if self.eat_kw("echo") {
            let mut exprs = vec![self.expr()?];
            while self.eat(&Token::Comma) {
                exprs.push(self.expr()?);
            }
            self.end_statement()?;
            return Ok(StmtKind::Echo(exprs));
        }
        if self.eat_kw("return") {
            let value = if self.check(&Token::Semicolon) || self.check(&Token::Eof) {
                None
            } else {
                Some(self.expr()?)
            };
            self.end_statement()?;
            return Ok(StmtKind::Return(value));
        }
        if self.eat_kw("if") {
            return self.if_statement();
        }
        if self.eat_kw("while") {
            self.expect(&Token::LParen)?;
            let cond = self.expr()?;
            self.expect(&Token::RParen)?;
            let body = self.body()?;
            return Ok(StmtKind::While { cond, body });
        }
        if self.eat_kw("do") {
            let body = self.body()?;
            self.expect_kw("while")?;
            self.expect(&Token::LParen)?;
            let cond = self.expr()?;
            self.expect(&Token::RParen)?;
            self.end_statement()?;
            return Ok(StmtKind::DoWhile { body, cond });
        }
        if self.eat_kw("for") {
            return self.for_statement();
        }
        if self.eat_kw("foreach") {
            return self.foreach_statement();
        }
        if self.eat_kw("break") {
            let levels = self.loop_levels()?;
            return Ok(StmtKind::Break(levels));
        }
        if self.eat_kw("continue") {
            let levels = self.loop_levels()?;
            return Ok(StmtKind::Continue(levels));
        }
        if self.is_kw("function") && matches!(self.peek_at(1), Token::Ident(_)) {
            self.pos += 1;
            let decl = self.function_rest(false, false)?;
            return Ok(StmtKind::Function(Rc::new(decl)));
        }
        if self.is_kw("class")
            || ((self.is_kw("abstract") || self.is_kw("final")) && self.is_kw_at(1, "class"))
        {
            let is_abstract = self.eat_kw("abstract");
            self.eat_kw("final");
            self.expect_kw("class")?;
            return Ok(StmtKind::Class(Rc::new(self.class_rest(is_abstract)?)));
        }
        if self.eat_kw("try") {
            return self.try_statement();
        }
        if self.is_kw("throw") {
            self.pos += 1;
            let value = self.expr()?;
            self.end_statement()?;
            return Ok(StmtKind::Throw(value));
        }
        if self.is_kw("unset") && self.peek_at(1) == &Token::LParen {
            self.pos += 2;
            let mut targets = Vec::new();
            if !self.check(&Token::RParen) {
                loop {
                    let target = self.expr()?;
                    if !is_lvalue(&target) {
                        return Err(self.error("Cannot unset the result of an expression"));
                    }
                    targets.push(target);
                    if !self.eat(&Token::Comma) || self.check(&Token::RParen) {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
            self.end_statement()?;
            return Ok(StmtKind::Unset(targets));
        }
        if self.is_kw("declare") && self.peek_at(1) == &Token::LParen {
            self.pos += 2;
            while !self.eat(&Token::RParen) {
                if self.check(&Token::Eof) {
                    return Err(self.unexpected());
                }
                self.pos += 1;
            }
            self.end_statement()?;
            return Ok(StmtKind::Nop);
        }

        let expr = self.expr()?;
        self.end_statement()?;
        Ok(StmtKind::Expr(expr))
    }

    fn loop_levels(&mut self) -> PResult<u32> {
        let levels = match self.peek() {
            Token::Int(n) if *n >= 1 => {
                let n = *n as u32;
                self.pos += 1;
                n
            }
            Token::Int(_) => return Err(self.error("'break' operator accepts only positive integers")),
            _ => 1,
        };
        self.end_statement()?;
        Ok(levels)
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        self.expect(&Token::LParen)?;
        let cond = self.expr()?;
        self.expect(&Token::RParen)?;
        let then = self.body()?;

        let mut elifs = Vec::new();
        let mut els = None;
        loop {
            if self.eat_kw("elseif") || (self.is_kw("else") && self.is_kw_at(1, "if")) {
                if self.is_kw("else") {
                    self.pos += 2;
                }
                self.expect(&Token::LParen)?;
                let c = self.expr()?;
                self.expect(&Token::RParen)?;
                elifs.push((c, self.body()?));
            } else if self.eat_kw("else") {
                els = Some(self.body()?);
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If {
            cond,
            then,
            elifs,
            els,
        })
    }

    fn expr_list(&mut self, terminator: &Token) -> PResult<Vec<Expr>> {
        let mut exprs = Vec::new();
        if self.check(terminator) {
            return Ok(exprs);
        }
        loop {
            exprs.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(exprs)
    }

    fn for_statement(&mut self) -> PResult<StmtKind> {
        self.expect(&Token::LParen)?;
        let init = self.expr_list(&Token::Semicolon)?;
        self.expect(&Token::Semicolon)?;
        let cond = self.expr_list(&Token::Semicolon)?;
        self.expect(&Token::Semicolon)?;
        let step = self.expr_list(&Token::RParen)?;
        self.expect(&Token::RParen)?;
        let body = self.body()?;
        Ok(StmtKind::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn foreach_statement(&mut self) -> PResult<StmtKind> {
        self.expect(&Token::LParen)?;
        let subject = self.expr()?;
        self.expect_kw("as")?;
        if self.check(&Token::Ampersand) {
            return Err(self.error("foreach by reference is not supported"));
        }
        let first = self.variable()?;
        let (key, value) = if self.eat(&Token::DoubleArrow) {
            if self.check(&Token::Ampersand) {
                return Err(self.error("foreach by reference is not supported"));
            }
            (Some(first), self.variable()?)
        } else {
            (None, first)
        };
        self.expect(&Token::RParen)?;
        let body = self.body()?;
        Ok(StmtKind::Foreach {
            subject,
            key,
            value,
            body,
        })
    }

    fn try_statement(&mut self) -> PResult<StmtKind> {
        let body = self.block()?;
        let mut catches = Vec::new();
        while self.eat_kw("catch") {
            self.expect(&Token::LParen)?;
            let mut types = vec![self.ident()?];
            while self.eat(&Token::Pipe) {
                types.push(self.ident()?);
            }
            let var = match self.peek() {
                Token::Variable(_) => Some(self.variable()?),
                _ => None,
            };
            self.expect(&Token::RParen)?;
            let body = self.block()?;
            catches.push(Catch { types, var, body });
        }
        let finally = if self.eat_kw("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if catches.is_empty() && finally.is_none() {
            return Err(self.error("Cannot use try without catch or finally"));
        }
        Ok(StmtKind::Try {
            body,
            catches,
            finally,
        })
    }

    fn type_hint(&mut self) -> PResult<Option<TypeHint>> {
        let nullable = self.eat(&Token::Question);
        if !matches!(self.peek(), Token::Ident(_)) {
            if nullable {
                return Err(self.unexpected_expecting("type"));
            }
            return Ok(None);
        }
        let mut names = vec![self.ident()?];
        while self.check(&Token::Pipe) && matches!(self.peek_at(1), Token::Ident(_)) {
            self.pos += 1;
            names.push(self.ident()?);
        }
        Ok(Some(TypeHint { nullable, names }))
    }

    fn params(&mut self, allow_promotion: bool) -> PResult<Vec<Param>> {
        self.expect(&Token::LParen)?;
        let mut params: Vec<Param> = Vec::new();
        while !self.check(&Token::RParen) {
            let mut promoted = false;
            while ["public", "protected", "private", "readonly"]
                .iter()
                .any(|m| self.is_kw(m))
            {
                if !allow_promotion {
                    return Err(self.error("Cannot declare promoted property outside a constructor"));
                }
                promoted = true;
                self.pos += 1;
            }
            let ty = self.type_hint()?;
            if self.check(&Token::Ampersand) {
                return Err(self.error("By-reference parameters are not supported"));
            }
            let variadic = self.eat(&Token::Ellipsis);
            let name = self.variable()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("Redefinition of parameter ${name}")));
            }
            let default = if self.eat(&Token::Assign) {
                Some(self.expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                ty,
                default,
                variadic,
                promoted,
            });
            if variadic && !self.check(&Token::RParen) {
                return Err(self.error("Only the last parameter can be variadic"));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    fn return_type(&mut self) -> PResult<Option<TypeHint>> {
        if self.eat(&Token::Colon) {
            match self.type_hint()? {
                Some(hint) => Ok(Some(hint)),
                None => Err(self.unexpected_expecting("type")),
            }
        } else {
            Ok(None)
        }
    }

    /// After `function`: name, parameters, return type and body.
    fn function_rest(&mut self, is_method: bool, is_static: bool) -> PResult<FunctionDecl> {
        let line = self.line();
        let name = if is_method { self.ident()? } else { self.decl_name()? };
        let is_ctor = is_method && name.eq_ignore_ascii_case("__construct");
        let params = self.params(is_ctor)?;
        let ret = self.return_type()?;
        let body = self.block()?;
        Ok(FunctionDecl {
            name,
            params,
            ret,
            body,
            uses: Vec::new(),
            is_arrow: false,
            is_static,
            is_abstract: false,
            file: self.file_name.clone(),
            line,
        })
    }

    fn class_rest(&mut self, is_abstract: bool) -> PResult<ClassDecl> {
        let line = self.line();
        let name = self.decl_name()?;
        let parent = if self.eat_kw("extends") {
            Some(self.ident()?)
        } else {
            None
        };
        if self.eat_kw("implements") {
            self.ident()?;
            while self.eat(&Token::Comma) {
                self.ident()?;
            }
        }
        self.expect(&Token::LBrace)?;

        let mut class = ClassDecl {
            name,
            parent,
            is_abstract,
            props: Vec::new(),
            consts: Vec::new(),
            methods: Vec::new(),
            line,
        };

        while !self.eat(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.unexpected());
            }
            self.class_member(&mut class)?;
        }
        Ok(class)
    }

    fn class_member(&mut self, class: &mut ClassDecl) -> PResult<()> {
        let mut is_static = false;
        let mut is_abstract = false;
        loop {
            if self.eat_kw("static") {
                is_static = true;
            } else if self.eat_kw("abstract") {
                is_abstract = true;
            } else if ["public", "protected", "private", "final", "readonly", "var"]
                .iter()
                .any(|m| self.eat_kw(m))
            {
            } else {
                break;
            }
        }

        if self.eat_kw("const") {
            loop {
                let name = self.ident()?;
                self.expect(&Token::Assign)?;
                let value = self.expr()?;
                class.consts.push((name, value));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            return self.end_statement();
        }

        if self.eat_kw("function") {
            if is_abstract {
                let line = self.line();
                let name = self.ident()?;
                let params = self.params(false)?;
                let ret = self.return_type()?;
                self.end_statement()?;
                class.methods.push(Rc::new(FunctionDecl {
                    name,
                    params,
                    ret,
                    body: Vec::new(),
                    uses: Vec::new(),
                    is_arrow: false,
                    is_static,
                    is_abstract: true,
                    file: self.file_name.clone(),
                    line,
                }));
                return Ok(());
            }
            let method = self.function_rest(true, is_static)?;
            if class
                .methods
                .iter()
                .any(|m| m.name.eq_ignore_ascii_case(&method.name))
            {
                return Err(self.error(format!(
                    "Cannot redeclare {}::{}()",
                    class.name, method.name
                )));
            }
            class.methods.push(Rc::new(method));
            return Ok(());
        }

        if is_static {
            return Err(self.error("Static properties are not supported"));
        }
        // Optional property type.
        if !matches!(self.peek(), Token::Variable(_)) {
            self.type_hint()?;
        }
        loop {
            let name = self.variable()?;
            let default = if self.eat(&Token::Assign) {
                Some(self.expr()?)
            } else {
                None
            };
            class.props.push(PropDecl { name, default });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.end_statement()
    }

    fn closure(&mut self, is_static: bool) -> PResult<Expr> {
        let line = self.line();
        if self.eat_kw("fn") {
            let params = self.params(false)?;
            let ret = self.return_type()?;
            self.expect(&Token::DoubleArrow)?;
            let body_line = self.line();
            let value = self.assignment()?;
            return Ok(Expr::Closure(Rc::new(FunctionDecl {
                name: Rc::from("{closure}"),
                params,
                ret,
                body: vec![Stmt {
                    kind: StmtKind::Return(Some(value)),
                    line: body_line,
                }],
                uses: Vec::new(),
                is_arrow: true,
                is_static,
                is_abstract: false,
                file: self.file_name.clone(),
                line,
            })));
        }

        self.expect_kw("function")?;
        if self.check(&Token::Ampersand) {
            return Err(self.error("Return by reference is not supported"));
        }
        let params = self.params(false)?;
        let mut uses = Vec::new();
        if self.eat_kw("use") {
            self.expect(&Token::LParen)?;
            while !self.check(&Token::RParen) {
                if self.check(&Token::Ampersand) {
                    return Err(self.error("Capture by reference is not supported"));
                }
                uses.push(self.variable()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        let ret = self.return_type()?;
        let body = self.block()?;
        Ok(Expr::Closure(Rc::new(FunctionDecl {
            name: Rc::from("{closure}"),
            params,
            ret,
            body,
            uses,
            is_arrow: false,
            is_static,
            is_abstract: false,
            file: self.file_name.clone(),
            line,
        })))
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.low_or()
    }

    fn low_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.low_xor()?;
        let mut links = 0;
        while self.eat_kw("or") {
            self.link(&mut links)?;
            let rhs = self.low_xor()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn low_xor(&mut self) -> PResult<Expr> {
        let mut lhs = self.low_and()?;
        let mut links = 0;
        while self.eat_kw("xor") {
            self.link(&mut links)?;
            let rhs = self.low_and()?;
            lhs = Expr::Xor(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn low_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.assignment()?;
        let mut links = 0;
        while self.eat_kw("and") {
            self.link(&mut links)?;
            let rhs = self.assignment()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn assignment(&mut self) -> PResult<Expr> {
        self.nested(Self::assignment_expr)
    }

    fn assignment_expr(&mut self) -> PResult<Expr> {
        if self.is_kw("print") {
            self.pos += 1;
            return Ok(Expr::Print(Box::new(self.assignment()?)));
        }
        if self.is_kw("throw") {
            self.pos += 1;
            return Ok(Expr::Throw(Box::new(self.assignment()?)));
        }

        let lhs = self.ternary()?;
        let op = match self.peek() {
            Token::Assign => None,
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            Token::PercentAssign => Some(BinaryOp::Mod),
            Token::DotAssign => Some(BinaryOp::Concat),
            Token::CoalesceAssign => {
                self.require_lvalue(&lhs)?;
                self.pos += 1;
                let rhs = self.assignment()?;
                return Ok(Expr::CoalesceAssign(Box::new(lhs), Box::new(rhs)));
            }
            _ => return Ok(lhs),
        };
        self.require_lvalue(&lhs)?;
        self.pos += 1;
        if op.is_none() && self.check(&Token::Ampersand) {
            return Err(self.error("Assignment by reference is not supported"));
        }
        let rhs = self.assignment()?;
        Ok(match op {
            None => Expr::Assign(Box::new(lhs), Box::new(rhs)),
            Some(op) => Expr::CompoundAssign(op, Box::new(lhs), Box::new(rhs)),
        })
    }

    fn require_lvalue(&self, expr: &Expr) -> PResult<()> {
        if is_lvalue(expr) {
            Ok(())
        } else {
            Err(self.error("syntax error, cannot assign to this expression"))
        }
    }

    fn ternary(&mut self) -> PResult<Expr> {
        let cond = self.coalesce()?;
        if !self.check(&Token::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let then = if self.eat(&Token::Colon) {
            None
        } else {
            let then = self.assignment()?;
            self.expect(&Token::Colon)?;
            Some(Box::new(then))
        };
        let els = self.assignment()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then,
            els: Box::new(els),
        })
    }

    fn coalesce(&mut self) -> PResult<Expr> {
        let lhs = self.logical_or()?;
        if self.eat(&Token::Coalesce) {
            let rhs = self.nested(Self::coalesce)?;
            return Ok(Expr::Coalesce(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.logical_and()?;
        let mut links = 0;
        while self.eat(&Token::OrOr) {
            self.link(&mut links)?;
            let rhs = self.logical_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.equality()?;
        let mut links = 0;
        while self.eat(&Token::AndAnd) {
            self.link(&mut links)?;
            let rhs = self.equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let lhs = self.comparison()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::NotEq,
            Token::Identical => BinaryOp::Identical,
            Token::NotIdentical => BinaryOp::NotIdentical,
            Token::Spaceship => BinaryOp::Spaceship,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.comparison()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let lhs = self.concat()?;
        let op = match self.peek() {
            Token::Lt => BinaryOp::Lt,
            Token::Gt => BinaryOp::Gt,
            Token::Le => BinaryOp::Le,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.concat()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn concat(&mut self) -> PResult<Expr> {
        let mut lhs = self.additive()?;
        let mut links = 0;
        while self.eat(&Token::Dot) {
            self.link(&mut links)?;
            let rhs = self.additive()?;
            lhs = Expr::Binary(BinaryOp::Concat, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.multiplicative()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.link(&mut links)?;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.link(&mut links)?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        match self.peek().clone() {
            Token::Bang => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.nested(Self::unary)?)))
            }
            Token::Minus => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::unary)?)))
            }
            Token::Plus => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.nested(Self::unary)?)))
            }
            Token::Cast(kind) => {
                self.pos += 1;
                Ok(Expr::Cast(kind, Box::new(self.nested(Self::unary)?)))
            }
            Token::Inc | Token::Dec => {
                let increment = self.advance() == Token::Inc;
                let target = self.nested(Self::unary)?;
                self.require_lvalue(&target)?;
                Ok(Expr::IncDec {
                    target: Box::new(target),
                    prefix: true,
                    increment,
                })
            }
            _ => self.instanceof(),
        }
    }

    fn instanceof(&mut self) -> PResult<Expr> {
        let mut lhs = self.power()?;
        let mut links = 0;
        while self.eat_kw("instanceof") {
            self.link(&mut links)?;
            let class = self.ident()?;
            lhs = Expr::InstanceOf(Box::new(lhs), class);
        }
        Ok(lhs)
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.nested(Self::unary)?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn args(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            if self.check(&Token::Ellipsis) {
                return Err(self.error("Argument unpacking is not supported"));
            }
            args.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        let mut links = 0;
        loop {
            let line = self.line();
            let chained = match self.peek() {
                Token::LBracket | Token::Arrow | Token::LParen => true,
                Token::Question => self.peek_at(1) == &Token::Arrow,
                _ => false,
            };
            if chained {
                self.link(&mut links)?;
            }
            match self.peek() {
                Token::LBracket => {
                    self.pos += 1;
                    let index = if self.check(&Token::RBracket) {
                        None
                    } else {
                        Some(Box::new(self.expr()?))
                    };
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index,
                    };
                }
                Token::Arrow => {
                    self.pos += 1;
                    expr = self.member(expr, false, line)?;
                }
                Token::Question if self.peek_at(1) == &Token::Arrow => {
                    self.pos += 2;
                    expr = self.member(expr, true, line)?;
                }
                Token::LParen => {
                    let args = self.args()?;
                    expr = Expr::CallValue {
                        callee: Box::new(expr),
                        args,
                        line,
                    };
                }
                Token::Inc | Token::Dec => {
                    if !is_lvalue(&expr) {
                        return Ok(expr);
                    }
                    let increment = self.advance() == Token::Inc;
                    expr = Expr::IncDec {
                        target: Box::new(expr),
                        prefix: false,
                        increment,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn interpolated(&self, part: TemplatePart) -> PResult<Interpolated> {
        Ok(match part {
            TemplatePart::Lit(text) => Interpolated::Lit(Rc::from(text)),
            TemplatePart::Var(name) => Interpolated::Expr(Expr::Var(Rc::from(name))),
            TemplatePart::Code(code, line) => {
                let tokens = Lexer::new(&code, &self.file).starting_at(line).tokenize()?;
                let mut inner = Parser::new(tokens, &self.file);
                inner.depth = self.depth;
                let expr = inner.nested(Self::expr)?;
                if !inner.check(&Token::Eof) {
                    return Err(inner.unexpected());
                }
                Interpolated::Expr(expr)
            }
        })
    }

    fn member(&mut self, object: Expr, nullsafe: bool, line: u32) -> PResult<Expr> {
        let name = self.ident()?;
        if self.check(&Token::LParen) {
            let args = self.args()?;
            return Ok(Expr::MethodCall {
                object: Box::new(object),
                method: name,
                args,
                nullsafe,
                line,
            });
        }
        Ok(Expr::Prop {
            base: Box::new(object),
            name,
            nullsafe,
        })
    }

    fn array_items(&mut self, close: &Token) -> PResult<Vec<ArrayItem>> {
        let mut items = Vec::new();
        while !self.check(close) {
            let spread = self.eat(&Token::Ellipsis);
            if self.check(&Token::Ampersand) {
                return Err(self.error("References in arrays are not supported"));
            }
            let first = self.expr()?;
            let item = if !spread && self.eat(&Token::DoubleArrow) {
                ArrayItem {
                    key: Some(first),
                    value: self.expr()?,
                    spread: false,
                }
            } else {
                ArrayItem {
                    key: None,
                    value: first,
                    spread,
                }
            };
            items.push(item);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Token::Variable(name) => {
                self.pos += 1;
                Ok(Expr::Var(Rc::from(name)))
            }
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Int(i))
            }
            Token::Float(f) => {
                self.pos += 1;
                Ok(Expr::Float(f))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Str(Rc::from(s)))
            }
            Token::Template(parts) => {
                self.pos += 1;
                let parts = parts
                    .into_iter()
                    .map(|part| self.interpolated(part))
                    .collect::<PResult<_>>()?;
                Ok(Expr::Template(parts))
            }
            Token::LBracket => {
                self.pos += 1;
                Ok(Expr::Array(self.array_items(&Token::RBracket)?))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => self.named(name, line),
            _ => Err(self.unexpected()),
        }
    }

    /// Expressions introduced by a bare identifier.
    fn named(&mut self, name: String, line: u32) -> PResult<Expr> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "true" => {
                self.pos += 1;
                return Ok(Expr::Bool(true));
            }
            "false" => {
                self.pos += 1;
                return Ok(Expr::Bool(false));
            }
            "null" => {
                self.pos += 1;
                return Ok(Expr::Null);
            }
            "array" if self.peek_at(1) == &Token::LParen => {
                self.pos += 2;
                return Ok(Expr::Array(self.array_items(&Token::RParen)?));
            }
            "isset" if self.peek_at(1) == &Token::LParen => {
                self.pos += 1;
                let args = self.args()?;
                if args.is_empty() || !args.iter().all(is_lvalue) {
                    return Err(self.error("Cannot use isset() on the result of an expression"));
                }
                return Ok(Expr::Isset(args));
            }
            "empty" if self.peek_at(1) == &Token::LParen => {
                self.pos += 2;
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                return Ok(Expr::Empty(Box::new(inner)));
            }
            "new" => {
                self.pos += 1;
                if self.is_kw("class") {
                    return Err(self.error("Anonymous classes are not supported"));
                }
                let class = self.ident()?;
                let args = if self.check(&Token::LParen) {
                    self.args()?
                } else {
                    Vec::new()
                };
                return Ok(Expr::New { class, args, line });
            }
            "function" | "fn" => return self.closure(false),
            "static" if self.is_kw_at(1, "function") || self.is_kw_at(1, "fn") => {
                self.pos += 1;
                return self.closure(true);
            }
            "include" | "include_once" | "require" | "require_once" => {
                self.pos += 1;
                let path = self.assignment()?;
                return Ok(Expr::Include {
                    path: Box::new(path),
                    require: lower.starts_with("require"),
                    once: lower.ends_with("_once"),
                });
            }
            _ => {}
        }

        self.pos += 1;
        let name: Rc<str> = Rc::from(name);
        if self.check(&Token::LParen) {
            let args = self.args()?;
            return Ok(Expr::Call { name, args, line });
        }
        if self.eat(&Token::DoubleColon) {
            if matches!(self.peek(), Token::Variable(_)) {
                return Err(self.error("Static properties are not supported"));
            }
            let member = self.ident()?;
            if self.check(&Token::LParen) {
                let args = self.args()?;
                return Ok(Expr::StaticCall {
                    class: name,
                    method: member,
                    args,
                    line,
                });
            }
            return Ok(Expr::ClassConst {
                class: name,
                name: member,
            });
        }
        Ok(Expr::Const(name))
    }
}

/// Expressions that denote a storage location.
pub fn is_lvalue(expr: &Expr) -> bool {
    match expr {
        Expr::Var(_) => true,
        Expr::Index { base, .. } => is_lvalue(base) || is_readable_base(base),
        Expr::Prop { .. } => true,
        _ => false,
    }
}

fn is_readable_base(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Call { .. } | Expr::MethodCall { .. } | Expr::StaticCall { .. } | Expr::CallValue { .. }
    )
}

fn describe(token: &Token) -> String {
    match token {
        Token::Variable(name) => format!("variable \"${name}\""),
        Token::Ident(name) => format!("identifier \"{name}\""),
        Token::Int(i) => format!("integer \"{i}\""),
        Token::Float(f) => format!("floating-point number \"{f}\""),
        Token::Str(_) | Token::Template(_) => "string content".to_string(),
        Token::Cast(_) => "type cast".to_string(),
        Token::Eof => "end of file".to_string(),
        other => format!("\"{}\"", punct(other)),
    }
}

fn punct(token: &Token) -> &'static str {
    match token {
        Token::LParen => "(",
        Token::RParen => ")",
        Token::LBrace => "{",
        Token::RBrace => "}",
        Token::LBracket => "[",
        Token::RBracket => "]",
        Token::Semicolon => ";",
        Token::Comma => ",",
        Token::Arrow => "->",
        Token::DoubleArrow => "=>",
        Token::DoubleColon => "::",
        Token::Question => "?",
        Token::Colon => ":",
        Token::Pipe => "|",
        Token::Ampersand => "&",
        Token::Ellipsis => "...",
        Token::Assign => "=",
        Token::PlusAssign => "+=",
        Token::MinusAssign => "-=",
        Token::StarAssign => "*=",
        Token::SlashAssign => "/=",
        Token::PercentAssign => "%=",
        Token::DotAssign => ".=",
        Token::CoalesceAssign => "??=",
        Token::Plus => "+",
        Token::Minus => "-",
        Token::Star => "*",
        Token::StarStar => "**",
        Token::Slash => "/",
        Token::Percent => "%",
        Token::Dot => ".",
        Token::Bang => "!",
        Token::EqEq => "==",
        Token::NotEq => "!=",
        Token::Identical => "===",
        Token::NotIdentical => "!==",
        Token::Lt => "<",
        Token::Gt => ">",
        Token::Le => "<=",
        Token::Ge => ">=",
        Token::Spaceship => "<=>",
        Token::AndAnd => "&&",
        Token::OrOr => "||",
        Token::Coalesce => "??",
        Token::Inc => "++",
        Token::Dec => "--",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmts(src: &str) -> Vec<Stmt> {
        parse(src, "test.php").unwrap().stmts
    }

    fn expr(src: &str) -> Expr {
        match stmts(&format!("{src};")).remove(0).kind {
            StmtKind::Expr(e) => e,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let e = expr("1 + 2 * 3");
        let Expr::Binary(BinaryOp::Add, lhs, rhs) = e else {
            panic!("expected addition at the root");
        };
        assert!(matches!(*lhs, Expr::Int(1)));
        assert!(matches!(*rhs, Expr::Binary(BinaryOp::Mul, _, _)));

        // Unary minus binds looser than `**`.
        let e = expr("-2 ** 2");
        assert!(matches!(e, Expr::Unary(UnaryOp::Neg, inner) if matches!(*inner, Expr::Binary(BinaryOp::Pow, _, _))));

        // `.` binds looser than `+`.
        let e = expr("'a' . 1 + 2");
        assert!(matches!(e, Expr::Binary(BinaryOp::Concat, _, _)));
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let e = expr("$a = $b = 3");
        let Expr::Assign(_, rhs) = e else {
            panic!("expected assignment");
        };
        assert!(matches!(*rhs, Expr::Assign(_, _)));
    }

    #[test]
    fn test_nested_write_targets() {
        let e = expr("$a['x'][] = 1");
        let Expr::Assign(target, _) = e else {
            panic!("expected assignment");
        };
        assert!(matches!(*target, Expr::Index { index: None, .. }));

        assert!(parse("1 = 2;", "t").is_err());
    }

    #[test]
    fn test_function_and_class_declarations() {
        let program = stmts(
            r#"<?php
            function add(int $a, int $b = 2): int { return $a + $b; }
            abstract class Shape {
                const SIDES = 0;
                public function __construct(protected string $name) {}
                abstract public function area(): float;
                public static function make() { return null; }
            }
            class Square extends Shape { private $side = 1; }
            "#,
        );
        assert_eq!(program.len(), 3);

        let StmtKind::Function(add) = &program[0].kind else {
            panic!("expected function");
        };
        assert_eq!(&*add.name, "add");
        assert_eq!(add.required_params(), 1);
        assert_eq!(add.ret.as_ref().unwrap().render(), "int");

        let StmtKind::Class(shape) = &program[1].kind else {
            panic!("expected class");
        };
        assert!(shape.is_abstract);
        assert_eq!(shape.methods.len(), 3);
        assert!(shape.methods[0].params[0].promoted);
        assert!(shape.methods[2].is_static);

        let StmtKind::Class(square) = &program[2].kind else {
            panic!("expected class");
        };
        assert_eq!(square.parent.as_deref(), Some("Shape"));
        assert_eq!(square.props.len(), 1);
    }

    #[test]
    fn test_closures() {
        let e = expr("function ($x) use ($y) { return $x + $y; }");
        let Expr::Closure(decl) = e else {
            panic!("expected closure");
        };
        assert_eq!(decl.uses.len(), 1);
        assert!(!decl.is_arrow);

        let e = expr("fn($x) => $x * 2");
        let Expr::Closure(decl) = e else {
            panic!("expected arrow fn");
        };
        assert!(decl.is_arrow);
        assert_eq!(decl.body.len(), 1);
    }

    #[test]
    fn test_control_flow() {
        let program = stmts(
            r#"
            if ($a) { echo 1; } elseif ($b) { echo 2; } else if ($c) echo 3; else { echo 4; }
            foreach ($items as $k => $v) { continue; }
            for ($i = 0; $i < 3; $i++) { break 1; }
            try { throw new Exception("x"); } catch (TypeError | Exception $e) {} finally {}
            "#,
        );
        let StmtKind::If { elifs, els, .. } = &program[0].kind else {
            panic!("expected if");
        };
        assert_eq!(elifs.len(), 2);
        assert!(els.is_some());
        assert!(matches!(&program[1].kind, StmtKind::Foreach { key: Some(_), .. }));
        assert!(matches!(&program[2].kind, StmtKind::For { .. }));
        let StmtKind::Try { catches, finally, .. } = &program[3].kind else {
            panic!("expected try");
        };
        assert_eq!(catches[0].types.len(), 2);
        assert!(finally.is_some());
    }

    #[test]
    fn test_method_chain_and_static_call() {
        let e = expr("$obj?->child->run(1)");
        assert!(matches!(e, Expr::MethodCall { .. }));
        let e = expr("Foo::bar(1, 2)");
        assert!(matches!(e, Expr::StaticCall { ref args, .. } if args.len() == 2));
        let e = expr("Foo::BAR");
        assert!(matches!(e, Expr::ClassConst { .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("<?php return {}1{};", "(".repeat(200_000), ")".repeat(200_000));
        let err = parse(&deep, "deep.php").unwrap_err();
        assert_eq!(err.message, "maximum nesting level of 128 exceeded");
        assert_eq!(err.line, 1);

        let negations = format!("<?php return {}1;", "-".repeat(50_000));
        assert!(parse(&negations, "deep.php").is_err());
        let sum = format!("<?php return 1{};", "+1".repeat(50_000));
        assert!(parse(&sum, "deep.php").is_err());
        let blocks = format!("<?php {}{}", "{".repeat(10_000), "}".repeat(10_000));
        assert!(parse(&blocks, "deep.php").is_err());

        // Moderate nesting is untouched.
        let fine = format!("<?php return {}1{};", "(".repeat(40), ")".repeat(40));
        assert!(parse(&fine, "ok.php").is_ok());
        assert!(parse(&format!("<?php return 1{};", "+1".repeat(100)), "ok.php").is_ok());
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse("<?php\n$a = ;\n", "bad.php").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.file, "bad.php");
        assert!(err.message.starts_with("syntax error, unexpected \";\""));
    }

    #[test]
    fn test_reserved_function_name_rejected() {
        assert!(parse("function while() {}", "t").is_err());
    }
}
