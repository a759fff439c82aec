//! Tokenizer for the script language.

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Variable(String),
    Ident(String),
    Int(i64),
    Float(f64),
    /// Literal string with escapes already resolved.
    Str(String),
    /// Double-quoted string containing `$var` interpolation.
    Template(Vec<TemplatePart>),
    Cast(CastKind),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Arrow,
    DoubleArrow,
    DoubleColon,
    Question,
    Colon,
    Pipe,
    Ampersand,
    Ellipsis,

    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    DotAssign,
    CoalesceAssign,

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Dot,
    Bang,
    EqEq,
    NotEq,
    Identical,
    NotIdentical,
    Lt,
    Gt,
    Le,
    Ge,
    Spaceship,
    AndAnd,
    OrOr,
    Coalesce,
    Inc,
    Dec,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Lit(String),
    Var(String),
    /// Source of an interpolated expression such as `$user->name` or
    /// `{$rows[0]['id']}`, parsed later with the line it started on.
    Code(String, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Int,
    Float,
    String,
    Bool,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    file: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str, file: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
            file,
        }
    }

    /// Start line numbering at `line`, for source cut out of a larger file.
    pub fn starting_at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Tokenize the whole input. A leading `<?php` tag is optional and a
    /// closing `?>` ends the script.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        self.skip_open_tag();
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let line = self.line;
            if self.pos >= self.src.len() || self.starts_with("?>") {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                });
                return Ok(tokens);
            }
            let token = self.next_token()?;
            tokens.push(Spanned { token, line });
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            file: self.file.to_string(),
            line: self.line,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s.as_bytes())
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_open_tag(&mut self) {
        let trimmed = self.text.trim_start();
        if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("<?php") {
            let skipped = self.text.len() - trimmed.len();
            for _ in 0..skipped + 5 {
                self.bump();
            }
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        if self.pos >= self.src.len() {
                            return Err(self.error("Unterminated comment starting"));
                        }
                        if self.starts_with("*/") {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' || self.starts_with("?>") {
                break;
            }
            self.bump();
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        let Some(b) = self.peek() else {
            return Ok(Token::Eof);
        };

        if b == b'$' && self.peek_at(1).is_some_and(is_ident_start) {
            self.bump();
            return Ok(Token::Variable(self.ident()));
        }
        if is_ident_start(b) {
            return Ok(Token::Ident(self.ident()));
        }
        if b.is_ascii_digit() || (b == b'.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())) {
            return self.number();
        }
        if b == b'\'' {
            return self.single_quoted();
        }
        if b == b'"' {
            return self.double_quoted();
        }
        if b == b'(' {
            if let Some(cast) = self.cast() {
                return Ok(Token::Cast(cast));
            }
        }

        const PUNCT: &[(&str, Token)] = &[
            ("===", Token::Identical),
            ("!==", Token::NotIdentical),
            ("<=>", Token::Spaceship),
            ("??=", Token::CoalesceAssign),
            ("...", Token::Ellipsis),
            ("**", Token::StarStar),
            ("==", Token::EqEq),
            ("!=", Token::NotEq),
            ("<>", Token::NotEq),
            ("<=", Token::Le),
            (">=", Token::Ge),
            ("&&", Token::AndAnd),
            ("||", Token::OrOr),
            ("??", Token::Coalesce),
            ("++", Token::Inc),
            ("--", Token::Dec),
            ("->", Token::Arrow),
            ("=>", Token::DoubleArrow),
            ("::", Token::DoubleColon),
            ("+=", Token::PlusAssign),
            ("-=", Token::MinusAssign),
            ("*=", Token::StarAssign),
            ("/=", Token::SlashAssign),
            ("%=", Token::PercentAssign),
            (".=", Token::DotAssign),
            ("(", Token::LParen),
            (")", Token::RParen),
            ("{", Token::LBrace),
            ("}", Token::RBrace),
            ("[", Token::LBracket),
            ("]", Token::RBracket),
            (";", Token::Semicolon),
            (",", Token::Comma),
            ("?", Token::Question),
            (":", Token::Colon),
            ("|", Token::Pipe),
            ("&", Token::Ampersand),
            ("=", Token::Assign),
            ("+", Token::Plus),
            ("-", Token::Minus),
            ("*", Token::Star),
            ("/", Token::Slash),
            ("%", Token::Percent),
            (".", Token::Dot),
            ("!", Token::Bang),
            ("<", Token::Lt),
            (">", Token::Gt),
        ];

        for (text, token) in PUNCT {
            if self.starts_with(text) {
                for _ in 0..text.len() {
                    self.bump();
                }
                return Ok(token.clone());
            }
        }

        Err(self.error(format!("syntax error, unexpected character '{}'", b as char)))
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.bump();
        }
        self.text[start..self.pos].to_string()
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        if self.starts_with("0x") || self.starts_with("0X") {
            self.bump();
            self.bump();
            let start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_hexdigit() || b == b'_') {
                self.bump();
            }
            let digits: String = self.text[start..self.pos].chars().filter(|c| *c != '_').collect();
            return match i64::from_str_radix(&digits, 16) {
                Ok(i) => Ok(Token::Int(i)),
                Err(_) => u64::from_str_radix(&digits, 16)
                    .map(|u| Token::Float(u as f64))
                    .map_err(|_| self.error("Invalid numeric literal")),
            };
        }

        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|b| b.is_ascii_digit() || b == b'_') {
            self.bump();
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|b| b.is_ascii_digit() || b == b'_') {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = matches!(self.peek_at(1), Some(b'+' | b'-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                for _ in 0..digit_at {
                    self.bump();
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
        }

        let literal: String = self.text[start..self.pos].chars().filter(|c| *c != '_').collect();
        if !is_float {
            if let Ok(i) = literal.parse::<i64>() {
                return Ok(Token::Int(i));
            }
        }
        // Integer literals beyond the engine range become floats.
        literal
            .parse::<f64>()
            .map(Token::Float)
            .map_err(|_| self.error("Invalid numeric literal"))
    }

    fn single_quoted(&mut self) -> Result<Token, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("syntax error, unterminated string")),
                Some(b'\'') => return Ok(Token::Str(out)),
                Some(b'\\') if matches!(self.peek(), Some(b'\'' | b'\\')) => {
                    out.push(self.bump().map(char::from).unwrap_or('\\'));
                }
                Some(_) => {
                    let start = self.pos - 1;
                    let end = self.char_end(start);
                    out.push_str(&self.text[start..end]);
                    while self.pos < end {
                        self.bump();
                    }
                }
            }
        }
    }

    fn double_quoted(&mut self) -> Result<Token, ParseError> {
        self.bump();
        let mut parts = Vec::new();
        let mut lit = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("syntax error, unterminated string")),
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    let escaped = match self.bump() {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'r') => '\r',
                        Some(b'0') => '\0',
                        Some(b'e') => '\x1b',
                        Some(b'$') => '$',
                        Some(b'"') => '"',
                        Some(b'\\') => '\\',
                        Some(other) => {
                            lit.push('\\');
                            char::from(other)
                        }
                        None => return Err(self.error("syntax error, unterminated string")),
                    };
                    lit.push(escaped);
                }
                Some(b'$') if self.peek_at(1).is_some_and(is_ident_start) => {
                    if !lit.is_empty() {
                        parts.push(TemplatePart::Lit(std::mem::take(&mut lit)));
                    }
                    parts.push(self.simple_interpolation()?);
                }
                Some(b'{') if self.peek_at(1) == Some(b'$') && self.peek_at(2).is_some_and(is_ident_start) => {
                    if !lit.is_empty() {
                        parts.push(TemplatePart::Lit(std::mem::take(&mut lit)));
                    }
                    parts.push(self.braced_interpolation()?);
                }
                Some(_) => {
                    let start = self.pos;
                    let end = self.char_end(start);
                    lit.push_str(&self.text[start..end]);
                    while self.pos < end {
                        self.bump();
                    }
                }
            }
        }

        if parts.is_empty() {
            return Ok(Token::Str(lit));
        }
        if !lit.is_empty() {
            parts.push(TemplatePart::Lit(lit));
        }
        Ok(Token::Template(parts))
    }

    /// `$name`, `$name->prop` or `$name[key]` inside a double-quoted string.
    fn simple_interpolation(&mut self) -> Result<TemplatePart, ParseError> {
        let line = self.line;
        self.bump();
        let name = self.ident();
        if self.peek() == Some(b'-')
            && self.peek_at(1) == Some(b'>')
            && self.peek_at(2).is_some_and(is_ident_start)
        {
            self.bump();
            self.bump();
            let prop = self.ident();
            return Ok(TemplatePart::Code(format!("${name}->{prop}"), line));
        }
        if self.peek() != Some(b'[') {
            return Ok(TemplatePart::Var(name));
        }
        self.bump();
        let start = self.pos;
        while self.peek().is_some_and(|b| b != b']' && b != b'"') {
            self.bump();
        }
        let key = &self.text[start..self.pos];
        if self.bump() != Some(b']') {
            return Err(self.error("syntax error, expected ']' in string interpolation"));
        }
        let bytes = key.as_bytes();
        let index = match bytes.first() {
            Some(b'$') if bytes[1..].iter().copied().all(is_ident_continue) && bytes.len() > 1 => {
                key.to_string()
            }
            Some(b) if b.is_ascii_digit() || *b == b'-' => {
                if key.parse::<i64>().is_err() {
                    return Err(self.error("syntax error, invalid array offset in string interpolation"));
                }
                key.to_string()
            }
            Some(&b) if is_ident_start(b) && bytes.iter().copied().all(is_ident_continue) => {
                format!("'{key}'")
            }
            _ => {
                return Err(self.error("syntax error, invalid array offset in string interpolation"));
            }
        };
        Ok(TemplatePart::Code(format!("${name}[{index}]"), line))
    }

    /// `{$expr}` inside a double-quoted string; braces nest and quoted
    /// strings inside the expression are skipped whole.
    fn braced_interpolation(&mut self) -> Result<TemplatePart, ParseError> {
        let line = self.line;
        self.bump();
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return Err(self.error("syntax error, unterminated string")),
                Some(b'}') if depth == 0 => break,
                Some(b'}') => depth -= 1,
                Some(b'{') => depth += 1,
                Some(quote @ (b'\'' | b'"')) => {
                    self.bump();
                    while let Some(b) = self.peek() {
                        if b == quote {
                            break;
                        }
                        if b == b'\\' {
                            self.bump();
                        }
                        self.bump();
                    }
                }
                Some(_) => {}
            }
            self.bump();
        }
        let code = self.text[start..self.pos].to_string();
        self.bump();
        Ok(TemplatePart::Code(code, line))
    }

    fn char_end(&self, start: usize) -> usize {
        let mut end = start + 1;
        while end < self.src.len() && !self.text.is_char_boundary(end) {
            end += 1;
        }
        end
    }

    fn cast(&mut self) -> Option<CastKind> {
        let rest = &self.text[self.pos + 1..];
        let close = rest.find(')')?;
        let inner = rest[..close].trim();
        let kind = match inner.to_ascii_lowercase().as_str() {
            "int" | "integer" => CastKind::Int,
            "float" | "double" => CastKind::Float,
            "string" => CastKind::String,
            "bool" | "boolean" => CastKind::Bool,
            "array" => CastKind::Array,
            "object" => CastKind::Object,
            _ => return None,
        };
        for _ in 0..close + 2 {
            self.bump();
        }
        Some(kind)
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}
