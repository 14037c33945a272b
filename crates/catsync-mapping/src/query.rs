//! A small jq dialect used by selectors and mapping fields.
//!
//! Queries compile once into an [`Expr`] tree and evaluate eagerly: every
//! expression turns one input value into a vector of outputs, which is the jq
//! stream with its laziness dropped. Mapping documents only ever ask for the
//! first output, and inputs are single vendor objects, so the eager form is
//! enough.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use catsync_core::json_type_name;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("{0}")]
    Runtime(String),
}

type QueryResult<T> = Result<T, QueryError>;

/// Upper bound on the output of `string * number`.
const MAX_REPEAT_BYTES: usize = 1 << 20;

fn runtime<T>(message: impl Into<String>) -> QueryResult<T> {
    Err(QueryError::Runtime(message.into()))
}

/// A compiled query.
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    pub fn compile(source: &str) -> QueryResult<Self> {
        let expr = parse(source, 0)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every output the query produces for `input`.
    pub fn run(&self, input: &Value) -> QueryResult<Vec<Value>> {
        eval(&self.expr, input, &Vars::default())
    }

    /// The first output, or `None` when the query produces nothing.
    pub fn first(&self, input: &Value) -> QueryResult<Option<Value>> {
        Ok(self.run(input)?.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// Syntax tree

#[derive(Debug, Clone)]
enum StrPart {
    Lit(String),
    Interp(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Identity,
    Recurse,
    Literal(Value),
    Str(Vec<StrPart>),
    Index(Box<Expr>, Box<Expr>),
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    Iterate(Box<Expr>),
    Try(Box<Expr>, Option<Box<Expr>>),
    Pipe(Box<Expr>, Box<Expr>),
    Comma(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Alt(Box<Expr>, Box<Expr>),
    Array(Option<Box<Expr>>),
    Object(Vec<(Expr, Expr)>),
    If(Vec<(Expr, Expr)>, Option<Box<Expr>>),
    Call(String, Vec<Expr>),
    Var(String),
    Bind(Box<Expr>, String, Box<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug)]
enum Token {
    Dot,
    DotDot,
    Field(String),
    Ident(String),
    Var(String),
    Num(f64),
    Str(Vec<StrPart>),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Pipe,
    Comma,
    Colon,
    Semicolon,
    Question,
    Alt,
    Op(BinOp),
    Minus,
    Eof,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    base: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, base: usize) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            base,
        }
    }

    fn peek_char(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.src.len())
    }

    fn error<T>(&self, message: impl Into<String>) -> QueryResult<T> {
        Err(QueryError::Parse {
            offset: self.base + self.offset(),
            message: message.into(),
        })
    }

    fn ident(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek_char(0).filter(|c| is_ident_char(*c)) {
            name.push(c);
            self.pos += 1;
        }
        name
    }

    fn tokenize(mut self) -> QueryResult<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek_char(0) {
            let at = self.base + self.offset();
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            if c == '#' {
                while self.peek_char(0).is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
                continue;
            }
            let token = match c {
                '.' => match self.peek_char(1) {
                    Some('.') => {
                        self.pos += 2;
                        Token::DotDot
                    }
                    Some(n) if is_ident_start(n) => {
                        self.pos += 1;
                        Token::Field(self.ident())
                    }
                    _ => {
                        self.pos += 1;
                        Token::Dot
                    }
                },
                '$' => {
                    self.pos += 1;
                    if !self.peek_char(0).is_some_and(is_ident_start) {
                        return self.error("expected a variable name after '$'");
                    }
                    Token::Var(self.ident())
                }
                '"' => Token::Str(self.string()?),
                c if c.is_ascii_digit() => Token::Num(self.number()?),
                c if is_ident_start(c) => Token::Ident(self.ident()),
                _ => {
                    let next = self.peek_char(1);
                    let (token, width) = match (c, next) {
                        ('/', Some('/')) => (Token::Alt, 2),
                        ('=', Some('=')) => (Token::Op(BinOp::Eq), 2),
                        ('!', Some('=')) => (Token::Op(BinOp::Ne), 2),
                        ('<', Some('=')) => (Token::Op(BinOp::Le), 2),
                        ('>', Some('=')) => (Token::Op(BinOp::Ge), 2),
                        ('<', _) => (Token::Op(BinOp::Lt), 1),
                        ('>', _) => (Token::Op(BinOp::Gt), 1),
                        ('+', _) => (Token::Op(BinOp::Add), 1),
                        ('-', _) => (Token::Minus, 1),
                        ('*', _) => (Token::Op(BinOp::Mul), 1),
                        ('/', _) => (Token::Op(BinOp::Div), 1),
                        ('%', _) => (Token::Op(BinOp::Rem), 1),
                        ('|', _) => (Token::Pipe, 1),
                        (',', _) => (Token::Comma, 1),
                        (':', _) => (Token::Colon, 1),
                        (';', _) => (Token::Semicolon, 1),
                        ('?', _) => (Token::Question, 1),
                        ('(', _) => (Token::LParen, 1),
                        (')', _) => (Token::RParen, 1),
                        ('[', _) => (Token::LBracket, 1),
                        (']', _) => (Token::RBracket, 1),
                        ('{', _) => (Token::LBrace, 1),
                        ('}', _) => (Token::RBrace, 1),
                        _ => return self.error(format!("unexpected character {c:?}")),
                    };
                    self.pos += width;
                    token
                }
            };
            tokens.push((token, at));
        }
        tokens.push((Token::Eof, self.base + self.src.len()));
        Ok(tokens)
    }

    fn number(&mut self) -> QueryResult<f64> {
        let start = self.offset();
        while self.peek_char(0).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_char(0) == Some('.') && self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek_char(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek_char(0), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_char(1), Some('+' | '-')));
            if self.peek_char(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek_char(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let src = self.src;
        let text = &src[start..self.offset()];
        match text.parse::<f64>() {
            Ok(n) => Ok(n),
            Err(_) => self.error(format!("invalid number {text:?}")),
        }
    }

    fn string(&mut self) -> QueryResult<Vec<StrPart>> {
        self.pos += 1;
        let mut parts = Vec::new();
        let mut lit = String::new();
        loop {
            let Some(c) = self.peek_char(0) else {
                return self.error("unterminated string literal");
            };
            self.pos += 1;
            match c {
                '"' => break,
                '\\' => {
                    let Some(esc) = self.peek_char(0) else {
                        return self.error("unterminated escape");
                    };
                    self.pos += 1;
                    match esc {
                        'n' => lit.push('\n'),
                        't' => lit.push('\t'),
                        'r' => lit.push('\r'),
                        'b' => lit.push('\u{8}'),
                        'f' => lit.push('\u{c}'),
                        '"' => lit.push('"'),
                        '\\' => lit.push('\\'),
                        '/' => lit.push('/'),
                        'u' => lit.push(self.unicode_escape()?),
                        '(' => {
                            if !lit.is_empty() {
                                parts.push(StrPart::Lit(std::mem::take(&mut lit)));
                            }
                            parts.push(StrPart::Interp(self.interpolation()?));
                        }
                        other => return self.error(format!("invalid escape \\{other}")),
                    }
                }
                other => lit.push(other),
            }
        }
        if !lit.is_empty() || parts.is_empty() {
            parts.push(StrPart::Lit(lit));
        }
        Ok(parts)
    }

    fn unicode_escape(&mut self) -> QueryResult<char> {
        let mut code = 0u32;
        for _ in 0..4 {
            let Some(digit) = self.peek_char(0).and_then(|c| c.to_digit(16)) else {
                return self.error("invalid \\u escape");
            };
            code = code * 16 + digit;
            self.pos += 1;
        }
        match char::from_u32(code) {
            Some(c) => Ok(c),
            None => self.error("invalid \\u escape"),
        }
    }

    /// Scans to the `)` closing a `\(` and parses what lies between.
    fn interpolation(&mut self) -> QueryResult<Expr> {
        let start = self.offset();
        let mut depth = 1usize;
        let mut in_string = false;
        while let Some(c) = self.peek_char(0) {
            match c {
                '\\' if in_string => self.pos += 1,
                '"' => in_string = !in_string,
                '(' if !in_string => depth += 1,
                ')' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let src = self.src;
                        let inner = &src[start..self.offset()];
                        self.pos += 1;
                        return parse(inner, self.base + start);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        self.error("unterminated string interpolation")
    }
}

// ---------------------------------------------------------------------------
// Parser

const KEYWORDS: &[&str] = &[
    "then", "elif", "else", "end", "as", "catch", "and", "or",
];

fn parse(src: &str, base: usize) -> QueryResult<Expr> {
    let tokens = Lexer::new(src, base).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    if matches!(parser.peek(), Token::Eof) {
        return parser.error("empty query");
    }
    let expr = parser.parse_pipe()?;
    if !matches!(parser.peek(), Token::Eof) {
        return parser.error(format!("unexpected {:?}", parser.peek()));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].0
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == word)
    }

    fn bump(&mut self) -> Token {
        if self.pos >= self.tokens.len() - 1 {
            return Token::Eof;
        }
        let token = std::mem::replace(&mut self.tokens[self.pos].0, Token::Eof);
        self.pos += 1;
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> QueryResult<T> {
        let offset = self.tokens[self.pos.min(self.tokens.len() - 1)].1;
        Err(QueryError::Parse {
            offset,
            message: message.into(),
        })
    }

    fn expect(&mut self, what: &str, matches: fn(&Token) -> bool) -> QueryResult<()> {
        if matches(self.peek()) {
            self.bump();
            Ok(())
        } else {
            self.error(format!("expected {what}, found {:?}", self.peek()))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> QueryResult<()> {
        if self.is_ident(word) {
            self.bump();
            Ok(())
        } else {
            self.error(format!("expected `{word}`, found {:?}", self.peek()))
        }
    }

    fn parse_pipe(&mut self) -> QueryResult<Expr> {
        let lhs = self.parse_comma()?;
        if matches!(self.peek(), Token::Pipe) {
            self.bump();
            let rhs = self.parse_pipe()?;
            return Ok(Expr::Pipe(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_comma(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.parse_alt()?;
        while matches!(self.peek(), Token::Comma) {
            self.bump();
            let rhs = self.parse_alt()?;
            lhs = Expr::Comma(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_alt(&mut self) -> QueryResult<Expr> {
        let lhs = self.parse_or()?;
        if matches!(self.peek(), Token::Alt) {
            self.bump();
            let rhs = self.parse_alt()?;
            return Ok(Expr::Alt(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.is_ident("or") {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.is_ident("and") {
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> QueryResult<Expr> {
        let lhs = self.parse_additive()?;
        if let Token::Op(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)) =
            *self.peek()
        {
            self.bump();
            let rhs = self.parse_additive()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Op(BinOp::Add) => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem)) = *self.peek() {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> QueryResult<Expr> {
        if matches!(self.peek(), Token::Minus) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> QueryResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Field(_) => {
                    let Token::Field(name) = self.bump() else {
                        unreachable!("peeked a field")
                    };
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Literal(Value::String(name))));
                }
                Token::Dot if matches!(self.peek_at(1), Token::Str(_)) => {
                    self.bump();
                    let key = self.parse_primary()?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Token::Dot if matches!(self.peek_at(1), Token::LBracket) => {
                    self.bump();
                    expr = self.parse_bracket(expr)?;
                }
                Token::LBracket => expr = self.parse_bracket(expr)?,
                Token::Question => {
                    self.bump();
                    expr = Expr::Try(Box::new(expr), None);
                }
                _ => break,
            }
        }
        if self.is_ident("as") {
            self.bump();
            let name = match self.bump() {
                Token::Var(name) => name,
                other => return self.error(format!("expected a variable after `as`, found {other:?}")),
            };
            self.expect("`|`", |t| matches!(t, Token::Pipe))?;
            let body = self.parse_pipe()?;
            return Ok(Expr::Bind(Box::new(expr), name, Box::new(body)));
        }
        Ok(expr)
    }

    fn parse_bracket(&mut self, target: Expr) -> QueryResult<Expr> {
        self.expect("`[`", |t| matches!(t, Token::LBracket))?;
        let target = Box::new(target);
        if matches!(self.peek(), Token::RBracket) {
            self.bump();
            return Ok(Expr::Iterate(target));
        }
        if matches!(self.peek(), Token::Colon) {
            self.bump();
            let to = self.parse_pipe()?;
            self.expect("`]`", |t| matches!(t, Token::RBracket))?;
            return Ok(Expr::Slice(target, None, Some(Box::new(to))));
        }
        let index = self.parse_pipe()?;
        if matches!(self.peek(), Token::Colon) {
            self.bump();
            let to = if matches!(self.peek(), Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_pipe()?))
            };
            self.expect("`]`", |t| matches!(t, Token::RBracket))?;
            return Ok(Expr::Slice(target, Some(Box::new(index)), to));
        }
        self.expect("`]`", |t| matches!(t, Token::RBracket))?;
        Ok(Expr::Index(target, Box::new(index)))
    }

    fn parse_primary(&mut self) -> QueryResult<Expr> {
        match self.bump() {
            Token::Dot => {
                if matches!(self.peek(), Token::Str(_)) {
                    let key = self.parse_primary()?;
                    return Ok(Expr::Index(Box::new(Expr::Identity), Box::new(key)));
                }
                Ok(Expr::Identity)
            }
            Token::DotDot => Ok(Expr::Recurse),
            Token::Field(name) => Ok(Expr::Index(
                Box::new(Expr::Identity),
                Box::new(Expr::Literal(Value::String(name))),
            )),
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(parts) => Ok(string_expr(parts)),
            Token::Var(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let inner = self.parse_pipe()?;
                self.expect("`)`", |t| matches!(t, Token::RParen))?;
                Ok(inner)
            }
            Token::LBracket => {
                if matches!(self.peek(), Token::RBracket) {
                    self.bump();
                    return Ok(Expr::Array(None));
                }
                let inner = self.parse_pipe()?;
                self.expect("`]`", |t| matches!(t, Token::RBracket))?;
                Ok(Expr::Array(Some(Box::new(inner))))
            }
            Token::LBrace => self.parse_object(),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "if" => self.parse_if(),
                "try" => {
                    let body = self.parse_postfix()?;
                    let handler = if self.is_ident("catch") {
                        self.bump();
                        Some(Box::new(self.parse_postfix()?))
                    } else {
                        None
                    };
                    Ok(Expr::Try(Box::new(body), handler))
                }
                w if KEYWORDS.contains(&w) => {
                    self.pos -= 1;
                    self.error(format!("unexpected keyword `{w}`"))
                }
                _ => {
                    let mut args = Vec::new();
                    if matches!(self.peek(), Token::LParen) {
                        self.bump();
                        loop {
                            args.push(self.parse_pipe()?);
                            match self.bump() {
                                Token::Semicolon => continue,
                                Token::RParen => break,
                                other => {
                                    return self.error(format!("expected `;` or `)`, found {other:?}"))
                                }
                            }
                        }
                    }
                    Ok(Expr::Call(word, args))
                }
            },
            Token::Eof => self.error("unexpected end of query"),
            other => {
                self.pos -= 1;
                self.error(format!("unexpected {other:?}"))
            }
        }
    }

    fn parse_if(&mut self) -> QueryResult<Expr> {
        let mut branches = Vec::new();
        loop {
            let cond = self.parse_pipe()?;
            self.expect_keyword("then")?;
            let then = self.parse_pipe()?;
            branches.push((cond, then));
            if self.is_ident("elif") {
                self.bump();
                continue;
            }
            break;
        }
        let otherwise = if self.is_ident("else") {
            self.bump();
            Some(Box::new(self.parse_pipe()?))
        } else {
            None
        };
        self.expect_keyword("end")?;
        Ok(Expr::If(branches, otherwise))
    }

    fn parse_object(&mut self) -> QueryResult<Expr> {
        let mut entries = Vec::new();
        if matches!(self.peek(), Token::RBrace) {
            self.bump();
            return Ok(Expr::Object(entries));
        }
        loop {
            let (key, shorthand) = match self.bump() {
                Token::Ident(name) => {
                    let key = Expr::Literal(Value::String(name));
                    let value = Expr::Index(Box::new(Expr::Identity), Box::new(key.clone()));
                    (key, Some(value))
                }
                Token::Var(name) => (Expr::Literal(Value::String(name.clone())), Some(Expr::Var(name))),
                Token::Str(parts) => {
                    let key = string_expr(parts);
                    let value = Expr::Index(Box::new(Expr::Identity), Box::new(key.clone()));
                    (key, Some(value))
                }
                Token::LParen => {
                    let key = self.parse_pipe()?;
                    self.expect("`)`", |t| matches!(t, Token::RParen))?;
                    (key, None)
                }
                other => return self.error(format!("invalid object key {other:?}")),
            };
            let value = if matches!(self.peek(), Token::Colon) {
                self.bump();
                self.parse_object_value()?
            } else if let Some(value) = shorthand {
                value
            } else {
                return self.error("computed object key needs a value");
            };
            entries.push((key, value));
            match self.bump() {
                Token::Comma => continue,
                Token::RBrace => break,
                other => return self.error(format!("expected `,` or `}}`, found {other:?}")),
            }
        }
        Ok(Expr::Object(entries))
    }

    fn parse_object_value(&mut self) -> QueryResult<Expr> {
        let mut value = self.parse_alt()?;
        while matches!(self.peek(), Token::Pipe) {
            self.bump();
            let rhs = self.parse_alt()?;
            value = Expr::Pipe(Box::new(value), Box::new(rhs));
        }
        Ok(value)
    }
}

fn string_expr(parts: Vec<StrPart>) -> Expr {
    if let [StrPart::Lit(text)] = parts.as_slice() {
        return Expr::Literal(Value::String(text.clone()));
    }
    Expr::Str(parts)
}

// ---------------------------------------------------------------------------
// Values

/// Converts a float back into the tidiest JSON number: integral values become
/// integers, non-finite values become null.
fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

pub(crate) fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

/// Total order over JSON values: null < false < true < numbers < strings <
/// arrays < objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let (kx, ky) = (sorted_keys(x), sorted_keys(y));
            let ord = kx.cmp(&ky);
            if ord != Ordering::Equal {
                return ord;
            }
            for key in kx {
                let ord = compare_values(&x[key.as_str()], &y[key.as_str()]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

fn describe(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 30 {
        let cut: String = text.chars().take(27).collect();
        format!("{} ({cut}...)", json_type_name(value))
    } else {
        format!("{} ({text})", json_type_name(value))
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> QueryResult<Value> {
    use BinOp::*;
    match op {
        Eq => return Ok(Value::Bool(values_equal(l, r))),
        Ne => return Ok(Value::Bool(!values_equal(l, r))),
        Lt => return Ok(Value::Bool(compare_values(l, r) == Ordering::Less)),
        Le => return Ok(Value::Bool(compare_values(l, r) != Ordering::Greater)),
        Gt => return Ok(Value::Bool(compare_values(l, r) == Ordering::Greater)),
        Ge => return Ok(Value::Bool(compare_values(l, r) != Ordering::Less)),
        _ => {}
    }
    match (op, l, r) {
        (Add, Value::Null, other) | (Add, other, Value::Null) => Ok(other.clone()),
        (_, Value::Number(_), Value::Number(_)) => {
            let (x, y) = (as_f64(l).unwrap_or(0.0), as_f64(r).unwrap_or(0.0));
            match op {
                Add => Ok(number(x + y)),
                Sub => Ok(number(x - y)),
                Mul => Ok(number(x * y)),
                Div if y == 0.0 => runtime(format!("{} and {} cannot be divided because the divisor is zero", describe(l), describe(r))),
                Div => Ok(number(x / y)),
                Rem => {
                    let (xi, yi) = (x.trunc() as i64, y.trunc() as i64);
                    if yi == 0 {
                        return runtime(format!("{} and {} cannot be divided because the divisor is zero", describe(l), describe(r)));
                    }
                    Ok(Value::from(xi % yi))
                }
                _ => unreachable!("comparisons handled above"),
            }
        }
        (Add, Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
        (Add, Value::Array(x), Value::Array(y)) => {
            Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()))
        }
        (Add, Value::Object(x), Value::Object(y)) => {
            let mut merged = x.clone();
            for (k, v) in y {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(merged))
        }
        (Sub, Value::Array(x), Value::Array(y)) => Ok(Value::Array(
            x.iter()
                .filter(|item| !y.iter().any(|r| values_equal(item, r)))
                .cloned()
                .collect(),
        )),
        (Mul, Value::Object(x), Value::Object(y)) => Ok(Value::Object(deep_merge(x, y))),
        (Mul, Value::String(s), Value::Number(n)) | (Mul, Value::Number(n), Value::String(s)) => {
            let times = n.as_f64().unwrap_or(0.0);
            if times <= 0.0 {
                return Ok(Value::Null);
            }
            let count = times.ceil();
            let limit = MAX_REPEAT_BYTES as f64;
            if count > limit || s.len() as f64 * count > limit {
                return runtime(format!(
                    "repeating a string of {} bytes {count} times exceeds {MAX_REPEAT_BYTES} bytes",
                    s.len()
                ));
            }
            Ok(Value::String(s.repeat(count as usize)))
        }
        (Div, Value::String(x), Value::String(y)) => Ok(split_string(x, y)),
        _ => {
            let verb = match op {
                Add => "added",
                Sub => "subtracted",
                Mul => "multiplied",
                Div => "divided",
                _ => "divided (remainder)",
            };
            runtime(format!("{} and {} cannot be {verb}", describe(l), describe(r)))
        }
    }
}

fn deep_merge(left: &Map<String, Value>, right: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = left.clone();
    for (key, value) in right {
        let next = match (merged.get(key), value) {
            (Some(Value::Object(l)), Value::Object(r)) => Value::Object(deep_merge(l, r)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

fn split_string(text: &str, sep: &str) -> Value {
    if text.is_empty() {
        return Value::Array(Vec::new());
    }
    if sep.is_empty() {
        return Value::Array(text.chars().map(|c| Value::String(c.to_string())).collect());
    }
    Value::Array(text.split(sep).map(|s| Value::String(s.to_string())).collect())
}

fn contains(a: &Value, b: &Value) -> QueryResult<bool> {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            for (key, want) in y {
                match x.get(key) {
                    Some(have) if contains(have, want)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (Value::Array(x), Value::Array(y)) => {
            for want in y {
                let mut found = false;
                for have in x {
                    if contains(have, want)? {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::String(x), Value::String(y)) => Ok(x.contains(y.as_str())),
        _ if type_rank(a) == type_rank(b) || (a.is_boolean() && b.is_boolean()) => Ok(values_equal(a, b)),
        _ => runtime(format!("{} and {} cannot have their containment checked", describe(a), describe(b))),
    }
}

fn index_value(target: &Value, key: &Value) -> QueryResult<Value> {
    match (target, key) {
        (Value::Null, Value::String(_) | Value::Number(_)) => Ok(Value::Null),
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Number(n)) => {
            let n = n.as_f64().unwrap_or(0.0).floor() as i64;
            let idx = if n < 0 { items.len() as i64 + n } else { n };
            Ok(usize::try_from(idx)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null))
        }
        (Value::Array(_), Value::String(k)) => runtime(format!("Cannot index array with \"{k}\"")),
        (Value::Object(_), other) => runtime(format!("Cannot index object with {}", json_type_name(other))),
        (other, Value::String(k)) => runtime(format!("Cannot index {} with \"{k}\"", json_type_name(other))),
        (other, key) => runtime(format!(
            "Cannot index {} with {}",
            json_type_name(other),
            json_type_name(key)
        )),
    }
}

fn slice_bounds(len: usize, from: Option<&Value>, to: Option<&Value>) -> QueryResult<(usize, usize)> {
    let resolve = |bound: Option<&Value>, default: i64| -> QueryResult<usize> {
        let raw = match bound {
            None | Some(Value::Null) => default,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0).floor() as i64,
            Some(other) => return runtime(format!("Start and end indices of a slice must be numbers, got {}", json_type_name(other))),
        };
        let adjusted = if raw < 0 { len as i64 + raw } else { raw };
        Ok(adjusted.clamp(0, len as i64) as usize)
    };
    let start = resolve(from, 0)?;
    let end = resolve(to, len as i64)?;
    Ok((start, end.max(start)))
}

fn slice_value(target: &Value, from: Option<&Value>, to: Option<&Value>) -> QueryResult<Value> {
    match target {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let (start, end) = slice_bounds(items.len(), from, to)?;
            Ok(Value::Array(items[start..end].to_vec()))
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let (start, end) = slice_bounds(chars.len(), from, to)?;
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        other => runtime(format!("Cannot index {} with object", json_type_name(other))),
    }
}

fn iterate_value(target: &Value) -> QueryResult<Vec<Value>> {
    match target {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.values().cloned().collect()),
        other => runtime(format!("Cannot iterate over {}", describe(other))),
    }
}

fn recurse(value: &Value, out: &mut Vec<Value>) {
    out.push(value.clone());
    match value {
        Value::Array(items) => items.iter().for_each(|v| recurse(v, out)),
        Value::Object(map) => map.values().for_each(|v| recurse(v, out)),
        _ => {}
    }
}

fn env_object() -> Value {
    Value::Object(
        std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, Default)]
struct Vars(Vec<(String, Value)>);

impl Vars {
    fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn with(&self, name: &str, value: Value) -> Vars {
        let mut next = self.0.clone();
        next.push((name.to_string(), value));
        Vars(next)
    }
}

fn eval(expr: &Expr, input: &Value, vars: &Vars) -> QueryResult<Vec<Value>> {
    match expr {
        Expr::Identity => Ok(vec![input.clone()]),
        Expr::Recurse => {
            let mut out = Vec::new();
            recurse(input, &mut out);
            Ok(out)
        }
        Expr::Literal(value) => Ok(vec![value.clone()]),
        Expr::Str(parts) => {
            let mut acc = vec![String::new()];
            for part in parts {
                match part {
                    StrPart::Lit(text) => acc.iter_mut().for_each(|s| s.push_str(text)),
                    StrPart::Interp(inner) => {
                        let outputs = eval(inner, input, vars)?;
                        acc = acc
                            .iter()
                            .flat_map(|prefix| outputs.iter().map(move |v| format!("{prefix}{}", to_text(v))))
                            .collect();
                    }
                }
            }
            Ok(acc.into_iter().map(Value::String).collect())
        }
        Expr::Index(target, key) => {
            let mut out = Vec::new();
            for t in eval(target, input, vars)? {
                for k in eval(key, input, vars)? {
                    out.push(index_value(&t, &k)?);
                }
            }
            Ok(out)
        }
        Expr::Slice(target, from, to) => {
            let froms = match from {
                Some(e) => eval(e, input, vars)?.into_iter().map(Some).collect(),
                None => vec![None],
            };
            let tos = match to {
                Some(e) => eval(e, input, vars)?.into_iter().map(Some).collect(),
                None => vec![None],
            };
            let mut out = Vec::new();
            for t in eval(target, input, vars)? {
                for f in &froms {
                    for e in &tos {
                        out.push(slice_value(&t, f.as_ref(), e.as_ref())?);
                    }
                }
            }
            Ok(out)
        }
        Expr::Iterate(target) => {
            let mut out = Vec::new();
            for t in eval(target, input, vars)? {
                out.extend(iterate_value(&t)?);
            }
            Ok(out)
        }
        Expr::Try(body, handler) => match eval(body, input, vars) {
            Ok(out) => Ok(out),
            Err(QueryError::Runtime(message)) => match handler {
                Some(h) => eval(h, &Value::String(message), vars),
                None => Ok(Vec::new()),
            },
            Err(parse) => Err(parse),
        },
        Expr::Pipe(lhs, rhs) => {
            let mut out = Vec::new();
            for v in eval(lhs, input, vars)? {
                out.extend(eval(rhs, &v, vars)?);
            }
            Ok(out)
        }
        Expr::Comma(lhs, rhs) => {
            let mut out = eval(lhs, input, vars)?;
            out.extend(eval(rhs, input, vars)?);
            Ok(out)
        }
        Expr::Neg(inner) => eval(inner, input, vars)?
            .into_iter()
            .map(|v| match as_f64(&v) {
                Some(n) => Ok(number(-n)),
                None => runtime(format!("{} cannot be negated", describe(&v))),
            })
            .collect(),
        Expr::Binary(op, lhs, rhs) => {
            let rights = eval(rhs, input, vars)?;
            let lefts = eval(lhs, input, vars)?;
            let mut out = Vec::with_capacity(rights.len() * lefts.len());
            for r in &rights {
                for l in &lefts {
                    out.push(binary(*op, l, r)?);
                }
            }
            Ok(out)
        }
        Expr::And(lhs, rhs) => {
            let mut out = Vec::new();
            for l in eval(lhs, input, vars)? {
                if !truthy(&l) {
                    out.push(Value::Bool(false));
                    continue;
                }
                for r in eval(rhs, input, vars)? {
                    out.push(Value::Bool(truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Or(lhs, rhs) => {
            let mut out = Vec::new();
            for l in eval(lhs, input, vars)? {
                if truthy(&l) {
                    out.push(Value::Bool(true));
                    continue;
                }
                for r in eval(rhs, input, vars)? {
                    out.push(Value::Bool(truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Alt(lhs, rhs) => {
            let kept: Vec<Value> = match eval(lhs, input, vars) {
                Ok(values) => values.into_iter().filter(truthy).collect(),
                Err(QueryError::Runtime(_)) => Vec::new(),
                Err(parse) => return Err(parse),
            };
            if kept.is_empty() {
                eval(rhs, input, vars)
            } else {
                Ok(kept)
            }
        }
        Expr::Array(None) => Ok(vec![Value::Array(Vec::new())]),
        Expr::Array(Some(inner)) => Ok(vec![Value::Array(eval(inner, input, vars)?)]),
        Expr::Object(entries) => {
            let mut acc = vec![Map::new()];
            for (key, value) in entries {
                let keys = eval(key, input, vars)?;
                let values = eval(value, input, vars)?;
                let mut next = Vec::with_capacity(acc.len() * keys.len() * values.len());
                for obj in &acc {
                    for k in &keys {
                        let Value::String(k) = k else {
                            return runtime(format!("Object keys must be strings, got {}", json_type_name(k)));
                        };
                        for v in &values {
                            let mut obj = obj.clone();
                            obj.insert(k.clone(), v.clone());
                            next.push(obj);
                        }
                    }
                }
                acc = next;
            }
            Ok(acc.into_iter().map(Value::Object).collect())
        }
        Expr::If(branches, otherwise) => eval_if(branches, otherwise.as_deref(), input, vars),
        Expr::Call(name, args) => call(name, args, input, vars),
        Expr::Var(name) => match vars.get(name) {
            Some(value) => Ok(vec![value.clone()]),
            None if name == "ENV" => Ok(vec![env_object()]),
            None => runtime(format!("${name} is not defined")),
        },
        Expr::Bind(source, name, body) => {
            let mut out = Vec::new();
            for value in eval(source, input, vars)? {
                out.extend(eval(body, input, &vars.with(name, value))?);
            }
            Ok(out)
        }
    }
}

fn eval_if(
    branches: &[(Expr, Expr)],
    otherwise: Option<&Expr>,
    input: &Value,
    vars: &Vars,
) -> QueryResult<Vec<Value>> {
    let Some(((cond, then), rest)) = branches.split_first() else {
        return match otherwise {
            Some(e) => eval(e, input, vars),
            None => Ok(vec![input.clone()]),
        };
    };
    let mut out = Vec::new();
    for c in eval(cond, input, vars)? {
        if truthy(&c) {
            out.extend(eval(then, input, vars)?);
        } else {
            out.extend(eval_if(rest, otherwise, input, vars)?);
        }
    }
    Ok(out)
}

/// Evaluates `arg` against `input` and applies `f` to each output.
fn map_arg(
    arg: &Expr,
    input: &Value,
    vars: &Vars,
    f: impl Fn(&Value) -> QueryResult<Value>,
) -> QueryResult<Vec<Value>> {
    eval(arg, input, vars)?.iter().map(f).collect()
}

fn expect_string<'v>(value: &'v Value, func: &str) -> QueryResult<&'v str> {
    match value {
        Value::String(s) => Ok(s),
        other => runtime(format!("{func} input must be a string, got {}", describe(other))),
    }
}

fn expect_array<'v>(value: &'v Value, func: &str) -> QueryResult<&'v [Value]> {
    match value {
        Value::Array(items) => Ok(items),
        other => runtime(format!("{func} input must be an array, got {}", describe(other))),
    }
}

fn sorted(items: &[Value]) -> Vec<Value> {
    let mut items = items.to_vec();
    items.sort_by(compare_values);
    items
}

fn flatten_into(items: &[Value], depth: f64, out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::Array(inner) if depth > 0.0 => flatten_into(inner, depth - 1.0, out),
            other => out.push(other.clone()),
        }
    }
}

fn call(name: &str, args: &[Expr], input: &Value, vars: &Vars) -> QueryResult<Vec<Value>> {
    let one = |v: Value| -> QueryResult<Vec<Value>> { Ok(vec![v]) };
    match (name, args) {
        ("empty", []) => Ok(Vec::new()),
        ("not", []) => one(Value::Bool(!truthy(input))),
        ("length", []) => one(match input {
            Value::Null => Value::from(0),
            Value::Bool(_) => return runtime(format!("{} has no length", describe(input))),
            Value::Number(n) => number(n.as_f64().unwrap_or(0.0).abs()),
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
        }),
        ("keys", []) => one(match input {
            Value::Object(map) => Value::Array(
                sorted_keys(map)
                    .into_iter()
                    .map(|k| Value::String(k.clone()))
                    .collect(),
            ),
            Value::Array(items) => Value::Array((0..items.len()).map(Value::from).collect()),
            other => return runtime(format!("{} has no keys", describe(other))),
        }),
        ("has", [key]) => map_arg(key, input, vars, |k| match (input, k) {
            (Value::Object(map), Value::String(k)) => Ok(Value::Bool(map.contains_key(k))),
            (Value::Array(items), Value::Number(n)) => {
                let n = n.as_f64().unwrap_or(-1.0);
                Ok(Value::Bool(n >= 0.0 && (n as usize) < items.len()))
            }
            _ => runtime(format!(
                "Cannot check whether {} has a {} key",
                json_type_name(input),
                json_type_name(k)
            )),
        }),
        ("select", [cond]) => Ok(eval(cond, input, vars)?
            .iter()
            .filter(|c| truthy(c))
            .map(|_| input.clone())
            .collect()),
        ("map", [f]) => {
            let mut out = Vec::new();
            for item in iterate_value(input)? {
                out.extend(eval(f, &item, vars)?);
            }
            one(Value::Array(out))
        }
        ("type", []) => one(Value::String(json_type_name(input).to_string())),
        ("tostring", []) => one(Value::String(to_text(input))),
        ("tojson", []) => one(Value::String(input.to_string())),
        ("fromjson", []) => {
            let text = expect_string(input, "fromjson")?;
            serde_json::from_str(text)
                .map(|v| vec![v])
                .map_err(|err| QueryError::Runtime(format!("{text:?} is not valid JSON: {err}")))
        }
        ("tonumber", []) => match input {
            Value::Number(_) => one(input.clone()),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) => one(number(n)),
                Err(_) => runtime(format!("Cannot parse {s:?} as a number")),
            },
            other => runtime(format!("{} cannot be parsed as a number", describe(other))),
        },
        ("ascii_downcase", []) => one(Value::String(expect_string(input, name)?.to_ascii_lowercase())),
        ("ascii_upcase", []) => one(Value::String(expect_string(input, name)?.to_ascii_uppercase())),
        ("split", [sep]) => {
            let text = expect_string(input, name)?;
            map_arg(sep, input, vars, |s| Ok(split_string(text, expect_string(s, "split separator")?)))
        }
        ("join", [sep]) => {
            let items = expect_array(input, name)?;
            map_arg(sep, input, vars, |s| {
                let sep = expect_string(s, "join separator")?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(match item {
                        Value::Null => String::new(),
                        Value::String(s) => s.clone(),
                        Value::Number(_) | Value::Bool(_) => item.to_string(),
                        other => return runtime(format!("Cannot join with {}", describe(other))),
                    });
                }
                Ok(Value::String(parts.join(sep)))
            })
        }
        ("ltrimstr", [prefix]) => map_arg(prefix, input, vars, |p| {
            Ok(match (input, p) {
                (Value::String(s), Value::String(p)) => {
                    Value::String(s.strip_prefix(p.as_str()).unwrap_or(s).to_string())
                }
                _ => input.clone(),
            })
        }),
        ("rtrimstr", [suffix]) => map_arg(suffix, input, vars, |p| {
            Ok(match (input, p) {
                (Value::String(s), Value::String(p)) => {
                    Value::String(s.strip_suffix(p.as_str()).unwrap_or(s).to_string())
                }
                _ => input.clone(),
            })
        }),
        ("startswith", [prefix]) => map_arg(prefix, input, vars, |p| match (input, p) {
            (Value::String(s), Value::String(p)) => Ok(Value::Bool(s.starts_with(p.as_str()))),
            _ => runtime("startswith() requires string inputs"),
        }),
        ("endswith", [suffix]) => map_arg(suffix, input, vars, |p| match (input, p) {
            (Value::String(s), Value::String(p)) => Ok(Value::Bool(s.ends_with(p.as_str()))),
            _ => runtime("endswith() requires string inputs"),
        }),
        ("test", [re]) => regex_test(input, re, None, vars),
        ("test", [re, flags]) => regex_test(input, re, Some(flags), vars),
        ("contains", [other]) => map_arg(other, input, vars, |b| Ok(Value::Bool(contains(input, b)?))),
        ("first", []) => one(index_value(input, &Value::from(0))?),
        ("last", []) => one(index_value(input, &Value::from(-1))?),
        ("first", [f]) => Ok(eval(f, input, vars)?.into_iter().take(1).collect()),
        ("last", [f]) => Ok(eval(f, input, vars)?.into_iter().last().into_iter().collect()),
        ("limit", [n, f]) => {
            let mut out = Vec::new();
            for n in eval(n, input, vars)? {
                let n = as_f64(&n).unwrap_or(0.0).max(0.0) as usize;
                out.extend(eval(f, input, vars)?.into_iter().take(n));
            }
            Ok(out)
        }
        ("range", [upto]) => {
            let mut out = Vec::new();
            for n in eval(upto, input, vars)? {
                let n = as_f64(&n).unwrap_or(0.0);
                let mut i = 0.0;
                while i < n {
                    out.push(number(i));
                    i += 1.0;
                }
            }
            Ok(out)
        }
        ("add", []) => {
            let mut acc = Value::Null;
            for item in iterate_value(input)? {
                acc = binary(BinOp::Add, &acc, &item)?;
            }
            one(acc)
        }
        ("any", []) => one(Value::Bool(iterate_value(input)?.iter().any(truthy))),
        ("all", []) => one(Value::Bool(iterate_value(input)?.iter().all(truthy))),
        ("any", [f]) => {
            for item in iterate_value(input)? {
                if eval(f, &item, vars)?.iter().any(truthy) {
                    return one(Value::Bool(true));
                }
            }
            one(Value::Bool(false))
        }
        ("all", [f]) => {
            for item in iterate_value(input)? {
                if !eval(f, &item, vars)?.iter().all(truthy) {
                    return one(Value::Bool(false));
                }
            }
            one(Value::Bool(true))
        }
        ("to_entries", []) => match input {
            Value::Object(map) => one(Value::Array(
                sorted_keys(map)
                    .into_iter()
                    .map(|k| serde_json::json!({"key": k, "value": map[k.as_str()]}))
                    .collect(),
            )),
            other => runtime(format!("{} has no keys", describe(other))),
        },
        ("from_entries", []) => {
            let mut map = Map::new();
            for entry in expect_array(input, name)? {
                let key = ["key", "k", "name", "Name", "Key", "K"]
                    .iter()
                    .find_map(|f| entry.get(f).filter(|v| !v.is_null()));
                let key = match key {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::Bool(b)) => b.to_string(),
                    _ => return runtime(format!("Cannot use {} as object key", describe(entry))),
                };
                let value = ["value", "v", "Value", "V"]
                    .iter()
                    .find_map(|f| entry.get(f))
                    .cloned()
                    .unwrap_or(Value::Null);
                map.insert(key, value);
            }
            one(Value::Object(map))
        }
        ("with_entries", [f]) => {
            let entries = call("to_entries", &[], input, vars)?;
            let mut out = Vec::new();
            for entries in entries {
                let mapped = call("map", std::slice::from_ref(f), &entries, vars)?;
                for m in mapped {
                    out.extend(call("from_entries", &[], &m, vars)?);
                }
            }
            Ok(out)
        }
        ("values", []) => Ok(if input.is_null() { Vec::new() } else { vec![input.clone()] }),
        ("nulls", []) => Ok(input.is_null().then(|| input.clone()).into_iter().collect()),
        ("booleans", []) => Ok(input.is_boolean().then(|| input.clone()).into_iter().collect()),
        ("numbers", []) => Ok(input.is_number().then(|| input.clone()).into_iter().collect()),
        ("strings", []) => Ok(input.is_string().then(|| input.clone()).into_iter().collect()),
        ("arrays", []) => Ok(input.is_array().then(|| input.clone()).into_iter().collect()),
        ("objects", []) => Ok(input.is_object().then(|| input.clone()).into_iter().collect()),
        ("sort", []) => one(Value::Array(sorted(expect_array(input, name)?))),
        ("sort_by", [f]) => {
            let mut keyed = Vec::new();
            for item in expect_array(input, name)? {
                keyed.push((Value::Array(eval(f, item, vars)?), item.clone()));
            }
            keyed.sort_by(|a, b| compare_values(&a.0, &b.0));
            one(Value::Array(keyed.into_iter().map(|(_, v)| v).collect()))
        }
        ("unique", []) => {
            let mut items = sorted(expect_array(input, name)?);
            items.dedup_by(|a, b| values_equal(a, b));
            one(Value::Array(items))
        }
        ("min", []) => one(sorted(expect_array(input, name)?).into_iter().next().unwrap_or(Value::Null)),
        ("max", []) => one(sorted(expect_array(input, name)?).into_iter().last().unwrap_or(Value::Null)),
        ("reverse", []) => match input {
            Value::Null => one(Value::Array(Vec::new())),
            Value::String(s) => one(Value::String(s.chars().rev().collect())),
            other => {
                let mut items = expect_array(other, name)?.to_vec();
                items.reverse();
                one(Value::Array(items))
            }
        },
        ("flatten", []) => {
            let mut out = Vec::new();
            flatten_into(expect_array(input, name)?, f64::INFINITY, &mut out);
            one(Value::Array(out))
        }
        ("flatten", [depth]) => {
            let items = expect_array(input, name)?;
            map_arg(depth, input, vars, |d| {
                let depth = as_f64(d).unwrap_or(-1.0);
                if depth < 0.0 {
                    return runtime("flatten depth must not be negative");
                }
                let mut out = Vec::new();
                flatten_into(items, depth, &mut out);
                Ok(Value::Array(out))
            })
        }
        ("floor", []) => match as_f64(input) {
            Some(n) => one(number(n.floor())),
            None => runtime(format!("{} number required", describe(input))),
        },
        ("ceil", []) => match as_f64(input) {
            Some(n) => one(number(n.ceil())),
            None => runtime(format!("{} number required", describe(input))),
        },
        ("round", []) => match as_f64(input) {
            Some(n) => one(number(n.round())),
            None => runtime(format!("{} number required", describe(input))),
        },
        ("env", []) => one(env_object()),
        ("error", []) => runtime(to_text(input)),
        ("error", [msg]) => match eval(msg, input, vars)?.into_iter().next() {
            Some(m) => runtime(to_text(&m)),
            None => Ok(Vec::new()),
        },
        (other, args) => runtime(format!("{other}/{} is not defined", args.len())),
    }
}

fn regex_test(input: &Value, re: &Expr, flags: Option<&Expr>, vars: &Vars) -> QueryResult<Vec<Value>> {
    let text = expect_string(input, "test")?;
    let flag_values = match flags {
        Some(f) => eval(f, input, vars)?,
        None => vec![Value::Null],
    };
    let mut out = Vec::new();
    for pattern in eval(re, input, vars)? {
        let pattern = expect_string(&pattern, "test pattern")?;
        for flags in &flag_values {
            let flags = match flags {
                Value::Null => "",
                Value::String(s) => s.as_str(),
                other => return runtime(format!("{} is not a string", describe(other))),
            };
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .ignore_whitespace(flags.contains('x'))
                .build()
                .map_err(|err| QueryError::Runtime(format!("{pattern:?} is not a valid regex: {err}")))?;
            out.push(Value::Bool(regex.is_match(text)));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(query: &str, input: Value) -> Vec<Value> {
        Query::compile(query)
            .unwrap_or_else(|e| panic!("compile {query}: {e}"))
            .run(&input)
            .unwrap_or_else(|e| panic!("run {query}: {e}"))
    }

    fn first(query: &str, input: Value) -> Value {
        run(query, input).into_iter().next().unwrap_or(Value::Null)
    }

    #[test]
    fn paths_and_optional_access() {
        let doc = json!({"a": {"b": [10, 20, 30]}, "odd key": 1});
        assert_eq!(first(".a.b[1]", doc.clone()), json!(20));
        assert_eq!(first(".a.b[-1]", doc.clone()), json!(30));
        assert_eq!(first(".a.b[1:]", doc.clone()), json!([20, 30]));
        assert_eq!(first(r#"."odd key""#, doc.clone()), json!(1));
        assert_eq!(first(".missing.deeper", doc.clone()), Value::Null);
        assert_eq!(run(".a.b[]", doc.clone()), vec![json!(10), json!(20), json!(30)]);
        assert!(Query::compile(".a.b.c").unwrap().run(&doc).is_err());
        assert_eq!(run(".a.b.c?", doc), Vec::<Value>::new());
    }

    #[test]
    fn string_repetition_is_bounded() {
        assert_eq!(first(r#""ab" * 3"#, Value::Null), json!("ababab"));
        assert_eq!(first(r#"2.5 * "x""#, Value::Null), json!("xxx"));
        assert_eq!(first(r#""x" * 0"#, Value::Null), Value::Null);

        for query in [r#""x" * 1e18"#, r#""" * 1e18"#, r#""abcd" * 300000"#] {
            let err = Query::compile(query).unwrap().run(&Value::Null).unwrap_err();
            assert!(matches!(err, QueryError::Runtime(ref m) if m.contains("exceeds")), "{query}: {err}");
        }
        assert_eq!(
            first(r#""x" * 1048576 | length"#, Value::Null),
            json!(1048576)
        );
    }

    #[test]
    fn comparisons_and_boolean_logic() {
        let doc = json!({"status": "open", "count": 3});
        assert_eq!(first(r#".status == "open""#, doc.clone()), json!(true));
        assert_eq!(first(".count >= 3 and .count < 4", doc.clone()), json!(true));
        assert_eq!(first(".missing or false", doc.clone()), json!(false));
        assert_eq!(first("1 == 1.0", doc.clone()), json!(true));
        assert_eq!(first(".status | not", doc), json!(false));
    }

    #[test]
    fn alternative_skips_null_false_and_errors() {
        assert_eq!(first(r#".name // "unnamed""#, json!({})), json!("unnamed"));
        assert_eq!(first(r#".name // "unnamed""#, json!({"name": "x"})), json!("x"));
        assert_eq!(first(r#"(.a.b.c) // "fallback""#, json!({"a": {"b": 1}})), json!("fallback"));
    }

    #[test]
    fn construction_and_interpolation() {
        let doc = json!({"id": 7, "name": "api", "tags": ["a", "b"]});
        assert_eq!(
            first(r#"{id, label: "svc-\(.name)", n: (.tags | length)}"#, doc.clone()),
            json!({"id": 7, "label": "svc-api", "n": 2})
        );
        assert_eq!(first("[.tags[] | ascii_upcase]", doc.clone()), json!(["A", "B"]));
        assert_eq!(first(r#".tags | join(",")"#, doc), json!("a,b"));
    }

    #[test]
    fn conditionals_and_try() {
        let q = r#"if .n > 10 then "big" elif .n > 1 then "mid" else "small" end"#;
        assert_eq!(first(q, json!({"n": 20})), json!("big"));
        assert_eq!(first(q, json!({"n": 5})), json!("mid"));
        assert_eq!(first(q, json!({"n": 0})), json!("small"));
        assert_eq!(first(r#"try error("boom") catch ."#, json!(null)), json!("boom"));
    }

    #[test]
    fn builtins_cover_common_mapping_needs() {
        let doc = json!({"labels": [{"name": "bug"}, {"name": "p1"}], "url": "https://git.example/org/repo"});
        assert_eq!(first("[.labels[].name] | sort | first", doc.clone()), json!("bug"));
        assert_eq!(first(r#".labels | map(select(.name == "p1")) | length"#, doc.clone()), json!(1));
        assert_eq!(first(r#".url | ltrimstr("https://") | split("/") | .[1:] | join("/")"#, doc.clone()), json!("org/repo"));
        assert_eq!(first(r#".url | test("EXAMPLE"; "i")"#, doc.clone()), json!(true));
        assert_eq!(first(r#"{a: 1, b: null} | to_entries | map(select(.value != null)) | from_entries"#, doc.clone()), json!({"a": 1}));
        assert_eq!(first("[3, 1, 3] | unique", doc.clone()), json!([1, 3]));
        assert_eq!(first("[1, [2, [3]]] | flatten", doc.clone()), json!([1, 2, 3]));
        assert_eq!(first(r#""42" | tonumber + 1"#, doc.clone()), json!(43));
        assert_eq!(first(".labels | any(.name == \"p1\")", doc), json!(true));
    }

    #[test]
    fn variables_bind_values() {
        let doc = json!({"owner": "me", "items": [1, 2]});
        assert_eq!(
            first(".owner as $o | [.items[] | {o: $o, v: .}]", doc),
            json!([{"o": "me", "v": 1}, {"o": "me", "v": 2}])
        );
    }

    #[test]
    fn env_is_readable() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(first("env.PATH // \"\"", Value::Null), json!(path));
        assert_eq!(first("$ENV.PATH // \"\"", Value::Null), json!(path));
    }

    #[test]
    fn parse_errors_report_offsets() {
        match Query::compile(".a | ") {
            Err(QueryError::Parse { offset, .. }) => assert_eq!(offset, 5),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(matches!(Query::compile("   "), Err(QueryError::Parse { .. })));
        assert!(matches!(Query::compile(".a = 1"), Err(QueryError::Parse { .. })));
    }

    #[test]
    fn value_order_follows_jq() {
        let mut values = vec![json!({"a": 1}), json!("s"), json!(2), json!(null), json!(true), json!([1]), json!(false)];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![json!(null), json!(false), json!(true), json!(2), json!("s"), json!([1]), json!({"a": 1})]
        );
    }
}
