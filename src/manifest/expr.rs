//! Manifest Expressions
//!
//! The restricted expression language available to manifest documents.
//! Expressions appear in two places:
//!
//! - stage `when` predicates, as a bare expression string
//! - `{{ expr }}` splices inside environment entries and script arguments
//!
//! The language is deliberately small: literals, dotted paths into the
//! evaluation scope, equality, boolean operators, and parentheses. There
//! is no function application and no way to reach the host process, which
//! is what keeps manifest evaluation sandboxed.
//!
//! # Example
//!
//! ```
//! use pipewright::manifest::expr::{Expr, Scope};
//! use serde_json::json;
//!
//! let mut scope = Scope::new();
//! scope.set("env", json!({ "release": true, "target": "prod" }));
//!
//! let expr = Expr::parse("env.release && env.target == 'prod'").unwrap();
//! assert!(expr.eval_bool(&scope).unwrap());
//! ```

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Expression parse or evaluation error.
#[derive(Debug, Clone, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("cannot read '{segment}' of null in '{path}'")]
    BadAccess { path: String, segment: String },

    #[error("unterminated '{{{{' splice in template")]
    UnterminatedSplice,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    True,
    False,
    Null,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Dot,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(name) => name.clone(),
            Self::Str(s) => format!("'{}'", s),
            Self::Num(n) => n.to_string(),
            Self::True => "true".to_string(),
            Self::False => "false".to_string(),
            Self::Null => "null".to_string(),
            Self::EqEq => "==".to_string(),
            Self::NotEq => "!=".to_string(),
            Self::AndAnd => "&&".to_string(),
            Self::OrOr => "||".to_string(),
            Self::Bang => "!".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
            Self::Dot => ".".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ExprError::UnexpectedChar('='));
                }
                tokens.push(Token::EqEq);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ExprError::UnexpectedChar('&'));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ExprError::UnexpectedChar('|'));
                }
                tokens.push(Token::OrOr);
            }
            '\'' | '"' => {
                let quote = ch;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => text.push(c),
                        None => return Err(ExprError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' | '-' => {
                chars.next();
                let mut text = String::from(ch);
                if ch == '-' && !matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                    return Err(ExprError::UnexpectedChar('-'));
                }
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .ok_or(ExprError::UnexpectedChar('.'))?
                } else {
                    text.parse::<i64>()
                        .map(Number::from)
                        .map_err(|_| ExprError::UnexpectedChar(ch))?
                };
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match name.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(name),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_unary()?;
        if self.eat(&Token::EqEq) {
            let right = self.parse_unary()?;
            Ok(Expr::Eq(Box::new(left), Box::new(right)))
        } else if self.eat(&Token::NotEq) {
            let right = self.parse_unary()?;
            Ok(Expr::Ne(Box::new(left), Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while self.eat(&Token::Dot) {
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        Some(other) => return Err(ExprError::UnexpectedToken(other.describe())),
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(match self.peek() {
                        Some(t) => ExprError::UnexpectedToken(t.describe()),
                        None => ExprError::UnexpectedEnd,
                    });
                }
                Ok(inner)
            }
            Some(other) => Err(ExprError::UnexpectedToken(other.describe())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

impl Expr {
    /// Parses an expression string.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(extra) => Err(ExprError::UnexpectedToken(extra.describe())),
        }
    }

    /// The default predicate for stages without a `when` field.
    pub fn always_true() -> Self {
        Self::Literal(Value::Bool(true))
    }

    /// Evaluates the expression against a scope.
    ///
    /// Unknown root names and missing mapping keys evaluate to `null`;
    /// traversing *into* a null value is an error.
    pub fn eval(&self, scope: &Scope) -> Result<Value, ExprError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Path(path) => scope.lookup(path),
            Self::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(scope)?))),
            Self::Eq(left, right) => Ok(Value::Bool(values_equal(
                &left.eval(scope)?,
                &right.eval(scope)?,
            ))),
            Self::Ne(left, right) => Ok(Value::Bool(!values_equal(
                &left.eval(scope)?,
                &right.eval(scope)?,
            ))),
            Self::And(left, right) => {
                if !truthy(&left.eval(scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&right.eval(scope)?)))
            }
            Self::Or(left, right) => {
                if truthy(&left.eval(scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&right.eval(scope)?)))
            }
        }
    }

    /// Evaluates the expression and reduces the result to truthiness.
    pub fn eval_bool(&self, scope: &Scope) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(scope)?))
    }
}

/// Truthiness rules for expression results: `null`, `false`, `0`, and the
/// empty string are falsy; everything else (including empty sequences and
/// mappings) is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // Numbers compare by magnitude, not representation
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

/// The evaluation scope: a flat mapping of root names to values, with
/// dotted paths descending into nested mappings.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    root: Map<String, Value>,
}

impl Scope {
    /// Creates an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a root name.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.root.insert(name.into(), value);
    }

    /// Merges every entry of a mapping into the scope root.
    pub fn merge(&mut self, values: &Map<String, Value>) {
        for (name, value) in values {
            self.root.insert(name.clone(), value.clone());
        }
    }

    /// Returns a root binding.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    fn lookup(&self, path: &[String]) -> Result<Value, ExprError> {
        let mut current = match self.root.get(&path[0]) {
            Some(value) => value.clone(),
            None => return Ok(Value::Null),
        };

        for segment in &path[1..] {
            let next = match &current {
                Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
                Value::Null => {
                    return Err(ExprError::BadAccess {
                        path: path.join("."),
                        segment: segment.clone(),
                    })
                }
                _ => Value::Null,
            };
            current = next;
        }

        Ok(current)
    }
}

/// Renders a value, replacing every `{{ expr }}` splice in its strings.
///
/// A string that is exactly one splice evaluates to the expression's value
/// with its type preserved; any other string gets splices substituted as
/// text. Arrays and mappings are rendered recursively.
pub fn render(value: &Value, scope: &Scope) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => render_str(s, scope),
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(|item| render(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (key, entry) in map {
                rendered.insert(key.clone(), render(entry, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(text: &str, scope: &Scope) -> Result<Value, ExprError> {
    // Type-preserving fast path: the whole string is a single splice.
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|rest| rest.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            return Expr::parse(inner)?.eval(scope);
        }
    }

    let mut output = String::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(ExprError::UnterminatedSplice)?;
        let value = Expr::parse(&after[..end])?.eval(scope)?;
        output.push_str(&stringify(&value));
        rest = &after[end + 2..];
    }

    output.push_str(rest);
    Ok(Value::String(output))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
