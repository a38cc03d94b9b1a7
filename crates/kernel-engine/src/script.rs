//! A small built-in expression language.
//!
//! Enough JavaScript-flavoured syntax to drive the engine end to end from a
//! notebook: literals, arrays, object literals, arithmetic with JS-style
//! coercion, `;`-separated statements (the last one is the result), `throw`,
//! error constructors, `Promise.resolve`/`reject`, `console.*`, and the `$$`
//! context surface. There are no variables or user-defined functions, and it
//! is not a sandbox.

use bytes::Bytes;
use kernel_wire::Stream;

use crate::channel::ChannelError;
use crate::evaluator::{Evaluator, Scope};
use crate::inspect::{format_number, inspect, to_display_string};
use crate::value::{Deferred, Object, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid or unexpected token")]
    InvalidToken,

    #[error("Unterminated string constant")]
    UnterminatedString,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of input")]
    UnexpectedEnd,

    #[error("Expression nested too deeply (limit {0})")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(char),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", format_number(*n)),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Punct(c) => write!(f, "{}", c),
        }
    }
}

const PUNCTUATION: &str = "()[]{},.;:+-*/%!";

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(ParseError::InvalidToken);
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse::<f64>().map_err(|_| ParseError::InvalidToken)?;
            tokens.push(Token::Number(n));
        } else if c == '"' || c == '\'' {
            let (s, end) = read_string(&chars, i)?;
            tokens.push(Token::Str(s));
            i = end;
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if PUNCTUATION.contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(ParseError::InvalidToken);
        }
    }
    Ok(tokens)
}

/// Read a quoted string starting at `start`. Returns the text and the index
/// just past the closing quote.
fn read_string(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        let c = *chars.get(i).ok_or(ParseError::UnterminatedString)?;
        i += 1;
        match c {
            '\n' => return Err(ParseError::UnterminatedString),
            c if c == quote => return Ok((out, i)),
            '\\' => {
                let escaped = *chars.get(i).ok_or(ParseError::UnterminatedString)?;
                i += 1;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'u' => {
                        let hex: String = chars.get(i..i + 4).ok_or(ParseError::InvalidToken)?.iter().collect();
                        let code = u32::from_str_radix(&hex, 16).map_err(|_| ParseError::InvalidToken)?;
                        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                        i += 4;
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    New(Box<Expr>, Vec<Expr>),
    Unary(char, Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Expr(Expr),
    Throw(Expr),
}

/// Deepest expression tree the parser will build. Parsing and evaluation
/// both recurse along the tree, so this bounds their stack use.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

fn unexpected(token: Option<Token>) -> ParseError {
    match token {
        Some(token) => ParseError::UnexpectedToken(token.to_string()),
        None => ParseError::UnexpectedEnd,
    }
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

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), ParseError> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(unexpected(self.next()))
        }
    }

    /// Count one level of nesting in the tree being built.
    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    /// Run `f`, restoring the nesting level afterwards.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let base = self.depth;
        let out = f(self);
        self.depth = base;
        out
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == word)
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();
        loop {
            while self.eat_punct(';') {}
            if self.peek().is_none() {
                break;
            }
            statements.push(self.statement()?);
            if self.peek().is_some() && !self.eat_punct(';') {
                return Err(unexpected(self.next()));
            }
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        if self.is_keyword("throw") {
            self.pos += 1;
            return Ok(Stmt::Throw(self.expression()?));
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    // Left-associative chains (`1+1+1`, `a.b.c`, `f()()`) nest the tree
    // without recursing here, so each link counts as a level too.

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            p.enter()?;
            let mut lhs = p.term()?;
            loop {
                let op = match p.peek() {
                    Some(Token::Punct(c)) if *c == '+' || *c == '-' => *c,
                    _ => return Ok(lhs),
                };
                p.pos += 1;
                p.enter()?;
                let rhs = p.term()?;
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
            }
        })
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            let mut lhs = p.unary()?;
            loop {
                let op = match p.peek() {
                    Some(Token::Punct(c)) if *c == '*' || *c == '/' || *c == '%' => *c,
                    _ => return Ok(lhs),
                };
                p.pos += 1;
                p.enter()?;
                let rhs = p.unary()?;
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
            }
        })
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        for op in ['-', '+', '!'] {
            if self.eat_punct(op) {
                return self.nested(|p| {
                    p.enter()?;
                    Ok(Expr::Unary(op, Box::new(p.unary()?)))
                });
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            let mut expr = p.primary()?;
            loop {
                if p.eat_punct('.') {
                    p.enter()?;
                    expr = Expr::Member(Box::new(expr), p.property_name()?);
                } else if p.eat_punct('(') {
                    p.enter()?;
                    expr = Expr::Call(Box::new(expr), p.arguments()?);
                } else if p.eat_punct('[') {
                    p.enter()?;
                    let index = p.expression()?;
                    p.expect_punct(']')?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                } else {
                    return Ok(expr);
                }
            }
        })
    }

    fn property_name(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    /// Comma-separated expressions up to `close`; the opener is consumed.
    fn list(&mut self, close: char) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        loop {
            if self.eat_punct(close) {
                return Ok(items);
            }
            items.push(self.expression()?);
            if !self.eat_punct(',') {
                self.expect_punct(close)?;
                return Ok(items);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.list(')')
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "undefined" => Ok(Expr::Literal(Value::Undefined)),
                "new" => self.new_expression(),
                "throw" => Err(ParseError::UnexpectedToken(word)),
                _ => Ok(Expr::Ident(word)),
            },
            Some(Token::Punct('(')) => {
                let inner = self.expression()?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            Some(Token::Punct('[')) => Ok(Expr::Array(self.list(']')?)),
            Some(Token::Punct('{')) => self.object_literal(),
            other => Err(unexpected(other)),
        }
    }

    fn new_expression(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            let mut callee = match p.next() {
                Some(Token::Ident(name)) => Expr::Ident(name),
                other => return Err(unexpected(other)),
            };
            while p.eat_punct('.') {
                p.enter()?;
                callee = Expr::Member(Box::new(callee), p.property_name()?);
            }
            p.enter()?;
            let args = if p.eat_punct('(') {
                p.arguments()?
            } else {
                Vec::new()
            };
            Ok(Expr::New(Box::new(callee), args))
        })
    }

    fn object_literal(&mut self) -> Result<Expr, ParseError> {
        let mut props = Vec::new();
        loop {
            if self.eat_punct('}') {
                break;
            }
            let key = match self.next() {
                Some(Token::Ident(s)) | Some(Token::Str(s)) => s,
                Some(Token::Number(n)) => format_number(n),
                other => return Err(unexpected(other)),
            };
            self.expect_punct(':')?;
            props.push((key, self.expression()?));
            if !self.eat_punct(',') {
                self.expect_punct('}')?;
                break;
            }
        }
        Ok(Expr::Object(props))
    }
}

fn parse(code: &str) -> Result<Vec<Stmt>, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(code)?,
        pos: 0,
        depth: 0,
    };
    parser.program()
}

/// Built-in names reachable from code.
const GLOBALS: &[&str] = &[
    "console", "Promise", "$$", "Buffer", "String", "Number", "Error", "TypeError",
    "RangeError", "SyntaxError", "ReferenceError",
];

const ERROR_TYPES: &[&str] = &["Error", "TypeError", "RangeError", "SyntaxError", "ReferenceError"];

/// An evaluated expression: a value, or a path into the built-ins
/// (`console.log`, `$$.done`) that only means something when called.
enum Slot {
    Value(Value),
    Path(String),
}

fn type_error(message: impl Into<String>) -> Value {
    Value::error("TypeError", message)
}

fn channel_failure(e: ChannelError) -> Value {
    Value::error("ChannelError", e.to_string())
}

/// `Number(value)`.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => *n,
        Value::String(s) => parse_numeric(s),
        Value::Array(items) if items.len() <= 1 => parse_numeric(&to_display_string(value)),
        _ => f64::NAN,
    }
}

fn parse_numeric(s: &str) -> f64 {
    let t = s.trim();
    match t {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if t.chars().any(|c| c.is_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => t.parse::<f64>().unwrap_or(f64::NAN),
    }
}

fn concatenates(value: &Value) -> bool {
    !matches!(
        value,
        Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_)
    )
}

fn binary(op: char, lhs: Value, rhs: Value) -> Value {
    if op == '+' && (concatenates(&lhs) || concatenates(&rhs)) {
        return Value::String(to_display_string(&lhs) + &to_display_string(&rhs));
    }
    let (a, b) = (to_number(&lhs), to_number(&rhs));
    Value::Number(match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => a / b,
        '%' => a % b,
        _ => f64::NAN,
    })
}

fn get_property(value: &Value, key: &str) -> Result<Value, Value> {
    let index = key.parse::<usize>().ok();
    Ok(match value {
        Value::Undefined | Value::Null => {
            return Err(type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                to_display_string(value),
                key
            )))
        }
        Value::String(s) if key == "length" => Value::Number(s.encode_utf16().count() as f64),
        Value::String(s) => index
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined),
        Value::Array(items) if key == "length" => Value::Number(items.len() as f64),
        Value::Array(items) => index
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Undefined),
        Value::Bytes(bytes) if key == "length" => Value::Number(bytes.len() as f64),
        Value::Bytes(bytes) => index
            .and_then(|i| bytes.get(i))
            .map(|b| Value::Number(f64::from(*b)))
            .unwrap_or(Value::Undefined),
        Value::Object(obj) => obj.get(key).cloned().unwrap_or(Value::Undefined),
        Value::Error(err) => match key {
            "name" => Value::String(err.name.clone()),
            "message" => Value::String(err.message.clone()),
            "stack" => err.stack.clone().map(Value::String).unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        },
        Value::Function(name) if key == "name" => Value::String(name.clone()),
        _ => Value::Undefined,
    })
}

/// Source text of a callee, for error messages.
fn callee_name(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member(object, name) => format!("{}.{}", callee_name(object), name),
        Expr::Literal(value) => inspect(value),
        _ => "expression".to_string(),
    }
}

fn is_callable(path: &str) -> bool {
    matches!(
        path,
        "String" | "Number" | "Promise.resolve" | "Promise.reject" | "Buffer.from"
    ) || ERROR_TYPES.contains(&path)
        || path.starts_with("console.")
        || path.starts_with("$$.")
}

struct Interpreter<'s> {
    scope: &'s Scope<'s>,
}

impl<'s> Interpreter<'s> {
    fn run(&self, program: &[Stmt]) -> Result<Value, Value> {
        let mut last = Value::Undefined;
        for statement in program {
            match statement {
                Stmt::Expr(expr) => last = self.value(expr)?,
                Stmt::Throw(expr) => return Err(self.value(expr)?),
            }
        }
        Ok(last)
    }

    fn value(&self, expr: &Expr) -> Result<Value, Value> {
        match self.eval(expr)? {
            Slot::Value(value) => Ok(value),
            Slot::Path(path) if is_callable(&path) => {
                let name = path.rsplit('.').next().unwrap_or_default();
                Ok(Value::Function(name.to_string()))
            }
            Slot::Path(path) if GLOBALS.contains(&path.as_str()) => Ok(Value::Object(Object::new())),
            Slot::Path(_) => Ok(Value::Undefined),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Slot, Value> {
        let value = match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Ident(name) => match name.as_str() {
                "Infinity" => Value::Number(f64::INFINITY),
                "NaN" => Value::Number(f64::NAN),
                _ if GLOBALS.contains(&name.as_str()) => return Ok(Slot::Path(name.clone())),
                _ => return Err(Value::error("ReferenceError", format!("{} is not defined", name))),
            },
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Object(props) => {
                let mut obj = Object::new();
                for (key, expr) in props {
                    obj.insert(key.clone(), self.value(expr)?);
                }
                Value::Object(obj)
            }
            Expr::Member(object, name) => match self.eval(object)? {
                Slot::Path(path) => return Ok(Slot::Path(format!("{}.{}", path, name))),
                Slot::Value(value) => get_property(&value, name)?,
            },
            Expr::Index(object, index) => {
                let key = match self.value(index)? {
                    Value::Number(n) => format_number(n),
                    other => to_display_string(&other),
                };
                match self.eval(object)? {
                    Slot::Path(path) => return Ok(Slot::Path(format!("{}.{}", path, key))),
                    Slot::Value(value) => get_property(&value, &key)?,
                }
            }
            Expr::Call(callee, args) => match self.eval(callee)? {
                Slot::Path(path) => {
                    let args = self.arguments(args)?;
                    self.call(&path, args)?
                }
                Slot::Value(_) => {
                    return Err(type_error(format!("{} is not a function", callee_name(callee))))
                }
            },
            Expr::New(callee, args) => match self.eval(callee)? {
                Slot::Path(path) if ERROR_TYPES.contains(&path.as_str()) => {
                    construct_error(&path, self.arguments(args)?)
                }
                _ => {
                    return Err(type_error(format!(
                        "{} is not a constructor",
                        callee_name(callee)
                    )))
                }
            },
            Expr::Unary(op, operand) => {
                let operand = self.value(operand)?;
                match op {
                    '-' => Value::Number(-to_number(&operand)),
                    '!' => Value::Bool(!operand.is_truthy()),
                    _ => Value::Number(to_number(&operand)),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.value(lhs)?;
                let rhs = self.value(rhs)?;
                binary(*op, lhs, rhs)
            }
        };
        Ok(Slot::Value(value))
    }

    fn arguments(&self, args: &[Expr]) -> Result<Vec<Value>, Value> {
        args.iter().map(|arg| self.value(arg)).collect()
    }

    fn call(&self, path: &str, args: Vec<Value>) -> Result<Value, Value> {
        match path {
            "console.log" | "console.info" | "console.debug" => self.console(Stream::Stdout, &args),
            "console.error" | "console.warn" => self.console(Stream::Stderr, &args),
            "Promise.resolve" => Ok(match args.into_iter().next() {
                Some(Value::Deferred(deferred)) => Value::Deferred(deferred),
                Some(value) => Value::Deferred(Deferred::resolved(value)),
                None => Value::Deferred(Deferred::resolved(Value::Undefined)),
            }),
            "Promise.reject" => {
                let reason = args.into_iter().next().unwrap_or(Value::Undefined);
                Ok(Value::Deferred(Deferred::rejected(reason)))
            }
            "String" => Ok(Value::String(
                args.first().map(to_display_string).unwrap_or_default(),
            )),
            "Number" => Ok(Value::Number(args.first().map(to_number).unwrap_or(0.0))),
            "Buffer.from" => buffer_from(args.into_iter().next().unwrap_or(Value::Undefined)),
            name if ERROR_TYPES.contains(&name) => Ok(construct_error(name, args)),
            other => match other.strip_prefix("$$.") {
                Some(method) => self.context_call(method, args),
                None => Err(type_error(format!("{} is not a function", other))),
            },
        }
    }

    fn console(&self, stream: Stream, args: &[Value]) -> Result<Value, Value> {
        let line = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => inspect(other),
            })
            .collect::<Vec<_>>()
            .join(" ");
        self.scope
            .print(stream, &format!("{}\n", line))
            .map_err(channel_failure)?;
        Ok(Value::Undefined)
    }

    /// `$$.<method>(...)`: operations on the running context.
    fn context_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Value> {
        let context = self.scope.context();
        let given = args.len();
        let mut args = args.into_iter();
        let value = args.next().unwrap_or(Value::Undefined);
        let keep_alive = args.next().is_some_and(|v| v.is_truthy());

        let sent = match method {
            "async" => {
                let flag = given == 0 || value.is_truthy();
                return Ok(Value::Bool(context.set_async(flag)));
            }
            "input" => return Ok(self.input(value)),
            "done" => context
                .done(if given == 0 { None } else { Some(value) })
                .map(|_| ()),
            "clear" => context
                .clear(if given == 0 { None } else { Some(value.to_json()) })
                .map(|_| ()),
            "sendResult" => context.send_result(value, keep_alive),
            "sendError" => context.send_error(value, keep_alive),
            "mime" => context.mime(value, keep_alive),
            "text" => context.text(value, keep_alive),
            "html" => context.html(value, keep_alive),
            "svg" => context.svg(value, keep_alive),
            "png" => context.png(value, keep_alive),
            "jpeg" => context.jpeg(value, keep_alive),
            "json" => context.json(value, keep_alive),
            other => return Err(type_error(format!("$$.{} is not a function", other))),
        };
        sent.map_err(channel_failure)?;
        Ok(Value::Undefined)
    }

    fn input(&self, options: Value) -> Value {
        let options = match options {
            Value::String(prompt) => serde_json::json!({ "prompt": prompt }),
            Value::Undefined => serde_json::json!({}),
            other => other.to_json(),
        };
        let reply = self.scope.context().input(options, None);
        Value::deferred(async move {
            reply
                .await
                .map(Value::from_json)
                .map_err(|e| Value::error("Error", e.to_string()))
        })
    }
}

fn construct_error(name: &str, args: Vec<Value>) -> Value {
    let message = match args.first() {
        None | Some(Value::Undefined) => String::new(),
        Some(message) => to_display_string(message),
    };
    Value::error(name, message)
}

fn buffer_from(source: Value) -> Result<Value, Value> {
    let bytes = match source {
        Value::String(s) => Bytes::from(s.into_bytes()),
        Value::Bytes(bytes) => bytes,
        Value::Array(items) => items
            .iter()
            .map(|item| (to_number(item) as i64 & 0xff) as u8)
            .collect::<Vec<u8>>()
            .into(),
        _ => {
            return Err(type_error(
                "The first argument must be of type string or an instance of Buffer or Array",
            ))
        }
    };
    Ok(Value::Bytes(bytes))
}

/// Evaluator for the built-in expression language.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptEvaluator;

impl ScriptEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for ScriptEvaluator {
    fn evaluate(&self, code: &str, scope: &Scope<'_>) -> Result<Value, Value> {
        let program = parse(code).map_err(|e| match e {
            ParseError::TooDeep(_) => Value::error("RangeError", e.to_string()),
            _ => Value::error("SyntaxError", e.to_string()),
        })?;
        Interpreter { scope }.run(&program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::Ambient;
    use crate::config::EngineConfig;
    use crate::test_util::{harness, Harness, RecordingOutput};
    use serde_json::json;
    use std::sync::Arc;

    fn eval_in(h: &Harness, code: &str) -> (Result<Value, Value>, Arc<RecordingOutput>) {
        let sink = Arc::new(RecordingOutput::default());
        let ambient = Arc::new(Ambient::new(sink.clone()));
        let context = h.context("s");
        let _capture = ambient.capture(context.clone());
        let scope = Scope::new(&context, &ambient);
        (ScriptEvaluator::new().evaluate(code, &scope), sink)
    }

    fn eval(code: &str) -> Result<Value, Value> {
        eval_in(&harness(EngineConfig::default()), code).0
    }

    fn shown(code: &str) -> String {
        match eval(code) {
            Ok(value) => inspect(&value),
            Err(thrown) => format!("threw {}", inspect(&thrown)),
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("$$.text('a\\n', 1.5e1) // trailing").unwrap(),
            vec![
                Token::Ident("$$".into()),
                Token::Punct('.'),
                Token::Ident("text".into()),
                Token::Punct('('),
                Token::Str("a\n".into()),
                Token::Punct(','),
                Token::Number(15.0),
                Token::Punct(')'),
            ]
        );
        assert_eq!(tokenize("'open"), Err(ParseError::UnterminatedString));
        assert_eq!(tokenize("1 # 2"), Err(ParseError::InvalidToken));
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let within = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&within).is_ok());
        assert!(parse(&format!("{}1", "-".repeat(100))).is_ok());

        let too_deep = [
            format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000)),
            format!("{}1", "-".repeat(100_000)),
            format!("{}1{}", "[".repeat(100_000), "]".repeat(100_000)),
            vec!["1"; 100_000].join("+"),
            format!("console{}", ".log".repeat(100_000)),
            format!("String{}", "()".repeat(100_000)),
        ];
        for code in &too_deep {
            assert_eq!(parse(code).unwrap_err(), ParseError::TooDeep(MAX_DEPTH));
        }
    }

    #[tokio::test]
    async fn test_deep_nesting_throws_range_error() {
        let thrown = eval(&format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000))).unwrap_err();
        match thrown {
            Value::Error(err) => assert_eq!(err.name, "RangeError"),
            other => panic!("expected an error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_arithmetic_and_coercion() {
        assert_eq!(shown("1+1"), "2");
        assert_eq!(shown("2 * (3 + 4) - 1"), "13");
        assert_eq!(shown("7 % 4; 10 / 4"), "2.5");
        assert_eq!(shown("'a' + 1"), "'a1'");
        assert_eq!(shown("1 + null"), "1");
        assert_eq!(shown("1 + undefined"), "NaN");
        assert_eq!(shown("-'3' * 2"), "-6");
        assert_eq!(shown("!0"), "true");
        assert_eq!(shown("[1] + [2]"), "'12'");
        assert_eq!(shown("1 / 0"), "Infinity");
    }

    #[tokio::test]
    async fn test_literals() {
        assert_eq!(shown("[1, 'two', [true, null]]"), "[ 1, 'two', [ true, null ] ]");
        assert_eq!(shown("{a: 1, 'b c': [], }"), "{ a: 1, 'b c': [] }");
        assert_eq!(shown("{a: {b: 2}}.a.b"), "2");
        assert_eq!(shown("'héllo'.length"), "5");
        assert_eq!(shown("[5, 6][1]"), "6");
        assert_eq!(shown(""), "undefined");
        assert_eq!(shown("console.log"), "[Function: log]");
    }

    #[tokio::test]
    async fn test_errors() {
        assert_eq!(
            shown("throw new Error('boom')"),
            "threw Error: boom\n    at <anonymous>"
        );
        match eval("nope + 1") {
            Err(Value::Error(err)) => {
                assert_eq!(err.name, "ReferenceError");
                assert_eq!(err.message, "nope is not defined");
            }
            other => panic!("expected ReferenceError, got {:?}", other),
        }
        match eval("1 +") {
            Err(Value::Error(err)) => {
                assert_eq!(err.name, "SyntaxError");
                assert_eq!(err.message, "Unexpected end of input");
            }
            other => panic!("expected SyntaxError, got {:?}", other),
        }
        match eval("null.x") {
            Err(Value::Error(err)) => assert_eq!(err.name, "TypeError"),
            other => panic!("expected TypeError, got {:?}", other),
        }
        match eval("(1)(2)") {
            Err(Value::Error(err)) => assert_eq!(err.message, "1 is not a function"),
            other => panic!("expected TypeError, got {:?}", other),
        }
        assert_eq!(shown("throw 'plain'"), "threw 'plain'");
        assert_eq!(shown("TypeError('x').name"), "'TypeError'");
    }

    #[tokio::test]
    async fn test_promises_are_deferred() {
        let value = eval("Promise.resolve(5)").unwrap();
        match value {
            Value::Deferred(deferred) => {
                assert!(matches!(deferred.await, Ok(Value::Number(n)) if n == 5.0))
            }
            other => panic!("expected deferred, got {:?}", other),
        }

        let rejected = eval("Promise.reject(new RangeError('r'))").unwrap();
        match rejected {
            Value::Deferred(deferred) => assert!(deferred.await.is_err()),
            other => panic!("expected deferred, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_console_is_captured() {
        let mut h = harness(EngineConfig::default());
        let (result, sink) = eval_in(&h, "console.log('x =', 1); console.error({a: 1})");
        assert!(result.unwrap().is_undefined());
        assert_eq!(
            sink.lines(),
            vec![
                (Stream::Stdout, "x = 1\n".to_string()),
                (Stream::Stderr, "{ a: 1 }\n".to_string()),
            ]
        );
        assert_eq!(h.next().await, json!({"id": "s", "stdout": "x = 1\n"}));
        assert_eq!(h.next().await, json!({"id": "s", "stderr": "{ a: 1 }\n"}));
    }

    #[tokio::test]
    async fn test_context_surface() {
        let mut h = harness(EngineConfig::default());
        let (result, _) = eval_in(&h, "$$.async(); $$.html('<b>hi</b>', true); $$.done()");
        assert!(result.is_ok());
        assert_eq!(
            h.next().await,
            json!({"id": "s", "mime": {"text/html": "<b>hi</b>"}, "end": false})
        );
        assert_eq!(h.next().await, json!({"id": "s", "end": true}));
    }

    #[tokio::test]
    async fn test_buffer_from() {
        assert_eq!(shown("Buffer.from([1, 255, 256])"), "<Buffer 01 ff 00>");
        assert_eq!(shown("Buffer.from('hi').length"), "2");
    }
}
