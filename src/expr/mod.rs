// src/expr/mod.rs

//! Condition and interpolation expressions.
//!
//! The language is deliberately small:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ( "==" | "!=" ) primary )?
//! primary := 'string' | "string" | true | false | path | call | "(" expr ")"
//! path    := ident ( "." ident )*
//! call    := ident "(" ( expr ( "," expr )* )? ")"
//! ```
//!
//! Paths are rooted at `trigger`, `env`, `secrets`, `run`, `steps` or
//! `jobs`. Functions: `success()`, `failure()`, `always()`,
//! `contains(a, b)`, `startsWith(a, b)`.

pub mod template;

use std::fmt;

pub use template::{interpolate, references_secret, template_expressions};

const ROOTS: &[&str] = &["trigger", "env", "secrets", "run", "steps", "jobs"];

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s,
        }
    }
}

/// Aggregate state of a node's predecessors, used by the status functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamStatus {
    /// Every predecessor succeeded (vacuously true for roots).
    pub all_succeeded: bool,
    /// At least one predecessor failed.
    pub any_failed: bool,
}

impl UpstreamStatus {
    pub fn succeeded() -> Self {
        Self {
            all_succeeded: true,
            any_failed: false,
        }
    }
}

/// Lookup surface expressions are evaluated against.
pub trait EvalContext {
    /// Resolve a dotted path. `None` evaluates to the empty string.
    fn lookup(&self, path: &[String]) -> Option<String>;

    /// Predecessor state for `success()` / `failure()`.
    fn upstream(&self) -> UpstreamStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Call { name: String, args: Vec<Expr> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ExprError {}

impl Expr {
    /// Parse and check an expression (known roots and functions).
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError(format!(
                "unexpected trailing input in expression '{src}'"
            )));
        }
        expr.check()?;
        Ok(expr)
    }

    fn check(&self) -> Result<(), ExprError> {
        match self {
            Expr::Literal(_) => Ok(()),
            Expr::Path(path) => {
                let root = path.first().map(String::as_str).unwrap_or_default();
                if ROOTS.contains(&root) {
                    Ok(())
                } else {
                    Err(ExprError(format!(
                        "unknown name '{}' (expected one of {})",
                        path.join("."),
                        ROOTS.join(", ")
                    )))
                }
            }
            Expr::Call { name, args } => {
                let arity = match name.as_str() {
                    "success" | "failure" | "always" => 0,
                    "contains" | "startsWith" => 2,
                    other => return Err(ExprError(format!("unknown function '{other}()'"))),
                };
                if args.len() != arity {
                    return Err(ExprError(format!(
                        "function '{name}()' takes {arity} argument(s), got {}",
                        args.len()
                    )));
                }
                args.iter().try_for_each(Expr::check)
            }
            Expr::Not(e) => e.check(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
                a.check()?;
                b.check()
            }
        }
    }

    /// Visit every node of the tree.
    fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Path(_) => {}
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk(&mut *f);
                }
            }
            Expr::Not(e) => e.walk(&mut *f),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
                a.walk(&mut *f);
                b.walk(&mut *f);
            }
        }
    }

    /// All dotted paths referenced by the expression.
    pub fn paths(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Path(p) = e {
                out.push(p.as_slice());
            }
        });
        out
    }

    fn calls(&self, wanted: &[&str]) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Call { name, .. } = e {
                found |= wanted.contains(&name.as_str());
            }
        });
        found
    }

    /// Whether the expression calls any status function.
    pub fn uses_status_function(&self) -> bool {
        self.calls(&["success", "failure", "always"])
    }

    /// Whether the node may run even though a predecessor did not succeed.
    pub fn runs_after_upstream_failure(&self) -> bool {
        self.calls(&["always", "failure"])
    }

    /// Static expressions only read run-scoped data frozen at start, so they
    /// can be evaluated when the graph is built.
    pub fn is_static(&self) -> bool {
        !self.uses_status_function()
            && self
                .paths()
                .iter()
                .all(|p| !matches!(p.first().map(String::as_str), Some("steps" | "jobs")))
    }

    pub fn eval(&self, ctx: &dyn EvalContext) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => Value::Str(ctx.lookup(path).unwrap_or_default()),
            Expr::Call { name, args } => match name.as_str() {
                "success" => Value::Bool(ctx.upstream().all_succeeded),
                "failure" => Value::Bool(ctx.upstream().any_failed),
                "always" => Value::Bool(true),
                "contains" => {
                    let hay = args[0].eval(ctx).into_string();
                    let needle = args[1].eval(ctx).into_string();
                    Value::Bool(hay.contains(&needle))
                }
                "startsWith" => {
                    let s = args[0].eval(ctx).into_string();
                    let prefix = args[1].eval(ctx).into_string();
                    Value::Bool(s.starts_with(&prefix))
                }
                _ => Value::Bool(false),
            },
            Expr::Not(e) => Value::Bool(!e.eval(ctx).is_truthy()),
            Expr::And(a, b) => Value::Bool(a.eval(ctx).is_truthy() && b.eval(ctx).is_truthy()),
            Expr::Or(a, b) => Value::Bool(a.eval(ctx).is_truthy() || b.eval(ctx).is_truthy()),
            Expr::Eq(a, b) => Value::Bool(a.eval(ctx).into_string() == b.eval(ctx).into_string()),
            Expr::Ne(a, b) => Value::Bool(a.eval(ctx).into_string() != b.eval(ctx).into_string()),
        }
    }

    /// Evaluate as a step condition.
    ///
    /// Without an explicit status function the condition is implicitly
    /// `success() && <expr>`.
    pub fn eval_condition(&self, ctx: &dyn EvalContext) -> bool {
        if !self.uses_status_function() && !ctx.upstream().all_succeeded {
            return false;
        }
        self.eval(ctx).is_truthy()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Not,
    And,
    Or,
    EqEq,
    NotEq,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| ExprError(format!("unterminated string in '{src}'")))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExprError(format!(
                    "unexpected character '{other}' in expression '{src}'"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ExprError(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_primary()?;
        if self.eat(&Token::EqEq) {
            let right = self.parse_primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::NotEq) {
            let right = self.parse_primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ExprError("unexpected end of expression".to_string()))?;
        self.pos += 1;

        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if name == "true" => Ok(Expr::Literal(Value::Bool(true))),
            Token::Ident(name) if name == "false" => Ok(Expr::Literal(Value::Bool(false))),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma)?;
                        }
                    }
                    return Ok(Expr::Call { name, args });
                }

                let mut path = vec![name];
                while self.eat(&Token::Dot) {
                    match self.tokens.get(self.pos).cloned() {
                        Some(Token::Ident(seg)) => {
                            self.pos += 1;
                            path.push(seg);
                        }
                        other => {
                            return Err(ExprError(format!(
                                "expected name after '.', found {other:?}"
                            )));
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(ExprError(format!("unexpected token {other:?}"))),
        }
    }
}

/// Where a `steps.<id>.outputs.<key>` / `jobs.<job>.steps.<id>.outputs.<key>`
/// path points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub job: String,
    pub step: String,
    pub key: String,
}

impl OutputRef {
    /// Interpret `path` as an output reference made from a step of `current_job`.
    pub fn from_path(path: &[String], current_job: &str) -> Option<OutputRef> {
        match path {
            [steps, step, outputs, key] if steps == "steps" && outputs == "outputs" => {
                Some(OutputRef {
                    job: current_job.to_string(),
                    step: step.clone(),
                    key: key.clone(),
                })
            }
            [jobs, job, steps, step, outputs, key]
                if jobs == "jobs" && steps == "steps" && outputs == "outputs" =>
            {
                Some(OutputRef {
                    job: job.clone(),
                    step: step.clone(),
                    key: key.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn node_id(&self) -> String {
        format!("{}.{}", self.job, self.step)
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.outputs.{}", self.node_id(), self.key)
    }
}
