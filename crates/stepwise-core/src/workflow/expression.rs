//! Embedded expression language and `{{ }}` templates.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr       := or_expr ( "if" or_expr "else" expr )?
//! or_expr    := and_expr ( "or" and_expr )*
//! and_expr   := not_expr ( "and" not_expr )*
//! not_expr   := "not" not_expr | comparison
//! comparison := primary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) primary )?
//! primary    := literal | path | "(" expr ")"
//! path       := root ( "." name | "[" integer "]" | "[" string "]" )*
//! root       := "inputs" | "steps" | "item" | "index"
//! ```
//!
//! `and` / `or` short-circuit and return the deciding operand. The ternary
//! evaluates its condition first and then only the chosen arm. A path that
//! does not resolve is always an [`EvaluationError::UndefinedPath`]; there is
//! no implicit null.
//!
//! Templates interleave literal text with `{{ expr }}` blocks. A template
//! that is exactly one block keeps the expression's type; anything else is
//! rendered to a string with [`canonical_string`].

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Number, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Malformed expression or template.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("syntax error at offset {offset} in `{input}`: {message}")]
pub struct SyntaxError {
    pub input: String,
    pub offset: usize,
    pub message: String,
}

impl SyntaxError {
    fn new(input: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            offset,
            message: message.into(),
        }
    }
}

/// Failure to evaluate an expression against a scope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    /// The reference does not resolve in the current scope.
    #[error("undefined path `{path}`")]
    UndefinedPath { path: String },

    /// An operator was applied to values it does not support.
    #[error("type mismatch in `{expression}`: {message}")]
    TypeMismatch { expression: String, message: String },

    #[error(transparent)]
    Syntax(#[from] SyntaxError),
}

impl EvaluationError {
    /// The unresolved path, for undefined-path errors.
    pub fn path(&self) -> Option<&str> {
        match self {
            EvaluationError::UndefinedPath { path } => Some(path),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A value bound to a step output or loop item.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Ready(Arc<Value>),
    /// Dry-run stand-in for a value that would exist after execution.
    Planned,
}

impl SlotValue {
    pub fn ready(value: Value) -> Self {
        SlotValue::Ready(Arc::new(value))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            SlotValue::Ready(v) => Some(v),
            SlotValue::Planned => None,
        }
    }
}

/// Read access to the names an expression can reference.
pub trait Scope {
    fn input(&self, name: &str) -> Option<&Value>;

    /// All inputs as one object (for a bare `inputs` reference).
    fn inputs(&self) -> Value;

    fn step_output(&self, name: &str) -> Option<SlotValue>;

    /// Innermost loop item, if inside a loop body.
    fn loop_item(&self) -> Option<SlotValue>;

    /// Innermost loop index, if inside a loop body.
    fn loop_index(&self) -> Option<usize>;
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(Number),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Cmp(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, SyntaxError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        match ch {
            '.' => {
                tokens.push((offset, Token::Dot));
                i += 1;
            }
            '[' => {
                tokens.push((offset, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((offset, Token::RBracket));
                i += 1;
            }
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let (op, width) = match (ch, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', _) => (CmpOp::Gt, 1),
                    ('!', _) => {
                        return Err(SyntaxError::new(input, offset, "use `not` instead of `!`"));
                    }
                    _ => {
                        return Err(SyntaxError::new(input, offset, "use `==` for equality"));
                    }
                };
                tokens.push((offset, Token::Cmp(op)));
                i += width;
            }
            '\'' | '"' => {
                let quote = ch;
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(SyntaxError::new(input, offset, "unterminated string literal"));
                    };
                    i += 1;
                    if c == quote {
                        break;
                    }
                    if c == '\\' {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(SyntaxError::new(
                                input,
                                offset,
                                "unterminated string literal",
                            ));
                        };
                        i += 1;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        continue;
                    }
                    value.push(c);
                }
                tokens.push((offset, Token::Str(value)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit()) {
                    i += 1;
                }
                let mut is_float = false;
                let fraction_follows = chars.get(i).is_some_and(|(_, c)| *c == '.')
                    && chars.get(i + 1).is_some_and(|(_, c)| c.is_ascii_digit());
                if fraction_follows {
                    is_float = true;
                    i += 1;
                    while chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit()) {
                        i += 1;
                    }
                }
                let end = chars.get(i).map(|(o, _)| *o).unwrap_or(input.len());
                let text = &input[chars[start].0..end];
                let number = if is_float {
                    text.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    text.parse::<i64>().ok().map(Number::from)
                };
                let number = number.ok_or_else(|| {
                    SyntaxError::new(input, offset, format!("invalid number `{text}`"))
                })?;
                tokens.push((offset, Token::Number(number)));
            }
            c if is_ident_start(c) => {
                let start = i;
                while chars.get(i).is_some_and(|(_, c)| is_ident_char(*c)) {
                    i += 1;
                }
                let end = chars.get(i).map(|(o, _)| *o).unwrap_or(input.len());
                tokens.push((offset, Token::Ident(input[chars[start].0..end].to_string())));
            }
            other => {
                return Err(SyntaxError::new(
                    input,
                    offset,
                    format!("unexpected character `{other}`"),
                ));
            }
        }
    }

    Ok(tokens)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')
}

const KEYWORDS: &[&str] = &["and", "or", "not", "if", "else", "true", "false", "null"];

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Root of a reference path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Inputs,
    Steps,
    Item,
    Index,
}

impl Root {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "inputs" => Some(Root::Inputs),
            "steps" => Some(Root::Steps),
            "item" => Some(Root::Item),
            "index" => Some(Root::Index),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Root::Inputs => "inputs",
            Root::Steps => "steps",
            Root::Item => "item",
            Root::Index => "index",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A reference such as `steps.build.output.files[0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: Root,
    pub segments: Vec<Segment>,
    text: String,
}

impl Path {
    fn new(root: Root, segments: Vec<Segment>) -> Self {
        let mut text = root.as_str().to_string();
        for segment in &segments {
            match segment {
                Segment::Key(k) if k.chars().all(is_ident_char) && !k.is_empty() => {
                    text.push('.');
                    text.push_str(k);
                }
                Segment::Key(k) => text.push_str(&format!("['{k}']")),
                Segment::Index(i) => text.push_str(&format!("[{i}]")),
            }
        }
        Self {
            root,
            segments,
            text,
        }
    }

    /// Canonical text of the path, as reported in errors.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The first key after the root (`steps.<name>` / `inputs.<name>`).
    pub fn head(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Path),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(p) => out.push(p),
            Expr::Not(e) => e.collect_paths(out),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_paths(out);
                r.collect_paths(out);
            }
            Expr::Compare { left, right, .. } => {
                left.collect_paths(out);
                right.collect_paths(out);
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_paths(out);
                then.collect_paths(out);
                otherwise.collect_paths(out);
            }
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(SyntaxError::new(source, 0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let root = parser.parse_expression()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(SyntaxError::new(
                source,
                *offset,
                format!("unexpected token {token:?}"),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every reference path in the expression.
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.root.collect_paths(&mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.source, self.offset(), message)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), SyntaxError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        let value = self.parse_or()?;
        if self.eat_keyword("if") {
            let condition = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(self.error("expected `else` in conditional expression"));
            }
            let otherwise = self.parse_expression()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_primary()?;
        let Some(Token::Cmp(op)) = self.peek().cloned() else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        if matches!(self.peek(), Some(Token::Cmp(_))) {
            return Err(self.error("chained comparisons are not supported"));
        }
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                kw if KEYWORDS.contains(&kw) => Err(SyntaxError::new(
                    self.source,
                    offset,
                    format!("unexpected keyword `{kw}`"),
                )),
                other => match Root::parse(other) {
                    Some(root) => self.parse_path(root).map(Expr::Path),
                    None => Err(SyntaxError::new(
                        self.source,
                        offset,
                        format!(
                            "unknown name `{other}` (expected inputs, steps, item or index)"
                        ),
                    )),
                },
            },
            Some(token) => Err(SyntaxError::new(
                self.source,
                offset,
                format!("unexpected token {token:?}"),
            )),
            None => Err(SyntaxError::new(
                self.source,
                offset,
                "unexpected end of expression",
            )),
        }
    }

    fn parse_path(&mut self, root: Root) -> Result<Path, SyntaxError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(Segment::Key(name)),
                        Some(Token::Number(n)) if n.as_u64().is_some() => {
                            segments.push(Segment::Index(n.as_u64().unwrap_or_default() as usize));
                        }
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.error("expected a name after `.`"));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Number(n)) => match n.as_u64() {
                            Some(i) => segments.push(Segment::Index(i as usize)),
                            None => return Err(self.error("index must be a non-negative integer")),
                        },
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        _ => return Err(self.error("expected an index or quoted key")),
                    }
                    self.expect(Token::RBracket, "`]`")?;
                }
                _ => break,
            }
        }
        Ok(Path::new(root, segments))
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Expr(Expression),
}

/// Literal text interleaved with `{{ expr }}` blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let mut parts = Vec::new();
        let mut rest = source;
        let mut consumed = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                return Err(SyntaxError::new(
                    source,
                    consumed + start,
                    "unclosed `{{` in template",
                ));
            };
            let inner = after_open[..end].trim();
            let expr = Expression::parse(inner).map_err(|e| SyntaxError {
                input: source.to_string(),
                offset: consumed + start,
                message: e.message,
            })?;
            parts.push(Part::Expr(expr));
            let advance = start + OPEN.len() + end + CLOSE.len();
            consumed += advance;
            rest = &rest[advance..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Whether the template contains no expressions.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Text(_)))
    }

    /// The expression, when the template is exactly one block surrounded by
    /// at most whitespace.
    pub fn single_expression(&self) -> Option<&Expression> {
        let mut found = None;
        for part in &self.parts {
            match part {
                Part::Text(t) if t.trim().is_empty() => {}
                Part::Text(_) => return None,
                Part::Expr(e) if found.is_none() => found = Some(e),
                Part::Expr(_) => return None,
            }
        }
        found
    }

    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.parts.iter().filter_map(|p| match p {
            Part::Expr(e) => Some(e),
            Part::Text(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Result of an evaluation together with whether it depended on a planned
/// (dry-run) value.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub value: Value,
    pub planned: bool,
}

impl Evaluated {
    fn known(value: Value) -> Self {
        Self {
            value,
            planned: false,
        }
    }

    fn planned(value: Value) -> Self {
        Self {
            value,
            planned: true,
        }
    }
}

/// Truth value of a guard or branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    True,
    False,
    /// Depends on a value that only exists after execution (dry run).
    Unknown,
}

/// Expression evaluator with a parse cache.
///
/// Cheap to share: parsed expressions and templates are cached by source
/// text in concurrent maps, so repeated evaluation of the same step (loop
/// bodies, parallel children) parses once.
#[derive(Default)]
pub struct Evaluator {
    expressions: DashMap<String, Arc<Expression>>,
    templates: DashMap<String, Arc<Template>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn expression(&self, source: &str) -> Result<Arc<Expression>, SyntaxError> {
        if let Some(cached) = self.expressions.get(source) {
            return Ok(Arc::clone(&cached));
        }
        let parsed = Arc::new(Expression::parse(source.trim())?);
        self.expressions
            .insert(source.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    fn template(&self, source: &str) -> Result<Arc<Template>, SyntaxError> {
        if let Some(cached) = self.templates.get(source) {
            return Ok(Arc::clone(&cached));
        }
        let parsed = Arc::new(Template::parse(source)?);
        self.templates.insert(source.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Evaluate a bare expression (`when`, `condition`, `items`). Sources
    /// written with `{{ }}` delimiters are accepted as templates.
    pub fn evaluate(&self, source: &str, scope: &dyn Scope) -> Result<Value, EvaluationError> {
        self.evaluate_full(source, scope).map(|e| e.value)
    }

    pub fn evaluate_full(
        &self,
        source: &str,
        scope: &dyn Scope,
    ) -> Result<Evaluated, EvaluationError> {
        if source.contains(OPEN) {
            return self.render_full(source, scope);
        }
        let expr = self.expression(source)?;
        eval(&expr.root, scope, expr.source())
    }

    /// Evaluate a guard to a three-valued condition.
    pub fn condition(&self, source: &str, scope: &dyn Scope) -> Result<Condition, EvaluationError> {
        let result = self.evaluate_full(source, scope)?;
        Ok(if result.planned {
            Condition::Unknown
        } else if truthy(&result.value) {
            Condition::True
        } else {
            Condition::False
        })
    }

    /// Render a template. A single-block template keeps its value's type.
    pub fn render(&self, template: &str, scope: &dyn Scope) -> Result<Value, EvaluationError> {
        self.render_full(template, scope).map(|e| e.value)
    }

    fn render_full(&self, source: &str, scope: &dyn Scope) -> Result<Evaluated, EvaluationError> {
        let template = self.template(source)?;
        if let Some(expr) = template.single_expression() {
            return eval(&expr.root, scope, expr.source());
        }

        let mut out = String::new();
        let mut planned = false;
        for part in &template.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Expr(expr) => {
                    let result = eval(&expr.root, scope, expr.source())?;
                    planned |= result.planned;
                    out.push_str(&canonical_string(&result.value));
                }
            }
        }
        Ok(Evaluated {
            value: Value::String(out),
            planned,
        })
    }

    /// Render a template and stringify the result.
    pub fn render_string(
        &self,
        template: &str,
        scope: &dyn Scope,
    ) -> Result<String, EvaluationError> {
        self.render(template, scope).map(|v| canonical_string(&v))
    }

    /// Resolve templates inside every string of a JSON value, recursively.
    pub fn resolve_value(
        &self,
        value: &Value,
        scope: &dyn Scope,
    ) -> Result<Value, EvaluationError> {
        match value {
            Value::String(s) if s.contains(OPEN) => self.render(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn placeholder(path: &Path) -> Value {
    Value::String(format!("<{}>", path.text()))
}

fn eval(expr: &Expr, scope: &dyn Scope, source: &str) -> Result<Evaluated, EvaluationError> {
    match expr {
        Expr::Literal(v) => Ok(Evaluated::known(v.clone())),
        Expr::Path(path) => resolve_path(path, scope),
        Expr::Not(inner) => {
            let result = eval(inner, scope, source)?;
            Ok(Evaluated {
                value: Value::Bool(!truthy(&result.value)),
                planned: result.planned,
            })
        }
        Expr::And(left, right) => {
            let l = eval(left, scope, source)?;
            if l.planned {
                let r = eval(right, scope, source)?;
                return Ok(Evaluated::planned(r.value));
            }
            if !truthy(&l.value) {
                return Ok(l);
            }
            eval(right, scope, source)
        }
        Expr::Or(left, right) => {
            let l = eval(left, scope, source)?;
            if l.planned {
                let r = eval(right, scope, source)?;
                return Ok(Evaluated::planned(r.value));
            }
            if truthy(&l.value) {
                return Ok(l);
            }
            eval(right, scope, source)
        }
        Expr::Compare { op, left, right } => {
            let l = eval(left, scope, source)?;
            let r = eval(right, scope, source)?;
            if l.planned || r.planned {
                return Ok(Evaluated::planned(Value::Bool(true)));
            }
            compare(*op, &l.value, &r.value, source).map(|b| Evaluated::known(Value::Bool(b)))
        }
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            let c = eval(condition, scope, source)?;
            if c.planned {
                let chosen = eval(then, scope, source)?;
                eval(otherwise, scope, source)?;
                return Ok(Evaluated::planned(chosen.value));
            }
            if truthy(&c.value) {
                eval(then, scope, source)
            } else {
                eval(otherwise, scope, source)
            }
        }
    }
}

fn resolve_path(path: &Path, scope: &dyn Scope) -> Result<Evaluated, EvaluationError> {
    let undefined = || EvaluationError::UndefinedPath {
        path: path.text().to_string(),
    };
    let segments = path.segments.as_slice();

    match path.root {
        Root::Inputs => {
            let (base, rest): (Cow<'_, Value>, &[Segment]) = match segments.first() {
                None => (Cow::Owned(scope.inputs()), &[]),
                Some(Segment::Key(name)) => {
                    (Cow::Borrowed(scope.input(name).ok_or_else(undefined)?), &segments[1..])
                }
                Some(Segment::Index(_)) => return Err(undefined()),
            };
            walk(&base, rest)
                .cloned()
                .map(Evaluated::known)
                .ok_or_else(undefined)
        }
        Root::Steps => {
            let Some(Segment::Key(name)) = segments.first() else {
                return Err(undefined());
            };
            let value = match scope.step_output(name).ok_or_else(undefined)? {
                SlotValue::Planned => return Ok(Evaluated::planned(placeholder(path))),
                SlotValue::Ready(v) => v,
            };
            match segments.get(1) {
                None => Ok(Evaluated::known(serde_json::json!({ "output": *value }))),
                Some(Segment::Key(k)) if k == "output" => walk(&value, &segments[2..])
                    .cloned()
                    .map(Evaluated::known)
                    .ok_or_else(undefined),
                Some(_) => Err(undefined()),
            }
        }
        Root::Item => match scope.loop_item().ok_or_else(undefined)? {
            SlotValue::Planned => Ok(Evaluated::planned(placeholder(path))),
            SlotValue::Ready(v) => walk(&v, segments)
                .cloned()
                .map(Evaluated::known)
                .ok_or_else(undefined),
        },
        Root::Index => {
            if !segments.is_empty() {
                return Err(undefined());
            }
            scope
                .loop_index()
                .map(|i| Evaluated::known(Value::from(i)))
                .ok_or_else(undefined)
        }
    }
}

fn walk<'v>(value: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    segments.iter().try_fold(value, |current, segment| match segment {
        Segment::Key(k) => current.as_object()?.get(k),
        Segment::Index(i) => current.as_array()?.get(*i),
    })
}

fn compare(op: CmpOp, left: &Value, right: &Value, source: &str) -> Result<bool, EvaluationError> {
    match op {
        CmpOp::Eq => return Ok(values_equal(left, right)),
        CmpOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let ordering = ordering.ok_or_else(|| EvaluationError::TypeMismatch {
        expression: source.to_string(),
        message: format!(
            "cannot compare {} {op} {}",
            type_name(left),
            type_name(right)
        ),
    })?;

    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq | CmpOp::Ne => unreachable!("equality handled above"),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Structural equality where `1 == 1.0`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => left == right,
    }
}

/// Truthiness: null, false, 0, "", [] and {} are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Canonical stringification
// ---------------------------------------------------------------------------

/// Render a value for template interpolation.
///
/// Strings render bare, booleans as `true`/`false`, null as `null`, numbers
/// in minimal decimal form (`3.0` renders `3`), and lists/maps as compact
/// JSON with object keys sorted at every level.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_string(n),
        compound => canonical_json(compound),
    }
}

/// Compact JSON with recursively sorted object keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&number_string(n)),
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn number_string(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => format!("{f}"),
        None => n.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestScope {
        inputs: serde_json::Map<String, Value>,
        steps: HashMap<String, SlotValue>,
        item: Option<SlotValue>,
        index: Option<usize>,
    }

    impl TestScope {
        fn with_input(mut self, name: &str, value: Value) -> Self {
            self.inputs.insert(name.to_string(), value);
            self
        }

        fn with_step(mut self, name: &str, value: Value) -> Self {
            self.steps.insert(name.to_string(), SlotValue::ready(value));
            self
        }
    }

    impl Scope for TestScope {
        fn input(&self, name: &str) -> Option<&Value> {
            self.inputs.get(name)
        }

        fn inputs(&self) -> Value {
            Value::Object(self.inputs.clone())
        }

        fn step_output(&self, name: &str) -> Option<SlotValue> {
            self.steps.get(name).cloned()
        }

        fn loop_item(&self) -> Option<SlotValue> {
            self.item.clone()
        }

        fn loop_index(&self) -> Option<usize> {
            self.index
        }
    }

    fn scope() -> TestScope {
        TestScope::default()
            .with_input("branch_name", json!("feat-x"))
            .with_input("count", json!(3))
            .with_input("flags", json!({ "dry": false, "tags": ["a", "b"] }))
            .with_step("build", json!({ "passed": true, "files": ["x.rs", "y.rs"] }))
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    #[test]
    fn resolves_dotted_and_indexed_paths() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.evaluate("inputs.branch_name", &s).unwrap(), json!("feat-x"));
        assert_eq!(ev.evaluate("inputs.flags.tags[1]", &s).unwrap(), json!("b"));
        assert_eq!(
            ev.evaluate("steps.build.output.files[0]", &s).unwrap(),
            json!("x.rs")
        );
        assert_eq!(
            ev.evaluate("steps.build.output['passed']", &s).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn undefined_path_names_the_full_path() {
        let ev = Evaluator::new();
        let s = scope();
        for path in [
            "inputs.missing",
            "inputs.flags.nope.deeper",
            "steps.deploy.output",
            "steps.build.output.files[5]",
            "steps.build.status",
            "item.name",
            "index",
        ] {
            let err = ev.evaluate(path, &s).unwrap_err();
            assert_eq!(err.path(), Some(path), "for {path}");
        }
    }

    #[test]
    fn undefined_path_inside_template_is_an_error_not_empty_text() {
        let ev = Evaluator::new();
        let err = ev
            .render("Branch: {{ inputs.nope }}", &scope())
            .unwrap_err();
        assert_eq!(
            err,
            EvaluationError::UndefinedPath {
                path: "inputs.nope".to_string()
            }
        );
    }

    #[test]
    fn loop_bindings_resolve() {
        let ev = Evaluator::new();
        let mut s = scope();
        s.item = Some(SlotValue::ready(json!({ "name": "core" })));
        s.index = Some(2);
        assert_eq!(ev.evaluate("item.name", &s).unwrap(), json!("core"));
        assert_eq!(ev.evaluate("index", &s).unwrap(), json!(2));
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    #[test]
    fn boolean_operators_short_circuit() {
        let ev = Evaluator::new();
        let s = scope();
        // The right operand would fail if it were evaluated.
        assert_eq!(ev.evaluate("false and inputs.missing", &s).unwrap(), json!(false));
        assert_eq!(ev.evaluate("true or inputs.missing", &s).unwrap(), json!(true));
        assert!(ev.evaluate("true and inputs.missing", &s).is_err());
    }

    #[test]
    fn boolean_operators_return_deciding_operand() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.evaluate("'' or 'fallback'", &s).unwrap(), json!("fallback"));
        assert_eq!(ev.evaluate("inputs.count and 'yes'", &s).unwrap(), json!("yes"));
        assert_eq!(ev.evaluate("not inputs.flags.dry", &s).unwrap(), json!(true));
        assert_eq!(ev.evaluate("not not 0", &s).unwrap(), json!(false));
    }

    #[test]
    fn ternary_evaluates_only_chosen_arm() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(
            ev.evaluate("'big' if inputs.count > 2 else inputs.missing", &s)
                .unwrap(),
            json!("big")
        );
        assert_eq!(
            ev.evaluate("inputs.missing if inputs.count > 5 else 'small'", &s)
                .unwrap(),
            json!("small")
        );
    }

    #[test]
    fn ternary_nests_to_the_right() {
        let ev = Evaluator::new();
        let s = scope();
        let value = ev
            .evaluate("'a' if inputs.count == 1 else 'b' if inputs.count == 3 else 'c'", &s)
            .unwrap();
        assert_eq!(value, json!("b"));
    }

    #[test]
    fn comparisons() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.evaluate("inputs.count == 3.0", &s).unwrap(), json!(true));
        assert_eq!(ev.evaluate("inputs.count != 3", &s).unwrap(), json!(false));
        assert_eq!(ev.evaluate("inputs.count >= 3", &s).unwrap(), json!(true));
        assert_eq!(ev.evaluate("inputs.count < -1", &s).unwrap(), json!(false));
        assert_eq!(ev.evaluate("'abc' < 'abd'", &s).unwrap(), json!(true));
        assert_eq!(
            ev.evaluate("inputs.branch_name == 'feat-x' and steps.build.output.passed", &s)
                .unwrap(),
            json!(true)
        );
        assert_eq!(ev.evaluate("null == null", &s).unwrap(), json!(true));
    }

    #[test]
    fn ordering_mixed_types_is_type_mismatch() {
        let ev = Evaluator::new();
        let err = ev.evaluate("inputs.count < 'x'", &scope()).unwrap_err();
        assert!(matches!(err, EvaluationError::TypeMismatch { .. }));
        assert!(err.to_string().contains("number < string"));
    }

    #[test]
    fn parentheses_override_precedence() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.evaluate("not (true and false)", &s).unwrap(), json!(true));
        assert_eq!(
            ev.evaluate("(false or true) and 'x'", &s).unwrap(),
            json!("x")
        );
    }

    // -----------------------------------------------------------------------
    // Syntax errors
    // -----------------------------------------------------------------------

    #[test]
    fn syntax_errors_are_reported() {
        for bad in [
            "",
            "inputs.",
            "steps.a ==",
            "1 < 2 < 3",
            "a if b",
            "'unterminated",
            "foo.bar",
            "inputs.x = 1",
            "!inputs.x",
            "(inputs.x",
            "inputs.x inputs.y",
        ] {
            assert!(Expression::parse(bad).is_err(), "expected error for `{bad}`");
        }
    }

    #[test]
    fn expression_paths_are_collected() {
        let expr =
            Expression::parse("steps.a.output if inputs.flag else steps.b.output.x").unwrap();
        let paths: Vec<&str> = expr.paths().iter().map(|p| p.text()).collect();
        assert_eq!(paths, vec!["steps.a.output", "inputs.flag", "steps.b.output.x"]);
        assert_eq!(expr.paths()[0].head(), Some("a"));
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    #[test]
    fn single_block_template_keeps_type() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.render("{{ inputs.count }}", &s).unwrap(), json!(3));
        assert_eq!(
            ev.render("  {{ steps.build.output.files }} ", &s).unwrap(),
            json!(["x.rs", "y.rs"])
        );
    }

    #[test]
    fn mixed_template_renders_canonically() {
        let ev = Evaluator::new();
        let s = scope().with_input("meta", json!({ "z": 1, "a": { "y": true, "b": 2.0 } }));
        let rendered = ev
            .render_string(
                "branch={{ inputs.branch_name }} n={{ inputs.count }} ok={{ steps.build.output.passed }} meta={{ inputs.meta }}",
                &s,
            )
            .unwrap();
        assert_eq!(
            rendered,
            r#"branch=feat-x n=3 ok=true meta={"a":{"b":2,"y":true},"z":1}"#
        );
    }

    #[test]
    fn literal_text_passes_through() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.render("no expressions } here", &s).unwrap(), json!("no expressions } here"));
        assert!(Template::parse("plain").unwrap().is_literal());
    }

    #[test]
    fn unclosed_block_is_a_syntax_error() {
        assert!(Template::parse("hello {{ inputs.x").is_err());
        assert!(Template::parse("hello {{ }}").is_err());
    }

    #[test]
    fn resolve_value_walks_nested_inputs() {
        let ev = Evaluator::new();
        let s = scope();
        let raw = json!({
            "name": "{{ inputs.branch_name }}",
            "files": ["{{ steps.build.output.files[1] }}", 7],
            "nested": { "count": "{{ inputs.count }}" }
        });
        let resolved = ev.resolve_value(&raw, &s).unwrap();
        assert_eq!(
            resolved,
            json!({ "name": "feat-x", "files": ["y.rs", 7], "nested": { "count": 3 } })
        );
    }

    #[test]
    fn bare_expression_accepts_delimiters() {
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate("{{ inputs.count > 1 }}", &scope()).unwrap(),
            json!(true)
        );
    }

    // -----------------------------------------------------------------------
    // Planned values
    // -----------------------------------------------------------------------

    #[test]
    fn planned_step_output_renders_placeholder() {
        let ev = Evaluator::new();
        let mut s = scope();
        s.steps.insert("plan".to_string(), SlotValue::Planned);
        assert_eq!(
            ev.render_string("result: {{ steps.plan.output.sha }}", &s)
                .unwrap(),
            "result: <steps.plan.output.sha>"
        );
        assert_eq!(
            ev.condition("steps.plan.output.ok == true", &s).unwrap(),
            Condition::Unknown
        );
        // Undefined paths are still errors next to planned ones.
        assert!(ev.condition("steps.plan.output or inputs.missing", &s).is_err());
    }

    #[test]
    fn condition_is_three_valued() {
        let ev = Evaluator::new();
        let s = scope();
        assert_eq!(ev.condition("inputs.count", &s).unwrap(), Condition::True);
        assert_eq!(ev.condition("inputs.flags.dry", &s).unwrap(), Condition::False);
    }

    // -----------------------------------------------------------------------
    // Canonical stringification
    // -----------------------------------------------------------------------

    #[test]
    fn canonical_string_forms() {
        assert_eq!(canonical_string(&json!(true)), "true");
        assert_eq!(canonical_string(&json!(null)), "null");
        assert_eq!(canonical_string(&json!(2.0)), "2");
        assert_eq!(canonical_string(&json!(0.5)), "0.5");
        assert_eq!(canonical_string(&json!(-7)), "-7");
        assert_eq!(canonical_string(&json!("text")), "text");
        assert_eq!(canonical_string(&json!([1, "a", null])), r#"[1,"a",null]"#);
        assert_eq!(
            canonical_string(&json!({ "b": [ { "d": 1, "c": 2 } ], "a": "x\"y" })),
            r#"{"a":"x\"y","b":[{"c":2,"d":1}]}"#
        );
    }

    #[test]
    fn canonical_string_is_stable_across_insertion_order() {
        let mut a = serde_json::Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(
            canonical_string(&Value::Object(a)),
            canonical_string(&Value::Object(b))
        );
    }

    #[test]
    fn truthiness_rules() {
        let falsy_values = [
            json!(null),
            json!(false),
            json!(0),
            json!(0.0),
            json!(""),
            json!([]),
            json!({}),
        ];
        for falsy in falsy_values {
            assert!(!truthy(&falsy), "{falsy} should be falsy");
        }
        for t in [json!(true), json!(-1), json!("0"), json!([0]), json!({ "a": null })] {
            assert!(truthy(&t), "{t} should be truthy");
        }
    }

    #[test]
    fn evaluator_caches_parsed_sources() {
        let ev = Evaluator::new();
        let s = scope();
        ev.evaluate("inputs.count", &s).unwrap();
        ev.evaluate("inputs.count", &s).unwrap();
        ev.render("x {{ inputs.count }}", &s).unwrap();
        assert_eq!(ev.expressions.len(), 1);
        assert_eq!(ev.templates.len(), 1);
    }
}
