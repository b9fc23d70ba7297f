//! Matcher expression language.
//!
//! A matcher is compiled once, when the model loads, and evaluated for every
//! policy row of every request.
//!
//! Supported syntax:
//! - Field access: `r.obj`, `p.act` (names come from the model definitions)
//! - Comparisons: `==`, `!=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `r.act in ("GET", "HEAD")`
//! - Function calls: `keyMatch(r.obj, p.obj)`, `g(r.sub, p.sub)`, ...
//! - Literals: `"double"` or `'single'` quoted strings, `true`, `false`
//! - Parentheses for grouping

use std::collections::BTreeMap;

use crate::authz::errors::AuthzError;
use crate::authz::functions::{Builtin, RegexCache};

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Bool(bool),
    /// Index into the request tuple.
    Request(usize),
    /// Index into the policy row.
    Policy(usize),
    Not(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        element: Box<Expr>,
        list: Vec<Expr>,
    },
    Call {
        func: Builtin,
        args: Vec<Expr>,
    },
    /// Role membership through a role definition, e.g. `g(r.sub, p.sub)`.
    HasRole {
        role_type: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Type {
    Str,
    Bool,
}

/// Names the matcher may refer to.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub request_key: &'a str,
    pub request_fields: &'a [String],
    pub policy_key: &'a str,
    pub policy_fields: &'a [String],
    /// role definition name -> arity (2 or 3)
    pub role_types: &'a BTreeMap<String, usize>,
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
    Not, // !
    In,  // in
}

fn tokenize(input: &str) -> Result<Vec<Token>, AuthzError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
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
            '=' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if i + 1 < chars.len() && chars[i + 1] == '&' => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if i + 1 < chars.len() && chars[i + 1] == '|' => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(AuthzError::InvalidMatcher(
                        "unterminated string literal".into(),
                    ));
                }
                tokens.push(Token::Str(s));
                i += 1; // closing quote
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => {
                return Err(AuthzError::InvalidMatcher(format!(
                    "unexpected character `{c}`"
                )));
            }
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: Scope<'a>,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, scope: Scope<'a>) -> Self {
        Self {
            tokens,
            pos: 0,
            scope,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), AuthzError> {
        if self.advance() != Some(expected) {
            return Err(AuthzError::InvalidMatcher(format!("expected {what}")));
        }
        Ok(())
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, AuthzError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, AuthzError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// comparison = unary (("==" | "!=") unary | "in" "(" list ")")?
    fn parse_comparison(&mut self) -> Result<Expr, AuthzError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::In) => {
                self.advance();
                self.expect(Token::LParen, "`(` after `in`")?;
                let list = self.parse_args()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    list,
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, AuthzError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }
        self.parse_primary()
    }

    /// primary = literal | field | call | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, AuthzError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(field)) => self.resolve_field(&name, &field),
                        _ => Err(AuthzError::InvalidMatcher(format!(
                            "expected field name after `{name}.`"
                        ))),
                    }
                }
                Some(Token::LParen) => {
                    self.advance();
                    let args = self.parse_args()?;
                    self.resolve_call(&name, args)
                }
                _ => Err(AuthzError::InvalidMatcher(format!(
                    "bare identifier `{name}` (expected `{name}.<field>` or `{name}(...)`)"
                ))),
            },
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            other => Err(AuthzError::InvalidMatcher(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    /// args = ")" | expr ("," expr)* ")"   (opening paren already consumed)
    fn parse_args(&mut self) -> Result<Vec<Expr>, AuthzError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => {
                    return Err(AuthzError::InvalidMatcher(
                        "expected `,` or `)` in argument list".into(),
                    ))
                }
            }
        }
    }

    fn resolve_field(&self, key: &str, field: &str) -> Result<Expr, AuthzError> {
        let position = |fields: &[String]| fields.iter().position(|f| f == field);
        let resolved = if key == self.scope.request_key {
            position(self.scope.request_fields).map(Expr::Request)
        } else if key == self.scope.policy_key {
            position(self.scope.policy_fields).map(Expr::Policy)
        } else {
            return Err(AuthzError::InvalidMatcher(format!(
                "unknown definition `{key}` in `{key}.{field}`"
            )));
        };
        resolved.ok_or_else(|| {
            AuthzError::InvalidMatcher(format!("`{key}` has no field `{field}`"))
        })
    }

    fn resolve_call(&self, name: &str, args: Vec<Expr>) -> Result<Expr, AuthzError> {
        if let Some(&arity) = self.scope.role_types.get(name) {
            if args.len() != arity {
                return Err(AuthzError::InvalidMatcher(format!(
                    "`{name}` takes {arity} arguments, got {}",
                    args.len()
                )));
            }
            return Ok(Expr::HasRole {
                role_type: name.to_string(),
                args,
            });
        }
        let func: Builtin = name.parse()?;
        if args.len() != func.arity() {
            return Err(AuthzError::InvalidMatcher(format!(
                "`{name}` takes {} arguments, got {}",
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call { func, args })
    }
}

/// Parse and type-check a matcher against the names a model declares.
pub fn compile(input: &str, scope: Scope<'_>) -> Result<Expr, AuthzError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(AuthzError::InvalidMatcher("empty expression".into()));
    }
    let mut parser = Parser::new(tokens, scope);
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(AuthzError::InvalidMatcher(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    if type_of(&expr)? != Type::Bool {
        return Err(AuthzError::InvalidMatcher(
            "matcher must evaluate to a boolean".into(),
        ));
    }
    Ok(expr)
}

fn type_of(expr: &Expr) -> Result<Type, AuthzError> {
    let expect = |e: &Expr, ty: Type, ctx: &str| -> Result<(), AuthzError> {
        if type_of(e)? != ty {
            return Err(AuthzError::InvalidMatcher(format!(
                "{ctx} requires {} operands",
                if ty == Type::Bool { "boolean" } else { "string" }
            )));
        }
        Ok(())
    };
    match expr {
        Expr::Str(_) | Expr::Request(_) | Expr::Policy(_) => Ok(Type::Str),
        Expr::Bool(_) => Ok(Type::Bool),
        Expr::Not(inner) => {
            expect(inner, Type::Bool, "`!`")?;
            Ok(Type::Bool)
        }
        Expr::BinOp { op, left, right } => {
            match op {
                BinOp::And => {
                    expect(left, Type::Bool, "`&&`")?;
                    expect(right, Type::Bool, "`&&`")?;
                }
                BinOp::Or => {
                    expect(left, Type::Bool, "`||`")?;
                    expect(right, Type::Bool, "`||`")?;
                }
                BinOp::Eq | BinOp::Ne => {
                    if type_of(left)? != type_of(right)? {
                        return Err(AuthzError::InvalidMatcher(
                            "`==`/`!=` operands must have the same type".into(),
                        ));
                    }
                }
            }
            Ok(Type::Bool)
        }
        Expr::In { element, list } => {
            let ty = type_of(element)?;
            for item in list {
                if type_of(item)? != ty {
                    return Err(AuthzError::InvalidMatcher(
                        "`in` list items must match the element type".into(),
                    ));
                }
            }
            Ok(Type::Bool)
        }
        Expr::Call { args, .. } | Expr::HasRole { args, .. } => {
            for arg in args {
                expect(arg, Type::Str, "function call")?;
            }
            Ok(Type::Bool)
        }
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Answers `g(...)` calls during evaluation.
pub trait RoleLookup {
    fn has_link(&self, role_type: &str, member: &str, role: &str, domain: Option<&str>) -> bool;
}

/// Values a single evaluation is bound to.
pub struct Bindings<'a> {
    pub request: &'a [&'a str],
    pub policy: &'a [String],
    pub roles: &'a dyn RoleLookup,
    pub regexes: &'a RegexCache,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EvalResult<'a> {
    Str(&'a str),
    Bool(bool),
}

/// Evaluate a compiled matcher against one request and one policy row.
pub fn evaluate(expr: &Expr, bindings: &Bindings<'_>) -> Result<bool, AuthzError> {
    match eval_value(expr, bindings)? {
        EvalResult::Bool(b) => Ok(b),
        EvalResult::Str(_) => Err(AuthzError::Evaluation(
            "matcher did not evaluate to a boolean".into(),
        )),
    }
}

fn eval_value<'a>(expr: &'a Expr, b: &Bindings<'a>) -> Result<EvalResult<'a>, AuthzError> {
    match expr {
        Expr::Str(s) => Ok(EvalResult::Str(s)),
        Expr::Bool(v) => Ok(EvalResult::Bool(*v)),
        Expr::Request(idx) => b
            .request
            .get(*idx)
            .copied()
            .map(EvalResult::Str)
            .ok_or_else(|| AuthzError::Evaluation(format!("request has no field #{idx}"))),
        Expr::Policy(idx) => Ok(EvalResult::Str(
            b.policy.get(*idx).map(String::as_str).unwrap_or(""),
        )),
        Expr::Not(inner) => Ok(EvalResult::Bool(!eval_bool(inner, b)?)),
        Expr::BinOp { op, left, right } => match op {
            BinOp::And => Ok(EvalResult::Bool(eval_bool(left, b)? && eval_bool(right, b)?)),
            BinOp::Or => Ok(EvalResult::Bool(eval_bool(left, b)? || eval_bool(right, b)?)),
            BinOp::Eq => Ok(EvalResult::Bool(eval_value(left, b)? == eval_value(right, b)?)),
            BinOp::Ne => Ok(EvalResult::Bool(eval_value(left, b)? != eval_value(right, b)?)),
        },
        Expr::In { element, list } => {
            let elem = eval_value(element, b)?;
            for item in list {
                if eval_value(item, b)? == elem {
                    return Ok(EvalResult::Bool(true));
                }
            }
            Ok(EvalResult::Bool(false))
        }
        Expr::Call { func, args } => {
            let args = eval_strs(args, b)?;
            Ok(EvalResult::Bool(func.call(&args, b.regexes)?))
        }
        Expr::HasRole { role_type, args } => {
            let linked = match eval_strs(args, b)?.as_slice() {
                [member, role] => b.roles.has_link(role_type, member, role, None),
                [member, role, domain] => {
                    b.roles.has_link(role_type, member, role, Some(*domain))
                }
                other => {
                    return Err(AuthzError::Evaluation(format!(
                        "`{role_type}` called with {} arguments",
                        other.len()
                    )))
                }
            };
            Ok(EvalResult::Bool(linked))
        }
    }
}

fn eval_bool<'a>(expr: &'a Expr, b: &Bindings<'a>) -> Result<bool, AuthzError> {
    match eval_value(expr, b)? {
        EvalResult::Bool(v) => Ok(v),
        EvalResult::Str(_) => Err(AuthzError::Evaluation(
            "expected a boolean operand".into(),
        )),
    }
}

fn eval_strs<'a>(args: &'a [Expr], b: &Bindings<'a>) -> Result<Vec<&'a str>, AuthzError> {
    args.iter()
        .map(|arg| match eval_value(arg, b)? {
            EvalResult::Str(s) => Ok(s),
            EvalResult::Bool(_) => Err(AuthzError::Evaluation(
                "function arguments must be strings".into(),
            )),
        })
        .collect()
}
