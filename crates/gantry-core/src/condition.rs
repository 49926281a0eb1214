//! Run-condition expression language.
//!
//! Conditions are evaluated over the terminal outcomes of a job's
//! dependencies. The grammar is the small CI-conventional one:
//!
//! ```text
//! expr      := or
//! or        := and ( "||" and )*
//! and       := unary ( "&&" unary )*
//! unary     := "!" unary | primary
//! primary   := "(" expr ")" | call | comparison
//! call      := ("always"|"success"|"failure"|"cancelled"|"skipped") "(" names? ")"
//! comparison:= "needs" "." name "." "result" ("==" | "!=") "'" keyword "'"
//! ```
//!
//! Expressions are parsed at graph-build time so unknown references surface
//! before anything runs.

use crate::outcome::Outcome;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("Unexpected token at offset {offset}: {found}")]
    UnexpectedToken { offset: usize, found: String },

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown outcome keyword: {0}")]
    UnknownKeyword(String),

    #[error("always() takes no arguments")]
    AlwaysWithArguments,

    #[error("Trailing input after expression: {0}")]
    TrailingInput(String),
}

/// Outcome keyword in a `needs.X.result == '...'` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKeyword {
    Success,
    /// Matches Failed and TimedOut.
    Failure,
    Skipped,
    Cancelled,
    /// Matches TimedOut only.
    TimedOut,
}

impl OutcomeKeyword {
    fn parse(s: &str) -> Result<Self, ConditionError> {
        match s {
            "success" => Ok(OutcomeKeyword::Success),
            "failure" => Ok(OutcomeKeyword::Failure),
            "skipped" => Ok(OutcomeKeyword::Skipped),
            "cancelled" => Ok(OutcomeKeyword::Cancelled),
            "timed_out" => Ok(OutcomeKeyword::TimedOut),
            other => Err(ConditionError::UnknownKeyword(other.to_string())),
        }
    }

    fn matches(&self, outcome: Outcome) -> bool {
        match self {
            OutcomeKeyword::Success => outcome == Outcome::Succeeded,
            OutcomeKeyword::Failure => outcome.counts_as_failure(),
            OutcomeKeyword::Skipped => outcome == Outcome::Skipped,
            OutcomeKeyword::Cancelled => outcome == Outcome::Cancelled,
            OutcomeKeyword::TimedOut => outcome == Outcome::TimedOut,
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// True regardless of upstream outcomes.
    Always,
    /// All named dependencies (all needs when empty) terminated Succeeded.
    Success(Vec<String>),
    /// At least one named dependency terminated Failed or TimedOut.
    Failure(Vec<String>),
    /// At least one named dependency was Cancelled.
    Cancelled(Vec<String>),
    /// At least one named dependency was Skipped.
    Skipped(Vec<String>),
    Compare {
        name: String,
        negated: bool,
        keyword: OutcomeKeyword,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ConditionError::TrailingInput(tok.describe()));
        }
        Ok(expr)
    }

    /// The default condition when a job declares none.
    pub fn default_condition() -> Expr {
        Expr::Success(Vec::new())
    }

    /// Every dependency name the expression references.
    pub fn references(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_references(&mut names);
        names
    }

    fn collect_references<'a>(&'a self, into: &mut Vec<&'a str>) {
        match self {
            Expr::Always => {}
            Expr::Success(names)
            | Expr::Failure(names)
            | Expr::Cancelled(names)
            | Expr::Skipped(names) => into.extend(names.iter().map(String::as_str)),
            Expr::Compare { name, .. } => into.push(name),
            Expr::Not(inner) => inner.collect_references(into),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_references(into);
                b.collect_references(into);
            }
        }
    }

    /// Evaluate over the terminal outcomes of the job's dependencies.
    ///
    /// `outcomes` maps dependency name to its terminal outcome; `all_needs`
    /// is the job's full needs list, used when a status call names no
    /// dependencies explicitly.
    pub fn evaluate(&self, outcomes: &HashMap<String, Outcome>, all_needs: &[String]) -> bool {
        match self {
            Expr::Always => true,
            Expr::Success(names) => {
                resolve_names(names, all_needs).all(|n| outcomes.get(n) == Some(&Outcome::Succeeded))
            }
            Expr::Failure(names) => resolve_names(names, all_needs)
                .any(|n| outcomes.get(n).is_some_and(|o| o.counts_as_failure())),
            Expr::Cancelled(names) => {
                resolve_names(names, all_needs).any(|n| outcomes.get(n) == Some(&Outcome::Cancelled))
            }
            Expr::Skipped(names) => {
                resolve_names(names, all_needs).any(|n| outcomes.get(n) == Some(&Outcome::Skipped))
            }
            Expr::Compare {
                name,
                negated,
                keyword,
            } => {
                let matched = outcomes.get(name).is_some_and(|o| keyword.matches(*o));
                matched != *negated
            }
            Expr::Not(inner) => !inner.evaluate(outcomes, all_needs),
            Expr::And(a, b) => a.evaluate(outcomes, all_needs) && b.evaluate(outcomes, all_needs),
            Expr::Or(a, b) => a.evaluate(outcomes, all_needs) || b.evaluate(outcomes, all_needs),
        }
    }
}

fn resolve_names<'a>(
    names: &'a [String],
    all_needs: &'a [String],
) -> impl Iterator<Item = &'a str> {
    let list = if names.is_empty() { all_needs } else { names };
    list.iter().map(String::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Quoted(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Quoted(s) => format!("'{}'", s),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::Bang => "!".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::EqEq => "==".into(),
            Token::NotEq => "!=".into(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '.' => {
                tokens.push((i, Token::Dot));
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push((i, Token::AndAnd));
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push((i, Token::OrOr));
                i += 2;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((i, Token::EqEq));
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((i, Token::NotEq));
                i += 2;
            }
            '!' => {
                tokens.push((i, Token::Bang));
                i += 1;
            }
            '\'' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] != b'\'' {
                    end += 1;
                }
                if end >= bytes.len() {
                    return Err(ConditionError::UnexpectedEnd);
                }
                tokens.push((i, Token::Quoted(input[start..end].to_string())));
                i = end + 1;
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((start, Token::Ident(input[start..i].to_string())));
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    offset: i,
                    found: other.to_string(),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), ConditionError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        let (offset, tok) = self.next()?;
        if tok == expected {
            Ok(())
        } else {
            Err(ConditionError::UnexpectedToken {
                offset,
                found: tok.describe(),
            })
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let (offset, tok) = self.next()?;
        match tok {
            Token::LParen => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(name) if name == "needs" => self.parse_comparison(),
            Token::Ident(name) => self.parse_call(&name),
            other => Err(ConditionError::UnexpectedToken {
                offset,
                found: other.describe(),
            }),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, ConditionError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                let (offset, tok) = self.next()?;
                match tok {
                    Token::Ident(arg) => args.push(arg),
                    other => {
                        return Err(ConditionError::UnexpectedToken {
                            offset,
                            found: other.describe(),
                        });
                    }
                }
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        match name {
            "always" => {
                if args.is_empty() {
                    Ok(Expr::Always)
                } else {
                    Err(ConditionError::AlwaysWithArguments)
                }
            }
            "success" => Ok(Expr::Success(args)),
            "failure" => Ok(Expr::Failure(args)),
            "cancelled" => Ok(Expr::Cancelled(args)),
            "skipped" => Ok(Expr::Skipped(args)),
            other => Err(ConditionError::UnknownFunction(other.to_string())),
        }
    }

    /// `needs` has already been consumed.
    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        self.expect(Token::Dot)?;
        let (offset, tok) = self.next()?;
        let name = match tok {
            Token::Ident(n) => n,
            other => {
                return Err(ConditionError::UnexpectedToken {
                    offset,
                    found: other.describe(),
                });
            }
        };
        self.expect(Token::Dot)?;
        let (offset, tok) = self.next()?;
        match tok {
            Token::Ident(field) if field == "result" => {}
            other => {
                return Err(ConditionError::UnexpectedToken {
                    offset,
                    found: other.describe(),
                });
            }
        }
        let (offset, op) = self.next()?;
        let negated = match op {
            Token::EqEq => false,
            Token::NotEq => true,
            other => {
                return Err(ConditionError::UnexpectedToken {
                    offset,
                    found: other.describe(),
                });
            }
        };
        let (offset, tok) = self.next()?;
        let keyword = match tok {
            Token::Quoted(kw) => OutcomeKeyword::parse(&kw)?,
            other => {
                return Err(ConditionError::UnexpectedToken {
                    offset,
                    found: other.describe(),
                });
            }
        };
        Ok(Expr::Compare {
            name,
            negated,
            keyword,
        })
    }
}
