//! Storage location expressions.
//!
//! A location expression selects a set of storage locations:
//!
//! - `SITE1` selects the location named `SITE1`
//! - `*` selects every known location
//! - `tier=disk` selects known locations whose attribute `tier` equals `disk`
//! - `A|B` union, `A&B` intersection, `A\B` difference
//! - parentheses group; operators bind left to right with equal precedence

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

/// Errors from parsing a location expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// Expression was empty or only whitespace.
    #[error("empty location expression")]
    Empty,
    /// Unexpected character at the given byte offset.
    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected {
        /// Offending character.
        found: char,
        /// Byte offset in the source string.
        offset: usize,
    },
    /// Input ended where a term was expected.
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    /// An opening parenthesis was never closed.
    #[error("unbalanced parenthesis")]
    Unbalanced,
}

/// Known storage locations and their attributes.
pub type LocationUniverse = BTreeMap<String, BTreeMap<String, String>>;

/// A parsed location expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationExpression {
    /// `*`
    All,
    /// A single location by name.
    Name(String),
    /// `key=value` attribute match.
    Attribute {
        /// Attribute key.
        key: String,
        /// Required attribute value.
        value: String,
    },
    /// `a|b`
    Union(Box<LocationExpression>, Box<LocationExpression>),
    /// `a&b`
    Intersection(Box<LocationExpression>, Box<LocationExpression>),
    /// `a\b`
    Difference(Box<LocationExpression>, Box<LocationExpression>),
}

impl LocationExpression {
    /// Parse an expression string.
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        if src.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser {
            src,
            chars: src.char_indices().peekable(),
        };
        let expr = parser.expr()?;
        parser.skip_ws();
        match parser.chars.next() {
            None => Ok(expr),
            Some((_, ')')) => Err(ExpressionError::Unbalanced),
            Some((offset, found)) => Err(ExpressionError::Unexpected { found, offset }),
        }
    }

    /// Resolve the expression to the set of location names it selects.
    ///
    /// Bare names select themselves even when absent from `universe`.
    pub fn resolve(&self, universe: &LocationUniverse) -> BTreeSet<String> {
        match self {
            LocationExpression::All => universe.keys().cloned().collect(),
            LocationExpression::Name(name) => BTreeSet::from([name.clone()]),
            LocationExpression::Attribute { key, value } => universe
                .iter()
                .filter(|(_, attrs)| attrs.get(key) == Some(value))
                .map(|(name, _)| name.clone())
                .collect(),
            LocationExpression::Union(a, b) => {
                let mut set = a.resolve(universe);
                set.extend(b.resolve(universe));
                set
            }
            LocationExpression::Intersection(a, b) => {
                let rhs = b.resolve(universe);
                a.resolve(universe)
                    .into_iter()
                    .filter(|n| rhs.contains(n))
                    .collect()
            }
            LocationExpression::Difference(a, b) => {
                let rhs = b.resolve(universe);
                a.resolve(universe)
                    .into_iter()
                    .filter(|n| !rhs.contains(n))
                    .collect()
            }
        }
    }
}

impl fmt::Display for LocationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationExpression::All => write!(f, "*"),
            LocationExpression::Name(n) => write!(f, "{}", n),
            LocationExpression::Attribute { key, value } => write!(f, "{}={}", key, value),
            LocationExpression::Union(a, b) => write!(f, "({}|{})", a, b),
            LocationExpression::Intersection(a, b) => write!(f, "({}&{})", a, b),
            LocationExpression::Difference(a, b) => write!(f, "({}\\{})", a, b),
        }
    }
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

struct Parser<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expr(&mut self) -> Result<LocationExpression, ExpressionError> {
        let mut lhs = self.term()?;
        loop {
            self.skip_ws();
            let op = match self.chars.peek() {
                Some((_, c @ ('|' | '&' | '\\'))) => *c,
                _ => return Ok(lhs),
            };
            self.chars.next();
            let rhs = self.term()?;
            lhs = match op {
                '|' => LocationExpression::Union(Box::new(lhs), Box::new(rhs)),
                '&' => LocationExpression::Intersection(Box::new(lhs), Box::new(rhs)),
                _ => LocationExpression::Difference(Box::new(lhs), Box::new(rhs)),
            };
        }
    }

    fn term(&mut self) -> Result<LocationExpression, ExpressionError> {
        self.skip_ws();
        match self.chars.peek().copied() {
            None => Err(ExpressionError::UnexpectedEnd),
            Some((_, '(')) => {
                self.chars.next();
                let inner = self.expr()?;
                self.skip_ws();
                match self.chars.next() {
                    Some((_, ')')) => Ok(inner),
                    _ => Err(ExpressionError::Unbalanced),
                }
            }
            Some((_, '*')) => {
                self.chars.next();
                Ok(LocationExpression::All)
            }
            Some((start, c)) if is_ident(c) => {
                let key = self.ident(start);
                if let Some((_, '=')) = self.chars.peek() {
                    self.chars.next();
                    match self.chars.peek().copied() {
                        Some((vstart, vc)) if is_ident(vc) => {
                            let value = self.ident(vstart);
                            Ok(LocationExpression::Attribute { key, value })
                        }
                        Some((offset, found)) => Err(ExpressionError::Unexpected { found, offset }),
                        None => Err(ExpressionError::UnexpectedEnd),
                    }
                } else {
                    Ok(LocationExpression::Name(key))
                }
            }
            Some((offset, found)) => Err(ExpressionError::Unexpected { found, offset }),
        }
    }

    fn ident(&mut self, start: usize) -> String {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if !is_ident(c) {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        self.src[start..end].to_string()
    }
}
