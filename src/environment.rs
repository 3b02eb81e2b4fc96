//! Environment requirement expressions.
//!
//! A test describes the products it needs with an expression such as
//!
//! ```text
//! (type=RM-1,role=main)(type=RM-2)
//! ```
//!
//! Each parenthesized group describes one physically distinct product; the
//! whole expression is satisfied by a set of products on one node, one per
//! group. An [`EnvironmentCompiler`] turns the expression into one regular
//! expression per group, matched against a product's canonical attribute
//! string (see [`Product::attribute_string`](crate::inventory::Product::attribute_string)).
//!
//! # Grammar
//!
//! | Form | Meaning |
//! |------|---------|
//! | `(k=v)` | Attribute `k` equals `v` |
//! | `(k=v,k2=v2)` | Both attributes match |
//! | `(k=RM-*)` | `*` matches any run of characters except `;` |
//! | `k=v` | A single group without parentheses |

use std::collections::BTreeMap;

use regex::Regex;

/// Result type for environment compilation.
pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

/// Why an expression can never be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("empty environment expression")]
    Empty,

    #[error("unbalanced parentheses in '{0}'")]
    Unbalanced(String),

    #[error("malformed attribute '{pair}' in '{expression}'")]
    MalformedPair { expression: String, pair: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Turns a requirement expression into one regular expression per required
/// product.
pub trait EnvironmentCompiler: Send + Sync {
    fn compile(&self, expression: &str) -> EnvironmentResult<Vec<String>>;
}

/// The default `(name=value,...)` compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeCompiler;

impl AttributeCompiler {
    fn groups(expression: &str) -> EnvironmentResult<Vec<&str>> {
        let trimmed = expression.trim();
        if !trimmed.contains('(') && !trimmed.contains(')') {
            return Ok(vec![trimmed]);
        }

        let mut groups = Vec::new();
        let mut rest = trimmed;
        while !rest.is_empty() {
            let unbalanced = || EnvironmentError::Unbalanced(expression.to_string());
            let body = rest.strip_prefix('(').ok_or_else(unbalanced)?;
            let end = body.find(')').ok_or_else(unbalanced)?;
            let group = &body[..end];
            if group.contains('(') {
                return Err(unbalanced());
            }
            groups.push(group);
            rest = body[end + 1..].trim_start();
        }
        Ok(groups)
    }

    fn pattern(expression: &str, group: &str) -> EnvironmentResult<String> {
        let mut pairs = BTreeMap::new();
        for pair in group.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let malformed = || EnvironmentError::MalformedPair {
                expression: expression.to_string(),
                pair: pair.to_string(),
            };
            let (name, value) = pair.split_once('=').ok_or_else(malformed)?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || name.contains(';') || value.contains(';') {
                return Err(malformed());
            }
            pairs.insert(name, value);
        }
        if pairs.is_empty() {
            return Err(EnvironmentError::MalformedPair {
                expression: expression.to_string(),
                pair: group.to_string(),
            });
        }

        // Attribute strings are sorted by name, so pairs are matched in the
        // same order with anything allowed in between.
        let body = pairs
            .iter()
            .map(|(name, value)| {
                let value = value
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join("[^;]*");
                format!("{}={}", regex::escape(name), value)
            })
            .collect::<Vec<_>>()
            .join("(?:;.*)?;");
        Ok(format!("^(?:.*;)?{}(?:;.*)?$", body))
    }
}

impl EnvironmentCompiler for AttributeCompiler {
    fn compile(&self, expression: &str) -> EnvironmentResult<Vec<String>> {
        if expression.trim().is_empty() {
            return Err(EnvironmentError::Empty);
        }
        Self::groups(expression)?
            .into_iter()
            .map(|group| Self::pattern(expression, group))
            .collect()
    }
}

/// A compiled environment: one pattern per required product.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    pub expression: String,
    pub patterns: Vec<Regex>,
}

impl PatternGroup {
    /// Compiles `expression` with `compiler` and builds the regexes.
    pub fn compile(
        compiler: &dyn EnvironmentCompiler,
        expression: &str,
    ) -> EnvironmentResult<Self> {
        let patterns = compiler
            .compile(expression)?
            .into_iter()
            .map(|p| {
                Regex::new(&p).map_err(|e| EnvironmentError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<EnvironmentResult<Vec<_>>>()?;
        if patterns.is_empty() {
            return Err(EnvironmentError::Empty);
        }
        Ok(Self {
            expression: expression.to_string(),
            patterns,
        })
    }

    /// Number of distinct products the group needs.
    pub fn size(&self) -> usize {
        self.patterns.len()
    }
}
