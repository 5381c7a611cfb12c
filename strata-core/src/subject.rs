//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated token sequences such as `orders.us.2024`.
//! Subscription patterns may additionally contain two wildcards, each of
//! which must occupy a whole token:
//!
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and may only appear last

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-token wildcard.
pub const SINGLE_WILDCARD: &str = "*";
/// Trailing multi-token wildcard.
pub const FULL_WILDCARD: &str = ">";
/// Token separator.
pub const SEPARATOR: char = '.';

/// Returns `true` when `subject` is accepted by `pattern`.
///
/// Matching is case-sensitive and purely token based: no regular expressions,
/// no partial-token globbing.
///
/// ```
/// use strata_core::subject::matches;
///
/// assert!(matches("orders.>", "orders.us.2024"));
/// assert!(!matches("orders.*", "orders.us.2024"));
/// assert!(matches("orders.*", "orders.us"));
/// assert!(matches(">", "anything.at.all"));
/// ```
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split(SEPARATOR);
    let mut subject_tokens = subject.split(SEPARATOR);

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return pattern_tokens.next().is_none(),
            (Some(SINGLE_WILDCARD), Some(_)) => {},
            (Some(p), Some(s)) if p == s => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some concrete subject is accepted by both patterns.
#[must_use]
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut left = a.split(SEPARATOR);
    let mut right = b.split(SEPARATOR);

    loop {
        match (left.next(), right.next()) {
            (Some(FULL_WILDCARD), Some(_)) | (Some(_), Some(FULL_WILDCARD)) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) | (Some(_), Some(SINGLE_WILDCARD)) => {},
            (Some(l), Some(r)) if l == r => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether the pattern contains any wildcard token.
#[must_use]
pub fn has_wildcards(pattern: &str) -> bool {
    pattern.split(SEPARATOR).any(|t| t == SINGLE_WILDCARD || t == FULL_WILDCARD)
}

/// Iterate over the tokens of a subject.
pub fn tokens(subject: &str) -> impl Iterator<Item = &str> {
    subject.split(SEPARATOR)
}

fn check_tokens(subject: &str, allow_wildcards: bool) -> bool {
    if subject.is_empty() {
        return false;
    }
    let mut iter = subject.split(SEPARATOR).peekable();
    while let Some(token) = iter.next() {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return false;
        }
        let is_wildcard = token == SINGLE_WILDCARD || token == FULL_WILDCARD;
        if is_wildcard && !allow_wildcards {
            return false;
        }
        if token == FULL_WILDCARD && iter.peek().is_some() {
            return false;
        }
        // partial-token wildcards such as `new*` are not patterns
        if allow_wildcards && !is_wildcard && (token.contains('*') || token.contains('>')) {
            return false;
        }
    }
    true
}

/// Validate a concrete publish subject (no wildcards).
///
/// # Errors
/// Returns [`Error::InvalidSubject`] for empty tokens, whitespace or wildcards.
pub fn validate_subject(subject: &str) -> Result<()> {
    if check_tokens(subject, false) {
        Ok(())
    } else {
        Err(Error::InvalidSubject { subject: subject.to_string() })
    }
}

/// Validate a subscription pattern.
///
/// # Errors
/// Returns [`Error::InvalidSubject`] when `>` is not the final token, a
/// wildcard shares a token with other characters, or a token is empty.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if check_tokens(pattern, true) {
        Ok(())
    } else {
        Err(Error::InvalidSubject { subject: pattern.to_string() })
    }
}

/// A validated, wildcard-free subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Create a new subject.
    ///
    /// # Errors
    /// Returns an error if the subject is empty, has empty tokens, whitespace
    /// or wildcards.
    pub fn new(subject: impl Into<String>) -> Result<Self> {
        let subject = subject.into();
        validate_subject(&subject)?;
        Ok(Self(subject))
    }

    /// Get the subject as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of tokens.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.0.split(SEPARATOR).count()
    }

    /// Whether this subject is accepted by `pattern`.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        matches(pattern, &self.0)
    }

    /// Convert to owned string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for Subject {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
