//! Digit-collection grammars

use std::time::Duration;

use regex::Regex;

/// Rules for collecting and validating a digit string.
///
/// Collection stops at whichever comes first: the terminator digit, reaching
/// `max_length` digits, or `timeout` elapsing between digits. The pattern is
/// applied afterwards as an unanchored search; anchor it with `^...$` to
/// require a full match.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub name: String,
    pub max_length: usize,
    pub terminator: Option<String>,
    pub timeout: Duration,
    pub pattern: Regex,
}

impl Grammar {
    /// Build a grammar, compiling `pattern`.
    pub fn new(
        name: impl Into<String>,
        max_length: usize,
        terminator: Option<&str>,
        timeout: Duration,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            max_length,
            terminator: terminator
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            timeout,
            pattern: Regex::new(pattern)?,
        })
    }

    /// Whether `digit` ends collection without being collected.
    pub fn is_terminator(&self, digit: &str) -> bool {
        self.terminator
            .as_deref()
            == Some(digit)
    }

    /// Whether `collected` digits already reach the length limit.
    ///
    /// A zero `max_length` never completes by length.
    pub fn is_complete(&self, collected: usize) -> bool {
        self.max_length > 0 && collected >= self.max_length
    }

    /// Unanchored pattern search over the collected digits.
    pub fn validate(&self, digits: &str) -> bool {
        self.pattern
            .is_match(digits)
    }
}
