// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Tuples are strings of the form `<field,field,...>`. Search patterns share
//! the bracket syntax, but their fields may be regular expressions; a pattern
//! matches a tuple when the whole tuple string matches it.

use crate::StoreError;
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};

const TUPLE_OPEN: char = '<';
const TUPLE_CLOSE: char = '>';

fn is_bracketed(s: &str) -> bool {
    s.len() >= 2 && s.starts_with(TUPLE_OPEN) && s.ends_with(TUPLE_CLOSE)
}

/// Rejects strings that are not tuple-shaped.
pub fn validate_tuple(tuple: &str) -> Result<(), StoreError> {
    if is_bracketed(tuple) {
        Ok(())
    } else {
        Err(StoreError::InvalidTuple(tuple.to_string()))
    }
}

/// A validated, compiled search pattern.
///
/// Equality and hashing go by the source text, so two patterns compiled from
/// the same string are interchangeable.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self, StoreError> {
        if !is_bracketed(source) {
            return Err(StoreError::InvalidPattern(source.to_string()));
        }
        // Anchor the whole expression: a pattern has to cover the tuple.
        let regex = Regex::new(&format!("^(?:{})$", source))
            .map_err(|_| StoreError::InvalidPattern(source.to_string()))?;
        Ok(Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, tuple: &str) -> bool {
        self.regex.is_match(tuple)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}
