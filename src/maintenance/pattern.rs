// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Glob matching for repository and CA names.
//!
//! A glob is translated once into an anchored regex: `*` becomes `.*`, `?`
//! becomes `.`, everything else is matched literally.

use regex::Regex;

/// A compiled `*` / `?` glob
#[derive(Debug, Clone)]
pub struct Glob {
    regex: Option<Regex>,
}

impl Glob {
    pub fn new(pattern: &str) -> Self {
        let mut translated = String::with_capacity(pattern.len() + 8);
        translated.push_str("^(?s:");
        let mut literal = String::new();
        for c in pattern.chars() {
            match c {
                '*' | '?' => {
                    translated.push_str(&regex::escape(&literal));
                    literal.clear();
                    translated.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        translated.push_str(&regex::escape(&literal));
        translated.push_str(")$");

        // Literal runs are escaped, so this only fails on size limits
        Glob {
            regex: Regex::new(&translated).ok(),
        }
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(candidate))
    }
}

/// Match `candidate` against `pattern`; an empty pattern matches everything
pub fn matches_pattern(candidate: &str, pattern: &str) -> bool {
    pattern.is_empty() || Glob::new(pattern).is_match(candidate)
}
