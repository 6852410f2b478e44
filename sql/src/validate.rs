//! Identifier and literal validation.
//!
//! Every identifier that reaches a visitor must have passed
//! [`check_identifier`]. The engine enforces this at model-registration time,
//! so a bad name is a configuration error, never a runtime SQL error.

use crate::{Error, ErrorKind, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static regex"));

/// SQL keywords that are never accepted as identifiers, whatever the quoting.
static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "select", "insert", "update", "delete", "drop", "create", "alter", "truncate", "grant",
        "revoke", "union", "join", "where", "from", "table", "database", "schema", "index", "view",
        "procedure", "function", "trigger", "constraint", "primary", "foreign", "references",
        "null", "not", "and", "or", "order", "group", "having", "limit", "offset", "values", "set",
        "into", "as", "on", "using", "distinct", "between", "like", "exists", "case", "when",
        "then", "else", "end", "cast", "default", "unique", "check", "column", "add",
    ]
    .into_iter()
    .collect()
});

/// Literal defaults may name one of these instead of a value; they render as
/// the dialect's function call and are exempt from the injection screen.
pub const DEFAULT_FUNCTION_TOKENS: &[&str] = &["now", "current_timestamp", "uuid"];

pub fn is_valid_identifier(s: &str) -> bool {
    IDENTIFIER_RE.is_match(s) && !RESERVED_WORDS.contains(s.to_ascii_lowercase().as_str())
}

pub fn check_identifier(s: &str) -> Result<()> {
    if !IDENTIFIER_RE.is_match(s) {
        return Err(Error::new(ErrorKind::InvalidIdentifier {
            name: s.to_owned(),
            reason: "must match [A-Za-z_][A-Za-z0-9_]{0,62}".to_owned(),
        }));
    }

    if RESERVED_WORDS.contains(s.to_ascii_lowercase().as_str()) {
        return Err(Error::new(ErrorKind::InvalidIdentifier {
            name: s.to_owned(),
            reason: "reserved SQL keyword".to_owned(),
        }));
    }

    Ok(())
}

/// Savepoint names share the identifier grammar.
pub fn check_savepoint_name(s: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(s) {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::InvalidSavepointName(s.to_owned())))
    }
}

/// Screens a literal default value for statement-breaking content. Function
/// tokens from [`DEFAULT_FUNCTION_TOKENS`] pass as-is.
pub fn is_safe_default_literal(literal: &str) -> bool {
    let lowered = literal.trim().to_ascii_lowercase();

    if DEFAULT_FUNCTION_TOKENS.contains(&lowered.as_str()) {
        return true;
    }

    if lowered.contains(';') || lowered.contains("--") || lowered.contains("/*") {
        return false;
    }

    // Any call-looking pattern outside the whitelist is rejected.
    static CALL_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*\s*\(").expect("static regex"));
    !CALL_RE.is_match(&lowered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_grammar() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("a2"));
        assert!(is_valid_identifier(&"a".repeat(63)));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2abc"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("dash-ed"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
        assert!(!is_valid_identifier("users; DROP TABLE x"));
    }

    #[test]
    fn reserved_words_rejected_case_insensitively() {
        for word in ["select", "SELECT", "Drop", "uNiOn", "where", "table"] {
            assert!(!is_valid_identifier(word), "{word} should be rejected");
        }
    }

    #[test]
    fn check_identifier_reports_reason() {
        let err = check_identifier("select").unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let err = check_identifier("1abc").unwrap_err();
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn safe_default_literals() {
        assert!(is_safe_default_literal("42"));
        assert!(is_safe_default_literal("hello world"));
        assert!(is_safe_default_literal("now"));
        assert!(is_safe_default_literal("CURRENT_TIMESTAMP"));
        assert!(is_safe_default_literal("uuid"));

        assert!(!is_safe_default_literal("1; DROP TABLE users"));
        assert!(!is_safe_default_literal("x -- comment"));
        assert!(!is_safe_default_literal("load_extension('evil')"));
        assert!(!is_safe_default_literal("/* hidden */ 1"));
    }

    #[test]
    fn savepoint_names() {
        assert!(check_savepoint_name("step_0").is_ok());
        assert!(check_savepoint_name("sp; DROP").is_err());
        assert!(check_savepoint_name(&"s".repeat(64)).is_err());
    }
}
