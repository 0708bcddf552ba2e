//! Identifier validation
//!
//! Table and column names cannot be bound as parameters, so every
//! caller-supplied identifier passes through here before it is spliced into
//! statement text.

use crate::error::{DataError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum identifier length accepted
const MAX_IDENTIFIER_LEN: usize = 63;

/// Keywords that may never be used as a bare identifier
const RESERVED_KEYWORDS: &[&str] = &[
    "add", "all", "alter", "and", "as", "attach", "begin", "between", "by", "case", "check",
    "column", "commit", "constraint", "create", "cross", "database", "default", "delete",
    "desc", "detach", "distinct", "drop", "else", "end", "escape", "except", "exec",
    "execute", "exists", "foreign", "from", "full", "grant", "group", "having", "in",
    "index", "inner", "insert", "intersect", "into", "is", "join", "left", "like", "limit",
    "not", "null", "offset", "on", "or", "order", "outer", "pragma", "primary", "references",
    "reindex", "release", "replace", "revoke", "right", "rollback", "savepoint", "select",
    "set", "table", "then", "transaction", "trigger", "truncate", "union", "unique", "update",
    "using", "vacuum", "values", "view", "when", "where", "with",
];

// The pattern is a literal; compilation cannot fail.
#[allow(clippy::unwrap_used)]
fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// Whether `name` is a reserved keyword (case-insensitive)
pub fn is_reserved_keyword(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_KEYWORDS.contains(&lower.as_str())
}

/// Validate a bare identifier (`projects`, `creator_id`)
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_IDENTIFIER_LEN
        || !identifier_pattern().is_match(name)
        || is_reserved_keyword(name)
    {
        return Err(DataError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// Validate an identifier that may be qualified with a table (`projects.id`)
pub fn validate_qualified_identifier(name: &str) -> Result<()> {
    let mut parts = name.splitn(2, '.');
    match (parts.next(), parts.next()) {
        (Some(table), Some(column)) => {
            validate_identifier(table).map_err(|_| DataError::InvalidIdentifier(name.to_string()))?;
            validate_identifier(column)
                .map_err(|_| DataError::InvalidIdentifier(name.to_string()))
        }
        _ => validate_identifier(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        for name in ["projects", "creator_id", "_internal", "Table2", "updated_at"] {
            assert!(validate_identifier(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_identifiers() {
        for name in [
            "",
            "2fast",
            "drop table",
            "name;--",
            "a-b",
            "\"quoted\"",
            "projects.id",
        ] {
            assert!(validate_identifier(name).is_err(), "{} should be invalid", name);
        }
        let long = "a".repeat(64);
        assert!(validate_identifier(&long).is_err());
    }

    #[test]
    fn test_reserved_keywords_blocked() {
        assert!(validate_identifier("select").is_err());
        assert!(validate_identifier("DROP").is_err());
        assert!(validate_identifier("Where").is_err());
        assert!(validate_identifier("selection").is_ok());
    }

    #[test]
    fn test_qualified_identifiers() {
        assert!(validate_qualified_identifier("projects.id").is_ok());
        assert!(validate_qualified_identifier("id").is_ok());
        assert!(validate_qualified_identifier("projects.").is_err());
        assert!(validate_qualified_identifier("a.b.c").is_err());
        assert!(validate_qualified_identifier("projects.select").is_err());
    }
}
