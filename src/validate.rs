/*!
 * @file validate.rs
 * @brief Identifier validation for field paths and table names
 */

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{MongoraError, Result};

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_REPORTED_LEN: usize = 50;

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap())
}

fn table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]{0,127}$").unwrap())
}

/// Validates a dotted field path and returns it with a single leading `$`
/// stripped. Every segment must match `[a-zA-Z_][a-zA-Z0-9_]*`; the whole
/// path is capped at 128 characters.
///
/// This is the only route by which a user-provided field name may reach the
/// SQL buffer.
pub fn validate_field_path(path: &str) -> Result<String> {
    let stripped = path.strip_prefix('$').unwrap_or(path);

    if stripped.is_empty() {
        return Err(MongoraError::validation("EMPTY_FIELD_PATH", "field path is empty"));
    }
    if stripped.len() > MAX_IDENTIFIER_LEN {
        return Err(MongoraError::validation(
            "FIELD_PATH_TOO_LONG",
            format!("field path exceeds {} characters: {}", MAX_IDENTIFIER_LEN, sanitize(stripped)),
        ));
    }

    for segment in stripped.split('.') {
        if segment.is_empty() {
            return Err(MongoraError::validation(
                "EMPTY_PATH_SEGMENT",
                format!("field path has an empty segment: {}", sanitize(stripped)),
            ));
        }
        if !segment_pattern().is_match(segment) {
            return Err(MongoraError::validation(
                "INVALID_PATH_SEGMENT",
                format!("invalid field path segment: {}", sanitize(segment)),
            ));
        }
    }

    Ok(stripped.to_string())
}

/// Validates a collection/table name: `[a-zA-Z][a-zA-Z0-9_]{0,127}`, no dots.
pub fn validate_table_name(name: &str) -> Result<String> {
    if table_pattern().is_match(name) {
        Ok(name.to_string())
    } else {
        Err(MongoraError::validation(
            "INVALID_TABLE_NAME",
            format!("invalid table name: {}", sanitize(name)),
        ))
    }
}

/// Truncates to 50 chars and replaces control characters so hostile input
/// cannot corrupt error messages or logs.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .take(MAX_REPORTED_LEN)
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_dotted_paths() {
        assert_eq!(validate_field_path("status").unwrap(), "status");
        assert_eq!(validate_field_path("order.items.qty").unwrap(), "order.items.qty");
        assert_eq!(validate_field_path("_id").unwrap(), "_id");
    }

    #[test]
    fn strips_single_leading_dollar() {
        assert_eq!(validate_field_path("$customerId").unwrap(), "customerId");
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_field_path("a; DROP TABLE x").is_err());
        assert!(validate_field_path("a'||'b").is_err());
        assert!(validate_field_path("a..b").is_err());
        assert!(validate_field_path("").is_err());
        assert!(validate_field_path("$").is_err());
    }

    #[test]
    fn rejects_over_long_paths() {
        let long = "a".repeat(129);
        assert!(validate_field_path(&long).is_err());
        let ok = "a".repeat(128);
        assert!(validate_field_path(&ok).is_ok());
    }

    #[test]
    fn table_names_are_stricter() {
        assert!(validate_table_name("orders").is_ok());
        assert!(validate_table_name("orders_2024").is_ok());
        assert!(validate_table_name("_orders").is_err());
        assert!(validate_table_name("orders.archive").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn sanitize_masks_control_characters() {
        let hostile = "bad\nname\u{7}";
        let cleaned = sanitize(hostile);
        assert_eq!(cleaned, "bad?name?");
        assert_eq!(sanitize(&"x".repeat(80)).len(), 50);
    }
}
