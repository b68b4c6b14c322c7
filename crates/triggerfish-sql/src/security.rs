//! Identifier and literal handling for generated SQL.
//!
//! Everything the crate renders into DDL or a `WHEN (...)` clause goes through
//! one of these functions:
//! - identifiers are validated and then always double-quoted
//! - string values are rendered as single-quoted literals with `'` doubled
//! - `LIKE` patterns built from literals have their wildcards escaped
//! - channel names are restricted to a conservative character set

use crate::error::ValidationError;

/// Maximum identifier length accepted by PostgreSQL (`NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a SQL identifier (schema, table, column, trigger or function name).
///
/// Identifiers are always quoted when rendered, so any character is allowed
/// except NUL. The name must be non-empty and at most 63 bytes, since longer
/// names are silently truncated by the server and would no longer match.
///
/// # Examples
///
/// ```
/// use triggerfish_sql::security::validate_identifier;
///
/// assert!(validate_identifier("orders").is_ok());
/// assert!(validate_identifier("Order Items").is_ok());
///
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier(&"x".repeat(64)).is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::identifier(name, "cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::identifier(
            name,
            format!(
                "too long: {} bytes (max {})",
                name.len(),
                MAX_IDENTIFIER_LEN
            ),
        ));
    }

    if name.contains('\0') {
        return Err(ValidationError::identifier(name, "contains a NUL byte"));
    }

    Ok(())
}

/// Validate a notification channel name.
///
/// Channels are passed to `LISTEN`, `UNLISTEN` and `pg_notify`, so they are
/// restricted to ASCII alphanumerics and `_ - . :`, at most 63 bytes.
///
/// # Examples
///
/// ```
/// use triggerfish_sql::security::validate_channel;
///
/// assert!(validate_channel("orders_status_changed").is_ok());
/// assert!(validate_channel("app:orders.v1").is_ok());
///
/// assert!(validate_channel("orders; NOTIFY x").is_err());
/// ```
pub fn validate_channel(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::channel(name, "cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::channel(
            name,
            format!(
                "too long: {} bytes (max {})",
                name.len(),
                MAX_IDENTIFIER_LEN
            ),
        ));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(ValidationError::channel(
            name,
            format!("contains invalid character '{}'", c.escape_default()),
        ));
    }

    Ok(())
}

/// Quote an identifier for PostgreSQL, doubling embedded quotes.
///
/// ```
/// use triggerfish_sql::security::quote_identifier;
///
/// assert_eq!(quote_identifier("status"), "\"status\"");
/// assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified name.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(name))
}

/// Escape a string value for a single-quoted SQL literal.
///
/// ```
/// use triggerfish_sql::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("paid"), "paid");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Render a value as a complete single-quoted SQL literal.
///
/// Backslashes are left alone: with `standard_conforming_strings` (the
/// default since PostgreSQL 9.1) they carry no meaning inside `'...'`.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", escape_string_literal(value))
}

/// Escape `LIKE` metacharacters so the value matches literally.
///
/// Uses the default `LIKE` escape character (`\`).
///
/// ```
/// use triggerfish_sql::security::escape_like;
///
/// assert_eq!(escape_like("50%_off"), "50\\%\\_off");
/// ```
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
