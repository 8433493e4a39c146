//! Identifier validation and quoting for legacy queries.
//!
//! Table and column names cannot be bound as parameters, so they are the only
//! part of a [`Query`](super::query::Query) interpolated into its text. They
//! are validated and quoted here; values always travel as parameters.

use crate::error::{MigrateError, Result};

/// Maximum identifier length (conservative limit across databases).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, null bytes and identifiers longer than
/// [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an ANSI SQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
/// Dotted names (`schema.table`) are quoted part by part.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    let parts: Vec<String> = name
        .split('.')
        .map(|part| {
            validate_identifier(part)?;
            Ok(format!("\"{}\"", part.replace('"', "\"\"")))
        })
        .collect::<Result<_>>()?;
    Ok(parts.join("."))
}
