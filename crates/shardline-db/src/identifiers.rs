//! Table allow-list and identifier validation.
//!
//! This is the SQL-injection boundary of the executor. Generated statements
//! interpolate table and column names, so every name is checked here first:
//!
//! - tables must appear in [`ALLOWED_TABLES`], a fixed list compiled into the
//!   crate and not extensible at runtime;
//! - columns and conflict keys must match `[A-Za-z0-9_]+` and fit within
//!   `PostgreSQL`'s 63-byte identifier limit.
//!
//! Values are never interpolated; they are always bound parameters.

use crate::error::DbError;

/// Tables the executor's CRUD helpers may touch.
pub const ALLOWED_TABLES: &[&str] = &[
    "guild_settings",
    "mod_cases",
    "user_warnings",
    "automod_rules",
    "temp_bans",
    "user_levels",
    "reminders",
    "custom_commands",
    "reaction_roles",
    "starboard_entries",
    "music_playlists",
    "audit_log",
];

/// `PostgreSQL` truncates identifiers longer than this (`NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Return `table` if it is on the allow-list.
///
/// # Errors
///
/// Returns [`DbError::InvalidTable`] for any other name.
pub fn validate_table(table: &str) -> Result<&str, DbError> {
    if ALLOWED_TABLES.contains(&table) {
        Ok(table)
    } else {
        Err(DbError::InvalidTable(table.to_owned()))
    }
}

/// Return `ident` if it is a well-formed column identifier.
///
/// # Errors
///
/// Returns [`DbError::InvalidIdentifier`] if the name is empty, too long, or
/// contains anything other than ASCII letters, digits, and underscores.
pub fn validate_identifier(ident: &str) -> Result<&str, DbError> {
    let well_formed = !ident.is_empty()
        && ident.len() <= MAX_IDENTIFIER_LEN
        && ident
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if well_formed {
        Ok(ident)
    } else {
        Err(DbError::InvalidIdentifier(ident.to_owned()))
    }
}

/// Validate and double-quote an identifier for interpolation.
///
/// Quoting keeps reserved words such as `user` or `order` usable as column
/// names. Validation guarantees the name cannot contain a quote.
///
/// # Errors
///
/// Returns [`DbError::InvalidIdentifier`] if validation fails.
pub fn quote_identifier(ident: &str) -> Result<String, DbError> {
    validate_identifier(ident).map(|name| format!("\"{name}\""))
}

/// Validate a table and return it quoted.
///
/// # Errors
///
/// Returns [`DbError::InvalidTable`] if the table is not allow-listed.
pub fn quote_table(table: &str) -> Result<String, DbError> {
    validate_table(table).map(|name| format!("\"{name}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_listed_tables_pass() {
        for table in ALLOWED_TABLES {
            assert_eq!(validate_table(table), Ok(*table));
        }
    }

    #[test]
    fn unknown_tables_fail() {
        assert_eq!(
            validate_table("pg_shadow"),
            Err(DbError::InvalidTable("pg_shadow".to_owned()))
        );
        assert!(validate_table("mod_cases; DROP TABLE mod_cases").is_err());
        assert!(validate_table("MOD_CASES").is_err());
    }

    #[test]
    fn identifiers_are_alphanumeric_underscore() {
        assert!(validate_identifier("guild_id").is_ok());
        assert!(validate_identifier("x1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("guild id").is_err());
        assert!(validate_identifier("id\"--").is_err());
        assert!(validate_identifier("naïve").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn quoting_wraps_validated_names() {
        assert_eq!(quote_identifier("user"), Ok("\"user\"".to_owned()));
        assert_eq!(quote_table("mod_cases"), Ok("\"mod_cases\"".to_owned()));
        assert!(quote_identifier("a\"b").is_err());
    }
}
