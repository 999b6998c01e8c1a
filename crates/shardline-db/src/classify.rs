//! Transient-failure classification.
//!
//! Decides whether a [`DbError`] is worth retrying. Two signals are used:
//!
//! - the SQLSTATE the server reported (see [`PgErrorCode`]), and
//! - substrings of the driver message for failures that never reach the
//!   server (connection resets, socket timeouts).
//!
//! Pool-level [`DbError::Connection`] failures are always transient.
//! Validation errors and integrity violations never are.
//!
//! Reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>

use crate::error::DbError;

/// `PostgreSQL` SQLSTATE codes the executor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    // =========================================================================
    // Class 08 -- Connection Exception
    // =========================================================================

    /// Generic connection exception - Code 08000
    pub const CONNECTION_EXCEPTION: &'static str = "08000";

    /// Client unable to establish connection - Code 08001
    pub const SQLCLIENT_UNABLE_TO_ESTABLISH: &'static str = "08001";

    /// Connection does not exist - Code 08003
    pub const CONNECTION_DOES_NOT_EXIST: &'static str = "08003";

    /// Server rejected the connection - Code 08004
    pub const SQLSERVER_REJECTED_CONNECTION: &'static str = "08004";

    /// Connection failure - Code 08006
    pub const CONNECTION_FAILURE: &'static str = "08006";

    // =========================================================================
    // Class 23 -- Integrity Constraint Violation
    // =========================================================================

    /// Unique violation (duplicate key) - Code 23505
    pub const UNIQUE_VIOLATION: &'static str = "23505";

    // =========================================================================
    // Class 40 -- Transaction Rollback
    // =========================================================================

    /// Serialization failure - Code 40001
    pub const SERIALIZATION_FAILURE: &'static str = "40001";

    /// Deadlock detected - Code 40P01
    pub const DEADLOCK_DETECTED: &'static str = "40P01";

    // =========================================================================
    // Class 53 -- Insufficient Resources
    // =========================================================================

    /// Insufficient resources - Code 53000
    pub const INSUFFICIENT_RESOURCES: &'static str = "53000";

    /// Out of memory - Code 53200
    pub const OUT_OF_MEMORY: &'static str = "53200";

    /// Too many connections - Code 53300
    pub const TOO_MANY_CONNECTIONS: &'static str = "53300";

    // =========================================================================
    // Class 57 -- Operator Intervention
    // =========================================================================

    /// Admin shutdown - Code 57P01
    pub const ADMIN_SHUTDOWN: &'static str = "57P01";

    /// Crash shutdown - Code 57P02
    pub const CRASH_SHUTDOWN: &'static str = "57P02";

    /// Cannot connect now (server starting up) - Code 57P03
    pub const CANNOT_CONNECT_NOW: &'static str = "57P03";

    /// Every code that is expected to clear on its own.
    pub const TRANSIENT: &'static [&'static str] = &[
        Self::SERIALIZATION_FAILURE,
        Self::DEADLOCK_DETECTED,
        Self::ADMIN_SHUTDOWN,
        Self::CRASH_SHUTDOWN,
        Self::CANNOT_CONNECT_NOW,
        Self::CONNECTION_EXCEPTION,
        Self::SQLCLIENT_UNABLE_TO_ESTABLISH,
        Self::CONNECTION_DOES_NOT_EXIST,
        Self::SQLSERVER_REJECTED_CONNECTION,
        Self::CONNECTION_FAILURE,
        Self::INSUFFICIENT_RESOURCES,
        Self::OUT_OF_MEMORY,
        Self::TOO_MANY_CONNECTIONS,
    ];

    /// Check if the code belongs to the transient set.
    #[inline]
    pub fn is_transient(code: &str) -> bool {
        Self::TRANSIENT.contains(&code)
    }

    /// Check if the error code is any integrity constraint violation (Class 23)
    #[inline]
    pub fn is_integrity_constraint_violation(code: &str) -> bool {
        code.starts_with("23")
    }
}

/// Lower-cased message fragments that indicate a dropped or stalled socket.
const TRANSIENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection terminated",
    "broken pipe",
    "econnreset",
    "econnrefused",
    "etimedout",
    "timed out",
    "timeout",
];

/// Decide whether `err` should be retried.
pub fn is_transient(err: &DbError) -> bool {
    match err {
        DbError::Connection(_) => true,
        DbError::Query { code, message } => {
            if let Some(code) = code.as_deref() {
                if PgErrorCode::is_integrity_constraint_violation(code) {
                    return false;
                }
                if PgErrorCode::is_transient(code) {
                    return true;
                }
            }
            message_is_transient(message)
        }
        DbError::InvalidTable(_)
        | DbError::InvalidIdentifier(_)
        | DbError::EmptyWrite(_)
        | DbError::Config(_)
        | DbError::Serialization(_) => false,
    }
}

fn message_is_transient(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(code: Option<&str>, message: &str) -> DbError {
        DbError::Query {
            code: code.map(str::to_owned),
            message: message.to_owned(),
        }
    }

    #[test]
    fn transaction_rollbacks_are_transient() {
        assert!(is_transient(&query(Some("40001"), "could not serialize access")));
        assert!(is_transient(&query(Some("40P01"), "deadlock detected")));
    }

    #[test]
    fn shutdown_and_resource_codes_are_transient() {
        for code in ["57P01", "57P02", "57P03", "53300", "08006"] {
            assert!(is_transient(&query(Some(code), "")), "{code} should retry");
        }
    }

    #[test]
    fn constraint_violations_are_not_transient() {
        assert!(!is_transient(&query(
            Some(PgErrorCode::UNIQUE_VIOLATION),
            "duplicate key value violates unique constraint"
        )));
        assert!(!is_transient(&query(Some("42601"), "syntax error at or near")));
    }

    #[test]
    fn message_fragments_match_without_code() {
        assert!(is_transient(&query(None, "Connection reset by peer")));
        assert!(is_transient(&query(None, "read ETIMEDOUT")));
        assert!(!is_transient(&query(None, "column \"foo\" does not exist")));
    }

    #[test]
    fn connection_and_validation_errors() {
        assert!(is_transient(&DbError::Connection("pool timed out".to_owned())));
        assert!(!is_transient(&DbError::InvalidTable("secrets".to_owned())));
    }
}
