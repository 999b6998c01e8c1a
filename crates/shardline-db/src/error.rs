//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`]. Driver errors from [`sqlx`] are
//! flattened into owned strings (keeping the SQLSTATE when the server supplied
//! one) so that the retry classifier in [`crate::classify`] can inspect them
//! and so that errors can be cloned into replay reports.

/// Errors that can occur in the data layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// The table is not on the executor's allow-list.
    #[error("table is not allow-listed: {0}")]
    InvalidTable(String),

    /// A column name or conflict key failed identifier validation.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A write was built with no columns, or an update/delete had no predicate.
    #[error("empty write: {0}")]
    EmptyWrite(String),

    /// The server rejected or failed the statement.
    #[error("query failed: {message}")]
    Query {
        /// SQLSTATE reported by the server, if any.
        code: Option<String>,
        /// Server or driver message.
        message: String,
    },

    /// Pool-level failure: no connection could be acquired or the socket died.
    #[error("connection error: {0}")]
    Connection(String),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A row or queued write could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Whether this error was raised by call-site validation, before any
    /// statement reached the network.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTable(_) | Self::InvalidIdentifier(_) | Self::EmptyWrite(_)
        )
    }

    /// The SQLSTATE carried by a [`DbError::Query`], if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::Query {
                code: db.code().map(std::borrow::Cow::into_owned),
                message: db.message().to_owned(),
            },
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::Tls(e) => Self::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut => {
                Self::Connection("timed out waiting for a pooled connection".to_owned())
            }
            sqlx::Error::PoolClosed => Self::Connection("connection pool is closed".to_owned()),
            sqlx::Error::WorkerCrashed => {
                Self::Connection("connection background worker crashed".to_owned())
            }
            sqlx::Error::Configuration(e) => Self::Config(e.to_string()),
            other => Self::Query {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_flagged() {
        assert!(DbError::InvalidTable("users".to_owned()).is_validation());
        assert!(DbError::InvalidIdentifier("a b".to_owned()).is_validation());
        assert!(DbError::EmptyWrite("no columns".to_owned()).is_validation());
        assert!(!DbError::Connection("refused".to_owned()).is_validation());
    }

    #[test]
    fn sqlstate_is_exposed_for_query_errors() {
        let err = DbError::Query {
            code: Some("23505".to_owned()),
            message: "duplicate key".to_owned(),
        };
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(DbError::Connection(String::new()).sqlstate(), None);
    }

    #[test]
    fn pool_timeout_maps_to_connection() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Connection(_)));
    }
}
