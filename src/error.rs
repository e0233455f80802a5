//! Error types for the pool.
//!
//! Every failure surfaced by the crate is one of the `Error` kinds below.
//! Per-execution errors are sticky: the first error recorded for a query is
//! the one its completion handle returns.

use std::collections::HashMap;
use std::io;

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    ParseConfig(String),

    /// Dial, TLS negotiation, startup, or authentication failed.
    #[error("failed to connect to `host={host} user={user} database={database}`: {message}")]
    Connect {
        host: String,
        user: String,
        database: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The server reported an error.
    #[error(transparent)]
    Pg(Box<PgError>),

    /// A socket write failed. `safe_to_retry` is true iff no bytes reached
    /// the wire.
    #[error("write failed: {source}")]
    Write {
        #[source]
        source: io::Error,
        safe_to_retry: bool,
    },

    /// A socket operation timed out. Timeouts do not close the connection.
    #[error("timeout: {0}")]
    Timeout(#[source] io::Error),

    /// An argument could not be encoded for its parameter OID.
    #[error("{0}")]
    Serialization(String),

    /// More than 65 535 arguments were supplied.
    #[error("args limit")]
    ArgsLimit,

    /// The query was reclaimed by the freshness TTL before its result was
    /// read.
    #[error("result not actual")]
    ResultNotActual,

    /// The peer sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection (or an internal channel) is closed.
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error was caused by an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True when the error is guaranteed to have occurred before any data
    /// reached the server.
    pub fn safe_to_retry(&self) -> bool {
        match self {
            Error::Write { safe_to_retry, .. } => *safe_to_retry,
            Error::Serialization(_) | Error::ArgsLimit => true,
            _ => false,
        }
    }

    /// The server-reported error, if that is what this is.
    pub fn as_pg(&self) -> Option<&PgError> {
        match self {
            Error::Pg(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn pg(err: PgError) -> Self {
        Error::Pg(Box::new(err))
    }
}

/// An error reported by the PostgreSQL server.
///
/// Field meanings follow the ErrorResponse message format:
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{severity}: {message} (SQLSTATE {code})")]
pub struct PgError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub column_name: Option<String>,
    pub data_type_name: Option<String>,
    pub constraint_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl PgError {
    /// The SQLSTATE of the error.
    pub fn sql_state(&self) -> &str {
        &self.code
    }

    /// True when the server flagged the session as unusable.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }

    /// Build from the tagged fields of an ErrorResponse message.
    pub(crate) fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let text = |tag: u8| fields.get(&tag).cloned();
        let num = |tag: u8| fields.get(&tag).and_then(|v| v.parse().ok());
        PgError {
            severity: text(b'S').unwrap_or_default(),
            code: text(b'C').unwrap_or_default(),
            message: text(b'M').unwrap_or_default(),
            detail: text(b'D'),
            hint: text(b'H'),
            position: num(b'P'),
            internal_position: num(b'p'),
            internal_query: text(b'q'),
            where_: text(b'W'),
            schema_name: text(b's'),
            table_name: text(b't'),
            column_name: text(b'c'),
            data_type_name: text(b'd'),
            constraint_name: text(b'n'),
            file: text(b'F'),
            line: num(b'L'),
            routine: text(b'R'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(u8, &str)]) -> HashMap<u8, String> {
        pairs.iter().map(|(t, v)| (*t, v.to_string())).collect()
    }

    #[test]
    fn pg_error_from_fields() {
        let err = PgError::from_fields(&fields(&[
            (b'S', "ERROR"),
            (b'C', "22012"),
            (b'M', "division by zero"),
            (b'P', "8"),
            (b'F', "int.c"),
            (b'L', "841"),
        ]));
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.sql_state(), "22012");
        assert_eq!(err.position, Some(8));
        assert_eq!(err.line, Some(841));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "ERROR: division by zero (SQLSTATE 22012)");
    }

    #[test]
    fn fatal_severity() {
        let err = PgError::from_fields(&fields(&[
            (b'S', "FATAL"),
            (b'C', "28P01"),
            (b'M', "password authentication failed"),
        ]));
        assert!(err.is_fatal());
    }

    #[test]
    fn write_error_retry_hint() {
        let err = Error::Write {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
            safe_to_retry: true,
        };
        assert!(err.safe_to_retry());

        let err = Error::Write {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
            safe_to_retry: false,
        };
        assert!(!err.safe_to_retry());
    }

    #[test]
    fn timeout_classification() {
        let err = Error::Timeout(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(err.is_timeout());
        assert!(!Error::ArgsLimit.is_timeout());
    }
}
