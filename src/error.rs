//! The engine's error taxonomy and its projection onto the SQLite
//! result-code space the host consumes.

use libc::c_int;
use snafu::Snafu;
use sqlite_interpose::abi;

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("backend connection lost: {message}"))]
    ConnectionLost { message: String },

    #[snafu(display("no free connection slot after {waited_ms} ms"))]
    PoolExhausted { waited_ms: u64 },

    #[snafu(display("cannot bind parameter {index}: {message}"))]
    ParameterBindingFailed { index: i32, message: String },

    #[snafu(display("{message}"))]
    ExecuteFailed { message: String },

    #[snafu(display("{message}"))]
    ConstraintViolation { message: String },

    #[snafu(display("{message}"))]
    NoSuchTable { message: String },

    #[snafu(display("{message}"))]
    NoSuchColumn { message: String },

    #[snafu(display("statement refused: {message}"))]
    RewriterRefused { message: String },

    #[snafu(display("remaining stack critical ({remaining_kb} KB)"))]
    StackCritical { remaining_kb: usize },

    #[snafu(display("prepare recursion depth {depth} exceeds limit"))]
    RecursionLimit { depth: u32 },

    #[snafu(display("connection inherited across fork was discarded"))]
    ForkDiscarded,

    #[snafu(display("{message}"))]
    Timeout { message: String },

    #[snafu(display("internal invariant violated: {message}"))]
    InternalInvariant { message: String },
}

impl EngineError {
    /// The SQLite result code the host observes for this error.
    pub fn code(&self) -> c_int {
        match self {
            EngineError::ConnectionLost { .. } | EngineError::ForkDiscarded => {
                abi::SQLITE_CANTOPEN
            }
            EngineError::PoolExhausted { .. } | EngineError::Timeout { .. } => abi::SQLITE_BUSY,
            EngineError::ConstraintViolation { .. } => abi::SQLITE_CONSTRAINT,
            EngineError::StackCritical { .. } | EngineError::RecursionLimit { .. } => {
                abi::SQLITE_NOMEM
            }
            EngineError::ParameterBindingFailed { .. }
            | EngineError::ExecuteFailed { .. }
            | EngineError::NoSuchTable { .. }
            | EngineError::NoSuchColumn { .. }
            | EngineError::RewriterRefused { .. }
            | EngineError::InternalInvariant { .. } => abi::SQLITE_ERROR,
        }
    }

    /// Classify a backend error by SQLSTATE class, keeping the backend's
    /// human-readable message verbatim for the host's `errmsg`.
    pub fn from_backend(err: &postgres::Error) -> EngineError {
        if let Some(db) = err.as_db_error() {
            let state = db.code().code();
            let message = db.message().to_string();
            return match state {
                "42P01" => EngineError::NoSuchTable { message },
                "42703" => EngineError::NoSuchColumn { message },
                "55P03" => EngineError::Timeout { message },
                _ if state.starts_with("23") => EngineError::ConstraintViolation { message },
                _ if state.starts_with("57") => EngineError::Timeout { message },
                _ if state.starts_with("08") => EngineError::ConnectionLost { message },
                _ => EngineError::ExecuteFailed { message },
            };
        }
        if err.is_closed() {
            return EngineError::ConnectionLost {
                message: err.to_string(),
            };
        }
        EngineError::ExecuteFailed {
            message: err.to_string(),
        }
    }

    /// Whether a one-shot retry on a fresh connection is worth attempting.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionLost { .. } | EngineError::ForkDiscarded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_host_expectations() {
        assert_eq!(
            EngineError::StackCritical { remaining_kb: 10 }.code(),
            abi::SQLITE_NOMEM
        );
        assert_eq!(
            EngineError::RecursionLimit { depth: 101 }.code(),
            abi::SQLITE_NOMEM
        );
        assert_eq!(
            EngineError::ConstraintViolation {
                message: "duplicate key".into()
            }
            .code(),
            abi::SQLITE_CONSTRAINT
        );
        assert_eq!(
            EngineError::PoolExhausted { waited_ms: 10 }.code(),
            abi::SQLITE_BUSY
        );
        assert_eq!(
            EngineError::ConnectionLost {
                message: "eof".into()
            }
            .code(),
            abi::SQLITE_CANTOPEN
        );
    }

    #[test]
    fn connection_loss_is_retryable() {
        assert!(EngineError::ForkDiscarded.is_connection_loss());
        assert!(!EngineError::PoolExhausted { waited_ms: 1 }.is_connection_loss());
    }
}
