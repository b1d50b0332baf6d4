//! Error types for shardproxy-backend
//!
//! Errors are classified so callers can tell backpressure apart from
//! permanent failures:
//! - Retriable errors (unreachable backend, exhausted pool, timeout)
//! - Non-retriable errors (configuration, unknown datasource, backend ERR packets)

use std::fmt;
use thiserror::Error;

/// Result type for shardproxy-backend operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed connection string, unknown or unset execution mode
    Configuration,
    /// Request named a datasource absent from the registry
    UnknownDataSource,
    /// Channel creation or handshake failed (retriable)
    BackendUnreachable,
    /// No channel became available within the bounded wait (retriable with backoff)
    PoolExhausted,
    /// Unparseable frame or backend ERR packet
    BackendProtocol,
    /// Operation timed out (retriable)
    Timeout,
    /// Execution cancelled by the caller
    Cancelled,
    /// The backend is shutting down
    Shutdown,
    /// The request itself is invalid (empty targets, parameter mismatch)
    InvalidRequest,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable | Self::PoolExhausted | Self::Timeout
        )
    }
}

/// Main error type for shardproxy-backend
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Configuration is invalid
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Datasource not present in the registry
    #[error("unknown datasource: {name}")]
    UnknownDataSource { name: String },

    /// Channel could not be created, handshaken or kept alive
    #[error("backend unreachable [{datasource}]: {message}")]
    BackendUnreachable {
        datasource: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Pool capacity/timeout policy rejected the acquire
    #[error("pool exhausted [{datasource}]: {message}")]
    PoolExhausted { datasource: String, message: String },

    /// Frame could not be parsed
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Backend answered with an ERR packet
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Caller cancelled the execution
    #[error("execution cancelled")]
    Cancelled,

    /// Backend is shutting down and accepts no new work
    #[error("backend is shutting down")]
    Shutdown,

    /// Request is malformed
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::UnknownDataSource { .. } => ErrorCategory::UnknownDataSource,
            Self::BackendUnreachable { .. } => ErrorCategory::BackendUnreachable,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Protocol { .. } | Self::Server { .. } => ErrorCategory::BackendProtocol,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Shutdown => ErrorCategory::Shutdown,
            Self::InvalidRequest { .. } => ErrorCategory::InvalidRequest,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether the channel that produced this error may be left in an
    /// inconsistent protocol state and must be discarded.
    ///
    /// A backend ERR packet ends the command cleanly, so the channel survives it.
    pub fn breaks_channel(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable { .. }
                | Self::Protocol { .. }
                | Self::Timeout { .. }
                | Self::Cancelled
                | Self::Shutdown
        )
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unknown datasource error
    pub fn unknown_datasource(name: impl Into<String>) -> Self {
        Self::UnknownDataSource { name: name.into() }
    }

    /// Create a backend unreachable error
    pub fn unreachable(datasource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnreachable {
            datasource: datasource.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend unreachable error with source
    pub fn unreachable_with_source(
        datasource: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnreachable {
            datasource: datasource.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(datasource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            datasource: datasource.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::UnknownDataSource => write!(f, "unknown_datasource"),
            Self::BackendUnreachable => write!(f, "backend_unreachable"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::BackendProtocol => write!(f, "backend_protocol"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::InvalidRequest => write!(f, "invalid_request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::BackendUnreachable.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::PoolExhausted.is_retriable());

        assert!(!ErrorCategory::Configuration.is_retriable());
        assert!(!ErrorCategory::UnknownDataSource.is_retriable());
        assert!(!ErrorCategory::BackendProtocol.is_retriable());
    }

    #[test]
    fn test_server_error_keeps_channel() {
        let err = Error::Server {
            code: 1146,
            sql_state: "42S02".into(),
            message: "Table 'shop.missing' doesn't exist".into(),
        };
        assert_eq!(err.category(), ErrorCategory::BackendProtocol);
        assert!(!err.breaks_channel());
        assert!(Error::protocol("short packet").breaks_channel());
        assert!(Error::Cancelled.breaks_channel());
    }

    #[test]
    fn test_error_display() {
        let err = Error::unreachable("ds_0", "connection refused");
        let text = err.to_string();
        assert!(text.contains("ds_0"));
        assert!(text.contains("connection refused"));

        let err = Error::pool_exhausted("ds_1", "no channel within 5000ms");
        assert_eq!(err.category().to_string(), "pool_exhausted");
    }
}
