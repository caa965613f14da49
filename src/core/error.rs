//! Unified error handling for the caching gateway
//!
//! Every layer (stores, transport, strategies, lifecycle) reports failures
//! through [`CacheError`], so modules never depend on each other's error types.

use std::fmt;

/// Unified error types for the caching layer
#[derive(Debug)]
pub enum CacheError {
    /// A manifest resource could not be retrieved during install
    InstallFailure(String),

    /// A live network request failed at the transport level
    Network(String),

    /// Store backend I/O or serialization errors
    Storage(String),

    /// Lifecycle operation not allowed in the current state
    InvalidTransition(String),

    /// Configuration-related errors
    Configuration(String),

    /// Internal system errors
    Internal(String),

    /// Pingora framework errors
    Pingora(Box<pingora_error::Error>),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InstallFailure(msg) => write!(f, "Install failed: {msg}"),
            CacheError::Network(msg) => write!(f, "Network error: {msg}"),
            CacheError::Storage(msg) => write!(f, "Storage error: {msg}"),
            CacheError::InvalidTransition(msg) => write!(f, "Invalid lifecycle transition: {msg}"),
            CacheError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            CacheError::Internal(msg) => write!(f, "Internal error: {msg}"),
            CacheError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Pingora(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl CacheError {
    /// Whether this error is a transport-level failure, the only signal the
    /// strategies fall back on.
    pub fn is_network(&self) -> bool {
        matches!(self, CacheError::Network(_))
    }
}

// Error conversions
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Storage(format!("serialization failed: {err}"))
    }
}

impl From<Box<pingora_error::Error>> for CacheError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        CacheError::Pingora(err)
    }
}

impl From<CacheError> for Box<pingora_error::Error> {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Pingora(pingora_err) => pingora_err,
            CacheError::Network(msg) => pingora_error::Error::explain(
                pingora_error::ErrorType::ConnectProxyFailure,
                msg,
            ),
            _ => pingora_error::Error::new_str("cache layer failure")
                .more_context(err.to_string()),
        }
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Convenience macros for error creation
#[macro_export]
macro_rules! storage_error {
    ($msg:expr) => {
        $crate::core::CacheError::Storage($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::CacheError::Storage(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! network_error {
    ($msg:expr) => {
        $crate::core::CacheError::Network($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::CacheError::Network(format!($fmt, $($arg)*))
    };
}
