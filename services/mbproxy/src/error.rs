//! Error handling for the Modbus proxy
//!
//! Per-connection errors are handled by the loop that owns the connection and
//! never cross session boundaries. Only startup failures reach `main`.

use thiserror::Error;

/// Proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Upstream address did not resolve to any socket address
    #[error("Failed to resolve upstream {address}: {reason}")]
    Resolve { address: String, reason: String },

    /// Upstream connection attempt failed or timed out
    #[error("Failed to connect to upstream {address}: {reason}")]
    Connect { address: String, reason: String },

    /// Accept loop failure
    #[error("Accept error: {0}")]
    Accept(#[source] std::io::Error),

    /// Socket I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A proxy task panicked or was aborted
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias for the proxy
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        ProxyError::Config(msg.into())
    }

    pub fn connect(address: impl Into<String>, reason: impl ToString) -> Self {
        ProxyError::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn resolve(address: impl Into<String>, reason: impl ToString) -> Self {
        ProxyError::Resolve {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::connect("plc:502", "connection refused");
        assert_eq!(
            err.to_string(),
            "Failed to connect to upstream plc:502: connection refused"
        );

        let err = ProxyError::resolve("plc.invalid:502", "no addresses found");
        assert!(err.to_string().contains("plc.invalid:502"));
    }

    #[test]
    fn test_bind_error_keeps_source() {
        use std::error::Error;

        let err = ProxyError::Bind {
            address: "0.0.0.0:502".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().starts_with("Failed to bind 0.0.0.0:502"));
        assert!(err.source().is_some());
    }
}
