//! # SwKit Common
//!
//! Shared error type, logging configuration, and timeout helpers for the SwKit
//! offline caching workspace.
//!
//! ## Features
//!
//! - One error enum shared by every SwKit crate
//! - Logging configuration and setup
//! - Timeout wrapper for network operations
//! - Result extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{maybe_with_timeout, with_timeout};

/// Unified error type for SwKit.
#[derive(Error, Debug)]
pub enum SwKitError {
    /// The network fetch itself failed (connection refused, DNS, abort).
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A cache read or write failed (including quota exhaustion).
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker install (precache) failed.
    #[error("Install failed: {message}")]
    Install {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A URL could not be parsed or resolved.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl SwKitError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an install error wrapping the failure that aborted it.
    pub fn install(message: impl Into<String>, source: SwKitError) -> Self {
        Self::Install {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Whether this error means "the network did not answer".
    ///
    /// These are the failures that trigger cache and offline fallbacks.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, SwKitError::Network { .. } | SwKitError::Timeout(_))
    }

    /// Get the error category for structured logs.
    pub fn category(&self) -> &'static str {
        match self {
            SwKitError::Network { .. } => "network",
            SwKitError::Storage { .. } => "storage",
            SwKitError::Install { .. } => "install",
            SwKitError::Config { .. } => "config",
            SwKitError::InvalidUrl(_) => "invalid_url",
            SwKitError::InvalidState(_) => "invalid_state",
            SwKitError::NotFound(_) => "not_found",
            SwKitError::Io(_) => "io",
            SwKitError::Json(_) => "json",
            SwKitError::Timeout(_) => "timeout",
            SwKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for SwKit operations.
pub type Result<T> = std::result::Result<T, SwKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| SwKitError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| SwKitError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(SwKitError::network("down").category(), "network");
        assert_eq!(SwKitError::storage("quota").category(), "storage");
        assert_eq!(
            SwKitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
        assert_eq!(
            SwKitError::install("precache", SwKitError::network("x")).category(),
            "install"
        );
    }

    #[test]
    fn test_network_failure_classification() {
        assert!(SwKitError::network("refused").is_network_failure());
        assert!(SwKitError::Timeout(Duration::from_millis(5)).is_network_failure());
        assert!(!SwKitError::storage("quota").is_network_failure());
        assert!(!SwKitError::InvalidUrl("nope".into()).is_network_failure());
    }

    #[test]
    fn test_install_error_keeps_source() {
        use std::error::Error as _;

        let err = SwKitError::install("precache /offline.html", SwKitError::network("refused"));
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Network error: refused"));
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("entry").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("entry"),
            Err(SwKitError::NotFound(_))
        ));
    }

    #[test]
    fn test_result_context() {
        let parsed: std::result::Result<u32, std::num::ParseIntError> = "x".parse();
        let err = parsed.context("parse quota").unwrap_err();
        assert!(err.to_string().contains("parse quota"));
    }
}
