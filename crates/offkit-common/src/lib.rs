//! # offkit Common
//!
//! Shared plumbing for the offkit interception and caching engine.
//!
//! ## Features
//!
//! - Categorized error type with backtrace support for internal failures
//! - Logging setup on top of `tracing-subscriber`
//! - Retry with backoff and bounded-time helpers for network work

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for offkit.
#[derive(Error, Debug)]
pub enum OffkitError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache store errors.
    #[error("Cache error: {message}")]
    Cache {
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

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl OffkitError {
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

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
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

    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OffkitError::Network { .. } | OffkitError::Timeout(_) | OffkitError::Io(_)
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            OffkitError::Network { .. } => "network",
            OffkitError::Cache { .. } => "cache",
            OffkitError::Config { .. } => "config",
            OffkitError::Io(_) => "io",
            OffkitError::Timeout(_) => "timeout",
            OffkitError::NotFound(_) => "not_found",
            OffkitError::InvalidArgument(_) => "invalid_argument",
            OffkitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for offkit operations.
pub type Result<T> = std::result::Result<T, OffkitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OffkitError::Internal {
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
        self.ok_or_else(|| OffkitError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OffkitError::network("down").category(), "network");
        assert_eq!(OffkitError::cache("full").category(), "cache");
        assert_eq!(
            OffkitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(OffkitError::network("down").is_retryable());
        assert!(OffkitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OffkitError::config("bad").is_retryable());
        assert!(!OffkitError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_context_wraps_as_internal() {
        let parsed: std::result::Result<u32, _> = "abc".parse::<u32>();
        let err = parsed.context("parsing version").unwrap_err();
        assert_eq!(err.category(), "internal");
        assert!(err.to_string().contains("parsing version"));
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("entry").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("entry"),
            Err(OffkitError::NotFound(_))
        ));
    }
}
