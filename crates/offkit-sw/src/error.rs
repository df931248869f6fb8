//! Error types for the worker.

use offkit_common::OffkitError;
use thiserror::Error;

/// Result type alias for worker operations.
pub type SwResult<T> = Result<T, SwError>;

/// Errors raised by lifecycle, storage, client, and sync work.
///
/// Fetch strategies never produce these; a failing fetch always resolves to
/// a cached or synthetic response.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Precache failed for {asset}: {reason}")]
    PrecacheFailed { asset: String, reason: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Sync task '{tag}' failed: {reason}")]
    SyncFailed { tag: String, reason: String },

    #[error("Event handler aborted: {0}")]
    HandlerAborted(String),

    #[error(transparent)]
    Common(#[from] OffkitError),
}

impl SwError {
    /// Create a cache error.
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::CacheError(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a client error.
    pub fn client(msg: impl Into<String>) -> Self {
        Self::ClientError(msg.into())
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::StateError(msg.into())
    }
}
