//! Error handling for the LOD streaming core
//!
//! Configuration and protocol errors surface through `LodError`. Capacity
//! refusals and stale responses are not errors and never reach this type.

use std::path::PathBuf;

/// Main error type for lod-stream
#[derive(Debug, thiserror::Error)]
pub enum LodError {
    // Cache Errors
    #[error("Channel not found: {name}")]
    ChannelNotFound { name: String },

    #[error("Channel '{name}' does not hold {expected} data")]
    ChannelTypeMismatch { name: String, expected: String },

    #[error("Channel '{name}' overflow: {len} elements written into a stride of {stride}")]
    ChannelOverflow {
        name: String,
        len: usize,
        stride: usize,
    },

    #[error("Slot {slot} out of range for cache of {slot_count} slots")]
    SlotOutOfRange { slot: usize, slot_count: usize },

    // Tree Errors
    #[error("Requested {requested} dynamic nodes but the full tree only has {available}")]
    NodeCountExceedsTree { requested: usize, available: usize },

    #[error("Invalid tree: {reason}")]
    InvalidTree { reason: String },

    // Protocol Errors
    #[error("Response length mismatch: expected {expected} bytes, received {actual}")]
    ResponseLengthMismatch { expected: usize, actual: usize },

    #[error("Mesh block {index} missing from response")]
    MissingBlock { index: u32 },

    #[error("Mesh block fetch failed: {reason}")]
    FetchFailed { reason: String },

    // Configuration Errors
    #[error("Invalid config: {field} = {value} ({reason})")]
    InvalidConfig {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load config from {}: {error}", path.display())]
    ConfigLoad { path: PathBuf, error: String },

    // Generic fallback for unexpected errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in lod-stream
pub type LodResult<T> = Result<T, LodError>;

impl LodError {
    pub fn channel_not_found(name: &str) -> Self {
        LodError::ChannelNotFound {
            name: name.to_string(),
        }
    }

    pub fn invalid_config(field: &str, value: impl ToString, reason: &str) -> Self {
        LodError::InvalidConfig {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for LodError {
    fn from(error: serde_json::Error) -> Self {
        LodError::Internal {
            message: format!("JSON encoding failed: {}", error),
        }
    }
}

// Helper functions for common error patterns

/// Convert Option to Result with context
pub trait OptionExt<T> {
    fn ok_or_lod<F>(self, f: F) -> LodResult<T>
    where
        F: FnOnce() -> LodError;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_lod<F>(self, f: F) -> LodResult<T>
    where
        F: FnOnce() -> LodError,
    {
        self.ok_or_else(f)
    }
}

/// Extension trait for adding context to foreign errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> LodResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, msg: &str) -> LodResult<T> {
        self.map_err(|e| LodError::Internal {
            message: format!("{}: {}", msg, e),
        })
    }
}
