//! Plugin engine error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid slug: {0}")]
    InvalidSlug(String),

    #[error("invalid module config: {0}")]
    InvalidModuleConfig(String),

    #[error("malformed file payload at index {index}: {reason}")]
    MalformedFilePayload { index: usize, reason: String },

    #[error("failed to write module '{slug}': {source}")]
    ScaffoldWriteFailed {
        slug: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Whether the error was raised before anything touched the disk.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PluginError::InvalidSlug(_)
                | PluginError::InvalidModuleConfig(_)
                | PluginError::MalformedFilePayload { .. }
        )
    }
}
