//! Errors raised while loading settings.

use thiserror::Error;

/// Why the settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("settings file unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON or does not match the settings shape.
    #[error("settings JSON rejected: {0}")]
    Json(#[from] serde_json::Error),
    /// A field holds a value the cache cannot run with.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result alias for settings loading.
pub type Result<T> = std::result::Result<T, SettingsError>;
