//! # commlog-settings
//!
//! Layered configuration for the commlog event cache.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CommlogSettings::default()`]
//! 2. **User file**: `~/.commlog/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `COMMLOG_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<CommlogSettings> = OnceLock::new();

/// Get the process-wide settings.
///
/// On first call, loads from `~/.commlog/settings.json` with env var
/// overrides, falling back to compiled defaults if loading fails.
pub fn get_settings() -> &'static CommlogSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the process-wide settings with a specific value.
///
/// Returns the settings back if they were already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CommlogSettings) -> std::result::Result<(), CommlogSettings> {
    SETTINGS.set(settings)
}
