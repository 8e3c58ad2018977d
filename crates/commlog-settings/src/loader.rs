//! Reading `~/.commlog/settings.json` and `COMMLOG_*` overrides.
//!
//! The file is optional and may be partial: its JSON is merged key by key
//! over the serialized defaults before being deserialized, so a file that
//! only sets `query.chunkSize` keeps every other default. Objects merge
//! recursively, arrays and scalars replace, and `null` leaves the default.
//! Environment overrides are applied last and then the whole result is
//! validated.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{CommlogSettings, QueryModeSetting};

/// `~/.commlog/settings.json`, or under `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".commlog").join("settings.json")
}

/// Load from [`settings_path`].
pub fn load_settings() -> Result<CommlogSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path`. A missing file yields the defaults plus env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<CommlogSettings> {
    let mut layered = serde_json::to_value(CommlogSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "merging settings file");
            layered = deep_merge(layered, serde_json::from_str(&text)?);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(err) => return Err(err.into()),
    }

    let mut settings: CommlogSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Merge `overlay` into `base`. See the module docs for the rules.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Cross-field checks run after every layer is applied.
pub fn validate(settings: &CommlogSettings) -> Result<()> {
    let positive = [
        ("query.firstChunkSize", settings.query.first_chunk_size),
        ("query.chunkSize", settings.query.chunk_size),
        ("database.poolSize", settings.database.pool_size as usize),
        ("bus.capacity", settings.bus.capacity),
    ];
    match positive.iter().find(|(_, value)| *value == 0) {
        Some((field, _)) => Err(SettingsError::InvalidValue(format!(
            "{field} must be positive"
        ))),
        None => Ok(()),
    }
}

/// Overwrite fields from `COMMLOG_*` variables.
///
/// Unparseable or out-of-range values are logged and skipped.
pub fn apply_env_overrides(settings: &mut CommlogSettings) {
    if let Some(path) = env_string("COMMLOG_DB_PATH") {
        settings.database.path = path;
    }
    if let Some(n) = env_parsed("COMMLOG_DB_POOL_SIZE", |v| parse_in_range(v, 1u32, 64)) {
        settings.database.pool_size = n;
    }
    if let Some(n) = env_parsed("COMMLOG_DB_BUSY_TIMEOUT_MS", |v| {
        parse_in_range(v, 100u32, 600_000)
    }) {
        settings.database.busy_timeout_ms = n;
    }

    if let Some(mode) = env_parsed("COMMLOG_QUERY_MODE", parse_query_mode) {
        settings.query.mode = mode;
    }
    if let Some(n) = env_parsed("COMMLOG_FIRST_CHUNK_SIZE", chunk_size) {
        settings.query.first_chunk_size = n;
    }
    if let Some(n) = env_parsed("COMMLOG_CHUNK_SIZE", chunk_size) {
        settings.query.chunk_size = n;
    }
    if let Some(on) = env_parsed("COMMLOG_DEDICATED_WORKER", parse_bool) {
        settings.query.dedicated_worker = on;
    }

    if let Some(on) = env_parsed("COMMLOG_CONTACTS_ENABLED", parse_bool) {
        settings.contacts.enabled = on;
    }
    if let Some(n) = env_parsed("COMMLOG_BUS_CAPACITY", |v| {
        parse_in_range(v, 1usize, 1_000_000)
    }) {
        settings.bus.capacity = n;
    }
    if let Some(level) = env_string("COMMLOG_LOG_LEVEL") {
        settings.logging.level = level;
    }
}

/// `true`/`1`/`yes`/`on` and their negatives, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    let val = val.trim().to_ascii_lowercase();
    if ["true", "1", "yes", "on"].contains(&val.as_str()) {
        Some(true)
    } else if ["false", "0", "no", "off"].contains(&val.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// `sync`, `async` or `streamed` (also `stream`).
pub fn parse_query_mode(val: &str) -> Option<QueryModeSetting> {
    match val.trim().to_ascii_lowercase().as_str() {
        "sync" => Some(QueryModeSetting::Sync),
        "async" => Some(QueryModeSetting::Async),
        "streamed" | "stream" => Some(QueryModeSetting::Streamed),
        _ => None,
    }
}

/// Parse `val` and accept it only within `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim()
        .parse()
        .ok()
        .filter(|n| (min..=max).contains(n))
}

fn chunk_size(val: &str) -> Option<usize> {
    parse_in_range(val, 1, 100_000)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T, F>(name: &str, parse: F) -> Option<T>
where
    F: FnOnce(&str) -> Option<T>,
{
    let raw = env_string(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "ignoring unusable settings override");
    }
    parsed
}
