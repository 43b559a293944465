//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MnemeSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `MNEME_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MnemeSettings;

/// Resolve the settings file: `$MNEME_HOME/settings.json`, else `~/.mneme/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(dir) = std::env::var("MNEME_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("settings.json");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".mneme").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MnemeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<MnemeSettings> {
    let defaults = serde_json::to_value(MnemeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MnemeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut MnemeSettings) {
    if let Some(v) = read_env_string("MNEME_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = read_env_string("MNEME_OLLAMA_URL") {
        settings.embedding.base_url.clone_from(&v);
        settings.generation.base_url = v;
    }
    if let Some(v) = read_env_string("MNEME_EMBED_MODEL") {
        settings.embedding.model = v;
    }
    if let Some(v) = read_env_string("MNEME_CHAT_MODEL") {
        settings.generation.model = v;
    }
    if let Some(v) = read_env_usize("MNEME_WINDOW", 1, 256) {
        settings.context.window = v;
    }
    if let Some(v) = read_env_usize("MNEME_SUMMARY_THRESHOLD", 1, 100_000) {
        settings.summary.threshold = v;
    }
    if let Some(v) = read_env_bool("MNEME_SUMMARY_ENABLED") {
        settings.summary.enabled = v;
    }
    if let Some(v) = read_env_bool("MNEME_REPLY_COMPRESS") {
        settings.reply.compress = v;
    }
    if let Some(v) = read_env_u64("MNEME_EMBED_TIMEOUT_MS", 100, 600_000) {
        settings.embedding.timeout_ms = v;
    }
    if let Some(v) = read_env_string("MNEME_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("MNEME_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
