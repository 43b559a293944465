//! # mneme-settings
//!
//! Strongly typed configuration for the memory core.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MnemeSettings::default()`]
//! 2. **User file**: `~/.mneme/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `MNEME_*` overrides (highest priority)
//!
//! Loaded once and immutable for the rest of the process.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<MnemeSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads from disk with env overrides. If loading fails the
/// compiled defaults are used and a warning is logged.
pub fn get_settings() -> &'static MnemeSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            MnemeSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: MnemeSettings) -> std::result::Result<(), MnemeSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = MnemeSettings::default();
        let path = settings_path();
        assert!(path.ends_with("settings.json"));
    }

    #[test]
    fn deep_merge_re_exported() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
