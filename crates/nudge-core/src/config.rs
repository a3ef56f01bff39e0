use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertSettings, DEFAULT_TOAST_TTL};
use crate::error::ErrorCode;
use crate::model::DEFAULT_PREVIEW_CHARS;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            preview_chars: default_preview_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_toast_ttl_ms")]
    pub toast_ttl_ms: u64,
    /// Initial value for [`AlertSettings::sound_enabled`] when no saved
    /// settings exist.
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    #[serde(default)]
    pub push_enabled: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            toast_ttl_ms: default_toast_ttl_ms(),
            sound_enabled: default_true(),
            push_enabled: false,
        }
    }
}

impl AlertConfig {
    #[must_use]
    pub const fn toast_ttl(&self) -> Duration {
        Duration::from_millis(self.toast_ttl_ms)
    }

    #[must_use]
    pub const fn initial_settings(&self) -> AlertSettings {
        AlertSettings {
            sound_enabled: self.sound_enabled,
            push_enabled: self.push_enabled,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.ledger.preview_chars == 0 {
            bail!("ledger.preview_chars must be greater than zero");
        }
        if self.alerts.toast_ttl_ms == 0 {
            bail!("alerts.toast_ttl_ms must be greater than zero");
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

const fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

#[allow(clippy::cast_possible_truncation)]
const fn default_toast_ttl_ms() -> u64 {
    DEFAULT_TOAST_TTL.as_millis() as u64
}

/// Load engine tuning from `path`. A missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or
/// validated.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<EngineConfig>(&content).with_context(|| {
        format!(
            "{}: Failed to parse {}",
            ErrorCode::ConfigParseError.code(),
            path.display()
        )
    })?;
    config
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

/// Per-user settings file, `<config_dir>/nudge/settings.toml`.
#[must_use]
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nudge/settings.toml"))
}

/// Load saved alert settings, falling back to `defaults` when none exist.
///
/// # Errors
///
/// Returns an error if a settings file exists but cannot be parsed.
pub fn load_settings(defaults: AlertSettings) -> Result<AlertSettings> {
    match settings_path() {
        Some(path) => load_settings_from(&path, defaults),
        None => Ok(defaults),
    }
}

/// # Errors
///
/// Returns an error if `path` exists but cannot be read or parsed.
pub fn load_settings_from(path: &Path, defaults: AlertSettings) -> Result<AlertSettings> {
    if !path.exists() {
        return Ok(defaults);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<AlertSettings>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// # Errors
///
/// Returns an error if no config directory is known or the write fails.
pub fn save_settings(settings: &AlertSettings) -> Result<PathBuf> {
    let Some(path) = settings_path() else {
        bail!("no user config directory available");
    };
    save_settings_to(&path, settings)?;
    Ok(path)
}

/// # Errors
///
/// Returns an error if the parent directory cannot be created or the file
/// cannot be written.
pub fn save_settings_to(path: &Path, settings: &AlertSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(settings).context("Failed to encode settings")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_engine_config(&dir.path().join("nudge.toml")).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.ledger.preview_chars, 100);
        assert_eq!(config.alerts.toast_ttl(), Duration::from_millis(5000));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nudge.toml");
        std::fs::write(&path, "[alerts]\ntoast_ttl_ms = 1500\npush_enabled = true\n")
            .expect("write");

        let config = load_engine_config(&path).expect("load");
        assert_eq!(config.alerts.toast_ttl_ms, 1500);
        assert!(config.alerts.push_enabled);
        assert!(config.alerts.sound_enabled);
        assert_eq!(config.ledger.preview_chars, 100);
    }

    #[test]
    fn zero_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nudge.toml");
        std::fs::write(&path, "[ledger]\npreview_chars = 0\n").expect("write");

        let err = load_engine_config(&path).expect_err("zero preview");
        assert!(format!("{err:#}").contains("preview_chars"));

        let config = EngineConfig {
            alerts: AlertConfig {
                toast_ttl_ms: 0,
                ..AlertConfig::default()
            },
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_config_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nudge.toml");
        std::fs::write(&path, "[ledger\n").expect("write");

        let err = load_engine_config(&path).expect_err("bad toml");
        assert!(err.to_string().contains("nudge.toml"));
    }

    #[test]
    fn settings_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/settings.toml");
        let defaults = AlertSettings::default();

        assert_eq!(load_settings_from(&path, defaults).expect("load"), defaults);

        let saved = AlertSettings {
            sound_enabled: false,
            push_enabled: true,
        };
        save_settings_to(&path, &saved).expect("save");
        assert_eq!(load_settings_from(&path, defaults).expect("load"), saved);
    }

    #[test]
    fn settings_file_may_omit_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "push_enabled = true\n").expect("write");

        let settings = load_settings_from(&path, AlertSettings::default()).expect("load");
        assert!(settings.sound_enabled);
        assert!(settings.push_enabled);
    }
}
