//! `nudge settings`: show or update persisted alert preferences.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use nudge_core::alerts::AlertSettings;
use nudge_core::config::{
    EngineConfig, load_engine_config, load_settings_from, save_settings_to, settings_path,
};
use serde::Serialize;
use tracing::info;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct SettingsArgs {
    /// Settings file to use instead of the per-user default.
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// Engine config supplying defaults when no settings are saved.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: SettingsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    #[command(about = "Show the effective alert settings")]
    Show,

    #[command(
        about = "Update alert settings",
        after_help = "EXAMPLES:\n    # Silence the in-app tone\n    nudge settings set --sound off\n\n\
                      # Turn on platform pushes\n    nudge settings set --push on"
    )]
    Set(SetArgs),
}

#[derive(Args, Debug)]
pub struct SetArgs {
    /// In-app tone on new notifications.
    #[arg(long, value_parser = parse_switch)]
    pub sound: Option<bool>,

    /// Platform push notifications.
    #[arg(long, value_parser = parse_switch)]
    pub push: Option<bool>,
}

fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected on/off, got '{other}'")),
    }
}

#[derive(Debug, Serialize)]
struct SettingsOutput {
    path: String,
    saved: bool,
    sound_enabled: bool,
    push_enabled: bool,
}

/// Execute `nudge settings`.
///
/// # Errors
///
/// Returns an error if the settings or config file cannot be read, or the
/// updated settings cannot be written.
pub fn run_settings(args: &SettingsArgs, output: OutputMode) -> Result<()> {
    let path = match &args.path {
        Some(path) => path.clone(),
        None => settings_path().context("no user config directory available; pass --path")?,
    };
    let engine = match &args.config {
        Some(config) => load_engine_config(config)?,
        None => EngineConfig::default(),
    };
    let current = load_settings_from(&path, engine.alerts.initial_settings())?;

    let (settings, saved) = match &args.command {
        SettingsCommand::Show => (current, false),
        SettingsCommand::Set(set) => (apply(current, set, &path)?, true),
    };

    let out = SettingsOutput {
        path: path.display().to_string(),
        saved,
        sound_enabled: settings.sound_enabled,
        push_enabled: settings.push_enabled,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "settings sound={} push={} saved={} path={}",
                on_off(out.sound_enabled),
                on_off(out.push_enabled),
                out.saved,
                out.path
            )
        },
        |out, w| {
            pretty_section(w, "Alert Settings")?;
            pretty_kv(w, "Sound", on_off(out.sound_enabled))?;
            pretty_kv(w, "Push", on_off(out.push_enabled))?;
            pretty_kv(w, "File", &out.path)?;
            if out.saved {
                pretty_kv(w, "Status", "saved")?;
            }
            Ok(())
        },
    )
}

fn apply(mut settings: AlertSettings, set: &SetArgs, path: &Path) -> Result<AlertSettings> {
    if let Some(sound) = set.sound {
        settings.sound_enabled = sound;
    }
    if let Some(push) = set.push {
        settings.push_enabled = push;
    }
    save_settings_to(path, &settings)?;
    info!(path = %path.display(), ?settings, "saved alert settings");
    Ok(settings)
}

const fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_accepts_common_spellings() {
        assert_eq!(parse_switch("ON"), Ok(true));
        assert_eq!(parse_switch("yes"), Ok(true));
        assert_eq!(parse_switch("off"), Ok(false));
        assert_eq!(parse_switch("0"), Ok(false));
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn apply_keeps_unset_fields_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        let set = SetArgs {
            sound: None,
            push: Some(true),
        };

        let updated = apply(AlertSettings::default(), &set, &path).expect("apply");
        assert!(updated.sound_enabled);
        assert!(updated.push_enabled);

        let reloaded = load_settings_from(&path, AlertSettings::default()).expect("reload");
        assert_eq!(reloaded, updated);
    }
}
