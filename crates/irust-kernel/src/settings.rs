//! Kernel settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/irust-kernel/settings.json
//! - Linux: ~/.config/irust-kernel/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\irust-kernel\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::bridge::Protocol;
use crate::interpreter::{self, InterpreterCommand};
use crate::session::Toolchain;

/// How the kernel reaches the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSettings {
    /// Interpreter protocol generation
    #[serde(default)]
    pub protocol: Protocol,

    /// Explicit interpreter binary; resolved from the kernel dir or PATH when unset
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Extra arguments placed before the per-call arguments
    #[serde(default)]
    pub interpreter_args: Vec<String>,

    /// Toolchain a new session starts with
    #[serde(default)]
    pub toolchain: Toolchain,

    /// Give up on an interpreter round trip after this many seconds
    #[serde(default)]
    pub eval_timeout_secs: Option<u64>,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            protocol: Protocol::OneShot,
            interpreter: None,
            interpreter_args: vec![],
            toolchain: Toolchain::Stable,
            eval_timeout_secs: None,
        }
    }
}

impl KernelSettings {
    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Interpreter to launch, with the configured leading arguments.
    pub fn interpreter_command(&self) -> InterpreterCommand {
        interpreter::resolve(self.interpreter.as_deref())
            .with_args(self.interpreter_args.iter().cloned())
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("irust-kernel")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
/// or can't be parsed
pub fn load_settings(path: &Path) -> KernelSettings {
    if !path.exists() {
        return KernelSettings::default();
    }
    read_settings(path).unwrap_or_else(|e| {
        warn!("[settings] Ignoring unreadable {:?}: {:#}", path, e);
        KernelSettings::default()
    })
}

fn read_settings(path: &Path) -> Result<KernelSettings> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).context("parsing settings JSON")
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &KernelSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating settings directory {:?}", parent))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = KernelSettings::default();
        assert_eq!(settings.protocol, Protocol::OneShot);
        assert!(settings.interpreter.is_none());
        assert!(settings.interpreter_args.is_empty());
        assert_eq!(settings.toolchain, Toolchain::Stable);
        assert_eq!(settings.eval_timeout(), None);
    }

    #[test]
    fn test_settings_serde() {
        let settings = KernelSettings {
            protocol: Protocol::JsonLine,
            interpreter: Some(PathBuf::from("/opt/irust/re")),
            interpreter_args: vec!["--quiet".to_string()],
            toolchain: Toolchain::Nightly,
            eval_timeout_secs: Some(30),
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"json-line\""));
        assert!(json.contains("\"nightly\""));

        let parsed: KernelSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_deserialize_missing_fields() {
        let parsed: KernelSettings = serde_json::from_str(r#"{"protocol":"json-line"}"#).unwrap();
        assert_eq!(parsed.protocol, Protocol::JsonLine);
        assert_eq!(parsed.toolchain, Toolchain::Stable);
        assert!(parsed.interpreter.is_none());
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let settings = KernelSettings {
            eval_timeout_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.eval_timeout(), None);

        let settings = KernelSettings {
            eval_timeout_secs: Some(5),
            ..Default::default()
        };
        assert_eq!(settings.eval_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");

        assert_eq!(load_settings(&path), KernelSettings::default());

        let settings = KernelSettings {
            protocol: Protocol::JsonLine,
            eval_timeout_secs: Some(10),
            ..Default::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_load_invalid_file_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), KernelSettings::default());
    }

    #[test]
    #[cfg(unix)]
    fn test_interpreter_command_appends_args() {
        let settings = KernelSettings {
            interpreter: Some(PathBuf::from("/opt/irust/re")),
            interpreter_args: vec!["--quiet".to_string()],
            ..Default::default()
        };
        let command = settings.interpreter_command();
        assert_eq!(command.program, PathBuf::from("/opt/irust/re"));
        assert_eq!(command.args, ["--quiet"]);
    }

    #[test]
    fn test_settings_path_is_valid() {
        let path = settings_path();
        assert!(path.ends_with("irust-kernel/settings.json"));
    }
}
