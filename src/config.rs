use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::cli::CliArgs;

pub const DEFAULT_REFRESH_MS: u64 = 2_000;
pub const MIN_REFRESH_MS: u64 = 500;
pub const DEFAULT_PORT_FORWARD_ADDRESS: &str = "localhost";

/// Effective runtime settings: the settings file overlaid by CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub source: Option<String>,
    pub refresh_ms: u64,
    pub port_forward_address: String,
    pub read_only: bool,
    pub auto_forward: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: None,
            refresh_ms: DEFAULT_REFRESH_MS,
            port_forward_address: DEFAULT_PORT_FORWARD_ADDRESS.to_string(),
            read_only: false,
            auto_forward: true,
        }
    }
}

impl Settings {
    /// Applies flags given on the command line, which always win.
    pub fn with_overrides(mut self, args: &CliArgs) -> Self {
        if let Some(refresh_ms) = args.refresh_ms {
            self.refresh_ms = refresh_ms;
        }
        if let Some(address) = &args.port_forward_address {
            self.port_forward_address = address.clone();
        }
        self.refresh_ms = self.refresh_ms.max(MIN_REFRESH_MS);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KviewConfigFile {
    #[serde(default)]
    refresh_ms: Option<u64>,
    #[serde(default)]
    port_forward_address: Option<String>,
    #[serde(default)]
    read_only: bool,
    #[serde(default = "default_auto_forward")]
    auto_forward: bool,
}

fn default_auto_forward() -> bool {
    true
}

fn parse(raw: &str, source: Option<String>) -> Result<Settings> {
    let parsed: KviewConfigFile = serde_yaml::from_str(raw)?;
    let defaults = Settings::default();
    Ok(Settings {
        source,
        refresh_ms: parsed.refresh_ms.unwrap_or(defaults.refresh_ms),
        port_forward_address: parsed
            .port_forward_address
            .filter(|address| !address.trim().is_empty())
            .unwrap_or(defaults.port_forward_address),
        read_only: parsed.read_only,
        auto_forward: parsed.auto_forward,
    })
}

#[derive(Debug, Clone)]
pub struct RuntimeConfigWatcher {
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
}

impl RuntimeConfigWatcher {
    pub fn discover() -> Self {
        Self {
            path: discover_config_path(),
            modified: None,
        }
    }

    pub fn load_current(&mut self) -> Result<Settings> {
        let Some(path) = self.path.clone() else {
            return Ok(Settings::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read runtime config {}", path.display()))?;
        let settings = parse(&raw, Some(path.display().to_string()))
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;
        self.modified = fs::metadata(&path)
            .ok()
            .and_then(|meta| meta.modified().ok());

        Ok(settings)
    }

    pub fn reload_if_changed(&mut self) -> Result<Option<Settings>> {
        if self.path.is_none() {
            self.path = discover_config_path();
            if self.path.is_some() {
                return self.load_current().map(Some);
            }
            return Ok(None);
        }

        let current_path = self.path.clone().unwrap_or_default();
        if !current_path.exists() {
            self.path = discover_config_path();
            self.modified = None;
            if self.path.is_some() {
                return self.load_current().map(Some);
            }
            return Ok(Some(Settings::default()));
        }

        let modified = fs::metadata(&current_path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        if modified != self.modified {
            return self.load_current().map(Some);
        }

        Ok(None)
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KVIEW_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [PathBuf::from("kview.yaml"), PathBuf::from(".kview.yaml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let candidate = PathBuf::from(home).join(".config/kview/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_REFRESH_MS, MIN_REFRESH_MS, Settings, parse};
    use crate::cli::CliArgs;
    use clap::Parser;

    #[test]
    fn file_keys_override_defaults() {
        let settings = parse(
            "refresh_ms: 1000\nport_forward_address: 0.0.0.0\nread_only: true\nauto_forward: false\n",
            Some("kview.yaml".to_string()),
        )
        .expect("parse");
        assert_eq!(settings.refresh_ms, 1_000);
        assert_eq!(settings.port_forward_address, "0.0.0.0");
        assert!(settings.read_only);
        assert!(!settings.auto_forward);
        assert_eq!(settings.source.as_deref(), Some("kview.yaml"));
    }

    #[test]
    fn missing_keys_keep_defaults() {
        let settings = parse("read_only: false\n", None).expect("parse");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.refresh_ms, DEFAULT_REFRESH_MS);
        assert!(settings.auto_forward);
        assert!(parse("refresh_ms: soon\n", None).is_err());
    }

    #[test]
    fn flags_win_and_refresh_has_a_floor() {
        let args = CliArgs::parse_from(["kview", "--refresh-ms", "10", "--port-forward-address", "127.0.0.1"]);
        let settings = Settings::default().with_overrides(&args);
        assert_eq!(settings.refresh_ms, MIN_REFRESH_MS);
        assert_eq!(settings.port_forward_address, "127.0.0.1");
    }
}
