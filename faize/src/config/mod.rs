//! CLI configuration from `~/.faize/config.yaml`.
//!
//! A missing config file means defaults. User-supplied blocked paths are
//! merged with the hardcoded list; the hardcoded entries cannot be
//! removed by configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FaizeError, FaizeResult};
use crate::mount::HARDCODED_BLOCKED_PATHS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    pub networks: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub claude: ClaudeConfig,
}

/// Default resource limits for new sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub cpus: u32,
    pub memory: String,
    pub timeout: String,
}

/// Agent-mode options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Extra mount specs added to every agent session.
    pub auto_mounts: Vec<String>,
    /// Keep agent credentials across sessions. Off unless set.
    pub persist_credentials: Option<bool>,
    /// Extra apk packages for the guest.
    pub extra_deps: Vec<String>,
    /// Mount the enclosing repo's `.git` read-only. On unless set.
    pub git_context: Option<bool>,
}

impl ClaudeConfig {
    pub fn should_persist_credentials(&self) -> bool {
        self.persist_credentials.unwrap_or(false)
    }

    pub fn should_mount_git_context(&self) -> bool {
        self.git_context.unwrap_or(true)
    }
}

impl Config {
    /// Load `~/.faize/config.yaml`, falling back to defaults when absent.
    pub fn load() -> FaizeResult<Config> {
        let path = config_dir()?.join("config.yaml");
        Self::load_from(&path)
    }

    /// Load from an explicit path; missing file yields defaults.
    pub fn load_from(path: &std::path::Path) -> FaizeResult<Config> {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(data) if data.trim().is_empty() => Config::default(),
            Ok(data) => serde_yaml::from_str(data.trim())
                .map_err(|e| FaizeError::Config(format!("failed to parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(FaizeError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        cfg.apply_defaults();
        cfg.blocked_paths = merge_blocked_paths(
            &cfg.blocked_paths,
            &HARDCODED_BLOCKED_PATHS
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        );
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.defaults.cpus == 0 {
            self.defaults.cpus = 2;
        }
        if self.defaults.memory.is_empty() {
            self.defaults.memory = "4GB".into();
        }
        if self.defaults.timeout.is_empty() {
            self.defaults.timeout = "2h".into();
        }
        if self.networks.is_empty() {
            self.networks = vec![
                "npm".into(),
                "pypi".into(),
                "github".into(),
                "anthropic".into(),
            ];
        }
        if self.blocked_paths.is_empty() {
            self.blocked_paths = default_blocked_paths();
        }
    }
}

/// The `~/.faize` configuration directory.
pub fn config_dir() -> FaizeResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FaizeError::Config("failed to determine home directory".into()))?;
    Ok(home.join(".faize"))
}

/// Default blocked paths: credential stores across common toolchains, plus
/// the platform keystore.
fn default_blocked_paths() -> Vec<String> {
    let mut paths: Vec<String> = [
        "~/.ssh",
        "~/.aws",
        "~/.config/gcloud",
        "~/.gnupg",
        "~/.password-store",
        "~/.mozilla",
        "~/.config/google-chrome",
        "~/.docker",
        "~/.netrc",
        "~/.npmrc",
        "~/.pypirc",
        "~/.m2/settings.xml",
        "~/.gradle/gradle.properties",
        "~/.kube",
        "~/.config/gh",
        "~/.config/hub",
        "~/.azure",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    #[cfg(target_os = "macos")]
    paths.push("~/Library/Keychains".into());
    #[cfg(target_os = "linux")]
    paths.push("~/.local/share/keyrings".into());

    paths
}

/// Merge user and hardcoded blocked paths; hardcoded entries come first and
/// duplicates are dropped.
fn merge_blocked_paths(user: &[String], hardcoded: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::with_capacity(user.len() + hardcoded.len());
    for path in hardcoded.iter().chain(user.iter()) {
        if seen.insert(path.clone()) {
            merged.push(path.clone());
        }
    }
    merged
}

/// Parse a human-readable duration like `2h`, `90m`, `1h30m`, `45s`.
pub fn parse_duration(input: &str) -> FaizeResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(FaizeError::Config("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut matched = false;

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(FaizeError::Config(format!("invalid duration '{input}'")));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| FaizeError::Config(format!("invalid duration '{input}'")))?;
        let secs = match ch {
            's' => value,
            'm' => value * 60,
            'h' => value * 3600,
            _ => return Err(FaizeError::Config(format!("invalid duration '{input}'"))),
        };
        total += Duration::from_secs(secs);
        digits.clear();
        matched = true;
    }

    if !digits.is_empty() || !matched {
        return Err(FaizeError::Config(format!("invalid duration '{input}'")));
    }
    Ok(total)
}
