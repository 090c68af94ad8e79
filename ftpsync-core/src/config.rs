use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::metafile::parse_permissions;

pub const CONFIG_FILE_NAME: &str = "ftpsync.settings";
const GLOBAL_KEY: &str = "__global";

/// Starting point written by `init` into a directory without settings.
pub const DEFAULT_SETTINGS_TEMPLATE: &str = r#"{
    // Each top level key names one remote server profile.
    "primary": {
        "host": "example.com",
        "username": null, // leave empty to be asked on first use
        "password": null,
        "path": "/", // remote directory mapped onto this folder

        "upload_on_save": true,
        "port": 21,
        "tls": false,
        "passive": true,
        "timeout": 30,

        "ignore": null, // regular expression of local paths never uploaded
        "upload_delay": 0,
        "after_save_watch": [],
        "overwrite_newer_prevention": true,
        "download_on_open": false,
        "default_folder_permissions": "755"
    }
}
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed parsing configuration file (commas problem?): {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `[folder, pattern]` pair scanned around a delayed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct WatchRule {
    pub folder: String,
    pub pattern: String,
}

impl WatchRule {
    pub fn new(folder: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            pattern: pattern.into(),
        }
    }
}

impl From<(String, String)> for WatchRule {
    fn from((folder, pattern): (String, String)) -> Self {
        Self { folder, pattern }
    }
}

impl From<WatchRule> for (String, String) {
    fn from(rule: WatchRule) -> Self {
        (rule.folder, rule.pattern)
    }
}

/// One named remote endpoint of a project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(skip_deserializing)]
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub path: String,
    pub tls: bool,
    pub passive: bool,
    pub timeout: u64,
    pub ignore: Option<String>,
    pub upload_on_save: bool,
    pub upload_delay: u64,
    pub after_save_watch: Option<Vec<WatchRule>>,
    #[serde(alias = "check_time")]
    pub overwrite_newer_prevention: bool,
    pub download_on_open: bool,
    pub default_folder_permissions: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 21,
            username: None,
            password: None,
            path: "/".to_string(),
            tls: false,
            passive: true,
            timeout: 30,
            ignore: None,
            upload_on_save: true,
            upload_delay: 0,
            after_save_watch: None,
            overwrite_newer_prevention: true,
            download_on_open: false,
            default_folder_permissions: None,
        }
    }
}

impl Profile {
    pub fn named(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn watch_rules(&self) -> &[WatchRule] {
        self.after_save_watch.as_deref().unwrap_or(&[])
    }

    pub fn has_after_save_watch(&self) -> bool {
        !self.watch_rules().is_empty()
    }

    /// Watch rules only take effect for delayed uploads.
    pub fn watches_after_save(&self) -> bool {
        self.has_after_save_watch() && self.upload_delay > 0
    }

    pub fn upload_delay(&self) -> Duration {
        Duration::from_secs(self.upload_delay)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn needs_password(&self) -> bool {
        self.username.is_some() && self.password.is_none()
    }

    pub fn ignore_regex(&self) -> Option<Regex> {
        self.ignore
            .as_deref()
            .and_then(|pattern| Regex::new(pattern).ok())
    }

    /// Structural hash of every field; two profiles with the same hash build
    /// interchangeable connections.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// Fully merged and verified project configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    file_path: PathBuf,
    profiles: Vec<Profile>,
}

impl Config {
    pub fn new(file_path: impl Into<PathBuf>, profiles: Vec<Profile>) -> Self {
        Self {
            file_path: file_path.into(),
            profiles,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Directory holding the settings file; local paths are mapped from here.
    pub fn root_dir(&self) -> &Path {
        self.file_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_for(&self.file_path)
    }

    pub fn with_password(&self, name: &str, password: impl Into<String>) -> Config {
        let password = password.into();
        let profiles = self
            .profiles
            .iter()
            .map(|profile| {
                if profile.name == name {
                    Profile {
                        password: Some(password.clone()),
                        ..profile.clone()
                    }
                } else {
                    profile.clone()
                }
            })
            .collect();
        Config::new(self.file_path.clone(), profiles)
    }
}

/// Cache key for everything derived from one settings file.
pub fn fingerprint_for(path: &Path) -> String {
    format!("{:x}", md5::compute(path.to_string_lossy().as_bytes()))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    parse_config(path, &contents)
}

pub fn parse_config(path: &Path, contents: &str) -> Result<Config, ConfigError> {
    let stripped = strip_line_comments(contents);
    let root: Map<String, Value> = serde_json::from_str(&stripped)?;

    let mut profiles = Vec::with_capacity(root.len());
    for (name, value) in root {
        if !value.is_object() {
            return Err(ConfigError::Invalid(
                "contents are not dictionaries but values".to_string(),
            ));
        }
        if name == GLOBAL_KEY {
            continue;
        }
        let mut profile: Profile = serde_json::from_value(value)?;
        profile.name = name;
        verify_profile(&profile).map_err(ConfigError::Invalid)?;
        profiles.push(profile);
    }

    Ok(Config::new(path, profiles))
}

/// Checks that a merged profile is usable; returns the failure reason.
pub fn verify_profile(profile: &Profile) -> Result<(), String> {
    let name = &profile.name;
    if profile.host.trim().is_empty() {
        return Err(format!("[{name}] entry 'host' must be a non-empty string"));
    }
    if profile.port == 0 {
        return Err(format!("[{name}] entry 'port' must be a positive integer"));
    }
    if !profile.path.starts_with('/') {
        return Err(format!(
            "[{name}] entry 'path' must be an absolute remote path, {:?} given",
            profile.path
        ));
    }
    if let Some(pattern) = &profile.ignore
        && let Err(err) = Regex::new(pattern)
    {
        return Err(format!(
            "[{name}] entry 'ignore' is not a valid regular expression: {err}"
        ));
    }
    if profile
        .watch_rules()
        .iter()
        .any(|rule| rule.pattern.trim().is_empty())
    {
        return Err(format!(
            "[{name}] entry 'after_save_watch' contains an empty pattern"
        ));
    }
    if let Some(permissions) = &profile.default_folder_permissions
        && parse_permissions(permissions).is_none()
    {
        return Err(format!(
            "[{name}] entry 'default_folder_permissions' is not a valid mode: {permissions:?}"
        ));
    }
    Ok(())
}

/// Removes `//` comments that appear outside JSON string literals.
pub fn strip_line_comments(contents: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    let mut chars = contents.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}
