use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ftpsync_core::{Config, ConfigError, ConnectionFactory, load_config};
use parking_lot::Mutex;
use tracing::debug;

use crate::prompt::Prompter;
use crate::settings::Settings;
use crate::sync::cache::{ConnectionCache, Connector};
use crate::sync::paths::find_config_file;
use crate::sync::scan::{GlobScanner, Scanner};

/// Process-lifetime state shared by every command.
pub struct SyncContext {
    settings: Settings,
    connector: Connector,
    cache: ConnectionCache,
    prompter: Arc<dyn Prompter>,
    scanner: Arc<dyn Scanner>,
    passwords: Arc<PasswordCache>,
    config_files: Mutex<HashMap<PathBuf, Option<PathBuf>>>,
    uploads: UploadTokens,
}

impl SyncContext {
    pub fn new(
        settings: Settings,
        factory: Arc<dyn ConnectionFactory>,
        prompter: Arc<dyn Prompter>,
    ) -> Arc<Self> {
        Self::with_scanner(settings, factory, prompter, Arc::new(GlobScanner))
    }

    pub fn with_scanner(
        settings: Settings,
        factory: Arc<dyn ConnectionFactory>,
        prompter: Arc<dyn Prompter>,
        scanner: Arc<dyn Scanner>,
    ) -> Arc<Self> {
        let passwords = Arc::new(PasswordCache::default());
        let connector = Connector::new(factory, Arc::clone(&passwords));
        let cache = ConnectionCache::new(connector.clone(), settings.connection_timeout);
        Arc::new(Self {
            settings,
            connector,
            cache,
            prompter,
            scanner,
            passwords,
            config_files: Mutex::new(HashMap::new()),
            uploads: UploadTokens::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub fn prompter(&self) -> &Arc<dyn Prompter> {
        &self.prompter
    }

    pub fn scanner(&self) -> &Arc<dyn Scanner> {
        &self.scanner
    }

    pub fn passwords(&self) -> &PasswordCache {
        &self.passwords
    }

    pub fn uploads(&self) -> &UploadTokens {
        &self.uploads
    }

    /// Settings file governing `path`, memoized per path.
    pub fn config_file_for(&self, path: &Path) -> Option<PathBuf> {
        if let Some(cached) = self.config_files.lock().get(path) {
            return cached.clone();
        }
        let found = find_config_file(path);
        if found.is_none() {
            debug!(path = %path.display(), "found no config");
        }
        self.config_files
            .lock()
            .insert(path.to_path_buf(), found.clone());
        found
    }

    /// Forgets lookups below `dir`, e.g. after a settings file was created
    /// or removed there.
    pub fn invalidate_config_cache(&self, dir: &Path) {
        self.config_files
            .lock()
            .retain(|path, _| !path.starts_with(dir));
    }

    /// Loads a settings file and applies interactively supplied passwords.
    pub fn load_config(&self, config_file: &Path) -> Result<Config, ConfigError> {
        let config = load_config(config_file)?;
        Ok(self.passwords.apply(config))
    }

    /// Asks for every password the settings file leaves empty and that has
    /// not been supplied yet.
    pub async fn fill_passwords(&self, config_file: &Path) -> Result<Config, ConfigError> {
        let mut config = self.load_config(config_file)?;
        let missing: Vec<(String, String, String)> = config
            .profiles()
            .iter()
            .filter(|profile| profile.needs_password())
            .map(|profile| {
                (
                    profile.name.clone(),
                    profile.host.clone(),
                    profile.username.clone().unwrap_or_default(),
                )
            })
            .collect();

        for (name, host, username) in missing {
            let caption = format!("FTPSync > please provide password for: {host} ~ {username}");
            if let Some(password) = self.prompter.ask_text(&caption, "").await {
                self.passwords.store(config_file, &name, &password);
                config = config.with_password(&name, password);
            }
        }
        Ok(config)
    }
}

/// Passwords typed in by the user, keyed by settings file and profile.
#[derive(Debug, Default)]
pub struct PasswordCache {
    entries: Mutex<HashMap<PathBuf, HashMap<String, String>>>,
}

impl PasswordCache {
    pub fn get(&self, config_file: &Path, profile: &str) -> Option<String> {
        self.entries
            .lock()
            .get(config_file)
            .and_then(|profiles| profiles.get(profile).cloned())
    }

    pub fn store(&self, config_file: &Path, profile: &str, password: &str) {
        self.entries
            .lock()
            .entry(config_file.to_path_buf())
            .or_default()
            .insert(profile.to_string(), password.to_string());
    }

    pub fn forget(&self, config_file: &Path, profile: &str) {
        if let Some(profiles) = self.entries.lock().get_mut(config_file) {
            profiles.remove(profile);
        }
    }

    pub fn apply(&self, config: Config) -> Config {
        let known = self.entries.lock().get(config.file_path()).cloned();
        let Some(known) = known else {
            return config;
        };
        known.into_iter().fold(config, |config, (name, password)| {
            let missing = config
                .profile(&name)
                .is_some_and(|profile| profile.password.is_none());
            if missing {
                config.with_password(&name, password)
            } else {
                config
            }
        })
    }
}

/// Identity tokens of scheduled uploads; only the most recent token of a
/// path may fire.
#[derive(Debug, Default)]
pub struct UploadTokens {
    next: AtomicU64,
    current: Mutex<HashMap<PathBuf, u64>>,
}

impl UploadTokens {
    pub fn register(&self, path: &Path) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.lock().insert(path.to_path_buf(), token);
        token
    }

    pub fn is_current(&self, path: &Path, token: u64) -> bool {
        self.current.lock().get(path) == Some(&token)
    }

    /// A scheduled upload of `path` has not completed yet.
    pub fn is_pending(&self, path: &Path) -> bool {
        self.current.lock().contains_key(path)
    }

    /// Drops the token once its last fire completed, unless a newer one
    /// replaced it meanwhile.
    pub fn finish(&self, path: &Path, token: u64) {
        let mut current = self.current.lock();
        if current.get(path) == Some(&token) {
            current.remove(path);
        }
    }
}
