use std::collections::HashMap;
use std::sync::Arc;

use ftpsync_core::{Config, Metafile, Profile};
use thiserror::Error;
use tracing::debug;

use super::scan::{Scanner, Snapshot};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watcher has not been prepared")]
    NotPrepared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Before,
    After,
}

/// Snapshots of after-save-watch patterns taken around a delayed upload.
pub struct FileWatcher {
    config: Arc<Config>,
    scanner: Arc<dyn Scanner>,
    prepared: bool,
    before: HashMap<String, Snapshot>,
    after: HashMap<String, Snapshot>,
}

impl FileWatcher {
    pub fn new(config: Arc<Config>, scanner: Arc<dyn Scanner>) -> Self {
        Self {
            config,
            scanner,
            prepared: false,
            before: HashMap::new(),
            after: HashMap::new(),
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Takes the baseline for every watching profile. Profiles that already
    /// have a non-empty baseline keep it.
    pub fn prepare(&mut self) {
        for profile in self.config.profiles() {
            if !profile.watches_after_save() {
                continue;
            }
            if self
                .before
                .get(&profile.name)
                .is_some_and(|snapshot| !snapshot.is_empty())
            {
                continue;
            }
            let snapshot = scan_watched(&self.config, profile, self.scanner.as_ref());
            debug!(profile = %profile.name, files = snapshot.len(), "pre-scan");
            self.before.insert(profile.name.clone(), snapshot);
        }
        self.prepared = true;
    }

    pub fn set_scanned(&mut self, stage: Stage, profile: &str, snapshot: Snapshot) {
        let target = match stage {
            Stage::Before => &mut self.before,
            Stage::After => &mut self.after,
        };
        target.insert(profile.to_string(), snapshot);
    }

    pub fn scanned(&self, stage: Stage, profile: &str) -> Option<&Snapshot> {
        match stage {
            Stage::Before => self.before.get(profile),
            Stage::After => self.after.get(profile),
        }
    }

    /// Files present in both snapshots whose modification time advanced.
    pub fn changed_files(&mut self, profile: &str) -> Result<Vec<Metafile>, WatchError> {
        if !self.prepared {
            return Err(WatchError::NotPrepared);
        }
        let Some(properties) = self.config.profile(profile) else {
            return Ok(Vec::new());
        };

        let after = scan_watched(&self.config, properties, self.scanner.as_ref());
        let changed = match self.before.get(profile) {
            Some(before) => changed_between(before, &after),
            None => Vec::new(),
        };
        debug!(profile, changed = changed.len(), "post-scan");
        self.after.insert(profile.to_string(), after);
        Ok(changed)
    }
}

/// Scans every watch rule of `profile` relative to the project root.
pub fn scan_watched(config: &Config, profile: &Profile, scanner: &dyn Scanner) -> Snapshot {
    let mut snapshot = Snapshot::new();
    if !profile.watches_after_save() {
        return snapshot;
    }
    let root = config.root_dir();
    for rule in profile.watch_rules() {
        snapshot.extend(scanner.scan(&rule.pattern, &root.join(&rule.folder)));
    }
    snapshot
}

/// Pre-save scan of every watching profile, keyed by profile name.
pub fn scan_all(config: &Config, scanner: &dyn Scanner) -> HashMap<String, Snapshot> {
    config
        .profiles()
        .iter()
        .filter(|profile| profile.watches_after_save())
        .map(|profile| (profile.name.clone(), scan_watched(config, profile, scanner)))
        .collect()
}

fn changed_between(before: &Snapshot, after: &Snapshot) -> Vec<Metafile> {
    after
        .iter()
        .filter_map(|(path, now)| {
            let then = before.get(path)?;
            now.is_newer_than(then).then(|| now.clone())
        })
        .collect()
}
