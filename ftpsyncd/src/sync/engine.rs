use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ftpsync_core::{CONFIG_FILE_NAME, Metafile, Progress, fingerprint_for};
use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::cache::ConnectionSet;
use super::check::{
    CheckChoice, check_choice, check_rows, classify_versions, overwrite_conflicts, overwrite_rows,
};
use super::command::{Outcome, RemoteMetadata, SyncCommand, TransferOptions};
use super::file_watcher::scan_all;
use super::navigator::BrowsePoint;
use super::paths::display_name;
use super::scan::Snapshot;
use super::worker::Worker;
use crate::context::SyncContext;
use crate::status::finished_notice;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoConfig,
    NotFound,
    UpToDate,
    Kept,
    Downloaded(Outcome),
    Uploaded(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    Proceed,
    /// The user refused to overwrite newer remote copies.
    Prevent,
}

/// Entry point for editor and CLI events.
pub struct Synchronizer {
    ctx: Arc<SyncContext>,
    prevented: Mutex<HashSet<PathBuf>>,
    overwrite_cancelled: Mutex<HashSet<PathBuf>>,
    pre_scans: Mutex<HashMap<PathBuf, HashMap<String, Snapshot>>>,
    scheduled_checks: Mutex<HashSet<PathBuf>>,
    pub(super) last_browsed: Mutex<Option<BrowsePoint>>,
}

impl Synchronizer {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            prevented: Mutex::new(HashSet::new()),
            overwrite_cancelled: Mutex::new(HashSet::new()),
            pre_scans: Mutex::new(HashMap::new()),
            scheduled_checks: Mutex::new(HashSet::new()),
            last_browsed: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Expands directories into their files and empty folders, paired with
    /// the settings file governing each. Paths without settings are dropped.
    pub fn collect_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, PathBuf)> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for path in paths {
            let candidates: Vec<PathBuf> = if path.is_dir() {
                WalkDir::new(path)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_type().is_file() || is_empty_dir(entry.path()))
                    .map(|entry| entry.into_path())
                    .collect()
            } else {
                vec![path.clone()]
            };

            for candidate in candidates {
                if candidate.file_name().is_some_and(|name| name == CONFIG_FILE_NAME) {
                    continue;
                }
                if !seen.insert(candidate.clone()) {
                    continue;
                }
                match self.ctx.config_file_for(&candidate) {
                    Some(config_file) => files.push((candidate, config_file)),
                    None => debug!(path = %candidate.display(), "found no config"),
                }
            }
        }
        files
    }

    pub async fn upload(&self, paths: &[PathBuf]) -> Vec<Outcome> {
        let files = self.collect_files(paths);
        self.ensure_passwords(files.iter().map(|(_, config_file)| config_file.as_path()))
            .await;

        if let [(path, _)] = files.as_slice() {
            let outcome = SyncCommand::upload(Arc::clone(&self.ctx), path.clone(), TransferOptions::default())
                .run()
                .await;
            return vec![outcome];
        }

        let progress = batch_progress(files.iter().map(|(path, _)| path.as_path()));
        let commands = files
            .into_iter()
            .map(|(path, _)| {
                let options = TransferOptions::default().with_progress(Arc::clone(&progress));
                SyncCommand::upload(Arc::clone(&self.ctx), path, options)
            })
            .collect();
        let outcomes = self.run_batch(commands).await;
        self.notify_finished("Uploading", &progress);
        outcomes
    }

    pub async fn download(&self, paths: &[PathBuf], forced: bool) -> Vec<Outcome> {
        let targets: Vec<PathBuf> = paths
            .iter()
            .filter(|path| self.ctx.config_file_for(path).is_some())
            .cloned()
            .collect();
        let config_files: Vec<PathBuf> = targets
            .iter()
            .filter_map(|path| self.ctx.config_file_for(path))
            .collect();
        self.ensure_passwords(config_files.iter().map(PathBuf::as_path))
            .await;

        let progress = batch_progress(
            targets
                .iter()
                .filter(|path| path.is_file())
                .map(PathBuf::as_path),
        );
        let commands = targets
            .into_iter()
            .map(|path| {
                let options = TransferOptions {
                    progress: Some(Arc::clone(&progress)),
                    is_dir: path.is_dir(),
                    forced,
                    ..TransferOptions::default()
                };
                SyncCommand::download(Arc::clone(&self.ctx), path, options)
            })
            .collect();
        let outcomes = self.run_batch(commands).await;
        self.notify_finished("Downloading", &progress);
        outcomes
    }

    /// Deletes local and remote copies after the user confirmed.
    pub async fn delete(&self, paths: &[PathBuf]) -> Vec<Outcome> {
        let mut seen = HashSet::new();
        let targets: Vec<PathBuf> = paths
            .iter()
            .filter(|path| path.exists() && seen.insert(path.to_path_buf()))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let mut yes = vec!["Yes, delete the selected items [also remotely]".to_string()];
        yes.extend(targets.iter().map(|path| self.root_relative(path)));
        let mut no = vec!["No".to_string(), "Cancel deletion".to_string()];
        no.extend(std::iter::repeat_n(String::new(), targets.len() - 1));
        if self.ctx.prompter().choose(&[yes, no]).await != Some(0) {
            self.ctx.prompter().status("Deleting: cancelled");
            return Vec::new();
        }

        let config_files: Vec<PathBuf> = targets
            .iter()
            .filter_map(|path| self.ctx.config_file_for(path))
            .collect();
        self.ensure_passwords(config_files.iter().map(PathBuf::as_path))
            .await;

        let progress = batch_progress(targets.iter().map(PathBuf::as_path));
        let commands = targets
            .into_iter()
            .map(|path| {
                let options = TransferOptions::default().with_progress(Arc::clone(&progress));
                SyncCommand::delete(Arc::clone(&self.ctx), path, options)
            })
            .collect();
        self.run_sequential(commands).await
    }

    pub async fn rename(&self, path: &Path, new_name: &str) -> Outcome {
        if let Some(config_file) = self.ctx.config_file_for(path) {
            self.ensure_passwords([config_file.as_path()]).await;
        }
        SyncCommand::rename(
            Arc::clone(&self.ctx),
            path,
            new_name,
            TransferOptions::default(),
        )
        .run()
        .await
    }

    /// Compares the local file with every remote copy and lets the user pick
    /// which version wins.
    pub async fn check(&self, path: &Path, forced: bool) -> CheckOutcome {
        let name = file_name(path);
        let prompter = self.ctx.prompter();
        prompter.status(&format!("Checking {{{name}}} if up-to-date"));

        let Some(config_file) = self.ctx.config_file_for(path) else {
            prompter.status(&format!("Found no config > for file: {}", path.display()));
            return CheckOutcome::NoConfig;
        };
        self.ensure_passwords([config_file.as_path()]).await;

        let command = SyncCommand::metadata(Arc::clone(&self.ctx), path, TransferOptions::default());
        let Some(config) = command.config() else {
            return CheckOutcome::NoConfig;
        };
        let entries = remote_versions(command.run().await);
        if entries.is_empty() {
            prompter.status(&format!("No version of {{{name}}} found on any server"));
            return CheckOutcome::NotFound;
        }

        let local = Metafile::from_local(path)
            .unwrap_or_else(|_| Metafile::new(name.clone(), false, None, None, path));
        let classification = classify_versions(&local, &entries, forced);
        if classification.is_up_to_date() {
            prompter.status(&format!(
                "All remote versions of {{{name}}} are of same size and older"
            ));
            return CheckOutcome::UpToDate;
        }

        let rows = check_rows(&config, &local, &classification);
        let choice = check_choice(&classification, prompter.choose(&rows).await);
        match choice {
            CheckChoice::Keep => CheckOutcome::Kept,
            CheckChoice::Download(profile) => {
                info!(path = %path.display(), %profile, "taking remote version");
                let options = TransferOptions::default().only([profile]).forced(true);
                let outcome = SyncCommand::download(Arc::clone(&self.ctx), path, options)
                    .run()
                    .await;
                CheckOutcome::Downloaded(outcome)
            }
            CheckChoice::Upload => {
                let outcome =
                    SyncCommand::upload(Arc::clone(&self.ctx), path, TransferOptions::default())
                        .run()
                        .await;
                CheckOutcome::Uploaded(outcome)
            }
        }
    }

    /// Records watch baselines and asks before a save overwrites newer
    /// remote copies.
    pub async fn pre_save(&self, path: &Path) -> SaveDecision {
        let Some(config_file) = self.ctx.config_file_for(path) else {
            return SaveDecision::Proceed;
        };
        let config = match self.ctx.fill_passwords(&config_file).await {
            Ok(config) => config,
            Err(err) => {
                debug!(path = %config_file.display(), error = %err, "config unusable");
                return SaveDecision::Proceed;
            }
        };

        let scans = scan_all(&config, self.ctx.scanner().as_ref());
        self.pre_scans.lock().insert(config_file.clone(), scans);
        if !config.profiles().iter().any(|profile| profile.upload_on_save) {
            return SaveDecision::Proceed;
        }

        let entries = remote_versions(
            SyncCommand::metadata(Arc::clone(&self.ctx), path, TransferOptions::default())
                .run()
                .await,
        );
        let Ok(local) = Metafile::from_local(path) else {
            return SaveDecision::Proceed;
        };
        let cancelled_before = self.overwrite_cancelled.lock().contains(path);
        let conflicts = if cancelled_before {
            entries
        } else {
            overwrite_conflicts(&config, &local, &entries)
        };
        if conflicts.is_empty() {
            return SaveDecision::Proceed;
        }

        let rows = overwrite_rows(&config, &conflicts);
        if self.ctx.prompter().choose(&rows).await == Some(0) {
            info!(path = %path.display(), "overwrite prevention: overwriting");
            self.overwrite_cancelled.lock().remove(path);
            SaveDecision::Proceed
        } else {
            info!(path = %path.display(), "overwrite prevention: cancelled upload");
            self.overwrite_cancelled.lock().insert(path.to_path_buf());
            self.prevented.lock().insert(path.to_path_buf());
            SaveDecision::Prevent
        }
    }

    /// On-save upload; `None` when the upload was prevented or the file has
    /// no settings.
    pub async fn post_save(&self, path: &Path) -> Option<Outcome> {
        if self.prevented.lock().remove(path) {
            debug!(path = %path.display(), "upload prevented");
            return None;
        }
        let config_file = self.ctx.config_file_for(path)?;
        let pre_scan = self.pre_scans.lock().remove(&config_file);
        let options = TransferOptions {
            on_save: true,
            pre_scan,
            ..TransferOptions::default()
        };
        Some(
            SyncCommand::upload(Arc::clone(&self.ctx), path, options)
                .run()
                .await,
        )
    }

    /// Drops a pending open check and the shared connections of the file's
    /// settings.
    pub async fn on_close(&self, path: &Path) {
        self.scheduled_checks.lock().remove(path);
        if let Some(config_file) = self.ctx.config_file_for(path) {
            self.ctx.cache().close(&fingerprint_for(&config_file)).await;
        }
    }

    /// Checks remote versions shortly after a file was opened, when a
    /// profile asks for it.
    pub async fn on_load(&self, path: &Path) -> Option<CheckOutcome> {
        if self
            .ctx
            .settings()
            .is_globally_ignored(&path.to_string_lossy())
        {
            return None;
        }
        let config_file = self.ctx.config_file_for(path)?;
        let config = self.ctx.load_config(&config_file).ok()?;
        if !config.profiles().iter().any(|profile| profile.download_on_open) {
            return None;
        }
        if !self.scheduled_checks.lock().insert(path.to_path_buf()) {
            return None;
        }

        tokio::time::sleep(self.ctx.settings().open_check_delay).await;
        if !self.scheduled_checks.lock().remove(path) {
            debug!(path = %path.display(), "closed before the open check");
            return None;
        }
        Some(self.check(path, false).await)
    }

    async fn ensure_passwords<'a>(&self, config_files: impl IntoIterator<Item = &'a Path>) {
        let unique: HashSet<&Path> = config_files.into_iter().collect();
        for config_file in unique {
            if let Err(err) = self.ctx.fill_passwords(config_file).await {
                debug!(path = %config_file.display(), error = %err, "config unusable");
            }
        }
    }

    /// Runs on a worker when more than one slot is configured, otherwise one
    /// after another.
    async fn run_batch(&self, commands: Vec<SyncCommand>) -> Vec<Outcome> {
        let limit = self.ctx.settings().worker_limit;
        if limit <= 1 {
            return self.run_sequential(commands).await;
        }

        let worker = Worker::with_policy(
            self.ctx.connector().clone(),
            limit,
            self.ctx.settings().retry_policy(),
        );
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        for command in commands {
            let sink = Arc::clone(&outcomes);
            worker.add_command(command.on_finish(move |outcome| sink.lock().push(outcome.clone())));
        }
        worker.wait_idle().await;
        worker.shutdown().await;
        std::mem::take(&mut *outcomes.lock())
    }

    /// Runs commands in order, sharing one connection set per settings file.
    /// A set a command found stale is replaced before the next command.
    async fn run_sequential(&self, commands: Vec<SyncCommand>) -> Vec<Outcome> {
        let mut sets: HashMap<String, Arc<ConnectionSet>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(commands.len());
        for mut command in commands {
            if let Some(config) = command.config() {
                let fingerprint = config.fingerprint();
                let reusable = sets
                    .get(&fingerprint)
                    .filter(|connections| !connections.is_stale())
                    .cloned();
                let connections = match reusable {
                    Some(connections) => connections,
                    None => {
                        let connections = Arc::new(
                            self.ctx
                                .connector()
                                .connect_all(&fingerprint, &config)
                                .await,
                        );
                        if let Some(stale) = sets.insert(fingerprint, Arc::clone(&connections)) {
                            debug!("replacing stale batch connections");
                            stale.close().await;
                        }
                        connections
                    }
                };
                command.assign_connections(connections);
            }
            outcomes.push(command.run().await);
        }
        for connections in sets.into_values() {
            connections.close().await;
        }
        outcomes
    }

    fn notify_finished(&self, verb: &str, progress: &ftpsync_core::SharedProgress) {
        let snapshot = progress.lock().clone();
        if snapshot.total() > 1 {
            self.ctx
                .prompter()
                .status(&finished_notice(verb, Some(&snapshot), ""));
        }
    }

    fn root_relative(&self, path: &Path) -> String {
        match self
            .ctx
            .config_file_for(path)
            .as_deref()
            .and_then(Path::parent)
        {
            Some(root) => format!("/{}", display_name(root, path)),
            None => path.display().to_string(),
        }
    }
}

fn remote_versions(outcome: Outcome) -> Vec<RemoteMetadata> {
    match outcome {
        Outcome::Metadata(entries) => entries,
        _ => Vec::new(),
    }
}

fn batch_progress<'a>(paths: impl Iterator<Item = &'a Path>) -> ftpsync_core::SharedProgress {
    let mut progress = Progress::new();
    progress.add(paths.map(|path| path.to_string_lossy().into_owned()));
    progress.shared()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_empty_dir(path: &Path) -> bool {
    path.is_dir()
        && std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
