//! Interactive browsing of one profile's remote tree, plus creation of new
//! settings files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ftpsync_core::{
    CONFIG_FILE_NAME, Config, DEFAULT_SETTINGS_TEMPLATE, DEFAULT_TIME_FORMAT, Metafile, Profile,
    RemoteError, parse_permissions,
};
use tracing::{debug, info, warn};

use super::cache::ConnectionHandle;
use super::check::{formatted_time, kilobytes};
use super::command::{Outcome, SyncCommand, TransferOptions};
use super::engine::Synchronizer;
use super::paths::{join_remote, local_path_for, remote_path_for};

const FALLBACK_PERMISSIONS: &str = "755";

/// Where the last browse session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsePoint {
    pub config_file: PathBuf,
    pub profile: String,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseOutcome {
    NoConfig,
    /// `browse_last` before anything was browsed.
    NothingToResume,
    Dismissed,
    Failed(String),
    Downloaded(Outcome),
    Uploaded(Vec<Outcome>),
    Removed(Vec<Outcome>),
    RemovedRemotely(String),
    Renamed(Outcome),
    RenamedRemotely { from: String, to: String },
    PermissionsChanged { remote: String, mode: String },
    Details(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryAction {
    Open,
    Back,
    Download,
    Upload,
    Remove,
    Rename,
    Permissions,
    Details,
}

/// A listing row resolved to the remote path it acts on.
#[derive(Debug, Clone)]
struct Entry {
    meta: Metafile,
    remote: String,
    name: String,
}

impl Entry {
    fn resolve(dir: &str, meta: Metafile) -> Self {
        let remote = match meta.name() {
            "." => dir.to_string(),
            ".." => parent_of(dir).to_string(),
            _ => meta.path().to_string_lossy().into_owned(),
        };
        let name = match meta.name() {
            "." | ".." => last_segment(&remote).to_string(),
            other => other.to_string(),
        };
        Self { meta, remote, name }
    }

    fn is_dir(&self) -> bool {
        self.meta.is_dir()
    }
}

impl Synchronizer {
    /// Browses the remote copy of the folder containing `path`.
    pub async fn browse(&self, path: &Path) -> BrowseOutcome {
        let prompter = self.context().prompter();
        let Some(config_file) = self.context().config_file_for(path) else {
            prompter.status(&format!("Found no config > for file: {}", path.display()));
            return BrowseOutcome::NoConfig;
        };
        let config = match self.context().fill_passwords(&config_file).await {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %config_file.display(), error = %err, "config unusable");
                return BrowseOutcome::Failed(err.to_string());
            }
        };
        let Some(profile) = self.pick_profile(&config).await else {
            return BrowseOutcome::Dismissed;
        };

        let local_dir = if path.is_dir() {
            path
        } else {
            path.parent().unwrap_or(path)
        };
        let start = remote_path_for(config.root_dir(), &profile.path, local_dir)
            .unwrap_or_else(|_| profile.path.clone());
        self.navigate(&config, &profile, start).await
    }

    /// Resumes at the folder the previous session last listed.
    pub async fn browse_last(&self) -> BrowseOutcome {
        let Some(point) = self.last_browsed.lock().clone() else {
            self.context().prompter().status("Nothing was browsed yet");
            return BrowseOutcome::NothingToResume;
        };
        let config = match self.context().fill_passwords(&point.config_file).await {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %point.config_file.display(), error = %err, "config unusable");
                return BrowseOutcome::Failed(err.to_string());
            }
        };
        let Some(profile) = config.profile(&point.profile).cloned() else {
            debug!(profile = %point.profile, "browsed profile no longer configured");
            return BrowseOutcome::NoConfig;
        };
        self.navigate(&config, &profile, point.remote).await
    }

    /// Writes the default settings into every directory that has none yet and
    /// returns the settings file of each directory.
    pub fn new_settings(&self, dirs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let config_file = dir.join(CONFIG_FILE_NAME);
            self.context().invalidate_config_cache(dir);
            if config_file.exists() {
                debug!(path = %config_file.display(), "settings already present");
            } else {
                std::fs::write(&config_file, DEFAULT_SETTINGS_TEMPLATE)?;
                info!(path = %config_file.display(), "settings created");
            }
            written.push(config_file);
        }
        Ok(written)
    }

    async fn pick_profile(&self, config: &Config) -> Option<Profile> {
        match config.profiles() {
            [] => None,
            [only] => Some(only.clone()),
            profiles => {
                let rows: Vec<Vec<String>> = profiles
                    .iter()
                    .map(|profile| {
                        vec![
                            profile.name.clone(),
                            format!("Host: {}", profile.host),
                            format!("Path: {}", profile.path),
                        ]
                    })
                    .collect();
                let index = self.context().prompter().choose(&rows).await?;
                profiles.get(index).cloned()
            }
        }
    }

    async fn navigate(&self, config: &Config, profile: &Profile, start: String) -> BrowseOutcome {
        let handle = match self.context().connector().connect_one(config, profile).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(profile = %profile.name, error = %err, "browse connection failed");
                self.context()
                    .prompter()
                    .status(&format!("Connecting to {} failed: {err}", profile.name));
                return BrowseOutcome::Failed(err.to_string());
            }
        };
        let outcome = self.browse_on(&handle, config, profile, start).await;
        handle.lock().await.close().await;
        outcome
    }

    async fn browse_on(
        &self,
        handle: &ConnectionHandle,
        config: &Config,
        profile: &Profile,
        start: String,
    ) -> BrowseOutcome {
        let prompter = Arc::clone(self.context().prompter());
        let mut dir = start;
        loop {
            *self.last_browsed.lock() = Some(BrowsePoint {
                config_file: config.file_path().to_path_buf(),
                profile: profile.name.clone(),
                remote: dir.clone(),
            });

            let listing = match handle.lock().await.list(&dir, true).await {
                Ok(listing) => listing,
                Err(err) => return self.remote_failure(profile, &dir, err),
            };
            let entries = listing_entries(&dir, listing);
            if entries.iter().all(|entry| matches!(entry.meta.name(), "." | "..")) {
                prompter.status(&format!("No files found in remote path {{{dir}}}"));
            }

            let Some(entry) = prompter
                .choose(&listing_rows(&dir, &entries))
                .await
                .and_then(|index| entries.get(index))
            else {
                return BrowseOutcome::Dismissed;
            };
            let local = local_path_for(config.root_dir(), &profile.path, &entry.remote).ok();
            let has_local = local.as_deref().is_some_and(Path::exists);

            let actions = entry_actions(entry, has_local);
            let rows: Vec<Vec<String>> = actions.iter().map(|(_, label)| vec![label.clone()]).collect();
            let Some(action) = prompter
                .choose(&rows)
                .await
                .and_then(|index| actions.get(index))
                .map(|(action, _)| *action)
            else {
                return BrowseOutcome::Dismissed;
            };

            match action {
                EntryAction::Open => dir = entry.remote.clone(),
                EntryAction::Back => continue,
                _ => {
                    let target = Target {
                        handle,
                        config,
                        profile,
                        entry,
                        local: local.clone().filter(|_| has_local),
                        local_destination: local,
                    };
                    return self.apply(action, target).await;
                }
            }
        }
    }

    async fn apply(&self, action: EntryAction, target: Target<'_>) -> BrowseOutcome {
        let Target {
            handle,
            config,
            profile,
            entry,
            local,
            local_destination,
        } = target;
        let ctx = self.context();
        match action {
            EntryAction::Open | EntryAction::Back => BrowseOutcome::Dismissed,
            EntryAction::Download => {
                let Some(destination) = local_destination else {
                    return BrowseOutcome::Failed(format!("no local path for {}", entry.remote));
                };
                let options = TransferOptions {
                    is_dir: entry.is_dir(),
                    ..TransferOptions::default()
                }
                .only([profile.name.clone()])
                .forced(true);
                let outcome = SyncCommand::download(Arc::clone(ctx), destination, options)
                    .run()
                    .await;
                BrowseOutcome::Downloaded(outcome)
            }
            EntryAction::Upload => match local {
                Some(local) => BrowseOutcome::Uploaded(self.upload(&[local]).await),
                None => BrowseOutcome::Dismissed,
            },
            EntryAction::Remove => {
                if let Some(local) = local {
                    return BrowseOutcome::Removed(self.delete(&[local]).await);
                }
                let rows = vec![
                    vec![
                        "Yes, delete the selected items [remotely]".to_string(),
                        entry.remote.clone(),
                    ],
                    vec!["No".to_string(), "Cancel deletion".to_string()],
                ];
                if ctx.prompter().choose(&rows).await != Some(0) {
                    ctx.prompter().status("Deleting: cancelled");
                    return BrowseOutcome::Dismissed;
                }
                match handle.lock().await.delete(&entry.remote).await {
                    Ok(()) => {
                        info!(profile = %profile.name, remote = %entry.remote, "deleted");
                        ctx.prompter()
                            .status(&format!("Deleted {{{}}}", entry.name));
                        BrowseOutcome::RemovedRemotely(entry.remote.clone())
                    }
                    Err(err) => self.remote_failure(profile, &entry.remote, err),
                }
            }
            EntryAction::Rename => {
                let Some(new_name) = ctx.prompter().ask_text("New name:", &entry.name).await else {
                    return BrowseOutcome::Dismissed;
                };
                let new_name = new_name.trim();
                if new_name.is_empty() || new_name == entry.name {
                    return BrowseOutcome::Dismissed;
                }
                if let Some(local) = local {
                    return BrowseOutcome::Renamed(self.rename(&local, new_name).await);
                }
                let to = join_remote(parent_of(&entry.remote), new_name);
                match handle.lock().await.rename(&entry.remote, &to, false).await {
                    Ok(()) => {
                        info!(profile = %profile.name, from = %entry.remote, %to, "renamed");
                        BrowseOutcome::RenamedRemotely {
                            from: entry.remote.clone(),
                            to,
                        }
                    }
                    Err(err) => self.remote_failure(profile, &entry.remote, err),
                }
            }
            EntryAction::Permissions => {
                let default = profile
                    .default_folder_permissions
                    .as_deref()
                    .unwrap_or(FALLBACK_PERMISSIONS);
                let Some(text) = ctx.prompter().ask_text("Change permissions to:", default).await
                else {
                    return BrowseOutcome::Dismissed;
                };
                let text = text.trim().to_string();
                let Some(mode) = parse_permissions(&text) else {
                    ctx.prompter().status(&format!("Invalid permissions {{{text}}}"));
                    return BrowseOutcome::Failed(format!("invalid permissions {text:?}"));
                };
                match handle.lock().await.chmod(&entry.remote, mode).await {
                    Ok(()) => {
                        ctx.prompter().status(&format!(
                            "Properties of {} changed to {text}",
                            entry.name
                        ));
                        BrowseOutcome::PermissionsChanged {
                            remote: entry.remote.clone(),
                            mode: text,
                        }
                    }
                    Err(err) => self.remote_failure(profile, &entry.remote, err),
                }
            }
            EntryAction::Details => {
                let rows = details_rows(profile, entry, local.as_deref());
                ctx.prompter().choose(std::slice::from_ref(&rows)).await;
                debug!(config = %config.file_path().display(), remote = %entry.remote, "details shown");
                BrowseOutcome::Details(rows)
            }
        }
    }

    fn remote_failure(&self, profile: &Profile, remote: &str, err: RemoteError) -> BrowseOutcome {
        warn!(profile = %profile.name, %remote, error = %err, "browse operation failed");
        self.context()
            .prompter()
            .status(&format!("Remote operation on {{{remote}}} failed: {err}"));
        BrowseOutcome::Failed(err.to_string())
    }
}

struct Target<'a> {
    handle: &'a ConnectionHandle,
    config: &'a Config,
    profile: &'a Profile,
    entry: &'a Entry,
    /// Existing local copy.
    local: Option<PathBuf>,
    /// Where a download of the entry lands.
    local_destination: Option<PathBuf>,
}

/// Parent link first, then folders, then files, each by case-insensitive
/// name. The root has no parent link.
fn listing_entries(dir: &str, listing: Vec<Metafile>) -> Vec<Entry> {
    let mut entries: Vec<Entry> = listing
        .into_iter()
        .filter(|meta| !(meta.name() == ".." && dir.trim_end_matches('/').is_empty()))
        .map(|meta| Entry::resolve(dir, meta))
        .collect();
    entries.sort_by_key(|entry| {
        (
            entry.meta.name() != "..",
            !entry.is_dir(),
            entry.meta.name().to_lowercase(),
        )
    });
    entries
}

fn listing_rows(dir: &str, entries: &[Entry]) -> Vec<Vec<String>> {
    entries
        .iter()
        .map(|entry| {
            let mut row = if entry.is_dir() {
                vec![format!("[ {} ]", entry.meta.name()), "Directory".to_string()]
            } else {
                vec![
                    entry.meta.name().to_string(),
                    format!("Size: {} kB", kilobytes(entry.meta.size().unwrap_or(0))),
                ]
            };
            row.push(format!("Last modified: {}", formatted_time(&entry.meta)));
            row.push(format!("Path: {dir}"));
            row
        })
        .collect()
}

fn entry_actions(entry: &Entry, has_local: bool) -> Vec<(EntryAction, String)> {
    let (kind, mut actions) = if entry.is_dir() {
        let actions = vec![
            (EntryAction::Open, format!("Open {}", entry.name)),
            (EntryAction::Back, "Back".to_string()),
        ];
        ("folder", actions)
    } else {
        ("file", vec![(EntryAction::Back, "Back".to_string())])
    };
    actions.push((EntryAction::Download, format!("Download {kind}")));
    if has_local {
        actions.push((EntryAction::Upload, format!("Upload {kind}")));
    }
    actions.push((EntryAction::Remove, format!("Remove {kind}")));
    actions.push((EntryAction::Rename, format!("Rename {kind}")));
    actions.push((EntryAction::Permissions, "Change permissions".to_string()));
    actions.push((EntryAction::Details, "Show details".to_string()));
    actions
}

fn details_rows(profile: &Profile, entry: &Entry, local: Option<&Path>) -> Vec<String> {
    let mut rows = vec![entry.name.clone()];
    if entry.is_dir() {
        rows.push("[Directory]".to_string());
    } else {
        rows.push("[File]".to_string());
    }
    rows.push(format!("Path: {}", relative_to(&profile.path, &entry.remote)));
    if !entry.is_dir() {
        rows.push(format!(
            "Size: {} kB",
            kilobytes(entry.meta.size().unwrap_or(0))
        ));
    }
    if let (Some(text), Some(octal)) = (entry.meta.permissions(), entry.meta.permissions_octal()) {
        rows.push(format!("Permissions: {text} ({octal:o})"));
    }
    rows.push(format!("Last Modified: {}", formatted_time(&entry.meta)));
    rows.push(String::new());

    match local.and_then(|path| Metafile::from_local(path).ok()) {
        Some(copy) => {
            rows.push("[Has local version]".to_string());
            if !copy.is_dir() {
                rows.push(format!("Local size: {} kB", kilobytes(copy.size().unwrap_or(0))));
            }
            let modified = copy
                .last_modified_formatted(DEFAULT_TIME_FORMAT)
                .unwrap_or_else(|| "unknown".to_string());
            rows.push(format!("Local last modified: {modified}"));
        }
        None => rows.push("[No local version]".to_string()),
    }
    rows
}

fn relative_to(remote_root: &str, remote: &str) -> String {
    let prefix = remote_root.trim_end_matches('/');
    let rest = remote.strip_prefix(prefix).unwrap_or(remote);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

fn parent_of(remote: &str) -> &str {
    match remote.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn last_segment(remote: &str) -> &str {
    match remote.trim_end_matches('/').rsplit('/').next() {
        Some("") | None => "/",
        Some(name) => name,
    }
}

#[cfg(test)]
#[path = "navigator_tests.rs"]
mod tests;
