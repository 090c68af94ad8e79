mod delete;
mod download;
mod metadata;
mod rename;
mod upload;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ftpsync_core::{Config, Metafile, Profile, SharedProgress};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::cache::{ConnectionHandle, ConnectionSet, InUseGuard};
use super::file_watcher::FileWatcher;
use super::paths::display_name;
use super::scan::Snapshot;
use super::worker::Worker;
use crate::context::SyncContext;
use crate::settings::Settings;
use crate::status::progress_message;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Upload,
    Download,
    Rename,
    Delete,
    Metadata,
}

impl CommandKind {
    pub fn past_tense(self) -> &'static str {
        match self {
            CommandKind::Upload => "Uploaded",
            CommandKind::Download => "Downloaded",
            CommandKind::Rename => "Renamed",
            CommandKind::Delete => "Deleted",
            CommandKind::Metadata => "Checked",
        }
    }

    fn needs_local_file(self) -> bool {
        matches!(
            self,
            CommandKind::Upload | CommandKind::Rename | CommandKind::Delete
        )
    }
}

/// Knobs shared by every command kind; irrelevant fields are ignored.
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub progress: Option<SharedProgress>,
    /// The command was triggered by an editor save.
    pub on_save: bool,
    /// Upload on save even where `upload_on_save` is off.
    pub forced_save: bool,
    pub disregard_ignore: bool,
    /// When non-empty, only these profiles are used.
    pub whitelist: Vec<String>,
    /// Watch snapshots taken before the save, keyed by profile.
    pub pre_scan: Option<HashMap<String, Snapshot>>,
    /// Download: treat the target as a directory.
    pub is_dir: bool,
    /// Download: transfer even when the local copy is up to date.
    pub forced: bool,
    /// Download: record only, no byte transfer.
    pub skip: bool,
}

impl TransferOptions {
    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn on_save(mut self) -> Self {
        self.on_save = true;
        self
    }

    pub fn disregarding_ignore(mut self) -> Self {
        self.disregard_ignore = true;
        self
    }

    pub fn only(mut self, profiles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.whitelist = profiles.into_iter().map(Into::into).collect();
        self
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("on_save", &self.on_save)
            .field("forced_save", &self.forced_save)
            .field("disregard_ignore", &self.disregard_ignore)
            .field("whitelist", &self.whitelist)
            .field("is_dir", &self.is_dir)
            .field("forced", &self.forced)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Delayed fires or child commands handed off for later.
    pub scheduled: usize,
    pub collisions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub profile: String,
    pub metadata: Metafile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Cancelled { reason: String },
    Done(Report),
    Metadata(Vec<RemoteMetadata>),
    /// The user refused to overwrite existing remote files.
    Declined { collisions: Vec<String> },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("connection for profile {0} went stale")]
    StaleConnection(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type FinishCallback = Box<dyn FnOnce(&Outcome) + Send + Sync>;

/// Profiles a command may use, after ignore rules and whitelists.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub eligible: Vec<String>,
    /// Ignored profiles kept alive only to watch after the save.
    pub skipping: HashSet<String>,
}

/// Applies on-save filtering, then global ignore, then per-profile ignore,
/// then the whitelist. `Err` carries the reason the command closes.
pub fn select_profiles(
    settings: &Settings,
    config: &Config,
    path: &Path,
    options: &TransferOptions,
    watching_upload: bool,
) -> Result<Selection, String> {
    let path_text = path.to_string_lossy();
    let mut candidates: Vec<&Profile> = config
        .profiles()
        .iter()
        .filter(|profile| {
            let dropped = options.on_save && !profile.upload_on_save && !options.forced_save;
            if dropped {
                debug!(profile = %profile.name, "upload on save disabled");
            }
            !dropped
        })
        .collect();

    let mut selection = Selection::default();
    let check_ignore = !options.disregard_ignore;

    if check_ignore && settings.is_globally_ignored(&path_text) {
        if !watching_upload {
            return Err("ignored by global ignore pattern".into());
        }
        candidates.retain(|profile| profile.watches_after_save());
        if candidates.is_empty() {
            return Err("ignored by global ignore pattern".into());
        }
        selection.skipping = candidates.iter().map(|profile| profile.name.clone()).collect();
    }

    for profile in candidates {
        let ignored = check_ignore
            && profile
                .ignore_regex()
                .is_some_and(|pattern| pattern.is_match(&path_text));
        if ignored {
            if watching_upload && profile.watches_after_save() {
                selection.skipping.insert(profile.name.clone());
            } else {
                debug!(profile = %profile.name, "ignored by profile pattern");
                continue;
            }
        }
        if !options.whitelist.is_empty() && !options.whitelist.contains(&profile.name) {
            continue;
        }
        selection.eligible.push(profile.name.clone());
    }
    selection
        .skipping
        .retain(|name| selection.eligible.contains(name));

    if selection.eligible.is_empty() {
        return Err("no profile applies".into());
    }
    Ok(selection)
}

/// One unit of synchronization work for a single local path.
pub struct SyncCommand {
    id: CommandId,
    kind: CommandKind,
    ctx: Arc<SyncContext>,
    path: PathBuf,
    new_name: Option<String>,
    options: TransferOptions,
    config_file: Option<PathBuf>,
    config: Option<Arc<Config>>,
    selection: Selection,
    worker: Option<Worker>,
    on_finish: Vec<FinishCallback>,
    closed: bool,
    close_reason: Option<String>,
    connections: Option<Arc<ConnectionSet>>,
    owns_connections: bool,
    shared: bool,
    completed: Vec<String>,
    watcher: Option<Arc<Mutex<FileWatcher>>>,
    tracker: TaskTracker,
    /// Results of delayed fires, merged into the outcome by `finish`.
    deferred: Arc<Mutex<Report>>,
    upload_token: Option<u64>,
}

impl SyncCommand {
    pub fn upload(ctx: Arc<SyncContext>, path: impl Into<PathBuf>, options: TransferOptions) -> Self {
        Self::build(ctx, CommandKind::Upload, path.into(), None, options)
    }

    pub fn download(
        ctx: Arc<SyncContext>,
        path: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        Self::build(ctx, CommandKind::Download, path.into(), None, options)
    }

    pub fn rename(
        ctx: Arc<SyncContext>,
        path: impl Into<PathBuf>,
        new_name: impl Into<String>,
        options: TransferOptions,
    ) -> Self {
        Self::build(
            ctx,
            CommandKind::Rename,
            path.into(),
            Some(new_name.into()),
            options,
        )
    }

    pub fn delete(ctx: Arc<SyncContext>, path: impl Into<PathBuf>, options: TransferOptions) -> Self {
        Self::build(ctx, CommandKind::Delete, path.into(), None, options)
    }

    /// Metadata lookups reuse the shared cached connections.
    pub fn metadata(
        ctx: Arc<SyncContext>,
        path: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        let mut command = Self::build(ctx, CommandKind::Metadata, path.into(), None, options);
        command.shared = true;
        command
    }

    fn build(
        ctx: Arc<SyncContext>,
        kind: CommandKind,
        path: PathBuf,
        new_name: Option<String>,
        options: TransferOptions,
    ) -> Self {
        let mut command = Self {
            id: CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            ctx,
            path,
            new_name,
            options,
            config_file: None,
            config: None,
            selection: Selection::default(),
            worker: None,
            on_finish: Vec::new(),
            closed: false,
            close_reason: None,
            connections: None,
            owns_connections: false,
            shared: false,
            completed: Vec::new(),
            watcher: None,
            tracker: TaskTracker::new(),
            deferred: Arc::new(Mutex::new(Report::default())),
            upload_token: None,
        };
        if let Err(reason) = command.load() {
            command.close(reason);
        }
        command
    }

    fn load(&mut self) -> Result<(), String> {
        if self.kind.needs_local_file() && !self.path.exists() {
            return Err(format!("{} does not exist", self.path.display()));
        }
        if self.kind == CommandKind::Rename
            && self
                .new_name
                .as_deref()
                .is_none_or(|name| name.trim().is_empty())
        {
            return Err("new name is empty".into());
        }

        let config_file = self
            .ctx
            .config_file_for(&self.path)
            .ok_or_else(|| "found no config".to_string())?;
        let config = self
            .ctx
            .load_config(&config_file)
            .map_err(|err| err.to_string())?;
        self.selection = select_profiles(
            self.ctx.settings(),
            &config,
            &self.path,
            &self.options,
            self.kind == CommandKind::Upload && self.options.on_save,
        )?;
        self.config_file = Some(config_file);
        self.config = Some(Arc::new(config));
        Ok(())
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> Option<Arc<Config>> {
        self.config.clone()
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn eligible(&self) -> &[String] {
        &self.selection.eligible
    }

    pub fn is_skipping(&self, profile: &str) -> bool {
        self.selection.skipping.contains(profile)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Registers a callback run once the command and its follow-ups finished.
    pub fn on_finish(mut self, callback: impl FnOnce(&Outcome) + Send + Sync + 'static) -> Self {
        self.on_finish.push(Box::new(callback));
        self
    }

    pub(crate) fn attach_worker(&mut self, worker: Worker) {
        self.worker = Some(worker);
    }

    /// Hands the command a connection set it borrows and never closes.
    pub fn assign_connections(&mut self, connections: Arc<ConnectionSet>) {
        self.connections = Some(connections);
        self.owns_connections = false;
    }

    fn close(&mut self, reason: impl Into<String>) {
        if self.closed {
            return;
        }
        let reason = reason.into();
        debug!(command = %self.id, path = %self.path.display(), %reason, "closing command");
        self.closed = true;
        self.close_reason = Some(reason);
        self.advance_progress();
    }

    fn cancel(&mut self, reason: &str) -> Outcome {
        self.close(reason);
        Outcome::Cancelled {
            reason: reason.to_string(),
        }
    }

    fn advance_progress(&self) {
        if let Some(progress) = &self.options.progress {
            progress.lock().progress(1);
        }
    }

    /// Runs the command once. Per-profile failures are logged and reported;
    /// only a stale connection surfaces as an error so the caller can retry.
    pub async fn execute(&mut self) -> Result<Outcome, CommandError> {
        if self.closed {
            let reason = self.close_reason.clone().unwrap_or_default();
            debug!(command = %self.id, %reason, "skipping closed command");
            return Ok(Outcome::Cancelled { reason });
        }
        let Some(config) = self.config.clone() else {
            return Ok(self.cancel("found no config"));
        };

        let fingerprint = config.fingerprint();
        let _in_use: Option<InUseGuard> = self
            .shared
            .then(|| self.ctx.cache().mark_in_use(&fingerprint));
        let connections = self.acquire_connections(&fingerprint, &config).await;
        let live = self
            .selection
            .eligible
            .iter()
            .any(|name| connections.handle(name).is_some());
        if !live {
            warn!(command = %self.id, "zero connections apply");
            return Ok(self.cancel("zero connections apply"));
        }

        match self.kind {
            CommandKind::Upload => self.run_upload(&config, &connections).await,
            CommandKind::Download => self.run_download(&config, &connections).await,
            CommandKind::Rename => self.run_rename(&config, &connections).await,
            CommandKind::Delete => self.run_delete(&config, &connections).await,
            CommandKind::Metadata => self.run_metadata(&config, &connections).await,
        }
    }

    async fn acquire_connections(&mut self, fingerprint: &str, config: &Config) -> Arc<ConnectionSet> {
        if let Some(connections) = &self.connections {
            return Arc::clone(connections);
        }
        let connections = self.ctx.cache().get(fingerprint, config, self.shared).await;
        self.owns_connections = !self.shared;
        self.connections = Some(Arc::clone(&connections));
        connections
    }

    /// Eligible profiles with a live connection that have not completed in
    /// an earlier attempt, in declaration order.
    fn targets(&self, config: &Config, connections: &ConnectionSet) -> Vec<(Profile, ConnectionHandle)> {
        config
            .profiles()
            .iter()
            .filter(|profile| self.selection.eligible.contains(&profile.name))
            .filter(|profile| !self.completed.contains(&profile.name))
            .filter_map(|profile| match connections.handle(&profile.name) {
                Some(handle) => Some((profile.clone(), handle)),
                None => {
                    debug!(profile = %profile.name, "profile unavailable this round");
                    None
                }
            })
            .collect()
    }

    fn resumed_report(&self) -> Report {
        Report {
            succeeded: self.completed.clone(),
            ..Report::default()
        }
    }

    fn record_success(&mut self, report: &mut Report, profile: &str) {
        report.succeeded.push(profile.to_string());
        if !self.completed.iter().any(|done| done == profile) {
            self.completed.push(profile.to_string());
        }
    }

    /// Gives up a connection set that went stale. Shared sets are evicted
    /// from the cache; borrowed sets are flagged for their owner to rebuild.
    async fn drop_stale_connections(&mut self) {
        let Some(connections) = self.connections.take() else {
            return;
        };
        connections.mark_stale();
        if self.shared {
            self.ctx.cache().close(connections.fingerprint()).await;
        } else if self.owns_connections {
            connections.close().await;
        }
        self.owns_connections = false;
    }

    fn stale(&self, profile: &str) -> CommandError {
        warn!(command = %self.id, profile, "connection went stale");
        CommandError::StaleConnection(profile.to_string())
    }

    fn report_status(&self, config: &Config, report: &Report) {
        if report.succeeded.is_empty() {
            return;
        }
        let progress = self
            .options
            .progress
            .as_ref()
            .map(|progress| progress.lock().clone());
        let name = display_name(config.root_dir(), &self.path);
        let message = progress_message(
            &report.succeeded,
            progress.as_ref(),
            self.kind.past_tense(),
            Some(&name),
        );
        self.ctx.prompter().status(&message);
    }

    /// Runs `child` on the attached worker, or inline on `connections`.
    async fn dispatch_child(&self, mut child: SyncCommand, connections: &Arc<ConnectionSet>) {
        match &self.worker {
            Some(worker) => {
                worker.add_command(child);
            }
            None => {
                child.assign_connections(Arc::clone(connections));
                run_boxed(child).await;
            }
        }
    }

    /// Waits for delayed fires and follow-ups, releases owned connections and
    /// runs the finish callbacks.
    pub async fn finish(mut self, outcome: Outcome) -> Outcome {
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(token) = self.upload_token.take() {
            self.ctx.uploads().finish(&self.path, token);
        }
        let outcome = match outcome {
            Outcome::Done(mut report) => {
                let deferred = std::mem::take(&mut *self.deferred.lock());
                report.succeeded.extend(deferred.succeeded);
                report.failed.extend(deferred.failed);
                Outcome::Done(report)
            }
            other => other,
        };
        if self.owns_connections
            && let Some(connections) = self.connections.take()
        {
            connections.close().await;
        }
        for callback in self.on_finish.drain(..) {
            callback(&outcome);
        }
        outcome
    }

    /// Executes under the configured retry policy and waits for completion.
    pub async fn run(mut self) -> Outcome {
        let policy = self.ctx.settings().retry_policy();
        let mut attempt = 1;
        let outcome = loop {
            match self.execute().await {
                Ok(outcome) => break outcome,
                Err(err) => {
                    attempt += 1;
                    let Some(delay) = policy.delay_before(attempt) else {
                        error!(command = %self.id, error = %err, "command failed");
                        break Outcome::Cancelled {
                            reason: err.to_string(),
                        };
                    };
                    warn!(command = %self.id, attempt, error = %err, "retrying command");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };
        self.finish(outcome).await
    }
}

impl fmt::Debug for SyncCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCommand")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("eligible", &self.selection.eligible)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Boxed [`SyncCommand::run`], for commands started from inside other commands.
pub fn run_boxed(command: SyncCommand) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        command.run().await;
    })
}
