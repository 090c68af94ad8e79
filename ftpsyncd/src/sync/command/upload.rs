use std::path::PathBuf;
use std::sync::Arc;

use ftpsync_core::{Config, Profile, RemoteError, SharedProgress, parse_permissions};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{CommandError, CommandKind, Outcome, Report, SyncCommand, TransferOptions, run_boxed};
use crate::context::SyncContext;
use crate::status::progress_message;
use crate::sync::cache::{ConnectionHandle, ConnectionSet};
use crate::sync::file_watcher::{FileWatcher, Stage};
use crate::sync::paths::{display_name, remote_path_for};
use crate::sync::worker::Worker;

/// Everything a single profile's upload needs, detached from the command so
/// it can fire later.
struct Fire {
    ctx: Arc<SyncContext>,
    config: Arc<Config>,
    profile: Profile,
    connections: Arc<ConnectionSet>,
    handle: ConnectionHandle,
    path: PathBuf,
    token: u64,
    skip: bool,
    progress: Option<SharedProgress>,
    deferred: Arc<Mutex<Report>>,
    watcher: Option<Arc<Mutex<FileWatcher>>>,
    worker: Option<Worker>,
}

impl Fire {
    async fn transfer(&self, handle: &ConnectionHandle) -> Result<(), RemoteError> {
        if self.skip {
            debug!(profile = %self.profile.name, path = %self.path.display(), "ignored, watching only");
            return Ok(());
        }
        let remote = remote_path_for(self.config.root_dir(), &self.profile.path, &self.path)
            .map_err(|err| RemoteError::Transfer(err.to_string()))?;

        let mut connection = handle.lock().await;
        if self.path.is_dir() {
            connection.ensure_dir(&remote).await?;
            if let Some(mode) = self
                .profile
                .default_folder_permissions
                .as_deref()
                .and_then(parse_permissions)
            {
                connection.chmod(&remote, mode).await?;
            }
        } else {
            connection.put(&self.path, &remote).await?;
        }
        info!(profile = %self.profile.name, %remote, "uploaded");
        Ok(())
    }

    /// Transfers on the borrowed connection; once it goes stale the set is
    /// flagged and the retries run on a private connection.
    async fn transfer_with_retry(&self) -> Result<(), RemoteError> {
        let policy = self.ctx.settings().retry_policy();
        let mut handle = Arc::clone(&self.handle);
        let mut private = None;
        let mut attempt = 1;
        let result = loop {
            let err = match self.transfer(&handle).await {
                Ok(()) => break Ok(()),
                Err(err) if err.is_stale() => err,
                Err(err) => break Err(err),
            };
            handle.lock().await.close().await;
            if private.is_none() {
                self.connections.mark_stale();
            }
            attempt += 1;
            let Some(delay) = policy.delay_before(attempt) else {
                break Err(err);
            };
            warn!(profile = %self.profile.name, attempt, error = %err, "reconnecting delayed upload");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.ctx.connector().connect_one(&self.config, &self.profile).await {
                Ok(fresh) => {
                    handle = Arc::clone(&fresh);
                    private = Some(fresh);
                }
                Err(err) => break Err(err),
            }
        };
        if let Some(private) = private {
            private.lock().await.close().await;
        }
        result
    }

    fn record(&self, succeeded: bool) {
        let name = self.profile.name.clone();
        let mut deferred = self.deferred.lock();
        if succeeded {
            deferred.succeeded.push(name);
        } else {
            deferred.failed.push(name);
        }
    }

    fn report_status(&self) {
        let progress = self.progress.as_ref().map(|progress| progress.lock().clone());
        let name = display_name(self.config.root_dir(), &self.path);
        let message = progress_message(
            std::slice::from_ref(&self.profile.name),
            progress.as_ref(),
            CommandKind::Upload.past_tense(),
            Some(&name),
        );
        self.ctx.prompter().status(&message);
    }

    /// Uploads files the watch rules saw change while the upload waited.
    async fn follow_up(&self) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        if !self.profile.has_after_save_watch() {
            return;
        }
        let watcher = Arc::clone(watcher);
        let profile = self.profile.name.clone();
        let scan = tokio::task::spawn_blocking(move || watcher.lock().changed_files(&profile));
        let changed = match scan.await {
            Ok(Ok(changed)) => changed,
            Ok(Err(err)) => {
                warn!(profile = %self.profile.name, error = %err, "watch failed");
                return;
            }
            Err(err) => {
                warn!(profile = %self.profile.name, error = %err, "watch scan aborted");
                return;
            }
        };

        let paths: Vec<PathBuf> = changed
            .iter()
            .filter(|file| !file.is_same_filepath(&self.path))
            .map(|file| file.path().to_path_buf())
            .collect();
        if !paths.is_empty() {
            debug!(profile = %self.profile.name, count = paths.len(), "uploading watched changes");
        }
        for path in paths {
            let options = TransferOptions::default()
                .disregarding_ignore()
                .only([self.profile.name.clone()]);
            let command = SyncCommand::upload(Arc::clone(&self.ctx), path, options);
            match &self.worker {
                Some(worker) => {
                    worker.add_command(command);
                }
                None => run_boxed(command).await,
            }
        }
    }
}

fn fire_later(fire: Fire) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::time::sleep(fire.profile.upload_delay()).await;
        if !fire.ctx.uploads().is_current(&fire.path, fire.token) {
            debug!(path = %fire.path.display(), "superseded by a newer upload");
            return;
        }
        match fire.transfer_with_retry().await {
            Ok(()) => {
                fire.record(true);
                fire.report_status();
            }
            Err(err) => {
                error!(profile = %fire.profile.name, error = %err, "delayed upload failed");
                fire.record(false);
            }
        }
        fire.follow_up().await;
    })
}

impl SyncCommand {
    pub(super) async fn run_upload(
        &mut self,
        config: &Arc<Config>,
        connections: &Arc<ConnectionSet>,
    ) -> Result<Outcome, CommandError> {
        if !self.path.exists() {
            return Ok(self.cancel("local file vanished"));
        }
        let token = self.ctx.uploads().register(&self.path);
        self.upload_token = Some(token);
        let watcher = if self.options.on_save {
            Some(self.prepare_watcher(config))
        } else {
            None
        };

        let mut report = self.resumed_report();
        let mut stale = None;
        for (profile, handle) in self.targets(config, connections) {
            let fire = Fire {
                ctx: Arc::clone(&self.ctx),
                config: Arc::clone(config),
                connections: Arc::clone(connections),
                skip: self.is_skipping(&profile.name),
                profile,
                handle,
                path: self.path.clone(),
                token,
                progress: self.options.progress.clone(),
                deferred: Arc::clone(&self.deferred),
                watcher: watcher.clone(),
                worker: self.worker.clone(),
            };

            if self.options.on_save && fire.profile.upload_delay > 0 {
                debug!(profile = %fire.profile.name, delay = fire.profile.upload_delay, "upload scheduled");
                report.scheduled += 1;
                self.tracker.spawn(fire_later(fire));
                continue;
            }

            match fire.transfer(&fire.handle).await {
                Ok(()) => self.record_success(&mut report, &fire.profile.name),
                Err(err) if err.is_stale() => {
                    report.failed.push(fire.profile.name.clone());
                    stale.get_or_insert(fire.profile.name.clone());
                }
                Err(err) => {
                    warn!(profile = %fire.profile.name, error = %err, "upload failed");
                    report.failed.push(fire.profile.name.clone());
                }
            }
        }

        if let Some(profile) = stale {
            self.drop_stale_connections().await;
            return Err(self.stale(&profile));
        }
        self.advance_progress();
        self.report_status(config, &report);
        Ok(Outcome::Done(report))
    }

    /// Watcher with the pre-save scan injected and a baseline for every
    /// watching profile.
    fn prepare_watcher(&mut self, config: &Arc<Config>) -> Arc<Mutex<FileWatcher>> {
        if let Some(watcher) = &self.watcher {
            return Arc::clone(watcher);
        }
        let mut watcher = FileWatcher::new(Arc::clone(config), Arc::clone(self.ctx.scanner()));
        if let Some(pre_scan) = self.options.pre_scan.take() {
            for (profile, snapshot) in pre_scan {
                watcher.set_scanned(Stage::Before, &profile, snapshot);
            }
        }
        watcher.prepare();
        let watcher = Arc::new(Mutex::new(watcher));
        self.watcher = Some(Arc::clone(&watcher));
        watcher
    }
}
