use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ftpsync_core::{BlockCallback, Config, Metafile};
use tracing::{debug, info, warn};

use super::{CommandError, Outcome, SyncCommand, TransferOptions};
use crate::sync::cache::ConnectionSet;
use crate::sync::paths::{local_path_for, remote_path_for};

impl SyncCommand {
    pub(super) async fn run_download(
        &mut self,
        config: &Arc<Config>,
        connections: &Arc<ConnectionSet>,
    ) -> Result<Outcome, CommandError> {
        let Some((profile, handle)) = self.targets(config, connections).into_iter().next() else {
            return Ok(self.cancel("zero connections apply"));
        };
        let remote = match remote_path_for(config.root_dir(), &profile.path, &self.path) {
            Ok(remote) => remote,
            Err(err) => return Ok(self.cancel(&err.to_string())),
        };

        let mut report = self.resumed_report();
        if self.options.skip {
            debug!(%remote, "local copy is current, skipping");
            self.record_success(&mut report, &profile.name);
            self.advance_progress();
            return Ok(Outcome::Done(report));
        }

        if self.options.is_dir || self.path.is_dir() {
            let listing = handle.lock().await.list(&remote, false).await;
            let entries = match listing {
                Ok(entries) => entries,
                Err(err) if err.is_stale() => {
                    self.drop_stale_connections().await;
                    return Err(self.stale(&profile.name));
                }
                Err(err) => {
                    warn!(profile = %profile.name, %remote, error = %err, "listing failed");
                    report.failed.push(profile.name.clone());
                    self.advance_progress();
                    return Ok(Outcome::Done(report));
                }
            };

            tokio::fs::create_dir_all(&self.path).await?;
            let children = self.child_downloads(config, &profile.name, &profile.path, &entries);
            if let Some(progress) = &self.options.progress {
                progress.lock().add(
                    children
                        .iter()
                        .map(|child| child.path().to_string_lossy().into_owned()),
                );
            }
            report.scheduled = children.len();
            self.record_success(&mut report, &profile.name);
            self.advance_progress();
            for child in children {
                self.dispatch_child(child, connections).await;
            }
            return Ok(Outcome::Done(report));
        }

        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        let on_block = move |size: u64| {
            counter.fetch_add(size, Ordering::Relaxed);
        };
        let on_block: &BlockCallback = &on_block;
        let result = handle
            .lock()
            .await
            .get(&remote, &self.path, Some(on_block))
            .await;
        match result {
            Ok(()) => {
                info!(profile = %profile.name, %remote, bytes = received.load(Ordering::Relaxed), "downloaded");
                self.record_success(&mut report, &profile.name);
            }
            Err(err) if err.is_stale() => {
                self.drop_stale_connections().await;
                return Err(self.stale(&profile.name));
            }
            Err(err) => {
                warn!(profile = %profile.name, %remote, error = %err, "download failed");
                report.failed.push(profile.name.clone());
            }
        }
        self.advance_progress();
        self.report_status(config, &report);
        Ok(Outcome::Done(report))
    }

    fn child_downloads(
        &self,
        config: &Config,
        profile: &str,
        remote_root: &str,
        entries: &[Metafile],
    ) -> Vec<SyncCommand> {
        entries
            .iter()
            .filter(|entry| entry.name() != "." && entry.name() != "..")
            .filter_map(|entry| {
                let remote = entry.path().to_string_lossy();
                match local_path_for(config.root_dir(), remote_root, &remote) {
                    Ok(local) => Some((entry, local)),
                    Err(err) => {
                        warn!(%remote, error = %err, "cannot map remote entry");
                        None
                    }
                }
            })
            .map(|(entry, local)| {
                let skip = !self.options.forced
                    && !entry.is_dir()
                    && local.exists()
                    && !entry.is_newer_than_local(&local);
                let options = TransferOptions {
                    progress: self.options.progress.clone(),
                    whitelist: vec![profile.to_string()],
                    disregard_ignore: self.options.disregard_ignore,
                    is_dir: entry.is_dir(),
                    forced: self.options.forced,
                    skip,
                    ..TransferOptions::default()
                };
                SyncCommand::download(Arc::clone(&self.ctx), local, options)
            })
            .collect()
    }
}
