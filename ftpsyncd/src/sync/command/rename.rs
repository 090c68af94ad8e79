use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ftpsync_core::Config;
use tracing::{debug, info, warn};

use super::{CommandError, Outcome, SyncCommand};
use crate::sync::cache::ConnectionSet;
use crate::sync::paths::{display_name, remote_path_for};

impl SyncCommand {
    pub(super) async fn run_rename(
        &mut self,
        config: &Arc<Config>,
        connections: &ConnectionSet,
    ) -> Result<Outcome, CommandError> {
        if !self.path.exists() {
            return Ok(self.cancel("local file vanished"));
        }
        let new_name = self.new_name.clone().unwrap_or_default();
        let new_path = self.path.with_file_name(new_name.trim());
        let root = config.root_dir();
        let targets = self.targets(config, connections);

        let mut collisions = Vec::new();
        for (profile, handle) in &targets {
            let Ok(remote_new) = remote_path_for(root, &profile.path, &new_path) else {
                continue;
            };
            let listing = handle.lock().await.list(&remote_new, false).await;
            match listing {
                Ok(entries) if !entries.is_empty() => collisions.push(profile.name.clone()),
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) if err.is_stale() => {
                    self.drop_stale_connections().await;
                    return Err(self.stale(&profile.name));
                }
                Err(err) => warn!(profile = %profile.name, error = %err, "collision check failed"),
            }
        }

        let forced = !collisions.is_empty();
        if forced {
            let rows = collision_rows(config, &collisions, &display_name(root, &new_path));
            if self.ctx.prompter().choose(&rows).await != Some(0) {
                info!(path = %self.path.display(), "rename declined");
                self.advance_progress();
                return Ok(Outcome::Declined { collisions });
            }
        }

        let mut report = self.resumed_report();
        report.collisions = collisions;
        let mut stale = None;
        for (profile, handle) in targets {
            let (Ok(from), Ok(to)) = (
                remote_path_for(root, &profile.path, &self.path),
                remote_path_for(root, &profile.path, &new_path),
            ) else {
                report.failed.push(profile.name.clone());
                continue;
            };
            let result = handle.lock().await.rename(&from, &to, forced).await;
            match result {
                Ok(()) => self.record_success(&mut report, &profile.name),
                Err(err) if err.is_not_found() => {
                    debug!(profile = %profile.name, %from, "nothing to move remotely");
                    self.record_success(&mut report, &profile.name);
                }
                Err(err) if err.is_stale() => {
                    report.failed.push(profile.name.clone());
                    stale.get_or_insert(profile.name.clone());
                }
                Err(err) => {
                    warn!(profile = %profile.name, error = %err, "rename failed");
                    report.failed.push(profile.name.clone());
                }
            }
        }
        if let Some(profile) = stale {
            self.drop_stale_connections().await;
            return Err(self.stale(&profile));
        }

        if !report.succeeded.is_empty() {
            match replace(&self.path, &new_path).await {
                Ok(()) => info!(from = %self.path.display(), to = %new_path.display(), "renamed locally"),
                Err(err) => warn!(path = %self.path.display(), error = %err, "local rename failed"),
            }
        }
        self.advance_progress();
        self.report_status(config, &report);
        Ok(Outcome::Done(report))
    }
}

/// Overwrite/cancel rows listing every profile where the target exists.
pub fn collision_rows(config: &Config, collisions: &[String], target: &str) -> Vec<Vec<String>> {
    let mut overwrite = vec!["Overwrite remote file? Already exists in:".to_string()];
    for name in collisions {
        let host = config
            .profile(name)
            .map(|profile| profile.host.as_str())
            .unwrap_or_default();
        overwrite.push(format!("{name} [{host}]"));
    }
    vec![
        overwrite,
        vec!["Cancel renaming".to_string(), target.to_string()],
    ]
}

/// Renames `from` to `to`, moving an existing `to` aside first and putting it
/// back when the rename fails.
async fn replace(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::symlink_metadata(to).await.is_err() {
        return tokio::fs::rename(from, to).await;
    }

    let backup = backup_path(to);
    tokio::fs::rename(to, &backup).await?;
    match tokio::fs::rename(from, to).await {
        Ok(()) => {
            let removed = if backup.is_dir() {
                tokio::fs::remove_dir_all(&backup).await
            } else {
                tokio::fs::remove_file(&backup).await
            };
            if let Err(err) = removed {
                debug!(path = %backup.display(), error = %err, "stale backup left behind");
            }
            Ok(())
        }
        Err(err) => {
            tokio::fs::rename(&backup, to).await?;
            Err(err)
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}
