use std::sync::Arc;

use ftpsync_core::Config;
use tracing::{debug, info, warn};

use super::{CommandError, Outcome, SyncCommand};
use crate::sync::cache::ConnectionSet;
use crate::sync::paths::remote_path_for;

impl SyncCommand {
    pub(super) async fn run_delete(
        &mut self,
        config: &Arc<Config>,
        connections: &ConnectionSet,
    ) -> Result<Outcome, CommandError> {
        if self.completed.is_empty() {
            self.advance_progress();
        }
        let mut report = self.resumed_report();
        let mut stale = None;
        for (profile, handle) in self.targets(config, connections) {
            let Ok(remote) = remote_path_for(config.root_dir(), &profile.path, &self.path) else {
                report.failed.push(profile.name.clone());
                continue;
            };
            let result = handle.lock().await.delete(&remote).await;
            match result {
                Ok(()) => {
                    info!(profile = %profile.name, %remote, "deleted");
                    self.record_success(&mut report, &profile.name);
                }
                Err(err) if err.is_not_found() => {
                    debug!(profile = %profile.name, %remote, "already gone remotely");
                    self.record_success(&mut report, &profile.name);
                }
                Err(err) if err.is_stale() => {
                    report.failed.push(profile.name.clone());
                    stale.get_or_insert(profile.name.clone());
                }
                Err(err) => {
                    warn!(profile = %profile.name, error = %err, "delete failed");
                    report.failed.push(profile.name.clone());
                }
            }
        }
        if let Some(profile) = stale {
            self.drop_stale_connections().await;
            return Err(self.stale(&profile));
        }

        if !report.succeeded.is_empty() {
            let removed = if self.path.is_dir() {
                tokio::fs::remove_dir_all(&self.path).await
            } else {
                tokio::fs::remove_file(&self.path).await
            };
            match removed {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.report_status(config, &report);
        Ok(Outcome::Done(report))
    }
}
