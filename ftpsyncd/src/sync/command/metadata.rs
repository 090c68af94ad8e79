use std::sync::Arc;

use ftpsync_core::Config;
use tracing::{debug, warn};

use super::{CommandError, Outcome, RemoteMetadata, SyncCommand};
use crate::sync::cache::ConnectionSet;
use crate::sync::paths::remote_path_for;

impl SyncCommand {
    pub(super) async fn run_metadata(
        &mut self,
        config: &Arc<Config>,
        connections: &ConnectionSet,
    ) -> Result<Outcome, CommandError> {
        let mut found = Vec::new();
        let mut stale = None;
        for (profile, handle) in self.targets(config, connections) {
            let Ok(remote) = remote_path_for(config.root_dir(), &profile.path, &self.path) else {
                continue;
            };
            let listing = handle.lock().await.list(&remote, false).await;
            match listing {
                Ok(entries) => match entries.into_iter().next() {
                    Some(metadata) => found.push(RemoteMetadata {
                        profile: profile.name.clone(),
                        metadata,
                    }),
                    None => debug!(profile = %profile.name, %remote, "empty listing"),
                },
                Err(err) if err.is_not_found() => {
                    debug!(profile = %profile.name, %remote, "not on remote");
                }
                Err(err) if err.is_stale() => {
                    stale.get_or_insert(profile.name.clone());
                }
                Err(err) => warn!(profile = %profile.name, error = %err, "listing failed"),
            }
        }
        if let Some(profile) = stale {
            self.drop_stale_connections().await;
            return Err(self.stale(&profile));
        }
        self.advance_progress();
        Ok(Outcome::Metadata(found))
    }
}
