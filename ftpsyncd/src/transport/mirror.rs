use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ftpsync_core::{
    BlockCallback, Config, ConnectionFactory, Metafile, Profile, RemoteConnection, RemoteError,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::sync::local_watcher::PARTIAL_SUFFIX;
use crate::sync::paths::join_remote;

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("remote path escapes the mirror: {0}")]
    OutsideMirror(String),
    #[error("session is not connected")]
    NotConnected,
}

impl From<TransferError> for RemoteError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                RemoteError::NotFound(err.to_string())
            }
            TransferError::NotConnected => RemoteError::Stale(err.to_string()),
            other => RemoteError::Transfer(other.to_string()),
        }
    }
}

/// Serves every profile from `<root>/<host>`, so a host name selects a
/// directory on the local machine or a mounted share.
#[derive(Debug, Clone)]
pub struct LocalMirrorFactory {
    root: PathBuf,
}

impl LocalMirrorFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ConnectionFactory for LocalMirrorFactory {
    fn create(
        &self,
        _config: &Config,
        profile: &Profile,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        let host = profile.host.trim();
        if host.is_empty() || host.contains(['/', '\\']) || host == ".." {
            return Err(RemoteError::Connection(format!(
                "host {host:?} cannot name a mirror directory"
            )));
        }
        Ok(Box::new(MirrorConnection {
            profile: profile.name.clone(),
            base: self.root.join(host),
            connected: false,
            closed: false,
        }))
    }
}

struct MirrorConnection {
    profile: String,
    base: PathBuf,
    connected: bool,
    closed: bool,
}

impl MirrorConnection {
    fn resolve(&self, remote: &str) -> Result<PathBuf, TransferError> {
        if !self.connected || self.closed {
            return Err(TransferError::NotConnected);
        }
        let mut path = self.base.clone();
        for component in Path::new(remote).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(TransferError::OutsideMirror(remote.to_string()));
                }
            }
        }
        Ok(path)
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let target = self.resolve(remote)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        let mut source = tokio::fs::File::open(local).await?;
        let mut file = tokio::fs::File::create(&partial).await?;
        tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }

    async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        on_block: Option<&BlockCallback>,
    ) -> Result<(), TransferError> {
        let source_path = self.resolve(remote)?;
        let mut source = tokio::fs::File::open(&source_path).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(local);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut block = vec![0u8; BLOCK_SIZE];
        loop {
            let read = source.read(&mut block).await?;
            if read == 0 {
                break;
            }
            file.write_all(&block[..read]).await?;
            if let Some(on_block) = on_block {
                on_block(read as u64);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, local).await?;
        Ok(())
    }

    async fn delete_path(&self, remote: &str) -> Result<(), TransferError> {
        let target = self.resolve(remote)?;
        let meta = tokio::fs::symlink_metadata(&target).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    async fn list_path(
        &self,
        remote: &str,
        include_dot_entries: bool,
    ) -> Result<Vec<Metafile>, TransferError> {
        let target = self.resolve(remote)?;
        let meta = tokio::fs::metadata(&target).await?;
        if !meta.is_dir() {
            let name = remote.rsplit('/').next().unwrap_or(remote);
            return Ok(vec![describe(name, remote, &meta)]);
        }

        let mut listing = Vec::new();
        if include_dot_entries {
            listing.push(Metafile::dot_entry(".", remote));
            listing.push(Metafile::dot_entry("..", remote));
        }
        let mut entries = tokio::fs::read_dir(&target).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            listing.push(describe(&name, &join_remote(remote, &name), &meta));
        }
        listing.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(listing)
    }
}

#[async_trait]
impl RemoteConnection for MirrorConnection {
    fn profile_name(&self) -> &str {
        &self.profile
    }

    async fn connect(&mut self) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(&self.base)
            .await
            .map_err(|err| RemoteError::Connection(format!("{}: {err}", self.base.display())))?;
        self.connected = true;
        self.closed = false;
        debug!(profile = %self.profile, base = %self.base.display(), "mirror opened");
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<bool, RemoteError> {
        Ok(false)
    }

    async fn login(&mut self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), RemoteError> {
        let target = self.resolve(remote)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(TransferError::from)?;
        Ok(())
    }

    async fn cwd(&mut self, remote: &str) -> Result<(), RemoteError> {
        let target = self.resolve(remote)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(TransferError::from)?;
        if !meta.is_dir() {
            return Err(RemoteError::NotFound(format!("{remote} is not a directory")));
        }
        Ok(())
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.put_file(local, remote).await?;
        Ok(())
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        on_block: Option<&BlockCallback>,
    ) -> Result<(), RemoteError> {
        self.get_file(remote, local, on_block).await?;
        Ok(())
    }

    async fn delete(&mut self, remote: &str) -> Result<(), RemoteError> {
        self.delete_path(remote).await?;
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str, forced: bool) -> Result<(), RemoteError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if tokio::fs::symlink_metadata(&source).await.is_err() {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if let Ok(existing) = tokio::fs::symlink_metadata(&target).await {
            if !forced {
                return Err(RemoteError::TargetExists(to.to_string()));
            }
            let removed = if existing.is_dir() {
                tokio::fs::remove_dir_all(&target).await
            } else {
                tokio::fs::remove_file(&target).await
            };
            removed.map_err(TransferError::from)?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(TransferError::from)?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(TransferError::from)?;
        Ok(())
    }

    async fn list(
        &mut self,
        remote: &str,
        include_dot_entries: bool,
    ) -> Result<Vec<Metafile>, RemoteError> {
        Ok(self.list_path(remote, include_dot_entries).await?)
    }

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<(), RemoteError> {
        let target = self.resolve(remote)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(TransferError::from)?;
        }
        #[cfg(not(unix))]
        debug!(path = %target.display(), mode, "chmod unsupported on this platform");
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        self.connected && !self.closed && tokio::fs::metadata(&self.base).await.is_ok()
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

fn describe(name: &str, remote: &str, meta: &std::fs::Metadata) -> Metafile {
    let modified = meta.modified().ok().map(OffsetDateTime::from);
    let file = Metafile::new(name, meta.is_dir(), modified, Some(meta.len()), remote);
    #[cfg(unix)]
    let file = {
        use std::os::unix::fs::PermissionsExt;
        file.with_permissions(ftpsync_core::mode_to_permissions(meta.permissions().mode()))
    };
    file
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}
