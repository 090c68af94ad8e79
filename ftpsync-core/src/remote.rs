use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, Profile};
use crate::metafile::Metafile;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("connection is no longer usable: {0}")]
    Stale(String),
    #[error("remote target already exists: {0}")]
    TargetExists(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, RemoteError::Stale(_))
    }
}

/// Invoked with the size of every block written by `get`.
pub type BlockCallback = dyn Fn(u64) + Send + Sync;

/// One protocol session bound to a single profile.
///
/// Remote paths are absolute POSIX strings (`/www/index.html`).
#[async_trait]
pub trait RemoteConnection: Send {
    fn profile_name(&self) -> &str;

    async fn connect(&mut self) -> Result<(), RemoteError>;

    /// Returns `false` when the server refuses the session (TLS handshake etc).
    async fn authenticate(&mut self) -> Result<bool, RemoteError>;

    async fn login(&mut self) -> Result<(), RemoteError>;

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), RemoteError>;

    async fn cwd(&mut self, remote: &str) -> Result<(), RemoteError>;

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        on_block: Option<&BlockCallback>,
    ) -> Result<(), RemoteError>;

    async fn delete(&mut self, remote: &str) -> Result<(), RemoteError>;

    async fn rename(&mut self, from: &str, to: &str, forced: bool) -> Result<(), RemoteError>;

    /// Lists a directory, or a single entry when `remote` names a file.
    async fn list(
        &mut self,
        remote: &str,
        include_dot_entries: bool,
    ) -> Result<Vec<Metafile>, RemoteError>;

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<(), RemoteError>;

    async fn is_alive(&mut self) -> bool;

    async fn close(&mut self);
}

/// Builds unconnected sessions for a profile.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &Config,
        profile: &Profile,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError>;
}
