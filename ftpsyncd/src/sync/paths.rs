use std::path::{Component, Path, PathBuf};

use ftpsync_core::CONFIG_FILE_NAME;
use thiserror::Error;

const MAX_NESTING: usize = 30;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("path {0:?} is outside of the project root")]
    OutsideRoot(PathBuf),
}

/// Maps a local path below `root` onto the profile's remote directory.
pub fn remote_path_for(root: &Path, remote_root: &str, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;

    let mut out = remote_root.trim_end_matches('/').to_string();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Inverse of [`remote_path_for`]; remote paths outside `remote_root` are
/// treated as relative to it.
pub fn local_path_for(root: &Path, remote_root: &str, remote: &str) -> Result<PathBuf, PathError> {
    if remote.is_empty() {
        return Err(PathError::Empty);
    }

    let prefix = remote_root.trim_end_matches('/');
    let relative = match remote.strip_prefix(prefix) {
        Some(rest) if prefix.is_empty() || rest.is_empty() || rest.starts_with('/') => rest,
        _ => remote,
    };

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Path relative to the project root, used in user-facing messages.
pub fn display_name(root: &Path, local: &Path) -> String {
    local
        .strip_prefix(root)
        .unwrap_or(local)
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Walks up from `start` looking for the project settings file.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = if start.is_dir() {
        Some(start)
    } else {
        start.parent()
    };
    for _ in 0..MAX_NESTING {
        let current = dir?;
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}
