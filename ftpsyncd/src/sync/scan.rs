use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ftpsync_core::Metafile;
use glob::Pattern;
use tracing::debug;
use walkdir::WalkDir;

/// Files found by one or more scans, keyed by local path.
pub type Snapshot = BTreeMap<PathBuf, Metafile>;

pub trait Scanner: Send + Sync {
    /// Every file below `root` whose name matches `pattern`. A missing root
    /// or an invalid pattern yields an empty snapshot.
    fn scan(&self, pattern: &str, root: &Path) -> Snapshot;
}

/// Recursive scanner matching file names with fnmatch-style globs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobScanner;

impl Scanner for GlobScanner {
    fn scan(&self, pattern: &str, root: &Path) -> Snapshot {
        let mut snapshot = Snapshot::new();
        let Ok(pattern) = Pattern::new(pattern) else {
            debug!(pattern, "ignoring invalid watch pattern");
            return snapshot;
        };
        if !root.is_dir() {
            return snapshot;
        }

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| pattern.matches(name));
            if !matches {
                continue;
            }
            if let Ok(meta) = Metafile::from_local(entry.path()) {
                snapshot.insert(entry.path().to_path_buf(), meta);
            }
        }
        snapshot
    }
}
