use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::format_description;

pub const DEFAULT_TIME_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]";

/// Descriptor of a local or remote file.
///
/// A `Metafile` is built either from a remote listing or by stat-ing a local
/// path and is never mutated afterwards. Unknown timestamps and sizes are kept
/// as `None`; every comparison involving an unknown side answers `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metafile {
    name: String,
    is_dir: bool,
    last_modified: Option<OffsetDateTime>,
    size: Option<u64>,
    path: PathBuf,
    permissions: Option<String>,
}

impl Metafile {
    pub fn new(
        name: impl Into<String>,
        is_dir: bool,
        last_modified: Option<OffsetDateTime>,
        size: Option<u64>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            is_dir,
            last_modified,
            size,
            path: path.into(),
            permissions: None,
        }
    }

    /// Synthetic `.`/`..` listing entry without timestamp or size.
    pub fn dot_entry(name: &str, path: impl Into<PathBuf>) -> Self {
        Self::new(name, true, None, None, path)
    }

    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions = Some(permissions.into());
        self
    }

    pub fn from_local(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = meta.modified().ok().map(OffsetDateTime::from);
        let file = Self::new(name, meta.is_dir(), modified, Some(meta.len()), path);

        #[cfg(unix)]
        let file = {
            use std::os::unix::fs::PermissionsExt;
            file.with_permissions(mode_to_permissions(meta.permissions().mode()))
        };

        Ok(file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn last_modified(&self) -> Option<OffsetDateTime> {
        self.last_modified
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn permissions(&self) -> Option<&str> {
        self.permissions.as_deref()
    }

    pub fn permissions_octal(&self) -> Option<u32> {
        self.permissions.as_deref().and_then(permissions_to_octal)
    }

    pub fn is_newer_than(&self, other: &Metafile) -> bool {
        match (self.last_modified, other.last_modified) {
            (Some(mine), Some(theirs)) => mine > theirs,
            _ => false,
        }
    }

    pub fn is_different_size_than(&self, other: &Metafile) -> bool {
        match (self.size, other.size) {
            (Some(mine), Some(theirs)) => mine != theirs,
            _ => false,
        }
    }

    /// Compares against a file on disk; a missing file is never older.
    pub fn is_newer_than_local(&self, path: &Path) -> bool {
        Metafile::from_local(path)
            .map(|local| self.is_newer_than(&local))
            .unwrap_or(false)
    }

    pub fn is_different_size_than_local(&self, path: &Path) -> bool {
        Metafile::from_local(path)
            .map(|local| self.is_different_size_than(&local))
            .unwrap_or(false)
    }

    pub fn is_same_filepath(&self, path: &Path) -> bool {
        self.path == path
    }

    pub fn last_modified_formatted(&self, format: &str) -> Option<String> {
        let modified = self.last_modified?;
        let description = format_description::parse(format).ok()?;
        modified.format(&description).ok()
    }
}

/// Converts `rwxr-xr-x` (optionally prefixed by a type char) to an octal mode.
pub fn permissions_to_octal(text: &str) -> Option<u32> {
    let chars: Vec<char> = text.chars().collect();
    let bits = match chars.len() {
        9 => &chars[..],
        10 => &chars[1..],
        _ => return None,
    };

    let mut mode = 0u32;
    for (index, triple) in bits.chunks(3).enumerate() {
        let mut value = 0u32;
        match triple[0] {
            'r' => value |= 4,
            '-' => {}
            _ => return None,
        }
        match triple[1] {
            'w' => value |= 2,
            '-' => {}
            _ => return None,
        }
        match triple[2] {
            'x' | 's' | 't' => value |= 1,
            '-' | 'S' | 'T' => {}
            _ => return None,
        }
        mode |= value << (3 * (2 - index as u32));
    }
    Some(mode)
}

/// Accepts either an octal string (`755`, `0644`) or the textual form.
pub fn parse_permissions(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let octal = !trimmed.is_empty()
        && trimmed.len() <= 4
        && trimmed.chars().all(|c| ('0'..='7').contains(&c));
    if octal {
        return u32::from_str_radix(trimmed, 8).ok();
    }
    permissions_to_octal(trimmed)
}

pub fn mode_to_permissions(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn at(seconds: i64) -> Option<OffsetDateTime> {
        Some(OffsetDateTime::UNIX_EPOCH + Duration::seconds(seconds))
    }

    fn file(modified: Option<OffsetDateTime>, size: Option<u64>) -> Metafile {
        Metafile::new("a.txt", false, modified, size, "/www/a.txt")
    }

    #[test]
    fn newer_compares_known_timestamps() {
        let old = file(at(100), Some(1));
        let new = file(at(200), Some(1));
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!old.is_newer_than(&old));
    }

    #[test]
    fn unknown_timestamp_is_never_newer() {
        let known = file(at(100), Some(1));
        let dot = Metafile::dot_entry("..", "/www");
        assert!(!dot.is_newer_than(&known));
        assert!(!known.is_newer_than(&dot));
    }

    #[test]
    fn size_difference_requires_both_sizes() {
        let small = file(at(1), Some(1));
        let large = file(at(1), Some(2));
        let unknown = file(at(1), None);
        assert!(small.is_different_size_than(&large));
        assert!(!small.is_different_size_than(&small));
        assert!(!unknown.is_different_size_than(&large));
    }

    #[test]
    fn missing_local_file_is_not_older() {
        let remote = file(at(i64::from(u32::MAX)), Some(3));
        assert!(!remote.is_newer_than_local(Path::new("/definitely/not/here.txt")));
        assert!(!remote.is_different_size_than_local(Path::new("/definitely/not/here.txt")));
    }

    #[test]
    fn from_local_reads_size_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        std::fs::write(&path, b"hello").unwrap();

        let meta = Metafile::from_local(&path).unwrap();
        assert_eq!(meta.name(), "index.html");
        assert_eq!(meta.size(), Some(5));
        assert!(!meta.is_dir());
        assert!(meta.last_modified().is_some());
        assert!(meta.is_same_filepath(&path));
    }

    #[test]
    fn permissions_convert_to_octal() {
        assert_eq!(permissions_to_octal("rwxr-xr-x"), Some(0o755));
        assert_eq!(permissions_to_octal("-rw-r--r--"), Some(0o644));
        assert_eq!(permissions_to_octal("drwsr-sr-t"), Some(0o755));
        assert_eq!(permissions_to_octal("rwSr--r--"), Some(0o644));
        assert_eq!(permissions_to_octal("rwx"), None);
        assert_eq!(permissions_to_octal("rwzr-xr-x"), None);
        assert_eq!(mode_to_permissions(0o100644), "rw-r--r--");
        assert_eq!(parse_permissions("755"), Some(0o755));
        assert_eq!(parse_permissions("0644"), Some(0o644));
        assert_eq!(parse_permissions("rwxr-x---"), Some(0o750));
        assert_eq!(parse_permissions("789"), None);
    }

    #[test]
    fn formats_last_modified() {
        let meta = file(at(86_400 + 3_660), Some(1));
        assert_eq!(
            meta.last_modified_formatted(DEFAULT_TIME_FORMAT).as_deref(),
            Some("1970-01-02 01:01")
        );
        assert_eq!(file(None, None).last_modified_formatted(DEFAULT_TIME_FORMAT), None);
    }
}
