use std::path::{Path, PathBuf};

use ftpsync_core::CONFIG_FILE_NAME;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Suffix of files a transfer is still writing.
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// A file was written and should go through the save hooks.
    Saved { path: PathBuf },
    /// A settings file appeared, changed or vanished in `dir`.
    SettingsChanged { dir: PathBuf },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(event: Event) -> Vec<LocalEvent> {
    let paths: Vec<PathBuf> = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // Editors save through a temp file renamed over the target.
            event.paths.into_iter().skip(1).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(_) => event.paths,
        EventKind::Remove(_) => {
            return event
                .paths
                .iter()
                .filter(|path| is_settings_file(path))
                .filter_map(|path| path.parent())
                .map(|dir| LocalEvent::SettingsChanged {
                    dir: dir.to_path_buf(),
                })
                .collect();
        }
        _ => Vec::new(),
    };

    paths
        .into_iter()
        .filter(|path| !is_partial(path))
        .filter_map(|path| {
            if is_settings_file(&path) {
                let dir = path.parent()?.to_path_buf();
                Some(LocalEvent::SettingsChanged { dir })
            } else if path.is_dir() {
                None
            } else {
                Some(LocalEvent::Saved { path })
            }
        })
        .collect()
}

fn is_settings_file(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == CONFIG_FILE_NAME)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_modify_event_to_save() {
        let mapped = map_event(event(
            EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            &["/tmp/root/Docs/A.txt"],
        ));
        assert_eq!(
            mapped,
            vec![LocalEvent::Saved {
                path: "/tmp/root/Docs/A.txt".into()
            }]
        );
    }

    #[test]
    fn rename_over_target_is_a_save_of_the_target() {
        let mapped = map_event(event(
            EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            &["/tmp/root/.A.txt.swp", "/tmp/root/A.txt"],
        ));
        assert_eq!(
            mapped,
            vec![LocalEvent::Saved {
                path: "/tmp/root/A.txt".into()
            }]
        );
    }

    #[test]
    fn partial_downloads_are_ignored() {
        let mapped = map_event(event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/tmp/root/A.txt.partial"],
        ));
        assert!(mapped.is_empty());
    }

    #[test]
    fn settings_changes_invalidate_their_directory() {
        let created = map_event(event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/tmp/root/sub/ftpsync.settings"],
        ));
        let removed = map_event(event(
            EventKind::Remove(notify::event::RemoveKind::File),
            &["/tmp/root/sub/ftpsync.settings", "/tmp/root/sub/A.txt"],
        ));
        let expected = vec![LocalEvent::SettingsChanged {
            dir: "/tmp/root/sub".into(),
        }];
        assert_eq!(created, expected);
        assert_eq!(removed, expected);
    }
}
