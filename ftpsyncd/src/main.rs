use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ftpsyncd::context::SyncContext;
use ftpsyncd::prompt::TerminalPrompter;
use ftpsyncd::settings::Settings;
use ftpsyncd::sync::command::Outcome;
use ftpsyncd::sync::engine::{CheckOutcome, SaveDecision, Synchronizer};
use ftpsyncd::sync::local_watcher::{LocalEvent, start_notify_watcher};
use ftpsyncd::sync::navigator::BrowseOutcome;
use ftpsyncd::transport::LocalMirrorFactory;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Upload(Vec<PathBuf>),
    Download { paths: Vec<PathBuf>, forced: bool },
    Delete(Vec<PathBuf>),
    Check { paths: Vec<PathBuf>, forced: bool },
    Rename { path: PathBuf, new_name: String },
    Watch(PathBuf),
    Browse(PathBuf),
    Init(Vec<PathBuf>),
    Help,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(verb) = args.next() else {
        return Ok(CliCommand::Help);
    };

    let mut forced = false;
    let mut rest = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--force" | "-f" => forced = true,
            "--help" | "-h" => return Ok(CliCommand::Help),
            flag if flag.starts_with('-') => anyhow::bail!("unknown argument: {flag}"),
            _ => rest.push(arg),
        }
    }
    if forced && !matches!(verb.as_str(), "download" | "check") {
        anyhow::bail!("--force only applies to download and check");
    }

    let paths = || -> anyhow::Result<Vec<PathBuf>> {
        if rest.is_empty() {
            anyhow::bail!("{verb} needs at least one path");
        }
        Ok(rest.iter().map(PathBuf::from).collect())
    };
    let command = match verb.as_str() {
        "upload" => CliCommand::Upload(paths()?),
        "download" => CliCommand::Download {
            paths: paths()?,
            forced,
        },
        "delete" => CliCommand::Delete(paths()?),
        "check" => CliCommand::Check {
            paths: paths()?,
            forced,
        },
        "rename" => match rest.as_slice() {
            [path, new_name] => CliCommand::Rename {
                path: PathBuf::from(path),
                new_name: new_name.clone(),
            },
            _ => anyhow::bail!("rename needs <path> <new-name>"),
        },
        "watch" => match rest.as_slice() {
            [dir] => CliCommand::Watch(PathBuf::from(dir)),
            [] => CliCommand::Watch(PathBuf::from(".")),
            _ => anyhow::bail!("watch takes a single directory"),
        },
        "browse" => match rest.as_slice() {
            [path] => CliCommand::Browse(PathBuf::from(path)),
            [] => CliCommand::Browse(PathBuf::from(".")),
            _ => anyhow::bail!("browse takes a single path"),
        },
        "init" if rest.is_empty() => CliCommand::Init(vec![PathBuf::from(".")]),
        "init" => CliCommand::Init(paths()?),
        "--help" | "-h" | "help" => CliCommand::Help,
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(command)
}

fn print_usage() {
    println!("Usage: ftpsyncd <command> [paths..]");
    println!("  upload <paths..>            Upload files and folders to every profile");
    println!("  download [--force] <paths..> Download remote versions");
    println!("  delete <paths..>            Delete locally and remotely");
    println!("  check [--force] <paths..>   Compare local files with remote versions");
    println!("  rename <path> <new-name>    Rename locally and remotely");
    println!("  watch [dir]                 Upload files as they are saved");
    println!("  browse [path]               Browse the remote copy of a folder");
    println!("  init [dirs..]               Write default settings into folders");
}

fn absolute_all(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|path| {
            std::path::absolute(path)
                .with_context(|| format!("cannot resolve path {}", path.display()))
        })
        .collect()
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Done(report) if report.scheduled > 0 => {
            format!("scheduled for {} profile(s)", report.scheduled)
        }
        Outcome::Done(report) if report.failed.is_empty() => {
            format!("done on {}", report.succeeded.join(","))
        }
        Outcome::Done(report) => format!(
            "done on [{}], failed on [{}]",
            report.succeeded.join(","),
            report.failed.join(",")
        ),
        Outcome::Cancelled { reason } => format!("cancelled: {reason}"),
        Outcome::Declined { collisions } => {
            format!("declined, target exists on {}", collisions.join(","))
        }
        Outcome::Metadata(entries) => format!("{} remote version(s)", entries.len()),
    }
}

fn describe_browse(outcome: &BrowseOutcome) -> String {
    match outcome {
        BrowseOutcome::Downloaded(outcome) | BrowseOutcome::Renamed(outcome) => describe(outcome),
        BrowseOutcome::Uploaded(outcomes) | BrowseOutcome::Removed(outcomes) => outcomes
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join("; "),
        BrowseOutcome::RemovedRemotely(remote) => format!("deleted {remote}"),
        BrowseOutcome::RenamedRemotely { from, to } => format!("renamed {from} to {to}"),
        BrowseOutcome::PermissionsChanged { remote, mode } => format!("{remote} set to {mode}"),
        BrowseOutcome::Details(rows) => rows.join("\n"),
        BrowseOutcome::Failed(reason) => format!("failed: {reason}"),
        other => format!("{other:?}"),
    }
}

async fn save(sync: Arc<Synchronizer>, path: PathBuf) {
    if sync.pre_save(&path).await == SaveDecision::Prevent {
        debug!(path = %path.display(), "save upload prevented");
    }
    if let Some(outcome) = sync.post_save(&path).await {
        info!(path = %path.display(), result = %describe(&outcome), "save handled");
    }
}

async fn watch(sync: Arc<Synchronizer>, dir: &Path) -> anyhow::Result<()> {
    let (_watcher, mut events) = start_notify_watcher(dir)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    info!(dir = %dir.display(), "watching for saves");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let saves = TaskTracker::new();
    let mut pending: HashSet<PathBuf> = HashSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    LocalEvent::SettingsChanged { dir } => {
                        debug!(dir = %dir.display(), "settings changed");
                        sync.context().invalidate_config_cache(&dir);
                    }
                    LocalEvent::Saved { path } => {
                        pending.insert(path);
                    }
                }
            }
            _ = tokio::time::sleep(SAVE_DEBOUNCE), if !pending.is_empty() => {
                for path in pending.drain() {
                    saves.spawn(save(Arc::clone(&sync), path));
                }
            }
        }
    }

    info!("shutting down");
    saves.close();
    saves.wait().await;
    sync.context().cache().close_all().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ftpsyncd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = parse_cli(std::env::args())?;
    if command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let settings = Settings::from_env()?;
    let factory = LocalMirrorFactory::new(settings.mirror_root.clone());
    let ctx = SyncContext::new(settings, Arc::new(factory), Arc::new(TerminalPrompter::new()));
    let sync = Arc::new(Synchronizer::new(ctx));

    match command {
        CliCommand::Upload(paths) => {
            for outcome in sync.upload(&absolute_all(&paths)?).await {
                println!("upload: {}", describe(&outcome));
            }
        }
        CliCommand::Download { paths, forced } => {
            for outcome in sync.download(&absolute_all(&paths)?, forced).await {
                println!("download: {}", describe(&outcome));
            }
        }
        CliCommand::Delete(paths) => {
            for outcome in sync.delete(&absolute_all(&paths)?).await {
                println!("delete: {}", describe(&outcome));
            }
        }
        CliCommand::Check { paths, forced } => {
            for path in absolute_all(&paths)? {
                let result = match sync.check(&path, forced).await {
                    CheckOutcome::Downloaded(outcome) => format!("downloaded, {}", describe(&outcome)),
                    CheckOutcome::Uploaded(outcome) => format!("uploaded, {}", describe(&outcome)),
                    other => format!("{other:?}"),
                };
                println!("check {}: {result}", path.display());
            }
        }
        CliCommand::Rename { path, new_name } => {
            let path = std::path::absolute(&path)
                .with_context(|| format!("cannot resolve path {}", path.display()))?;
            println!("rename: {}", describe(&sync.rename(&path, &new_name).await));
        }
        CliCommand::Watch(dir) => {
            let dir = std::fs::canonicalize(&dir)
                .with_context(|| format!("cannot watch {}", dir.display()))?;
            watch(Arc::clone(&sync), &dir).await?;
        }
        CliCommand::Browse(path) => {
            let path = std::path::absolute(&path)
                .with_context(|| format!("cannot resolve path {}", path.display()))?;
            let mut outcome = sync.browse(&path).await;
            loop {
                println!("browse: {}", describe_browse(&outcome));
                if matches!(
                    outcome,
                    BrowseOutcome::Dismissed
                        | BrowseOutcome::NoConfig
                        | BrowseOutcome::NothingToResume
                        | BrowseOutcome::Failed(_)
                ) {
                    break;
                }
                // Back to the folder the action was taken in.
                outcome = sync.browse_last().await;
            }
        }
        CliCommand::Init(dirs) => {
            for config_file in sync
                .new_settings(&absolute_all(&dirs)?)
                .context("failed to write settings")?
            {
                println!("settings: {}", config_file.display());
            }
        }
        CliCommand::Help => {}
    }
    sync.context().cache().close_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftpsyncd::sync::command::Report;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ftpsyncd")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn no_arguments_shows_help() {
        assert_eq!(parse_cli(args(&[])).unwrap(), CliCommand::Help);
        assert_eq!(parse_cli(args(&["--help"])).unwrap(), CliCommand::Help);
    }

    #[test]
    fn parses_paths_and_force() {
        assert_eq!(
            parse_cli(args(&["download", "--force", "a.txt", "b"])).unwrap(),
            CliCommand::Download {
                paths: vec!["a.txt".into(), "b".into()],
                forced: true
            }
        );
        assert_eq!(
            parse_cli(args(&["upload", "a.txt"])).unwrap(),
            CliCommand::Upload(vec!["a.txt".into()])
        );
    }

    #[test]
    fn rename_needs_exactly_two_arguments() {
        assert_eq!(
            parse_cli(args(&["rename", "a.txt", "b.txt"])).unwrap(),
            CliCommand::Rename {
                path: "a.txt".into(),
                new_name: "b.txt".into()
            }
        );
        assert!(parse_cli(args(&["rename", "a.txt"])).is_err());
    }

    #[test]
    fn rejects_misplaced_flags_and_unknown_commands() {
        assert!(parse_cli(args(&["upload", "--force", "a.txt"])).is_err());
        assert!(parse_cli(args(&["upload"])).is_err());
        assert!(parse_cli(args(&["sync", "a.txt"])).is_err());
        assert!(parse_cli(args(&["upload", "--verbose", "a.txt"])).is_err());
    }

    #[test]
    fn watch_defaults_to_current_directory() {
        assert_eq!(parse_cli(args(&["watch"])).unwrap(), CliCommand::Watch(".".into()));
    }

    #[test]
    fn browse_and_init_default_to_current_directory() {
        assert_eq!(parse_cli(args(&["browse"])).unwrap(), CliCommand::Browse(".".into()));
        assert_eq!(
            parse_cli(args(&["browse", "site/css"])).unwrap(),
            CliCommand::Browse("site/css".into())
        );
        assert!(parse_cli(args(&["browse", "a", "b"])).is_err());
        assert_eq!(parse_cli(args(&["init"])).unwrap(), CliCommand::Init(vec![".".into()]));
        assert_eq!(
            parse_cli(args(&["init", "a", "b"])).unwrap(),
            CliCommand::Init(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn describes_partial_failures() {
        let outcome = Outcome::Done(Report {
            succeeded: vec!["live".into()],
            failed: vec!["stage".into()],
            ..Report::default()
        });
        assert_eq!(describe(&outcome), "done on [live], failed on [stage]");
    }
}
