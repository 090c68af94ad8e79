use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ftpsync_core::{
    BlockCallback, CONFIG_FILE_NAME, Config, ConnectionFactory, Metafile, Profile,
    RemoteConnection, RemoteError,
};
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::context::SyncContext;
use crate::prompt::Prompter;
use crate::settings::Settings;
use crate::sync::scan::GlobScanner;

#[derive(Debug, Clone)]
struct FakeEntry {
    is_dir: bool,
    modified: OffsetDateTime,
    size: u64,
}

/// In-memory remote shared by every fake connection; files are keyed by
/// profile name and remote path.
#[derive(Default)]
pub struct FakeServer {
    files: Mutex<BTreeMap<(String, String), FakeEntry>>,
    calls: Mutex<Vec<String>>,
    created: AtomicUsize,
    unreachable: Mutex<HashSet<String>>,
    rejected_logins: Mutex<HashSet<String>>,
    dead: Mutex<HashSet<String>>,
    stale_once: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
    put_delay: Mutex<Option<Duration>>,
    active_puts: AtomicUsize,
    max_active_puts: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_file(&self, profile: &str, remote: &str, modified: OffsetDateTime, size: u64) {
        self.files.lock().insert(
            (profile.to_string(), remote.to_string()),
            FakeEntry {
                is_dir: false,
                modified,
                size,
            },
        );
    }

    pub fn add_dir(&self, profile: &str, remote: &str) {
        self.files.lock().insert(
            (profile.to_string(), remote.to_string()),
            FakeEntry {
                is_dir: true,
                modified: OffsetDateTime::UNIX_EPOCH,
                size: 0,
            },
        );
    }

    pub fn has(&self, profile: &str, remote: &str) -> bool {
        self.files
            .lock()
            .contains_key(&(profile.to_string(), remote.to_string()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls of one operation, e.g. `put`, as `profile:path` strings.
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let marker = format!(":{op}:");
        self.calls
            .lock()
            .iter()
            .filter_map(|call| {
                let (profile, rest) = call.split_once(&marker)?;
                Some(format!("{profile}:{rest}"))
            })
            .collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, profile: &str) {
        self.unreachable.lock().insert(profile.to_string());
    }

    pub fn reject_login(&self, profile: &str) {
        self.rejected_logins.lock().insert(profile.to_string());
    }

    pub fn set_alive(&self, profile: &str, alive: bool) {
        let mut dead = self.dead.lock();
        if alive {
            dead.remove(profile);
        } else {
            dead.insert(profile.to_string());
        }
    }

    pub fn go_stale_once(&self, profile: &str) {
        self.stale_once.lock().insert(profile.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = Some(delay);
    }

    pub fn max_concurrent_puts(&self) -> usize {
        self.max_active_puts.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn entry(&self, profile: &str, remote: &str) -> Option<FakeEntry> {
        self.files
            .lock()
            .get(&(profile.to_string(), remote.to_string()))
            .cloned()
    }

    fn children(&self, profile: &str, remote: &str) -> Vec<(String, FakeEntry)> {
        let prefix = format!("{}/", remote.trim_end_matches('/'));
        self.files
            .lock()
            .iter()
            .filter(|((owner, path), _)| {
                owner == profile
                    && path.starts_with(&prefix)
                    && !path[prefix.len()..].is_empty()
                    && !path[prefix.len()..].contains('/')
            })
            .map(|((_, path), entry)| (path.clone(), entry.clone()))
            .collect()
    }
}

fn metafile(remote: &str, entry: &FakeEntry) -> Metafile {
    let name = remote.rsplit('/').next().unwrap_or(remote);
    Metafile::new(
        name,
        entry.is_dir,
        Some(entry.modified),
        Some(entry.size),
        remote,
    )
}

pub struct FakeRemote {
    profile: String,
    server: Arc<FakeServer>,
    closed: bool,
    broken: bool,
}

impl FakeRemote {
    fn usable(&self) -> Result<(), RemoteError> {
        if self.broken {
            return Err(RemoteError::Stale("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConnection for FakeRemote {
    fn profile_name(&self) -> &str {
        &self.profile
    }

    async fn connect(&mut self) -> Result<(), RemoteError> {
        let delay = *self.server.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.server.record(format!("{}:connect", self.profile));
        if self.server.unreachable.lock().contains(&self.profile) {
            return Err(RemoteError::Connection("unreachable".into()));
        }
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<bool, RemoteError> {
        Ok(false)
    }

    async fn login(&mut self) -> Result<(), RemoteError> {
        if self.server.rejected_logins.lock().contains(&self.profile) {
            return Err(RemoteError::Connection("530 login incorrect".into()));
        }
        Ok(())
    }

    async fn ensure_dir(&mut self, remote: &str) -> Result<(), RemoteError> {
        self.usable()?;
        self.server.record(format!("{}:ensure_dir:{remote}", self.profile));
        if self.server.entry(&self.profile, remote).is_none() {
            self.server.add_dir(&self.profile, remote);
        }
        Ok(())
    }

    async fn cwd(&mut self, _remote: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.usable()?;
        if self.server.stale_once.lock().remove(&self.profile) {
            self.broken = true;
            self.usable()?;
        }

        let active = self.server.active_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.server
            .max_active_puts
            .fetch_max(active, Ordering::SeqCst);
        let delay = *self.server.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.server.active_puts.fetch_sub(1, Ordering::SeqCst);

        let size = std::fs::metadata(local)?.len();
        self.server.record(format!("{}:put:{remote}", self.profile));
        self.server
            .add_file(&self.profile, remote, OffsetDateTime::now_utc(), size);
        Ok(())
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        on_block: Option<&BlockCallback>,
    ) -> Result<(), RemoteError> {
        self.usable()?;
        let Some(entry) = self.server.entry(&self.profile, remote) else {
            return Err(RemoteError::NotFound(remote.to_string()));
        };
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = format!("{}:{remote}", self.profile);
        std::fs::write(local, &body)?;
        if let Some(on_block) = on_block {
            on_block(entry.size.max(body.len() as u64));
        }
        self.server.record(format!("{}:get:{remote}", self.profile));
        Ok(())
    }

    async fn delete(&mut self, remote: &str) -> Result<(), RemoteError> {
        self.usable()?;
        self.server.record(format!("{}:delete:{remote}", self.profile));
        let mut files = self.server.files.lock();
        let key = (self.profile.clone(), remote.to_string());
        if files.remove(&key).is_none() {
            return Err(RemoteError::NotFound(remote.to_string()));
        }
        let prefix = format!("{remote}/");
        files.retain(|(owner, path), _| !(owner == &self.profile && path.starts_with(&prefix)));
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str, forced: bool) -> Result<(), RemoteError> {
        self.usable()?;
        self.server
            .record(format!("{}:rename:{from}->{to}", self.profile));
        let mut files = self.server.files.lock();
        let target = (self.profile.clone(), to.to_string());
        if files.contains_key(&target) && !forced {
            return Err(RemoteError::TargetExists(to.to_string()));
        }
        let Some(entry) = files.remove(&(self.profile.clone(), from.to_string())) else {
            return Err(RemoteError::NotFound(from.to_string()));
        };
        files.insert(target, entry);
        Ok(())
    }

    async fn list(
        &mut self,
        remote: &str,
        include_dot_entries: bool,
    ) -> Result<Vec<Metafile>, RemoteError> {
        self.usable()?;
        self.server.record(format!("{}:list:{remote}", self.profile));
        let Some(entry) = self.server.entry(&self.profile, remote) else {
            return Err(RemoteError::NotFound(remote.to_string()));
        };
        if !entry.is_dir {
            return Ok(vec![metafile(remote, &entry)]);
        }

        let mut listing = Vec::new();
        if include_dot_entries {
            listing.push(Metafile::dot_entry(".", remote));
            listing.push(Metafile::dot_entry("..", remote));
        }
        listing.extend(
            self.server
                .children(&self.profile, remote)
                .iter()
                .map(|(path, entry)| metafile(path, entry)),
        );
        Ok(listing)
    }

    async fn chmod(&mut self, remote: &str, mode: u32) -> Result<(), RemoteError> {
        self.usable()?;
        self.server
            .record(format!("{}:chmod:{remote}:{mode:o}", self.profile));
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed && !self.broken && !self.server.dead.lock().contains(&self.profile)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.record(format!("{}:close", self.profile));
        }
    }
}

pub struct FakeFactory {
    server: Arc<FakeServer>,
}

impl FakeFactory {
    pub fn new(server: Arc<FakeServer>) -> Self {
        Self { server }
    }
}

impl ConnectionFactory for FakeFactory {
    fn create(
        &self,
        _config: &Config,
        profile: &Profile,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        self.server.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeRemote {
            profile: profile.name.clone(),
            server: Arc::clone(&self.server),
            closed: false,
            broken: false,
        }))
    }
}

/// Prompter answering from pre-recorded scripts and remembering what it showed.
#[derive(Default)]
pub struct ScriptedPrompter {
    choices: Mutex<VecDeque<Option<usize>>>,
    texts: Mutex<VecDeque<Option<String>>>,
    shown: Mutex<Vec<Vec<Vec<String>>>>,
    asked: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer_choice(&self, choice: Option<usize>) {
        self.choices.lock().push_back(choice);
    }

    pub fn answer_text(&self, text: Option<&str>) {
        self.texts.lock().push_back(text.map(str::to_string));
    }

    pub fn shown(&self) -> Vec<Vec<Vec<String>>> {
        self.shown.lock().clone()
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn choose(&self, rows: &[Vec<String>]) -> Option<usize> {
        self.shown.lock().push(rows.to_vec());
        self.choices.lock().pop_front().flatten()
    }

    async fn ask_text(&self, caption: &str, _default: &str) -> Option<String> {
        self.asked.lock().push(caption.to_string());
        self.texts.lock().pop_front().flatten()
    }

    fn status(&self, message: &str) {
        self.statuses.lock().push(message.to_string());
    }
}

/// Temporary project with a settings file and a fake remote behind it.
pub struct Project {
    pub dir: tempfile::TempDir,
    pub server: Arc<FakeServer>,
    pub prompter: Arc<ScriptedPrompter>,
    pub ctx: Arc<SyncContext>,
}

impl Project {
    pub fn new(settings_json: &str) -> Self {
        Self::with_settings(settings_json, Settings::default())
    }

    pub fn with_settings(settings_json: &str, settings: Settings) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), settings_json).expect("settings");
        let server = FakeServer::new();
        let prompter = ScriptedPrompter::new();
        let ctx = SyncContext::with_scanner(
            settings,
            Arc::new(FakeFactory::new(Arc::clone(&server))),
            prompter.clone(),
            Arc::new(GlobScanner),
        );
        Self {
            dir,
            server,
            prompter,
            ctx,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_file(&self) -> PathBuf {
        self.root().join(CONFIG_FILE_NAME)
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }

    pub fn touch_future(&self, relative: &str, secs: u64) {
        let file = std::fs::File::options()
            .write(true)
            .open(self.root().join(relative))
            .expect("open file");
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(secs))
            .expect("set mtime");
    }
}

pub fn at(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(seconds)
}
