use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ftpsync_core::{Config, ConnectionFactory, Profile, RemoteConnection, RemoteError};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::PasswordCache;

pub type ConnectionHandle = Arc<tokio::sync::Mutex<Box<dyn RemoteConnection>>>;

struct ConnectionEntry {
    profile: String,
    hash: String,
    handle: Option<ConnectionHandle>,
}

/// Connections of one settings file, keyed by profile name in declaration
/// order. A `None` handle means the profile is unavailable this round.
pub struct ConnectionSet {
    fingerprint: String,
    entries: Vec<ConnectionEntry>,
    stale: AtomicBool,
}

impl ConnectionSet {
    pub fn empty(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            entries: Vec::new(),
            stale: AtomicBool::new(false),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn handle(&self, profile: &str) -> Option<ConnectionHandle> {
        self.entries
            .iter()
            .find(|entry| entry.profile == profile)
            .and_then(|entry| entry.handle.clone())
    }

    pub fn profiles(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.profile.as_str())
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.handle.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    /// Flags the set after a command lost one of its connections.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Every profile of `config` has a live connection built from the
    /// profile's current settings.
    pub async fn is_valid_for(&self, config: &Config) -> bool {
        if self.is_stale() {
            return false;
        }
        for profile in config.profiles() {
            let Some(entry) = self.entries.iter().find(|entry| entry.profile == profile.name)
            else {
                return false;
            };
            if entry.hash != profile.content_hash() {
                return false;
            }
            let Some(handle) = &entry.handle else {
                return false;
            };
            if !handle.lock().await.is_alive().await {
                return false;
            }
        }
        true
    }

    pub async fn close(&self) {
        for entry in &self.entries {
            if let Some(handle) = &entry.handle {
                handle.lock().await.close().await;
                debug!(profile = %entry.profile, "closed");
            }
        }
    }
}

/// Opens connections for every profile of a settings file.
#[derive(Clone)]
pub struct Connector {
    factory: Arc<dyn ConnectionFactory>,
    passwords: Arc<PasswordCache>,
}

impl Connector {
    pub fn new(factory: Arc<dyn ConnectionFactory>, passwords: Arc<PasswordCache>) -> Self {
        Self { factory, passwords }
    }

    /// Builds a fresh set; a failing profile is logged and left empty.
    pub async fn connect_all(&self, fingerprint: &str, config: &Config) -> ConnectionSet {
        let mut entries = Vec::with_capacity(config.profiles().len());
        for profile in config.profiles() {
            let handle = match self.open(config, profile).await {
                Ok(connection) => Some(Arc::new(tokio::sync::Mutex::new(connection))),
                Err(err) => {
                    warn!(profile = %profile.name, error = %err, "connection failed");
                    None
                }
            };
            entries.push(ConnectionEntry {
                profile: profile.name.clone(),
                hash: profile.content_hash(),
                handle,
            });
        }
        ConnectionSet {
            fingerprint: fingerprint.to_string(),
            entries,
            stale: AtomicBool::new(false),
        }
    }

    /// Opens a private connection for a single profile.
    pub async fn connect_one(
        &self,
        config: &Config,
        profile: &Profile,
    ) -> Result<ConnectionHandle, RemoteError> {
        let connection = self.open(config, profile).await?;
        Ok(Arc::new(tokio::sync::Mutex::new(connection)))
    }

    async fn open(
        &self,
        config: &Config,
        profile: &Profile,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        let mut connection = self.factory.create(config, profile)?;
        match tokio::time::timeout(profile.timeout(), connection.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RemoteError::Connection(format!(
                    "timed out after {}s",
                    profile.timeout
                )));
            }
        }
        info!(
            profile = %profile.name,
            host = %profile.host,
            port = profile.port,
            "connected"
        );

        if let Err(err) = self.handshake(config, profile, &mut connection).await {
            connection.close().await;
            return Err(err);
        }
        Ok(connection)
    }

    async fn handshake(
        &self,
        config: &Config,
        profile: &Profile,
        connection: &mut Box<dyn RemoteConnection>,
    ) -> Result<(), RemoteError> {
        if connection.authenticate().await? {
            debug!(profile = %profile.name, "authentication processed");
        }

        if let (Some(username), Some(_)) = (&profile.username, &profile.password) {
            if let Err(err) = connection.login().await {
                self.passwords.forget(config.file_path(), &profile.name);
                return Err(err);
            }
            debug!(profile = %profile.name, username = %username, "logged in");
        } else {
            debug!(profile = %profile.name, "anonymous connection");
        }

        connection.ensure_dir(&profile.path).await?;
        connection.cwd(&profile.path).await?;
        Ok(())
    }
}

struct CacheEntry {
    set: Arc<ConnectionSet>,
    timer: Option<JoinHandle<()>>,
}

struct CacheInner {
    connector: Connector,
    idle_timeout: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_use: Mutex<HashMap<String, usize>>,
}

impl CacheInner {
    fn is_in_use(&self, fingerprint: &str) -> bool {
        self.in_use
            .lock()
            .get(fingerprint)
            .is_some_and(|count| *count > 0)
    }

    fn take_if_current(&self, fingerprint: &str, set: &Arc<ConnectionSet>) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(fingerprint)
            .is_some_and(|entry| Arc::ptr_eq(&entry.set, set));
        if current {
            entries.remove(fingerprint)
        } else {
            None
        }
    }
}

/// Shared connection sets keyed by settings-file fingerprint.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl ConnectionCache {
    pub fn new(connector: Connector, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connector,
                idle_timeout,
                entries: Mutex::new(HashMap::new()),
                build_locks: Mutex::new(HashMap::new()),
                in_use: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn get(&self, fingerprint: &str, config: &Config, shared: bool) -> Arc<ConnectionSet> {
        if !shared {
            return Arc::new(self.inner.connector.connect_all(fingerprint, config).await);
        }

        let lock = self.build_lock(fingerprint);
        let _building = lock.lock().await;

        let cached = self
            .inner
            .entries
            .lock()
            .get(fingerprint)
            .map(|entry| Arc::clone(&entry.set));
        if let Some(set) = cached {
            if set.is_valid_for(config).await {
                debug!(fingerprint, "connection cache hit");
                return set;
            }
            debug!(fingerprint, "cached connections are stale");
            self.evict(fingerprint, &set).await;
        }

        let set = Arc::new(self.inner.connector.connect_all(fingerprint, config).await);
        let timer = self.arm_idle_timer(fingerprint.to_string(), Arc::clone(&set));
        let replaced = self.inner.entries.lock().insert(
            fingerprint.to_string(),
            CacheEntry {
                set: Arc::clone(&set),
                timer: Some(timer),
            },
        );
        if let Some(timer) = replaced.and_then(|entry| entry.timer) {
            timer.abort();
        }
        set
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.entries.lock().contains_key(fingerprint)
    }

    /// Keeps the idle timer from closing `fingerprint` until the guard drops.
    pub fn mark_in_use(&self, fingerprint: &str) -> InUseGuard {
        *self
            .inner
            .in_use
            .lock()
            .entry(fingerprint.to_string())
            .or_insert(0) += 1;
        InUseGuard {
            inner: Arc::clone(&self.inner),
            fingerprint: fingerprint.to_string(),
        }
    }

    pub fn is_in_use(&self, fingerprint: &str) -> bool {
        self.inner.is_in_use(fingerprint)
    }

    pub async fn close(&self, fingerprint: &str) {
        let removed = self.inner.entries.lock().remove(fingerprint);
        if let Some(entry) = removed {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            entry.set.close().await;
            debug!(fingerprint, "closed cached connections");
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<CacheEntry> = self
            .inner
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let closing = drained.into_iter().map(|entry| async move {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            entry.set.close().await;
        });
        join_all(closing).await;
    }

    fn build_lock(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.inner
                .build_locks
                .lock()
                .entry(fingerprint.to_string())
                .or_default(),
        )
    }

    async fn evict(&self, fingerprint: &str, set: &Arc<ConnectionSet>) {
        if let Some(timer) = self
            .inner
            .take_if_current(fingerprint, set)
            .and_then(|entry| entry.timer)
        {
            timer.abort();
        }
        set.close().await;
    }

    fn arm_idle_timer(&self, fingerprint: String, set: Arc<ConnectionSet>) -> JoinHandle<()> {
        let inner: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.idle_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if inner.is_in_use(&fingerprint) {
                    continue;
                }
                // Dropping our own handle detaches it; aborting would cancel the close.
                if inner.take_if_current(&fingerprint, &set).is_some() {
                    debug!(fingerprint = %fingerprint, "closing idle connections");
                    set.close().await;
                }
                return;
            }
        })
    }
}

/// Counted "in use" marker released on drop.
pub struct InUseGuard {
    inner: Arc<CacheInner>,
    fingerprint: String,
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        let mut in_use = self.inner.in_use.lock();
        if let Some(count) = in_use.get_mut(&self.fingerprint) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_use.remove(&self.fingerprint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::{FakeFactory, FakeServer};
    use ftpsync_core::Profile;

    fn config(profiles: Vec<Profile>) -> Config {
        Config::new("/project/ftpsync.settings", profiles)
    }

    fn cache(server: &Arc<FakeServer>, idle: Duration) -> ConnectionCache {
        let connector = Connector::new(
            Arc::new(FakeFactory::new(Arc::clone(server))),
            Arc::new(PasswordCache::default()),
        );
        ConnectionCache::new(connector, idle)
    }

    #[tokio::test]
    async fn shared_get_returns_same_set_while_unchanged() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a"), Profile::named("stage", "b")]);

        let first = cache.get("fp", &config, true).await;
        let second = cache.get("fp", &config, true).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.live_count(), 2);
        assert_eq!(server.created(), 2);
    }

    #[tokio::test]
    async fn changed_profile_forces_rebuild() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        let before = config(vec![Profile::named("live", "a")]);
        let mut changed = Profile::named("live", "a");
        changed.timeout = 10;
        let after = config(vec![changed]);

        let first = cache.get("fp", &before, true).await;
        let second = cache.get("fp", &after, true).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(server.created(), 2);
        assert!(server.calls().contains(&"live:close".to_string()));
    }

    #[tokio::test]
    async fn dead_connection_forces_rebuild() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a")]);

        let first = cache.get("fp", &config, true).await;
        server.set_alive("live", false);
        let second = cache.get("fp", &config, true).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn stale_flag_forces_rebuild() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a")]);

        let first = cache.get("fp", &config, true).await;
        first.mark_stale();
        assert!(!first.is_valid_for(&config).await);
        let second = cache.get("fp", &config, true).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_stale());
    }

    #[tokio::test]
    async fn connect_one_opens_a_single_profile() {
        let server = FakeServer::new();
        let connector = Connector::new(
            Arc::new(FakeFactory::new(Arc::clone(&server))),
            Arc::new(PasswordCache::default()),
        );
        let config = config(vec![Profile::named("live", "a"), Profile::named("stage", "b")]);

        let handle = connector.connect_one(&config, &config.profiles()[1]).await.unwrap();
        assert_eq!(handle.lock().await.profile_name(), "stage");
        assert_eq!(server.created(), 1);

        server.set_unreachable("live");
        assert!(connector.connect_one(&config, &config.profiles()[0]).await.is_err());
    }

    #[tokio::test]
    async fn unshared_get_always_builds() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a")]);

        let first = cache.get("fp", &config, false).await;
        let second = cache.get("fp", &config, false).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!cache.contains("fp"));
    }

    #[tokio::test]
    async fn failing_profile_is_left_empty() {
        let server = FakeServer::new();
        server.set_unreachable("stage");
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a"), Profile::named("stage", "b")]);

        let set = cache.get("fp", &config, false).await;
        assert_eq!(set.profiles().collect::<Vec<_>>(), vec!["live", "stage"]);
        assert!(set.handle("live").is_some());
        assert!(set.handle("stage").is_none());
        assert_eq!(set.live_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_shared_gets_build_once() {
        let server = FakeServer::new();
        server.set_connect_delay(Duration::from_millis(20));
        let cache = cache(&server, Duration::from_secs(60));
        let config = config(vec![Profile::named("live", "a")]);

        let (a, b) = tokio::join!(
            cache.get("fp", &config, true),
            cache.get("fp", &config, true)
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(server.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_evicts_unless_in_use() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(5));
        let config = config(vec![Profile::named("live", "a")]);

        cache.get("fp", &config, true).await;
        let guard = cache.mark_in_use("fp");
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(cache.contains("fp"));

        drop(guard);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!cache.contains("fp"));
        assert!(server.calls().contains(&"live:close".to_string()));
    }

    #[tokio::test]
    async fn close_is_a_no_op_when_absent() {
        let server = FakeServer::new();
        let cache = cache(&server, Duration::from_secs(60));
        cache.close("missing").await;

        let config = config(vec![Profile::named("live", "a")]);
        cache.get("fp", &config, true).await;
        cache.close("fp").await;
        assert!(!cache.contains("fp"));

        cache.get("fp", &config, true).await;
        cache.close_all().await;
        assert!(!cache.contains("fp"));
    }

    #[tokio::test]
    async fn failed_login_forgets_typed_password() {
        let server = FakeServer::new();
        server.reject_login("live");
        let passwords = Arc::new(PasswordCache::default());
        let connector = Connector::new(
            Arc::new(FakeFactory::new(Arc::clone(&server))),
            Arc::clone(&passwords),
        );
        let mut profile = Profile::named("live", "a");
        profile.username = Some("deploy".into());
        profile.password = Some("typed".into());
        let config = config(vec![profile]);
        passwords.store(config.file_path(), "live", "typed");

        let set = connector.connect_all("fp", &config).await;
        assert!(set.is_empty());
        assert_eq!(passwords.get(config.file_path(), "live"), None);
    }
}
