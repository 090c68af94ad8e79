use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;

use crate::sync::backoff::{Backoff, RetryPolicy};

const DEFAULT_WORKER_LIMIT: u64 = 2;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_OPEN_CHECK_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_ATTEMPTS: u64 = 2;
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Process-wide settings shared by every project.
#[derive(Clone, Debug)]
pub struct Settings {
    pub worker_limit: usize,
    pub connection_timeout: Duration,
    pub ignore: Option<Regex>,
    pub open_check_delay: Duration,
    pub mirror_root: PathBuf,
    /// Attempts per command, the first one included.
    pub retry_attempts: u32,
    /// Base delay between attempts; doubled per attempt with jitter.
    pub retry_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_limit: DEFAULT_WORKER_LIMIT as usize,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            ignore: None,
            open_check_delay: Duration::from_millis(DEFAULT_OPEN_CHECK_DELAY_MS),
            mirror_root: PathBuf::from("."),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS as u32,
            retry_backoff: Duration::ZERO,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let ignore = match std::env::var("FTPSYNC_IGNORE") {
            Ok(pattern) if !pattern.trim().is_empty() => Some(
                Regex::new(&pattern)
                    .with_context(|| format!("FTPSYNC_IGNORE is not a valid regex: {pattern}"))?,
            ),
            _ => None,
        };
        let mirror_root = match std::env::var("FTPSYNC_MIRROR_ROOT") {
            Ok(root) if !root.trim().is_empty() => PathBuf::from(root),
            _ => std::env::current_dir().context("current directory is unavailable")?,
        };

        Ok(Self {
            worker_limit: read_u64_env("FTPSYNC_WORKER_LIMIT", DEFAULT_WORKER_LIMIT).max(1)
                as usize,
            connection_timeout: Duration::from_secs(read_u64_env(
                "FTPSYNC_CONNECTION_TIMEOUT_SECS",
                DEFAULT_CONNECTION_TIMEOUT_SECS,
            )),
            ignore,
            open_check_delay: Duration::from_millis(read_u64_env(
                "FTPSYNC_OPEN_CHECK_DELAY_MS",
                DEFAULT_OPEN_CHECK_DELAY_MS,
            )),
            mirror_root,
            retry_attempts: read_u64_env("FTPSYNC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)
                .clamp(1, u64::from(u32::MAX)) as u32,
            retry_backoff: Duration::from_millis(read_u64_env("FTPSYNC_RETRY_BACKOFF_MS", 0)),
        })
    }

    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit.max(1);
        self
    }

    pub fn with_ignore(mut self, ignore: Option<Regex>) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.retry_backoff.is_zero() {
            Backoff::none()
        } else {
            Backoff::new(
                self.retry_backoff,
                self.retry_backoff.saturating_mul(MAX_BACKOFF_FACTOR),
                true,
            )
        };
        RetryPolicy::new(self.retry_attempts, backoff)
    }

    pub fn is_globally_ignored(&self, path: &str) -> bool {
        self.ignore
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(path))
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.worker_limit, 2);
        assert_eq!(settings.connection_timeout, Duration::from_secs(60));
        assert_eq!(settings.open_check_delay, Duration::from_millis(500));
        assert!(!settings.is_globally_ignored("/p/a.txt"));
    }

    #[test]
    fn worker_limit_is_at_least_one() {
        let settings = Settings::default().with_worker_limit(0);
        assert_eq!(settings.worker_limit, 1);
    }

    #[test]
    fn global_ignore_matches_paths() {
        let settings = Settings::default().with_ignore(Some(Regex::new(r"\.git/").unwrap()));
        assert!(settings.is_globally_ignored("/p/.git/config"));
        assert!(!settings.is_globally_ignored("/p/src/main.rs"));
    }

    #[test]
    fn default_retry_policy_retries_once_immediately() {
        let policy = Settings::default().retry_policy();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.delay_before(2), Some(Duration::ZERO));
        assert_eq!(policy.delay_before(3), None);
    }

    #[test]
    fn retry_backoff_is_jittered_and_capped() {
        let policy = Settings::default()
            .with_retry(4, Duration::from_millis(100))
            .retry_policy();
        assert_eq!(policy.max_attempts(), 4);
        for attempt in 2..=4 {
            let delay = policy.delay_before(attempt).unwrap();
            assert!(delay <= Duration::from_millis(800));
        }
        assert_eq!(policy.delay_before(5), None);
    }

    #[test]
    fn read_u64_env_falls_back_on_garbage() {
        assert_eq!(read_u64_env("FTPSYNC_TEST_UNSET_VARIABLE", 7), 7);
    }
}
