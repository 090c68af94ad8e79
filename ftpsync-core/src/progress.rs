use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Completion counter for a batch of entries.
///
/// The total is either fixed up front or derived from the deduplicated set of
/// added entries, whichever is larger; `current` never exceeds it.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    fixed_total: usize,
    entries: HashSet<String>,
    current: usize,
}

pub type SharedProgress = Arc<Mutex<Progress>>;

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total(total: usize) -> Self {
        Self {
            fixed_total: total,
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedProgress {
        Arc::new(Mutex::new(self))
    }

    pub fn add<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            self.entries.insert(entry.into());
        }
    }

    pub fn progress(&mut self, by: usize) {
        self.current = self.current.saturating_add(by).min(self.total());
    }

    pub fn total(&self) -> usize {
        self.fixed_total.max(self.entries.len())
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.total()
    }

    pub fn percent(&self) -> u32 {
        let mut total = self.total();
        if total == 0 {
            total = self.current.max(1);
        }
        let scaled = (self.current as u128) * 100;
        scaled.div_ceil(total as u128) as u32
    }

    /// Percent rounded up into `division`-sized buckets, used to draw bars.
    pub fn bar_units(&self, division: u32) -> u32 {
        self.percent().div_ceil(division.max(1))
    }
}
