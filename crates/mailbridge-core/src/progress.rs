//! Ephemeral per-account fetch progress for UI polling

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Waiting,
    Fetching,
    Done,
    Error,
    Paused,
}

impl ProgressStatus {
    /// Whether this entry is a finished run waiting to expire
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub account_id: i64,
    pub current: usize,
    pub total: usize,
    pub status: ProgressStatus,
    pub label: String,
}

impl Progress {
    pub fn new(account_id: i64, label: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            account_id,
            current: 0,
            total: 0,
            status,
            label: label.into(),
        }
    }

    pub fn with_counts(mut self, current: usize, total: usize) -> Self {
        self.current = current;
        self.total = total;
        self
    }
}

/// Process-local progress store, keyed by account id.
///
/// Best-effort diagnostics only; nothing reads it for correctness.
pub trait ProgressStore: Send + Sync {
    /// Overwrite the entry for `progress.account_id`
    fn update(&self, progress: Progress);

    fn get(&self, account_id: i64) -> Option<Progress>;

    /// Drop the entry only if it is still `done`/`error`, so a newer run isn't erased
    fn clear_if_finished(&self, account_id: i64);

    /// Every entry, ordered by account id
    fn snapshot(&self) -> Vec<Progress>;
}

#[derive(Debug, Default)]
pub struct MemoryProgress {
    entries: Mutex<HashMap<i64, Progress>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<i64, Progress>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut entries)
    }
}

impl ProgressStore for MemoryProgress {
    fn update(&self, progress: Progress) {
        self.with_entries(|entries| {
            entries.insert(progress.account_id, progress);
        });
    }

    fn get(&self, account_id: i64) -> Option<Progress> {
        self.with_entries(|entries| entries.get(&account_id).cloned())
    }

    fn clear_if_finished(&self, account_id: i64) {
        self.with_entries(|entries| {
            if entries
                .get(&account_id)
                .is_some_and(|p| p.status.is_finished())
            {
                entries.remove(&account_id);
            }
        });
    }

    fn snapshot(&self) -> Vec<Progress> {
        let mut all: Vec<Progress> = self.with_entries(|entries| entries.values().cloned().collect());
        all.sort_by_key(|p| p.account_id);
        all
    }
}
