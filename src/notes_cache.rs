//! Per-(module, action) cache of [`ActionNotes`].
//!
//! Entries expire after a period without access. A handler without notes is
//! cached as `Some(None)` so that "computed, nothing declared" is never
//! confused with "not computed yet". Entries are keyed by the requested module
//! path, so expired entries are also purged every [`PURGE_INTERVAL`] inserts.

use crate::handler::ActionNotes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Inserts between two purges of expired entries
pub const PURGE_INTERVAL: usize = 64;

struct CachedNotes {
    notes: Option<ActionNotes>,
    last_access: Instant,
}

pub struct NotesCache {
    entries: DashMap<(String, String), CachedNotes>,
    ttl: Duration,
    inserts: AtomicUsize,
}

impl NotesCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            inserts: AtomicUsize::new(0),
        }
    }

    /// Cached notes; the outer `None` means not computed (or expired)
    pub fn get(&self, module: &str, action: &str) -> Option<Option<ActionNotes>> {
        let key = (module.to_string(), action.to_string());
        let now = Instant::now();
        let mut entry = self.entries.get_mut(&key)?;
        if now.duration_since(entry.last_access) > self.ttl {
            drop(entry);
            self.entries
                .remove_if(&key, |_, e| now.duration_since(e.last_access) > self.ttl);
            return None;
        }
        entry.last_access = now;
        Some(entry.notes)
    }

    /// Return the cached notes, computing them with `load` on a miss
    pub fn get_or_insert_with<F>(&self, module: &str, action: &str, load: F) -> Option<ActionNotes>
    where
        F: FnOnce() -> Option<ActionNotes>,
    {
        if let Some(notes) = self.get(module, action) {
            return notes;
        }
        let notes = load();
        self.entries.insert(
            (module.to_string(), action.to_string()),
            CachedNotes {
                notes,
                last_access: Instant::now(),
            },
        );
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge_expired();
        }
        notes
    }

    /// Drop every entry of `module` and of the paths below it
    pub fn invalidate_module(&self, module: &str) {
        self.entries.retain(|(m, _), _| !is_within(m, module));
    }

    /// Drop expired entries
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.last_access) <= self.ttl);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired action notes");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `path` is `module` itself or one of its sub-paths
fn is_within(path: &str, module: &str) -> bool {
    path.strip_prefix(module)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
