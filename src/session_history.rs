//! # Session History
//!
//! [`SessionHistory`] keeps entries in a fixed number of buckets, newest
//! bucket first. New entries go into the head bucket. Each
//! [`rotate`](SessionHistory::rotate) pushes an empty bucket to the head and
//! evicts the oldest one, so an entry that is never touched again ages out
//! after `bucket_count` rotations.
//!
//! Lookups walk a lock-free snapshot of the bucket list; only rotation takes
//! the list's mutation lock.

use crate::rotating_list::RotatingList;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

type Bucket<T> = Arc<DashMap<String, T>>;

/// Bounded recency buffer of keyed entries
pub struct SessionHistory<T> {
    buckets: RotatingList<Bucket<T>>,
}

impl<T: Clone> SessionHistory<T> {
    /// Create a history with `bucket_count` empty buckets (at least one)
    pub fn new(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| Arc::new(DashMap::new()))
            .collect();
        Self {
            buckets: RotatingList::from_vec(buckets),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Store `value` in the head bucket, dropping any older entry for `key`
    pub fn put(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let snapshot = self.buckets.snapshot();
        let Some((head, older)) = snapshot.split_first() else {
            return;
        };
        for bucket in older {
            bucket.remove(&key);
        }
        head.insert(key, value);
    }

    /// Newest entry for `key`
    pub fn get(&self, key: &str) -> Option<T> {
        self.buckets
            .iter()
            .find_map(|bucket| bucket.get(key).map(|e| e.value().clone()))
    }

    /// Like [`get`](Self::get), but moves a hit from an older bucket back to
    /// the head so it survives the next rotations
    pub fn touch(&self, key: &str) -> Option<T> {
        let snapshot = self.buckets.snapshot();
        let (head, older) = snapshot.split_first()?;
        if let Some(hit) = head.get(key) {
            return Some(hit.value().clone());
        }
        for (age, bucket) in older.iter().enumerate() {
            if let Some((key, value)) = bucket.remove(key) {
                debug!(key = %key, age = age + 1, "Moving entry to head bucket");
                head.insert(key, value.clone());
                return Some(value);
            }
        }
        None
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.buckets
            .iter()
            .find_map(|bucket| bucket.remove(key).map(|(_, v)| v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.iter().any(|bucket| bucket.contains_key(key))
    }

    /// Total number of entries across all buckets
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Push a fresh head bucket and return the entries of the evicted tail
    pub fn rotate(&self) -> Vec<(String, T)> {
        match self.buckets.rotate(Arc::new(DashMap::new())) {
            Ok(evicted) => {
                let entries: Vec<(String, T)> = evicted
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                debug!(evicted = entries.len(), "Rotated session history");
                entries
            }
            // new() never builds an empty list
            Err(_) => Vec::new(),
        }
    }

    /// Drop every entry, keeping the bucket count
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }
}
