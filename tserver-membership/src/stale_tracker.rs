use std::collections::BTreeSet;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use tokio::time::Instant;

use crate::server_path::ServerPath;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Observation {
    /// First time the path was seen without a lock; the clock starts now.
    FirstSeen,
    /// Still within the grace period, with the time spent unlocked so far.
    Pending(Duration),
    /// Unlocked for longer than the grace period.
    Expired(Duration),
}

/// Remembers when each server path was first seen without a lock holder.
#[derive(Debug)]
pub struct StalePathTracker {
    first_seen: HashMap<ServerPath, Instant>,
    grace_period: Duration,
}

impl StalePathTracker {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            first_seen: HashMap::new(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn observe(&mut self, path: &ServerPath, now: Instant) -> Observation {
        match self.first_seen.get(path) {
            None => {
                self.first_seen.insert(path.clone(), now);
                Observation::FirstSeen
            }
            Some(first_seen) => {
                let elapsed = now.saturating_duration_since(*first_seen);
                if elapsed > self.grace_period {
                    Observation::Expired(elapsed)
                } else {
                    Observation::Pending(elapsed)
                }
            }
        }
    }

    /// A lock holder appeared, so the path is no longer stale.
    pub fn clear(&mut self, path: &ServerPath) -> bool {
        self.first_seen.remove(path).is_some()
    }

    /// Drops the entry after the path itself was deleted.
    pub fn forget(&mut self, path: &ServerPath) {
        self.first_seen.remove(path);
    }

    /// Forgets every path the coordination service no longer lists.
    pub fn retain_present(&mut self, present: &BTreeSet<ServerPath>) {
        self.first_seen.retain(|path, _| present.contains(path));
    }

    pub fn contains(&self, path: &ServerPath) -> bool {
        self.first_seen.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}
