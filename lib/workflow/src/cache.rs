//! Shared key-value cache.
//!
//! The cache holds the only cross-instance state outside the database: run
//! locks, event claims and the per-run set of still-running nodes. Every
//! mutation is a single atomic command (set-if-absent, compare-and-delete,
//! set add/remove) so instances never need to coordinate otherwise.

use crate::error::CacheError;
use async_trait::async_trait;
use runwright_core::{UserId, WorkflowId, WorkflowRunId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Key of the lock guarding one workflow invocation for one user.
#[must_use]
pub fn run_lock_key(workflow_id: WorkflowId, user_id: UserId) -> String {
    format!("lock:workflow:{workflow_id}:user:{user_id}")
}

/// Key of the one-shot claim on an external event.
#[must_use]
pub fn event_claim_key(workflow_id: WorkflowId, event_id: &str) -> String {
    format!("event-claim:{workflow_id}:{event_id}")
}

/// Key of the set of node IDs of a run that have not finished yet.
#[must_use]
pub fn running_nodes_key(run_id: WorkflowRunId) -> String {
    format!("running-nodes:{run_id}")
}

/// Atomic operations on the shared cache.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Sets `key` to `value` with expiry `ttl` only if the key is absent.
    ///
    /// Returns true if the value was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Deletes `key` only if its value equals `expected`.
    ///
    /// Returns true if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Adds members to the set at `key` and (re)sets its expiry.
    async fn set_add(&self, key: &str, members: &[String], ttl: Duration)
    -> Result<(), CacheError>;

    /// Removes members from the set at `key`.
    ///
    /// Returns the number of members left, or `None` if the set does not exist.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<Option<u64>, CacheError>;

    /// Deletes `key` unconditionally.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug)]
enum Entry {
    Value(String),
    Set(HashSet<String>),
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<Entry>,
    expires_at: Option<Instant>,
}

/// Process-local cache with expiry, for tests and single-instance runs.
///
/// Expiry uses `tokio::time`, so paused-clock tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the plain value at `key`, if present and not expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match Self::live(&mut slots, key)?.entry.as_ref()? {
            Entry::Value(value) => Some(value.clone()),
            Entry::Set(_) => None,
        }
    }

    /// Returns the members of the set at `key`, sorted.
    #[must_use]
    pub fn members(&self, key: &str) -> Vec<String> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<String> = match Self::live(&mut slots, key).and_then(|s| s.entry.as_ref()) {
            Some(Entry::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        };
        members.sort();
        members
    }

    /// Returns true if `key` exists and has not expired.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Self::live(&mut slots, key).is_some()
    }

    /// Looks up a slot, evicting it first if it has expired.
    fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
        let expired = slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            slots.remove(key);
        }
        slots.get_mut(key)
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if Self::live(&mut slots, key).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: Some(Entry::Value(value.to_string())),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = matches!(
            Self::live(&mut slots, key).and_then(|slot| slot.entry.as_ref()),
            Some(Entry::Value(value)) if value == expected
        );
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Self::live(&mut slots, key);
        let slot = slots.entry(key.to_string()).or_default();
        match &mut slot.entry {
            Some(Entry::Set(set)) => set.extend(members.iter().cloned()),
            entry => *entry = Some(Entry::Set(members.iter().cloned().collect())),
        }
        slot.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<Option<u64>, CacheError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Entry::Set(set)) = Self::live(&mut slots, key).and_then(|s| s.entry.as_mut()) else {
            return Ok(None);
        };
        for member in members {
            set.remove(member);
        }
        let remaining = set.len() as u64;
        if remaining == 0 {
            slots.remove(key);
        }
        Ok(Some(remaining))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
