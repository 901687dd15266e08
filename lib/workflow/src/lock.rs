//! Distributed lock over the shared cache.
//!
//! A lease is a random token stored under the lock key with an expiry.
//! Contention is not an error: `acquire` reports `acquired = false`. Release
//! is compare-and-delete, so a holder whose lease expired can never remove
//! the lock of a later holder.
//!
//! Event claims use the same primitive without ever releasing; the TTL alone
//! decides when the claim lapses.

use crate::cache::SharedCache;
use crate::error::CacheError;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// The result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: String,
    acquired: bool,
}

impl Lease {
    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The random token identifying this holder.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lock was obtained.
    #[must_use]
    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

/// Mutual exclusion backed by a `SharedCache`.
#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn SharedCache>,
}

impl DistributedLock {
    /// Creates a lock client over the given cache.
    #[must_use]
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    /// Attempts to take `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache itself fails.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, CacheError> {
        let token = Ulid::new().to_string();
        let acquired = self.cache.set_if_absent(key, &token, ttl).await?;
        if !acquired {
            tracing::debug!(key, "lock held by another owner");
        }
        Ok(Lease {
            key: key.to_string(),
            token,
            acquired,
        })
    }

    /// Releases a lease.
    ///
    /// No-op if the lease was never acquired, has expired, or the key now
    /// belongs to someone else.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache itself fails.
    pub async fn release(&self, lease: &Lease) -> Result<(), CacheError> {
        if !lease.acquired {
            return Ok(());
        }
        let deleted = self.cache.delete_if_equals(&lease.key, &lease.token).await?;
        if !deleted {
            tracing::debug!(key = %lease.key, "lease already expired or taken over");
        }
        Ok(())
    }
}
