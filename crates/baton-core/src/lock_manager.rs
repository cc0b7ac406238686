// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease-based locks on top of the `locks` table.
//!
//! The [`LockManager`] is the only component that writes lock rows. It also
//! tracks the locks this process holds so the heartbeat knows what to renew,
//! and hands each holder a [`CancellationToken`] that fires the moment
//! ownership is lost.
//!
//! The held-lock map is guarded by a synchronous mutex that is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_RENEWAL_RATIO};
use crate::error::CoreError;
use crate::owner::OwnerId;
use crate::persistence::{LockKey, LockRecord, Persistence};
use crate::retry::RetryConfig;

/// A lock held by this process.
#[derive(Debug, Clone)]
struct HeldLock {
    key: LockKey,
    ttl: Duration,
    token: CancellationToken,
    next_renewal: Instant,
    /// Local estimate of the lease end, used to bound renewal retries.
    expires: Instant,
}

/// Handle to an acquired lock.
#[derive(Debug, Clone)]
pub struct Lease {
    key: LockKey,
    ttl: Duration,
    token: CancellationToken,
}

impl Lease {
    /// Key of the lock.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Lease length.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Token cancelled when ownership is lost or the lock is released.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether ownership has been lost.
    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Acquires, renews and releases locks on behalf of one owner.
pub struct LockManager {
    store: Arc<dyn Persistence>,
    owner: OwnerId,
    held: Mutex<HashMap<String, HeldLock>>,
    accepting: AtomicBool,
    changed: Notify,
    renewal_ratio: f64,
    retry: RetryConfig,
}

impl LockManager {
    /// Create a manager renewing at 0.6 x TTL.
    pub fn new(store: Arc<dyn Persistence>, owner: OwnerId) -> Self {
        Self {
            store,
            owner,
            held: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            changed: Notify::new(),
            renewal_ratio: MAX_RENEWAL_RATIO,
            retry: RetryConfig::default(),
        }
    }

    /// Create a manager using the renewal ratio from `config`.
    pub fn from_config(store: Arc<dyn Persistence>, owner: OwnerId, config: &Config) -> Self {
        Self::new(store, owner).with_renewal_ratio(config.renewal_ratio())
    }

    /// Renew leases after `ratio` x TTL. Values above 0.6 are clamped.
    pub fn with_renewal_ratio(mut self, ratio: f64) -> Self {
        self.renewal_ratio = ratio.clamp(0.01, MAX_RENEWAL_RATIO);
        self
    }

    /// Backoff used when renewals hit transient store errors.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Owner id written into every lock row.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn renewal_interval(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.renewal_ratio)
    }

    // ========================================================================
    // Acquire / renew / release
    // ========================================================================

    /// Try to take `key` for `ttl`.
    ///
    /// Returns `false` when someone (including this process) holds a live
    /// lease, or when the store reported contention or a timeout. Fails with
    /// [`CoreError::ShuttingDown`] after [`stop_accepting`](Self::stop_accepting).
    pub async fn acquire(&self, key: &LockKey, ttl: Duration) -> Result<bool, CoreError> {
        Ok(self.acquire_lease(key, ttl).await?.is_some())
    }

    /// Like [`acquire`](Self::acquire), returning the lease handle on success.
    pub async fn acquire_lease(
        &self,
        key: &LockKey,
        ttl: Duration,
    ) -> Result<Option<Lease>, CoreError> {
        if !self.is_accepting() {
            return Err(CoreError::ShuttingDown);
        }
        let raw_key = key.as_key();
        if self.held().contains_key(&raw_key) {
            debug!(key = %raw_key, "Lock already held by this process");
            return Ok(None);
        }

        let won = match self
            .store
            .try_acquire_lock(&raw_key, self.owner.as_str(), key.lock_type(), ttl)
            .await
        {
            Ok(won) => won,
            Err(e) if e.is_transient() => {
                debug!(key = %raw_key, error = %e, "Lock acquisition lost to contention");
                false
            }
            Err(e) => return Err(e),
        };
        if !won {
            return Ok(None);
        }

        // stop_accepting may have raced with the store call
        if !self.is_accepting() {
            self.give_back(&raw_key).await;
            return Err(CoreError::ShuttingDown);
        }

        let now = Instant::now();
        let token = CancellationToken::new();
        self.held().insert(
            raw_key.clone(),
            HeldLock {
                key: key.clone(),
                ttl,
                token: token.clone(),
                next_renewal: now + self.renewal_interval(ttl),
                expires: now + ttl,
            },
        );
        self.changed.notify_one();

        debug!(key = %raw_key, owner = %self.owner, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(Lease {
            key: key.clone(),
            ttl,
            token,
        }))
    }

    /// Extend a lock held by this process.
    ///
    /// Returns `false` when ownership was lost; the lock's token is cancelled
    /// and it is forgotten. Transient errors are retried within the remaining
    /// lease time; if they persist past it the lock is treated as lost.
    pub async fn renew(&self, key: &LockKey) -> Result<bool, CoreError> {
        let raw_key = key.as_key();
        let Some((ttl, expires)) = self.held().get(&raw_key).map(|h| (h.ttl, h.expires)) else {
            return Ok(false);
        };

        let owner = self.owner.as_str();
        let result = self
            .retry
            .run("renew_lock", Some(expires), || {
                self.store.renew_lock(&raw_key, owner, ttl)
            })
            .await;

        match result {
            Ok(true) => {
                let now = Instant::now();
                if let Some(held) = self.held().get_mut(&raw_key) {
                    held.next_renewal = now + self.renewal_interval(ttl);
                    held.expires = now + ttl;
                }
                debug!(key = %raw_key, owner = %self.owner, "Lease renewed");
                Ok(true)
            }
            Ok(false) => {
                self.forget_lost(&raw_key);
                Ok(false)
            }
            Err(e) => {
                if Instant::now() >= expires {
                    warn!(key = %raw_key, error = %e, "Lease expired while the store was failing");
                    self.forget_lost(&raw_key);
                }
                Err(e)
            }
        }
    }

    fn forget_lost(&self, raw_key: &str) {
        if let Some(held) = self.held().remove(raw_key) {
            held.token.cancel();
            info!(key = %raw_key, owner = %self.owner, "Lock ownership lost");
        }
    }

    /// Release `key` if this owner holds it. Idempotent.
    pub async fn release(&self, key: &LockKey) -> Result<(), CoreError> {
        let raw_key = key.as_key();
        if let Some(held) = self.held().remove(&raw_key) {
            held.token.cancel();
        }
        let deleted = self
            .store
            .release_lock(&raw_key, self.owner.as_str())
            .await?;
        debug!(key = %raw_key, owner = %self.owner, deleted, "Lock released");
        Ok(())
    }

    /// Release every lock this process holds. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<HeldLock> = self.held().drain().map(|(_, held)| held).collect();
        let mut released = 0;
        for held in drained {
            held.token.cancel();
            match self
                .store
                .release_lock(&held.key.as_key(), self.owner.as_str())
                .await
            {
                Ok(_) => released += 1,
                Err(e) => warn!(key = %held.key, error = %e, "Failed to release lock"),
            }
        }
        if released > 0 {
            info!(owner = %self.owner, released, "Released all held locks");
        }
        released
    }

    /// Release a row won in the store but never tracked locally.
    async fn give_back(&self, raw_key: &str) {
        match self.store.release_lock(raw_key, self.owner.as_str()).await {
            Ok(released) => {
                debug!(key = %raw_key, released, "Released lock acquired during shutdown")
            }
            Err(e) => warn!(
                key = %raw_key,
                owner = %self.owner,
                error = %e,
                "Failed to release lock acquired during shutdown, it stays taken until it expires"
            ),
        }
    }

    /// Refuse further acquisitions.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Whether acquisitions are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Held-lock bookkeeping
    // ========================================================================

    /// Whether this process holds `key`.
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held().contains_key(&key.as_key())
    }

    /// Cancellation token of a held lock.
    pub fn token(&self, key: &LockKey) -> Option<CancellationToken> {
        self.held().get(&key.as_key()).map(|h| h.token.clone())
    }

    /// Keys of all held locks.
    pub fn held_keys(&self) -> Vec<LockKey> {
        self.held().values().map(|h| h.key.clone()).collect()
    }

    /// Earliest scheduled renewal.
    pub fn next_renewal_due(&self) -> Option<Instant> {
        self.held().values().map(|h| h.next_renewal).min()
    }

    /// Held locks whose renewal is due at `now`.
    pub fn due_for_renewal(&self, now: Instant) -> Vec<LockKey> {
        self.held()
            .values()
            .filter(|h| h.next_renewal <= now)
            .map(|h| h.key.clone())
            .collect()
    }

    /// Resolves when a lock is acquired or acquisitions stop.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Whether anyone holds a live lease on `key` (store clock).
    pub async fn is_live(&self, key: &LockKey) -> Result<bool, CoreError> {
        self.store.is_lock_live(&key.as_key()).await
    }

    /// Current lock row of `key`.
    pub async fn get_lock(&self, key: &LockKey) -> Result<Option<LockRecord>, CoreError> {
        self.store.get_lock(&key.as_key()).await
    }

    /// Delete up to `limit` expired rows.
    pub async fn reap_expired(&self, limit: u32) -> Result<u64, CoreError> {
        self.store.reap_expired_locks(limit).await
    }

    /// Store time.
    pub async fn store_now(&self) -> Result<DateTime<Utc>, CoreError> {
        self.store.store_now().await
    }
}
