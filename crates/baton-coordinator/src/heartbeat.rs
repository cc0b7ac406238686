// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker renewing every lease this node holds.
//!
//! The service sleeps until the earliest scheduled renewal and wakes early
//! whenever the lock manager acquires a new lock. A renewal that returns
//! `false` cancels the lease token inside the [`LockManager`]; executions
//! observe it at their next step boundary.
//!
//! Renewing an execution lock also refreshes the instance's `updated_at`,
//! which is what the failure detector on other nodes reads.

use std::sync::Arc;
use std::time::Duration;

use baton_core::{LockManager, LockType, Persistence};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Summary of one renewal pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Leases extended.
    pub renewed: usize,
    /// Leases found lost.
    pub lost: usize,
    /// Renewals that failed with a store error.
    pub errors: usize,
}

/// Lease renewal worker.
pub struct HeartbeatService {
    lock_manager: Arc<LockManager>,
    store: Arc<dyn Persistence>,
    idle_wait: Duration,
    shutdown: Arc<Notify>,
}

impl HeartbeatService {
    /// Create a service. `idle_wait` bounds the sleep when nothing is held.
    pub fn new(
        lock_manager: Arc<LockManager>,
        store: Arc<dyn Persistence>,
        idle_wait: Duration,
    ) -> Self {
        Self {
            lock_manager,
            store,
            idle_wait,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(owner = %self.lock_manager.owner(), "Heartbeat service started");

        loop {
            let wake_at = self
                .lock_manager
                .next_renewal_due()
                .unwrap_or_else(|| Instant::now() + self.idle_wait);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat service received shutdown signal");
                    break;
                }

                _ = self.lock_manager.changed() => {
                    // A lock was acquired; recompute the next wake-up.
                    continue;
                }

                _ = tokio::time::sleep_until(wake_at) => {
                    self.tick(Instant::now()).await;
                }
            }
        }

        info!("Heartbeat service stopped");
    }

    /// Renew every lease due at `now`.
    pub async fn tick(&self, now: Instant) -> HeartbeatTick {
        let mut summary = HeartbeatTick::default();

        for key in self.lock_manager.due_for_renewal(now) {
            match self.lock_manager.renew(&key).await {
                Ok(true) => {
                    summary.renewed += 1;
                    if key.lock_type() == LockType::Execution {
                        let owner = self.lock_manager.owner().as_str();
                        if let Err(e) = self.store.touch_instance(key.name(), owner).await {
                            debug!(instance_id = %key.name(), error = %e, "Failed to touch instance");
                        }
                    }
                }
                Ok(false) => {
                    summary.lost += 1;
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!(key = %key, error = %e, "Lease renewal failed");
                }
            }
        }

        if summary != HeartbeatTick::default() {
            debug!(
                renewed = summary.renewed,
                lost = summary.lost,
                errors = summary.errors,
                "Heartbeat tick"
            );
        }
        summary
    }
}
