// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deleting expired lock rows.
//!
//! Expired rows are already free for `acquire`; deleting them only keeps the
//! `locks` table small. Deletion goes through the [`LockManager`] and is
//! batched to keep each transaction short.

use std::sync::Arc;
use std::time::Duration;

use baton_core::{CoreError, LockManager};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Expired-lock reaper.
pub struct LockJanitor {
    lock_manager: Arc<LockManager>,
    interval: Duration,
    batch_size: u32,
    shutdown: Arc<Notify>,
}

impl LockJanitor {
    /// Create a janitor sweeping every `interval` in batches of `batch_size`.
    pub fn new(lock_manager: Arc<LockManager>, interval: Duration, batch_size: u32) -> Self {
        Self {
            lock_manager,
            interval,
            batch_size: batch_size.max(1),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Lock janitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lock janitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to reap expired locks");
                    }
                }
            }
        }

        info!("Lock janitor stopped");
    }

    /// Delete expired rows until a batch comes back short. Returns the total.
    pub async fn sweep(&self) -> Result<u64, CoreError> {
        let mut total = 0u64;
        loop {
            let deleted = self.lock_manager.reap_expired(self.batch_size).await?;
            total += deleted;
            if deleted < u64::from(self.batch_size) {
                break;
            }
        }
        if total > 0 {
            info!(deleted = total, "Reaped expired locks");
        } else {
            debug!("No expired locks");
        }
        Ok(total)
    }
}
