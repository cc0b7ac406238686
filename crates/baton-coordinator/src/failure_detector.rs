// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic scan for instances whose owner stopped heartbeating.
//!
//! Every node runs its own detector; there is no leader. An instance is
//! suspected when it is `running`, its `updated_at` is older than the
//! detection threshold, and its execution lock is not live. The result is
//! advisory: several nodes may suspect the same instance, and the recovery
//! lock decides which one acts on it.

use std::sync::Arc;
use std::time::Duration;

use baton_core::{Config, CoreError, Persistence};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

/// Configuration for the failure detector.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// How often to scan.
    pub scan_interval: Duration,
    /// Age of `updated_at` after which a running instance is suspected.
    pub threshold: Duration,
    /// Maximum suspects per scan.
    pub batch_size: u32,
}

impl FailureDetectorConfig {
    /// Derive from coordinator configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            scan_interval: config.scan_interval,
            threshold: config.failure_detection_threshold(),
            batch_size: config.scan_batch_size,
        }
    }
}

/// Background worker feeding suspects to recovery.
pub struct FailureDetector {
    store: Arc<dyn Persistence>,
    config: FailureDetectorConfig,
    shutdown: Arc<Notify>,
}

impl FailureDetector {
    /// Create a detector.
    pub fn new(store: Arc<dyn Persistence>, config: FailureDetectorConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Instances that look abandoned right now.
    pub async fn scan(&self) -> Result<Vec<String>, CoreError> {
        self.store
            .find_suspected_abandoned(self.config.threshold, self.config.batch_size)
            .await
    }

    /// Scan every `scan_interval` and send suspects to `suspects` until
    /// shutdown or until the receiver is dropped.
    pub async fn run(&self, suspects: mpsc::Sender<String>) {
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            threshold_ms = self.config.threshold.as_millis() as u64,
            "Failure detector started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Failure detector received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.scan_interval) => {
                    match self.scan().await {
                        Ok(ids) if ids.is_empty() => debug!("No suspected instances"),
                        Ok(ids) => {
                            warn!(count = ids.len(), "Found instances without a live owner");
                            for id in ids {
                                if suspects.send(id).await.is_err() {
                                    info!("Recovery stopped, failure detector exiting");
                                    return;
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "Failure detection scan failed"),
                    }
                }
            }
        }

        info!("Failure detector stopped");
    }
}
