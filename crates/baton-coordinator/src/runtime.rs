// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime wiring every coordinator worker together.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use baton_coordinator::runtime::{CoordinatorRuntime, shutdown_signal};
//! use baton_core::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     baton_coordinator::telemetry::init_tracing("baton_coordinator=info");
//!
//!     let runtime = CoordinatorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .engine(Arc::new(my_engine()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let id = runtime
//!         .coordinator()
//!         .create_and_lock_instance("nightly-etl", Some(serde_json::json!({})))
//!         .await?;
//!
//!     shutdown_signal().await;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Shutdown order matters: acquisitions stop first, then failure detection
//! and recovery, then running instances get the grace period, and only after
//! every execution lock is released do the heartbeat and janitor stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use baton_core::persistence;
use baton_core::{Config, LockManager, OwnerId, Persistence, RetryConfig};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::coordinator::WorkflowCoordinator;
use crate::engine::ExecutionEngine;
use crate::failure_detector::{FailureDetector, FailureDetectorConfig};
use crate::heartbeat::HeartbeatService;
use crate::janitor::LockJanitor;
use crate::recovery::RecoveryCoordinator;
use crate::runner::InstanceRunner;

/// Default capacity of the suspect queue between detector and recovery.
const DEFAULT_SUSPECT_QUEUE: usize = 256;

/// Builder for creating a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    config: Option<Config>,
    owner: Option<OwnerId>,
    retry: RetryConfig,
    suspect_queue: usize,
}

impl Default for CoordinatorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            engine: None,
            config: None,
            owner: None,
            retry: RetryConfig::default(),
            suspect_queue: DEFAULT_SUSPECT_QUEUE,
        }
    }
}

impl CoordinatorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing store instead of connecting to `config.database_url`.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the execution engine (required).
    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the owner id written into lock rows.
    ///
    /// Default: generated from host name, pid and start time.
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the backoff for transient errors during lease renewal.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the capacity of the suspect queue.
    ///
    /// Default: 256
    pub fn suspect_queue(mut self, capacity: usize) -> Self {
        self.suspect_queue = capacity.max(1);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the configuration
    /// is invalid.
    pub fn build(self) -> Result<CoordinatorRuntimeConfig> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        config.validate()?;

        Ok(CoordinatorRuntimeConfig {
            persistence: self.persistence,
            engine,
            config,
            owner: self.owner.unwrap_or_else(OwnerId::generate),
            retry: self.retry,
            suspect_queue: self.suspect_queue,
        })
    }
}

/// Validated configuration for a [`CoordinatorRuntime`].
pub struct CoordinatorRuntimeConfig {
    persistence: Option<Arc<dyn Persistence>>,
    engine: Arc<dyn ExecutionEngine>,
    config: Config,
    owner: OwnerId,
    retry: RetryConfig,
    suspect_queue: usize,
}

impl CoordinatorRuntimeConfig {
    /// Connect if needed and spawn the heartbeat, failure detector, recovery
    /// and janitor tasks.
    pub async fn start(self) -> Result<CoordinatorRuntime> {
        let config = self.config;
        let store = match self.persistence {
            Some(store) => store,
            None => persistence::connect(&config.database_url).await?,
        };

        let lock_manager = Arc::new(
            LockManager::from_config(store.clone(), self.owner.clone(), &config)
                .with_retry(self.retry),
        );
        let runner = Arc::new(InstanceRunner::new(
            store.clone(),
            lock_manager.clone(),
            self.engine,
        ));
        let coordinator = Arc::new(WorkflowCoordinator::new(
            store.clone(),
            lock_manager.clone(),
            runner.clone(),
            config.lease_ttl,
        ));

        // Heartbeat
        let heartbeat = HeartbeatService::new(
            lock_manager.clone(),
            store.clone(),
            config.heartbeat_interval,
        );
        let heartbeat_shutdown = heartbeat.shutdown_handle();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run().await;
        });

        // Failure detector -> recovery
        let (suspect_tx, suspect_rx) = mpsc::channel(self.suspect_queue);
        let detector = FailureDetector::new(store.clone(), FailureDetectorConfig::from_config(&config));
        let detector_shutdown = detector.shutdown_handle();
        let detector_handle = tokio::spawn(async move {
            detector.run(suspect_tx).await;
        });

        let recovery = RecoveryCoordinator::new(
            store.clone(),
            lock_manager.clone(),
            runner.clone(),
            &config,
        );
        let recovery_shutdown = recovery.shutdown_handle();
        let recovery_handle = tokio::spawn(async move {
            recovery.run(suspect_rx).await;
        });

        // Janitor
        let janitor = LockJanitor::new(
            lock_manager.clone(),
            config.janitor_interval,
            config.scan_batch_size,
        );
        let janitor_shutdown = janitor.shutdown_handle();
        let janitor_handle = tokio::spawn(async move {
            janitor.run().await;
        });

        info!(
            owner = %self.owner,
            lease_ttl_ms = config.lease_ttl.as_millis() as u64,
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            detection_threshold_ms = config.failure_detection_threshold().as_millis() as u64,
            "CoordinatorRuntime started"
        );

        Ok(CoordinatorRuntime {
            coordinator,
            lock_manager,
            runner,
            store,
            grace_period: config.shutdown_grace_period,
            heartbeat_handle,
            detector_handle,
            recovery_handle,
            janitor_handle,
            heartbeat_shutdown,
            detector_shutdown,
            recovery_shutdown,
            janitor_shutdown,
        })
    }
}

/// A running coordinator node embedded in an application.
///
/// The runtime manages:
/// - Heartbeat renewing every lease this node holds
/// - Failure detector scanning for abandoned instances
/// - Recovery coordinator taking them over
/// - Janitor deleting expired lock rows
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoordinatorRuntime {
    coordinator: Arc<WorkflowCoordinator>,
    lock_manager: Arc<LockManager>,
    runner: Arc<InstanceRunner>,
    store: Arc<dyn Persistence>,
    grace_period: Duration,
    heartbeat_handle: JoinHandle<()>,
    detector_handle: JoinHandle<()>,
    recovery_handle: JoinHandle<()>,
    janitor_handle: JoinHandle<()>,
    heartbeat_shutdown: Arc<Notify>,
    detector_shutdown: Arc<Notify>,
    recovery_shutdown: Arc<Notify>,
    janitor_shutdown: Arc<Notify>,
}

impl CoordinatorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoordinatorRuntimeBuilder {
        CoordinatorRuntimeBuilder::new()
    }

    /// Public coordinator API.
    pub fn coordinator(&self) -> &Arc<WorkflowCoordinator> {
        &self.coordinator
    }

    /// Lock manager, also usable for `resource` locks.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Number of instances executing on this node.
    pub fn active_executions(&self) -> usize {
        self.runner.active_count()
    }

    /// Gracefully shut down the node.
    ///
    /// Running instances get the configured grace period; whatever is still
    /// running afterwards is interrupted, checkpointed and its execution lock
    /// released so another node can take over immediately.
    pub async fn shutdown(self) -> Result<()> {
        info!(owner = %self.lock_manager.owner(), "CoordinatorRuntime shutting down...");

        self.lock_manager.stop_accepting();

        self.detector_shutdown.notify_one();
        self.recovery_shutdown.notify_one();
        if let Err(e) = self.detector_handle.await {
            error!("Failure detector task panicked: {}", e);
        }
        if let Err(e) = self.recovery_handle.await {
            error!("Recovery coordinator task panicked: {}", e);
        }

        let interrupted = self.runner.shutdown(self.grace_period).await;
        let released = self.lock_manager.release_all().await;

        self.heartbeat_shutdown.notify_one();
        self.janitor_shutdown.notify_one();
        if let Err(e) = self.heartbeat_handle.await {
            error!("Heartbeat task panicked: {}", e);
        }
        if let Err(e) = self.janitor_handle.await {
            error!("Lock janitor task panicked: {}", e);
        }

        info!(interrupted, released, "CoordinatorRuntime shutdown complete");
        Ok(())
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        !self.heartbeat_handle.is_finished()
            && !self.detector_handle.is_finished()
            && !self.recovery_handle.is_finished()
            && !self.janitor_handle.is_finished()
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
