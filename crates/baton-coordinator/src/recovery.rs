// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Takes over instances whose owner has died.
//!
//! ```text
//! Suspected ──► recovery lock ──┬─► Won ─► Verifying ─► Recovering ─► Resumed
//!                               │              │
//!                               └─► Lost       └─► Abandoned (not ours to recover)
//! ```
//!
//! The recovery lock is short-lived and only serialises the takeover; once
//! the execution lock is acquired and the instance handed to the runner, the
//! recovery lock is released and the instance runs under the normal
//! heartbeat.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use baton_core::{
    Config, CoreError, InstanceRecord, InstanceStatus, Lease, LockKey, LockManager, Persistence,
};
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::runner::{InstanceRunner, StartMode};

/// Step of a recovery attempt, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Reported by the failure detector.
    Suspected,
    /// This node holds the recovery lock.
    Won,
    /// Another node holds the recovery lock.
    Lost,
    /// Re-checking that the instance is still abandoned.
    Verifying,
    /// Taking over the execution lock and loading the checkpoint.
    Recovering,
    /// Handed to the runner.
    Resumed,
    /// The instance turned out not to need recovery.
    Abandoned,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryState::Suspected => "suspected",
            RecoveryState::Won => "won",
            RecoveryState::Lost => "lost",
            RecoveryState::Verifying => "verifying",
            RecoveryState::Recovering => "recovering",
            RecoveryState::Resumed => "resumed",
            RecoveryState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Result of [`RecoveryCoordinator::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Resumed from its checkpoint on this node.
    Resumed,
    /// No checkpoint; restarted from the input on this node.
    Restarted,
    /// Another node is recovering it.
    Lost,
    /// Not abandoned after all; nothing was changed.
    Aborted,
    /// Marked failed.
    Failed {
        /// Recorded reason.
        reason: String,
    },
}

/// Recovery worker.
pub struct RecoveryCoordinator {
    store: Arc<dyn Persistence>,
    lock_manager: Arc<LockManager>,
    runner: Arc<InstanceRunner>,
    recovery_lock_ttl: Duration,
    lease_ttl: Duration,
    max_attempts: u32,
    in_flight: Mutex<HashSet<String>>,
    shutdown: Arc<Notify>,
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    instance_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instance_id);
    }
}

impl RecoveryCoordinator {
    /// Create a coordinator using the TTLs and attempt bound from `config`.
    pub fn new(
        store: Arc<dyn Persistence>,
        lock_manager: Arc<LockManager>,
        runner: Arc<InstanceRunner>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            lock_manager,
            runner,
            recovery_lock_ttl: config.recovery_lock_ttl,
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_recovery_attempts,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn transition(&self, instance_id: &str, state: RecoveryState) {
        info!(
            instance_id = %instance_id,
            owner = %self.lock_manager.owner(),
            state = %state,
            "Recovery state"
        );
    }

    fn enter(&self, instance_id: &str) -> Option<InFlight<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string());
        inserted.then(|| InFlight {
            set: &self.in_flight,
            instance_id: instance_id.to_string(),
        })
    }

    /// Try to recover one suspected instance.
    #[instrument(skip(self))]
    pub async fn recover(&self, instance_id: &str) -> Result<RecoveryOutcome> {
        self.transition(instance_id, RecoveryState::Suspected);
        let Some(_guard) = self.enter(instance_id) else {
            self.transition(instance_id, RecoveryState::Lost);
            return Ok(RecoveryOutcome::Lost);
        };

        let recovery_key = LockKey::recovery(instance_id);
        if !self
            .lock_manager
            .acquire(&recovery_key, self.recovery_lock_ttl)
            .await?
        {
            self.transition(instance_id, RecoveryState::Lost);
            return Ok(RecoveryOutcome::Lost);
        }
        self.transition(instance_id, RecoveryState::Won);

        let result = self.recover_locked(instance_id).await;

        // Released at handoff, not when the execution finishes. Once the
        // runner holds the execution lease and the instance is assigned to
        // this node, a rival recoverer fails verification on the live
        // execution lock, so the recovery lock has nothing left to guard.
        if let Err(e) = self.lock_manager.release(&recovery_key).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to release recovery lock");
        }
        result
    }

    async fn recover_locked(&self, instance_id: &str) -> Result<RecoveryOutcome> {
        self.transition(instance_id, RecoveryState::Verifying);
        let Some(instance) = self.verify(instance_id).await? else {
            self.transition(instance_id, RecoveryState::Abandoned);
            return Ok(RecoveryOutcome::Aborted);
        };

        let attempts = self.store.increment_recovery_attempts(instance_id).await?;
        if u32::try_from(attempts).unwrap_or(u32::MAX) > self.max_attempts {
            let reason = "recovery attempts exhausted".to_string();
            warn!(instance_id = %instance_id, attempts, "Giving up on instance");
            self.store
                .complete_instance_if_running(
                    instance_id,
                    InstanceStatus::Failed,
                    None,
                    Some(&reason),
                    None,
                )
                .await?;
            return Ok(RecoveryOutcome::Failed { reason });
        }

        self.transition(instance_id, RecoveryState::Recovering);
        let execution_key = LockKey::execution(instance_id);
        let Some(lease) = self
            .lock_manager
            .acquire_lease(&execution_key, self.lease_ttl)
            .await?
        else {
            self.transition(instance_id, RecoveryState::Abandoned);
            return Ok(RecoveryOutcome::Aborted);
        };

        if let Err(e) = self
            .store
            .assign_owner(instance_id, self.lock_manager.owner().as_str())
            .await
        {
            self.release_quietly(&execution_key).await;
            return Err(e.into());
        }

        match self.store.load_checkpoint(instance_id).await {
            Ok(Some(checkpoint)) => {
                info!(
                    instance_id = %instance_id,
                    completed = checkpoint.completed_node_ids.len(),
                    current_node = ?checkpoint.current_node_id,
                    "Resuming from checkpoint"
                );
                self.runner
                    .start(&instance, lease, StartMode::Resume(checkpoint));
                self.transition(instance_id, RecoveryState::Resumed);
                Ok(RecoveryOutcome::Resumed)
            }
            Ok(None) if instance.input_data.is_some() => {
                info!(instance_id = %instance_id, "No checkpoint, restarting from input");
                self.runner.start(&instance, lease, StartMode::Fresh);
                self.transition(instance_id, RecoveryState::Resumed);
                Ok(RecoveryOutcome::Restarted)
            }
            Ok(None) => {
                self.fail(instance_id, lease, "checkpoint missing and no input data".to_string())
                    .await
            }
            Err(CoreError::CheckpointCorrupt { reason, .. }) => {
                self.fail(instance_id, lease, format!("checkpoint corrupt: {}", reason))
                    .await
            }
            Err(e) => {
                self.release_quietly(&execution_key).await;
                Err(e.into())
            }
        }
    }

    /// The instance if it is still running without a live execution lock.
    async fn verify(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Ok(None);
        };
        if instance.status != InstanceStatus::Running {
            info!(instance_id = %instance_id, status = %instance.status, "Instance is no longer running");
            return Ok(None);
        }
        if self
            .lock_manager
            .is_live(&LockKey::execution(instance_id))
            .await?
        {
            info!(instance_id = %instance_id, "Execution lock is live again");
            return Ok(None);
        }
        Ok(Some(instance))
    }

    async fn fail(
        &self,
        instance_id: &str,
        lease: Lease,
        reason: String,
    ) -> Result<RecoveryOutcome> {
        error!(instance_id = %instance_id, reason = %reason, "Instance cannot be recovered");
        let result = self
            .store
            .complete_instance_if_running(
                instance_id,
                InstanceStatus::Failed,
                None,
                Some(&reason),
                Some(self.lock_manager.owner().as_str()),
            )
            .await;
        self.release_quietly(lease.key()).await;
        result?;
        Ok(RecoveryOutcome::Failed { reason })
    }

    async fn release_quietly(&self, key: &LockKey) {
        if let Err(e) = self.lock_manager.release(key).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        }
    }

    /// Recover suspects from `suspects` until shutdown or until the sender
    /// side closes.
    pub async fn run(&self, mut suspects: mpsc::Receiver<String>) {
        info!(owner = %self.lock_manager.owner(), "Recovery coordinator started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Recovery coordinator received shutdown signal");
                    break;
                }

                next = suspects.recv() => {
                    let Some(instance_id) = next else { break };
                    match self.recover(&instance_id).await {
                        Ok(outcome) => info!(instance_id = %instance_id, outcome = ?outcome, "Recovery finished"),
                        Err(e) => warn!(instance_id = %instance_id, error = %e, "Recovery attempt failed"),
                    }
                }
            }
        }

        info!("Recovery coordinator stopped");
    }
}
