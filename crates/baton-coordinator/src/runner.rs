// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs instances on this node under their execution lease.
//!
//! The runner spawns one task per instance on a [`TaskTracker`], keeps an
//! in-memory copy of each instance's checkpoint, and implements
//! [`StepListener`] so every step event is persisted before the engine moves
//! on. When the engine returns, the outcome is written to the instance row and
//! the execution lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::persistence::SignalType;
use baton_core::{Checkpoint, InstanceRecord, InstanceStatus, Lease, LockKey, LockManager, Persistence};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::engine::{ExecutionContext, ExecutionEngine, ExecutionOutcome, StepListener};
use crate::error::{Error, Result};

/// How long cancelled executions get to unwind before the final save.
const CANCEL_SETTLE: Duration = Duration::from_secs(1);

/// Where an execution starts.
#[derive(Debug, Clone)]
pub enum StartMode {
    /// Run every node.
    Fresh,
    /// Continue from a saved checkpoint.
    Resume(Checkpoint),
}

struct ActiveExecution {
    checkpoint: Checkpoint,
    token: CancellationToken,
    pending_signal: Option<SignalType>,
}

/// Executes instances owned by this node.
pub struct InstanceRunner {
    store: Arc<dyn Persistence>,
    lock_manager: Arc<LockManager>,
    engine: Arc<dyn ExecutionEngine>,
    tracker: TaskTracker,
    active: Mutex<HashMap<String, ActiveExecution>>,
}

impl InstanceRunner {
    /// Create a runner.
    pub fn new(
        store: Arc<dyn Persistence>,
        lock_manager: Arc<LockManager>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            store,
            lock_manager,
            engine,
            tracker: TaskTracker::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveExecution>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the execution of `instance`, which must already be `running` and
    /// whose execution lock is held through `lease`.
    pub fn start(self: &Arc<Self>, instance: &InstanceRecord, lease: Lease, mode: StartMode) {
        let instance_id = instance.id.clone();
        let checkpoint = match &mode {
            StartMode::Fresh => Checkpoint::new(instance_id.clone()),
            StartMode::Resume(cp) => cp.clone(),
        };
        self.active().insert(
            instance_id.clone(),
            ActiveExecution {
                checkpoint,
                token: lease.token().clone(),
                pending_signal: None,
            },
        );

        let listener: Arc<dyn StepListener> = self.clone();
        let ctx = ExecutionContext {
            instance_id: instance_id.clone(),
            definition_ref: instance.definition_ref.clone(),
            input: instance.input_data.clone(),
            cancel: lease.token().clone(),
            listener,
        };

        info!(
            instance_id = %instance_id,
            owner = %self.lock_manager.owner(),
            resume = matches!(mode, StartMode::Resume(_)),
            "Starting instance execution"
        );

        let this = self.clone();
        self.tracker.spawn(async move {
            let result = match mode {
                StartMode::Fresh => this.engine.execute_workflow(ctx).await,
                StartMode::Resume(cp) => this.engine.resume_from_breakpoint(ctx, cp.into()).await,
            };
            this.finish(&instance_id, &lease, result).await;
        });
    }

    async fn finish(&self, instance_id: &str, lease: &Lease, result: Result<ExecutionOutcome>) {
        self.active().remove(instance_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) if lease.is_lost() => ExecutionOutcome::OwnershipLost,
            Err(e) if e.is_ownership_lost() => ExecutionOutcome::OwnershipLost,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Engine returned an error");
                ExecutionOutcome::Failed {
                    node_id: None,
                    reason: e.to_string(),
                }
            }
        };

        if lease.is_lost() {
            info!(
                instance_id = %instance_id,
                owner = %self.lock_manager.owner(),
                "Execution stopped after ownership loss"
            );
            return;
        }

        if matches!(outcome, ExecutionOutcome::OwnershipLost) {
            // Lease is still ours; leave the instance running for recovery.
            warn!(instance_id = %instance_id, "Engine gave up the instance while the lease was held");
        } else if let Err(e) = self.record_outcome(instance_id, &outcome).await {
            error!(instance_id = %instance_id, error = %e, "Failed to record execution outcome");
        }
        if let Err(e) = self.lock_manager.release(lease.key()).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to release execution lock");
        }
    }

    async fn record_outcome(&self, instance_id: &str, outcome: &ExecutionOutcome) -> Result<()> {
        let owner = Some(self.lock_manager.owner().as_str());
        let applied = match outcome {
            ExecutionOutcome::Completed { output } => {
                self.store
                    .complete_instance_if_running(
                        instance_id,
                        InstanceStatus::Completed,
                        Some(output),
                        None,
                        owner,
                    )
                    .await?
            }
            ExecutionOutcome::Paused => {
                self.store
                    .transition_instance_status(
                        instance_id,
                        InstanceStatus::Running,
                        InstanceStatus::Paused,
                    )
                    .await?
            }
            ExecutionOutcome::Cancelled => {
                self.store
                    .complete_instance_if_running(
                        instance_id,
                        InstanceStatus::Cancelled,
                        None,
                        None,
                        owner,
                    )
                    .await?
            }
            ExecutionOutcome::Failed { node_id, reason } => {
                warn!(instance_id = %instance_id, node_id = ?node_id, reason = %reason, "Instance failed");
                self.store
                    .complete_instance_if_running(
                        instance_id,
                        InstanceStatus::Failed,
                        None,
                        Some(reason),
                        owner,
                    )
                    .await?
            }
            ExecutionOutcome::OwnershipLost => false,
        };

        if applied {
            info!(instance_id = %instance_id, outcome = ?outcome_name(outcome), "Execution finished");
        } else {
            warn!(instance_id = %instance_id, "Instance was no longer running here when execution finished");
        }
        Ok(())
    }

    /// Hand a pause or cancel signal to a locally running execution.
    ///
    /// Returns `false` if the instance is not running here.
    pub fn signal(&self, instance_id: &str, signal: SignalType) -> bool {
        match self.active().get_mut(instance_id) {
            Some(active) => {
                active.pending_signal = Some(signal);
                true
            }
            None => false,
        }
    }

    /// Whether `instance_id` is executing on this node.
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.active().contains_key(instance_id)
    }

    /// Number of executions on this node.
    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Wait up to `grace` for executions to finish, then cancel the rest and
    /// save their last known checkpoints. Returns how many were interrupted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            debug!("All executions finished within the grace period");
            return 0;
        }

        let interrupted: Vec<(Checkpoint, CancellationToken)> = self
            .active()
            .values()
            .map(|a| (a.checkpoint.clone(), a.token.clone()))
            .collect();
        warn!(
            count = interrupted.len(),
            grace_ms = grace.as_millis() as u64,
            "Grace period elapsed, interrupting executions"
        );

        for (_, token) in &interrupted {
            token.cancel();
        }
        let _ = tokio::time::timeout(CANCEL_SETTLE, self.tracker.wait()).await;

        for (checkpoint, _) in &interrupted {
            match self
                .store
                .save_checkpoint(checkpoint, self.lock_manager.owner().as_str())
                .await
            {
                Ok(saved) => debug!(
                    instance_id = %checkpoint.instance_id,
                    sequence = saved.sequence,
                    "Saved final checkpoint"
                ),
                Err(e) => error!(
                    instance_id = %checkpoint.instance_id,
                    error = %e,
                    "Failed to save final checkpoint"
                ),
            }
        }
        interrupted.len()
    }

    fn ensure_owned(&self, instance_id: &str) -> Result<()> {
        let owned = self
            .active()
            .get(instance_id)
            .is_some_and(|a| !a.token.is_cancelled());
        if owned && self.lock_manager.is_held(&LockKey::execution(instance_id)) {
            Ok(())
        } else {
            Err(Error::OwnershipLost(instance_id.to_string()))
        }
    }

    /// Apply `update` to the in-memory checkpoint and persist the result.
    async fn save_progress(
        &self,
        instance_id: &str,
        update: impl FnOnce(&mut Checkpoint),
    ) -> Result<Checkpoint> {
        self.ensure_owned(instance_id)?;
        let mut checkpoint = self
            .active()
            .get(instance_id)
            .map(|a| a.checkpoint.clone())
            .ok_or_else(|| Error::OwnershipLost(instance_id.to_string()))?;
        update(&mut checkpoint);

        let saved = self
            .store
            .save_checkpoint(&checkpoint, self.lock_manager.owner().as_str())
            .await?;
        if let Some(active) = self.active().get_mut(instance_id) {
            active.checkpoint = saved.clone();
        }
        Ok(saved)
    }
}

fn outcome_name(outcome: &ExecutionOutcome) -> &'static str {
    match outcome {
        ExecutionOutcome::Completed { .. } => "completed",
        ExecutionOutcome::Paused => "paused",
        ExecutionOutcome::Cancelled => "cancelled",
        ExecutionOutcome::OwnershipLost => "ownership_lost",
        ExecutionOutcome::Failed { .. } => "failed",
    }
}

#[async_trait]
impl StepListener for InstanceRunner {
    async fn on_step_started(&self, instance_id: &str, node_id: &str) -> Result<()> {
        self.save_progress(instance_id, |cp| cp.start_node(node_id))
            .await?;
        debug!(instance_id = %instance_id, node_id = %node_id, "Step started");
        Ok(())
    }

    async fn on_step_completed(
        &self,
        instance_id: &str,
        node_id: &str,
        output: Value,
        context: &Value,
    ) -> Result<()> {
        let saved = self
            .save_progress(instance_id, |cp| {
                cp.complete_node(node_id, output);
                cp.context_snapshot = context.clone();
            })
            .await?;
        self.store
            .update_instance_progress(
                instance_id,
                self.lock_manager.owner().as_str(),
                context,
                Some(node_id),
            )
            .await?;
        debug!(
            instance_id = %instance_id,
            node_id = %node_id,
            sequence = saved.sequence,
            "Step checkpointed"
        );
        Ok(())
    }

    async fn on_step_failed(&self, instance_id: &str, node_id: &str, reason: &str) -> Result<()> {
        self.save_progress(instance_id, |cp| cp.fail_node(node_id))
            .await?;
        warn!(instance_id = %instance_id, node_id = %node_id, reason = %reason, "Step failed");
        Ok(())
    }

    async fn poll_signal(&self, instance_id: &str) -> Result<Option<SignalType>> {
        let local = self
            .active()
            .get_mut(instance_id)
            .and_then(|a| a.pending_signal.take());
        if local.is_some() {
            return Ok(local);
        }
        let stored = self.store.take_pending_signal(instance_id).await?;
        Ok(stored.map(|s| s.signal_type))
    }
}
