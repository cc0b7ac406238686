// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entry points used by orchestration and API layers.
//!
//! Every state change goes through the execution lock: an instance is only
//! started, resumed or stopped by the node holding its lease. Administrative
//! requests for instances running on another node are stored as signals and
//! applied by that node at its next step boundary.

use std::sync::Arc;
use std::time::Duration;

use baton_core::persistence::{NewInstance, SignalType};
use baton_core::{
    CoreError, InstanceRecord, InstanceStatus, LockKey, LockManager, Persistence,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::StepListener;
use crate::error::{Error, Result};
use crate::runner::{InstanceRunner, StartMode};

/// Snapshot of an instance for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatusView {
    /// Instance id.
    pub instance_id: String,
    /// Workflow definition reference.
    pub definition_ref: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Node in flight at the last checkpoint.
    pub current_node: Option<String>,
    /// Completed nodes, sorted.
    pub completed_nodes: Vec<String>,
    /// Nodes whose last attempt failed, sorted.
    pub failed_nodes: Vec<String>,
    /// Node responsible for execution.
    pub assigned_owner: Option<String>,
    /// Last heartbeat or state change.
    pub last_heartbeat: DateTime<Utc>,
    /// Failure reason, for failed instances.
    pub error: Option<String>,
    /// Node that last attempted execution.
    pub last_attempted_node: Option<String>,
    /// Recoveries started so far.
    pub recovery_attempts: i32,
    /// Final output, for completed instances.
    pub output: Option<Value>,
}

/// How an administrative request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    /// The status was changed directly.
    Applied,
    /// The live executor will apply it at its next step boundary.
    Signalled,
}

/// Public coordinator API.
pub struct WorkflowCoordinator {
    store: Arc<dyn Persistence>,
    lock_manager: Arc<LockManager>,
    runner: Arc<InstanceRunner>,
    lease_ttl: Duration,
}

impl WorkflowCoordinator {
    /// Create a coordinator taking execution leases of `lease_ttl`.
    pub fn new(
        store: Arc<dyn Persistence>,
        lock_manager: Arc<LockManager>,
        runner: Arc<InstanceRunner>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            lock_manager,
            runner,
            lease_ttl,
        }
    }

    /// Lock manager used for execution leases.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    async fn instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    /// Create an instance, take its execution lock and start it on this node.
    #[instrument(skip(self, input), fields(owner = %self.lock_manager.owner()))]
    pub async fn create_and_lock_instance(
        &self,
        definition_ref: &str,
        input: Option<Value>,
    ) -> Result<String> {
        if definition_ref.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "definition_ref must not be empty".to_string(),
            ));
        }

        let instance_id = Uuid::new_v4().to_string();
        let key = LockKey::execution(&instance_id);
        let lease = self
            .lock_manager
            .acquire_lease(&key, self.lease_ttl)
            .await?
            .ok_or_else(|| Error::LockUnavailable(instance_id.clone()))?;

        let created = self
            .insert_running(&instance_id, definition_ref, input)
            .await;

        let record = match created {
            Ok(record) => record,
            Err(e) => {
                self.release_quietly(&key).await;
                return Err(e);
            }
        };

        self.runner.start(&record, lease, StartMode::Fresh);
        info!(instance_id = %instance_id, definition_ref = %definition_ref, "Instance created");
        Ok(instance_id)
    }

    async fn insert_running(
        &self,
        instance_id: &str,
        definition_ref: &str,
        input: Option<Value>,
    ) -> Result<InstanceRecord> {
        self.store
            .create_instance(&NewInstance {
                id: instance_id.to_string(),
                definition_ref: definition_ref.to_string(),
                input_data: input,
                assigned_owner: Some(self.lock_manager.owner().to_string()),
                status: InstanceStatus::Running,
            })
            .await
            .map_err(Error::from)
    }

    /// Status, progress and ownership of an instance.
    pub async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceStatusView> {
        let record = self.instance(instance_id).await?;
        let checkpoint = match self.store.load_checkpoint(instance_id).await {
            Ok(cp) => cp,
            Err(CoreError::CheckpointCorrupt { reason, .. }) => {
                warn!(instance_id = %instance_id, reason = %reason, "Checkpoint is corrupt");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let (current_node, completed_nodes, failed_nodes) = match checkpoint {
            Some(cp) => (
                cp.current_node_id,
                cp.completed_node_ids.into_iter().collect(),
                cp.failed_node_ids.into_iter().collect(),
            ),
            None => (None, Vec::new(), Vec::new()),
        };

        Ok(InstanceStatusView {
            instance_id: record.id,
            definition_ref: record.definition_ref,
            status: record.status,
            current_node,
            completed_nodes,
            failed_nodes,
            assigned_owner: record.assigned_owner,
            last_heartbeat: record.updated_at,
            error: record.error,
            last_attempted_node: record.last_attempted_node,
            recovery_attempts: record.recovery_attempts,
            output: record.output,
        })
    }

    /// List instances, newest first.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<InstanceRecord>> {
        Ok(self.store.list_instances(status, limit).await?)
    }

    /// Pause a pending or running instance at its next step boundary.
    #[instrument(skip(self))]
    pub async fn pause(&self, instance_id: &str) -> Result<AdminAction> {
        self.stop(instance_id, SignalType::Pause).await
    }

    /// Cancel a non-terminal instance.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: &str) -> Result<AdminAction> {
        self.stop(instance_id, SignalType::Cancel).await
    }

    async fn stop(&self, instance_id: &str, signal: SignalType) -> Result<AdminAction> {
        let record = self.instance(instance_id).await?;
        let (action, target, allowed) = match signal {
            SignalType::Pause => (
                "pause",
                InstanceStatus::Paused,
                matches!(record.status, InstanceStatus::Pending | InstanceStatus::Running),
            ),
            _ => (
                "cancel",
                InstanceStatus::Cancelled,
                !record.status.is_terminal(),
            ),
        };
        if !allowed {
            return Err(invalid_state(&record, action));
        }

        if self.runner.signal(instance_id, signal) {
            info!(instance_id = %instance_id, action, "Signalled local execution");
            return Ok(AdminAction::Signalled);
        }

        let key = LockKey::execution(instance_id);
        let Some(_lease) = self.lock_manager.acquire_lease(&key, self.lease_ttl).await? else {
            self.store.insert_signal(instance_id, signal).await?;
            info!(instance_id = %instance_id, action, "Stored signal for the live owner");
            return Ok(AdminAction::Signalled);
        };

        let applied = self
            .store
            .transition_instance_status(instance_id, record.status, target)
            .await;
        self.release_quietly(&key).await;

        if applied? {
            info!(instance_id = %instance_id, status = %target, "Applied administrative change");
            Ok(AdminAction::Applied)
        } else {
            let current = self.instance(instance_id).await?;
            Err(invalid_state(&current, action))
        }
    }

    /// Resume a paused instance on this node from its checkpoint.
    #[instrument(skip(self), fields(owner = %self.lock_manager.owner()))]
    pub async fn resume(&self, instance_id: &str) -> Result<AdminAction> {
        let record = self.instance(instance_id).await?;
        if record.status != InstanceStatus::Paused {
            return Err(invalid_state(&record, "resume"));
        }

        let key = LockKey::execution(instance_id);
        let lease = self
            .lock_manager
            .acquire_lease(&key, self.lease_ttl)
            .await?
            .ok_or_else(|| Error::LockUnavailable(instance_id.to_string()))?;

        match self.prepare_resume(instance_id).await {
            Ok(mode) => {
                let record = self.instance(instance_id).await?;
                self.runner.start(&record, lease, mode);
                info!(instance_id = %instance_id, "Instance resumed");
                Ok(AdminAction::Applied)
            }
            Err(e) => {
                self.release_quietly(&key).await;
                Err(e)
            }
        }
    }

    async fn prepare_resume(&self, instance_id: &str) -> Result<StartMode> {
        let checkpoint = match self.store.load_checkpoint(instance_id).await {
            Ok(cp) => cp,
            Err(CoreError::CheckpointCorrupt { reason, .. }) => {
                self.store
                    .update_instance_status(
                        instance_id,
                        InstanceStatus::Failed,
                        Some(&format!("checkpoint corrupt: {}", reason)),
                    )
                    .await?;
                return Err(Error::InvalidState {
                    instance_id: instance_id.to_string(),
                    status: InstanceStatus::Failed.to_string(),
                    action: "resume",
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !self
            .store
            .transition_instance_status(instance_id, InstanceStatus::Paused, InstanceStatus::Running)
            .await?
        {
            let current = self.instance(instance_id).await?;
            return Err(invalid_state(&current, "resume"));
        }
        self.store
            .assign_owner(instance_id, self.lock_manager.owner().as_str())
            .await?;
        // A pause that arrived after the executor stopped is stale now.
        if let Some(stale) = self.store.take_pending_signal(instance_id).await? {
            info!(instance_id = %instance_id, signal = stale.signal_type.as_str(), "Discarded stale signal");
        }

        Ok(match checkpoint {
            Some(cp) => StartMode::Resume(cp),
            None => StartMode::Fresh,
        })
    }

    /// Persist a step completion reported by an engine running on this node.
    pub async fn on_step_completed(
        &self,
        instance_id: &str,
        node_id: &str,
        output: Value,
        context: &Value,
    ) -> Result<()> {
        self.runner
            .on_step_completed(instance_id, node_id, output, context)
            .await
    }

    async fn release_quietly(&self, key: &LockKey) {
        if let Err(e) = self.lock_manager.release(key).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        }
    }
}

fn invalid_state(record: &InstanceRecord, action: &'static str) -> Error {
    Error::InvalidState {
        instance_id: record.id.clone(),
        status: record.status.to_string(),
        action,
    }
}
