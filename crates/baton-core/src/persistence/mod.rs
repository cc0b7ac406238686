// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for baton-core.
//!
//! Four tables back the coordinator: `locks`, `workflow_instances`,
//! `workflow_checkpoints` and `workflow_signals`. All lease expiry comparisons
//! happen against the store's clock (`NOW()` on PostgreSQL, the injected
//! [`Clock`](crate::clock::Clock) on SQLite).

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::error::CoreError;

// ============================================================================
// Locks
// ============================================================================

/// Lock namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Exclusive right to execute an instance.
    Execution,
    /// Short-lived right to recover an instance.
    Recovery,
    /// Named application mutex.
    Resource,
}

impl LockType {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Execution => "execution",
            LockType::Recovery => "recovery",
            LockType::Resource => "resource",
        }
    }
}

impl FromStr for LockType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution" => Ok(LockType::Execution),
            "recovery" => Ok(LockType::Recovery),
            "resource" => Ok(LockType::Resource),
            other => Err(CoreError::ValidationError {
                field: "lock_type".to_string(),
                message: format!("unknown lock type '{}'", other),
            }),
        }
    }
}

/// Namespaced lock key, stored as `"<lock_type>:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    lock_type: LockType,
    name: String,
}

impl LockKey {
    /// Execution lock of an instance.
    pub fn execution(instance_id: &str) -> Self {
        Self::new(LockType::Execution, instance_id)
    }

    /// Recovery lock of an instance.
    pub fn recovery(instance_id: &str) -> Self {
        Self::new(LockType::Recovery, instance_id)
    }

    /// Named resource mutex.
    pub fn resource(name: &str) -> Self {
        Self::new(LockType::Resource, name)
    }

    /// Key in an arbitrary namespace.
    pub fn new(lock_type: LockType, name: &str) -> Self {
        Self {
            lock_type,
            name: name.to_string(),
        }
    }

    /// Namespace of this key.
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Name within the namespace (the instance id for execution/recovery).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of the `locks.key` column.
    pub fn as_key(&self) -> String {
        format!("{}:{}", self.lock_type.as_str(), self.name)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lock_type.as_str(), self.name)
    }
}

/// Lock row.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    /// Namespaced key.
    pub key: String,
    /// Current (or last) owner.
    pub owner: String,
    /// Namespace.
    pub lock_type: LockType,
    /// Lease expiry; afterwards the lock is free regardless of `owner`.
    pub expires_at: DateTime<Utc>,
    /// Incremented on every renew or steal.
    pub version: i64,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Instances
// ============================================================================

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, not yet running.
    Pending,
    /// Executing under a live execution lock.
    Running,
    /// Stopped by an administrator; resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by an administrator; terminal.
    Cancelled,
}

impl InstanceStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "paused" => Ok(InstanceStatus::Paused),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown instance status '{}'", other),
            }),
        }
    }
}

/// Workflow instance row.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Unique identifier.
    pub id: String,
    /// Reference to the workflow definition.
    pub definition_ref: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Node currently responsible for execution.
    pub assigned_owner: Option<String>,
    /// Last heartbeat or state change.
    pub updated_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Input supplied at creation.
    pub input_data: Option<Value>,
    /// Latest shared context.
    pub context_data: Option<Value>,
    /// Final output.
    pub output: Option<Value>,
    /// Last recorded failure reason.
    pub error: Option<String>,
    /// Node that last attempted execution.
    pub last_attempted_node: Option<String>,
    /// Number of recoveries started for this instance.
    pub recovery_attempts: i32,
}

/// Values for a new instance row.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Unique identifier.
    pub id: String,
    /// Reference to the workflow definition.
    pub definition_ref: String,
    /// Input data.
    pub input_data: Option<Value>,
    /// Initial owner.
    pub assigned_owner: Option<String>,
    /// Initial status, `pending` or `running`.
    pub status: InstanceStatus,
}

// ============================================================================
// Signals
// ============================================================================

/// Administrative signal delivered to the live executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Stop at the next step boundary, resumable.
    Pause,
    /// Resume a paused instance.
    Resume,
    /// Stop at the next step boundary, terminal.
    Cancel,
}

impl SignalType {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Pause => "pause",
            SignalType::Resume => "resume",
            SignalType::Cancel => "cancel",
        }
    }
}

impl FromStr for SignalType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(SignalType::Pause),
            "resume" => Ok(SignalType::Resume),
            "cancel" => Ok(SignalType::Cancel),
            other => Err(CoreError::ValidationError {
                field: "signal_type".to_string(),
                message: format!("unknown signal type '{}'", other),
            }),
        }
    }
}

/// Pending signal row.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    /// Target instance.
    pub instance_id: String,
    /// Signal kind.
    pub signal_type: SignalType,
    /// When the signal was stored.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Storage operations used by the lock manager and the coordinator.
///
/// Lock-row methods are meant to be called through
/// [`LockManager`](crate::lock_manager::LockManager) only.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------------

    /// Create the lock row, or take it over if its lease has expired.
    /// Returns `false` when a live lease is held by anyone (including `owner`).
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Extend the lease if `owner` still holds it and it has not expired.
    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError>;

    /// Delete the row if `owner` matches. Returns whether a row was deleted.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, CoreError>;

    /// Read a lock row, expired or not.
    async fn get_lock(&self, key: &str) -> Result<Option<LockRecord>, CoreError>;

    /// Whether a row exists for `key` with an unexpired lease.
    async fn is_lock_live(&self, key: &str) -> Result<bool, CoreError>;

    /// Delete up to `limit` expired rows. Returns the number deleted.
    async fn reap_expired_locks(&self, limit: u32) -> Result<u64, CoreError>;

    /// Current time according to the store.
    async fn store_now(&self) -> Result<DateTime<Utc>, CoreError>;

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    /// Insert a new instance in `instance.status` with one statement, so a
    /// row created as `running` never exists in any other state.
    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError>;

    /// Fetch an instance.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Set status unconditionally. Terminal statuses also set `finished_at`.
    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Set status only if the instance is currently in `from`.
    async fn transition_instance_status(
        &self,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, CoreError>;

    /// Finish a `running` instance with a terminal status. Returns `false`
    /// if the instance was no longer running, or if `owner` is given and the
    /// instance is assigned to someone else.
    async fn complete_instance_if_running(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
        owner: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Reassign the instance to `owner` and refresh `updated_at`.
    async fn assign_owner(&self, instance_id: &str, owner: &str) -> Result<(), CoreError>;

    /// Heartbeat: refresh `updated_at` of a running instance owned by `owner`.
    async fn touch_instance(&self, instance_id: &str, owner: &str) -> Result<bool, CoreError>;

    /// Record the latest context and the node that last attempted execution.
    ///
    /// Fails with [`CoreError::OwnershipLost`] unless `owner` is the
    /// instance's assigned owner.
    async fn update_instance_progress(
        &self,
        instance_id: &str,
        owner: &str,
        context_data: &Value,
        last_attempted_node: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Running instances with `updated_at` older than `threshold` and no live
    /// execution lock, oldest first.
    async fn find_suspected_abandoned(
        &self,
        threshold: Duration,
        limit: u32,
    ) -> Result<Vec<String>, CoreError>;

    /// Increment and return `recovery_attempts`.
    async fn increment_recovery_attempts(&self, instance_id: &str) -> Result<i32, CoreError>;

    /// List instances, newest first.
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Store a signal, replacing any pending one.
    async fn insert_signal(
        &self,
        instance_id: &str,
        signal_type: SignalType,
    ) -> Result<(), CoreError>;

    /// Remove and return the pending signal.
    async fn take_pending_signal(
        &self,
        instance_id: &str,
    ) -> Result<Option<SignalRecord>, CoreError>;

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Merge `checkpoint` into the stored one and return the result.
    ///
    /// Fails with [`CoreError::OwnershipLost`] unless `owner` is the
    /// instance's assigned owner.
    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        owner: &str,
    ) -> Result<Checkpoint, CoreError>;

    /// Latest checkpoint, or `None` if never saved.
    async fn load_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>, CoreError>;

    /// Drop all progress of an instance.
    async fn reset_checkpoint(&self, instance_id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Round-trip to the database.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Connect to `database_url`, run migrations and return the matching backend.
///
/// `postgres://`/`postgresql://` selects PostgreSQL, `sqlite:` selects SQLite.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>, CoreError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresPersistence::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqlitePersistence::connect(database_url).await?))
    } else {
        Err(CoreError::ValidationError {
            field: "database_url".to_string(),
            message: "expected a postgres:// or sqlite: URL".to_string(),
        })
    }
}

pub(crate) fn decode_json(
    instance_id: &str,
    column: &str,
    raw: Option<String>,
) -> Result<Option<Value>, CoreError> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| CoreError::DatabaseError {
            operation: format!("decode {}", column),
            details: format!("instance '{}': {}", instance_id, e),
        })
}

pub(crate) fn encode_json(value: &Value) -> String {
    value.to_string()
}

/// Checkpoint columns stored as JSON text.
pub(crate) struct EncodedCheckpoint {
    pub completed_node_ids: String,
    pub failed_node_ids: String,
    pub node_outputs: String,
    pub context_snapshot: String,
}

pub(crate) fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<EncodedCheckpoint, CoreError> {
    let fail = |e: serde_json::Error| CoreError::CheckpointSaveFailed {
        instance_id: checkpoint.instance_id.clone(),
        reason: e.to_string(),
    };
    Ok(EncodedCheckpoint {
        completed_node_ids: serde_json::to_string(&checkpoint.completed_node_ids).map_err(fail)?,
        failed_node_ids: serde_json::to_string(&checkpoint.failed_node_ids).map_err(fail)?,
        node_outputs: serde_json::to_string(&checkpoint.node_outputs).map_err(fail)?,
        context_snapshot: encode_json(&checkpoint.context_snapshot),
    })
}

/// Raw checkpoint columns as read from either backend.
pub(crate) struct RawCheckpoint {
    pub instance_id: String,
    pub completed_node_ids: String,
    pub failed_node_ids: String,
    pub current_node_id: Option<String>,
    pub node_outputs: String,
    pub context_snapshot: String,
    pub sequence: i64,
    pub saved_at: DateTime<Utc>,
}

impl RawCheckpoint {
    pub(crate) fn decode(self) -> Result<Checkpoint, CoreError> {
        let instance_id = self.instance_id;
        let corrupt = |column: &str, e: serde_json::Error| CoreError::CheckpointCorrupt {
            instance_id: instance_id.clone(),
            reason: format!("{}: {}", column, e),
        };
        let completed_node_ids = serde_json::from_str(&self.completed_node_ids)
            .map_err(|e| corrupt("completed_node_ids", e))?;
        let failed_node_ids = serde_json::from_str(&self.failed_node_ids)
            .map_err(|e| corrupt("failed_node_ids", e))?;
        let node_outputs =
            serde_json::from_str(&self.node_outputs).map_err(|e| corrupt("node_outputs", e))?;
        let context_snapshot = serde_json::from_str(&self.context_snapshot)
            .map_err(|e| corrupt("context_snapshot", e))?;
        Ok(Checkpoint {
            instance_id,
            completed_node_ids,
            failed_node_ids,
            current_node_id: self.current_node_id,
            node_outputs,
            context_snapshot,
            sequence: self.sequence,
            saved_at: self.saved_at,
        })
    }
}
