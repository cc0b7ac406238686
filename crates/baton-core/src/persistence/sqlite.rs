// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are stored as epoch milliseconds and "now" comes from the
//! injected [`Clock`]. Lock acquisition is a single conditional upsert, which
//! SQLite runs as its own write transaction, so two acquirers are serialised
//! by the database write lock.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::checkpoint::Checkpoint;
use crate::clock::{SharedClock, SystemClock};
use crate::error::{CoreError, db_err};
use crate::migrations;

use super::{
    InstanceRecord, InstanceStatus, LockRecord, LockType, NewInstance, Persistence,
    RawCheckpoint, SignalRecord, SignalType, decode_json, encode_checkpoint, encode_json,
};

const INSTANCE_COLUMNS: &str = "id, definition_ref, status, assigned_owner, updated_at, \
     created_at, finished_at, input_data, context_data, output, error, last_attempted_node, \
     recovery_attempts";

const CHECKPOINT_COLUMNS: &str = "instance_id, completed_node_ids, failed_node_ids, \
     current_node_id, node_outputs, context_snapshot, sequence, saved_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqlitePersistence {
    /// Wrap an already migrated pool, using the system clock.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Wrap an already migrated pool with an explicit clock.
    pub fn with_clock(pool: SqlitePool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases get a single connection, since every connection
    /// to `sqlite::memory:` is a separate database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err("connect"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self::new(pool))
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Replace the clock used for lease arithmetic.
    pub fn set_clock(&mut self, clock: SharedClock) {
        self.clock = clock;
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct LockRow {
    key: String,
    owner: String,
    lock_type: String,
    expires_at: i64,
    version: i64,
    updated_at: i64,
}

impl TryFrom<LockRow> for LockRecord {
    type Error = CoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        Ok(LockRecord {
            lock_type: LockType::from_str(&row.lock_type)?,
            key: row.key,
            owner: row.owner,
            expires_at: from_ms(row.expires_at),
            version: row.version,
            updated_at: from_ms(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    definition_ref: String,
    status: String,
    assigned_owner: Option<String>,
    updated_at: i64,
    created_at: i64,
    finished_at: Option<i64>,
    input_data: Option<String>,
    context_data: Option<String>,
    output: Option<String>,
    error: Option<String>,
    last_attempted_node: Option<String>,
    recovery_attempts: i32,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(InstanceRecord {
            status: InstanceStatus::from_str(&row.status)?,
            input_data: decode_json(&row.id, "input_data", row.input_data)?,
            context_data: decode_json(&row.id, "context_data", row.context_data)?,
            output: decode_json(&row.id, "output", row.output)?,
            id: row.id,
            definition_ref: row.definition_ref,
            assigned_owner: row.assigned_owner,
            updated_at: from_ms(row.updated_at),
            created_at: from_ms(row.created_at),
            finished_at: row.finished_at.map(from_ms),
            error: row.error,
            last_attempted_node: row.last_attempted_node,
            recovery_attempts: row.recovery_attempts,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    instance_id: String,
    completed_node_ids: String,
    failed_node_ids: String,
    current_node_id: Option<String>,
    node_outputs: String,
    context_snapshot: String,
    sequence: i64,
    saved_at: i64,
}

impl CheckpointRow {
    fn decode(self) -> Result<Checkpoint, CoreError> {
        RawCheckpoint {
            instance_id: self.instance_id,
            completed_node_ids: self.completed_node_ids,
            failed_node_ids: self.failed_node_ids,
            current_node_id: self.current_node_id,
            node_outputs: self.node_outputs,
            context_snapshot: self.context_snapshot,
            sequence: self.sequence,
            saved_at: from_ms(self.saved_at),
        }
        .decode()
    }
}

#[derive(sqlx::FromRow)]
struct SignalRow {
    instance_id: String,
    signal_type: String,
    created_at: i64,
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = self.now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO locks (key, owner, lock_type, expires_at, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT (key) DO UPDATE SET
                owner = excluded.owner,
                lock_type = excluded.lock_type,
                expires_at = excluded.expires_at,
                version = locks.version + 1,
                updated_at = excluded.updated_at
            WHERE locks.expires_at <= ?5
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(lock_type.as_str())
        .bind(now.saturating_add(millis(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("try_acquire_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError> {
        let now = self.now_ms();
        let result = sqlx::query(
            r#"
            UPDATE locks
            SET expires_at = ?1, version = version + 1, updated_at = ?2
            WHERE key = ?3 AND owner = ?4 AND expires_at > ?2
            "#,
        )
        .bind(now.saturating_add(millis(ttl)))
        .bind(now)
        .bind(key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err("renew_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = ?1 AND owner = ?2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err("release_lock"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, key: &str) -> Result<Option<LockRecord>, CoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT key, owner, lock_type, expires_at, version, updated_at FROM locks WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_lock"))?;

        row.map(LockRecord::try_from).transpose()
    }

    async fn is_lock_live(&self, key: &str) -> Result<bool, CoreError> {
        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM locks WHERE key = ?1 AND expires_at > ?2)",
        )
        .bind(key)
        .bind(self.now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("is_lock_live"))?;

        Ok(live)
    }

    async fn reap_expired_locks(&self, limit: u32) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM locks
            WHERE key IN (SELECT key FROM locks WHERE expires_at <= ?1 LIMIT ?2)
            "#,
        )
        .bind(self.now_ms())
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await
        .map_err(db_err("reap_expired_locks"))?;

        Ok(result.rows_affected())
    }

    async fn store_now(&self) -> Result<DateTime<Utc>, CoreError> {
        Ok(from_ms(self.now_ms()))
    }

    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError> {
        let now = self.now_ms();
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, definition_ref, status, assigned_owner, updated_at, created_at, input_data)
            VALUES (?1, ?2, ?6, ?3, ?4, ?4, ?5)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.definition_ref)
        .bind(&instance.assigned_owner)
        .bind(now)
        .bind(instance.input_data.as_ref().map(encode_json))
        .bind(instance.status.as_str())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CoreError::InstanceAlreadyExists {
                    instance_id: instance.id.clone(),
                });
            }
            Err(e) => return Err(CoreError::from_sqlx("create_instance", e)),
        }

        self.get_instance(&instance.id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance.id.clone(),
            })
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM workflow_instances WHERE id = ?1",
            INSTANCE_COLUMNS
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_instance"))?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1,
                error = COALESCE(?2, error),
                updated_at = ?3,
                finished_at = CASE WHEN ?4 THEN ?3 ELSE finished_at END
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(self.now_ms())
        .bind(status.is_terminal())
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("update_instance_status"))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn transition_instance_status(
        &self,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1,
                updated_at = ?2,
                finished_at = CASE WHEN ?3 THEN ?2 ELSE finished_at END
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(to.as_str())
        .bind(self.now_ms())
        .bind(to.is_terminal())
        .bind(instance_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("transition_instance_status"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_instance_if_running(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
        owner: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1,
                output = ?2,
                error = ?3,
                updated_at = ?4,
                finished_at = CASE WHEN ?5 THEN ?4 ELSE finished_at END
            WHERE id = ?6 AND status = 'running'
              AND (?7 IS NULL OR assigned_owner = ?7)
            "#,
        )
        .bind(status.as_str())
        .bind(output.map(encode_json))
        .bind(error)
        .bind(self.now_ms())
        .bind(status.is_terminal())
        .bind(instance_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err("complete_instance_if_running"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn assign_owner(&self, instance_id: &str, owner: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET assigned_owner = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(owner)
        .bind(self.now_ms())
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("assign_owner"))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn touch_instance(&self, instance_id: &str, owner: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET updated_at = ?1
            WHERE id = ?2 AND assigned_owner = ?3 AND status = 'running'
            "#,
        )
        .bind(self.now_ms())
        .bind(instance_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err("touch_instance"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_instance_progress(
        &self,
        instance_id: &str,
        owner: &str,
        context_data: &Value,
        last_attempted_node: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET context_data = ?1,
                last_attempted_node = COALESCE(?2, last_attempted_node),
                updated_at = ?3
            WHERE id = ?4 AND assigned_owner = ?5
            "#,
        )
        .bind(encode_json(context_data))
        .bind(last_attempted_node)
        .bind(self.now_ms())
        .bind(instance_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err("update_instance_progress"))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::OwnershipLost {
                instance_id: instance_id.to_string(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    async fn find_suspected_abandoned(
        &self,
        threshold: Duration,
        limit: u32,
    ) -> Result<Vec<String>, CoreError> {
        let now = self.now_ms();
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT i.id
            FROM workflow_instances i
            WHERE i.status = 'running'
              AND i.updated_at < ?1
              AND NOT EXISTS (
                  SELECT 1 FROM locks l
                  WHERE l.key = 'execution:' || i.id AND l.expires_at > ?2
              )
            ORDER BY i.updated_at ASC
            LIMIT ?3
            "#,
        )
        .bind(now.saturating_sub(millis(threshold)))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("find_suspected_abandoned"))?;

        Ok(ids)
    }

    async fn increment_recovery_attempts(&self, instance_id: &str) -> Result<i32, CoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE workflow_instances
            SET recovery_attempts = recovery_attempts + 1
            WHERE id = ?1
            RETURNING recovery_attempts
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("increment_recovery_attempts"))?;

        attempts.ok_or_else(|| CoreError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM workflow_instances WHERE status = ?1 \
                     ORDER BY created_at DESC LIMIT ?2",
                    INSTANCE_COLUMNS
                );
                sqlx::query_as::<_, InstanceRow>(&sql)
                    .bind(status.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM workflow_instances ORDER BY created_at DESC LIMIT ?1",
                    INSTANCE_COLUMNS
                );
                sqlx::query_as::<_, InstanceRow>(&sql)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err("list_instances"))?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn insert_signal(
        &self,
        instance_id: &str,
        signal_type: SignalType,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_signals (instance_id, signal_type, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (instance_id) DO UPDATE SET
                signal_type = excluded.signal_type,
                created_at = excluded.created_at
            "#,
        )
        .bind(instance_id)
        .bind(signal_type.as_str())
        .bind(self.now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err("insert_signal"))?;

        Ok(())
    }

    async fn take_pending_signal(
        &self,
        instance_id: &str,
    ) -> Result<Option<SignalRecord>, CoreError> {
        let row = sqlx::query_as::<_, SignalRow>(
            r#"
            DELETE FROM workflow_signals
            WHERE instance_id = ?1
            RETURNING instance_id, signal_type, created_at
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("take_pending_signal"))?;

        row.map(|row| {
            Ok(SignalRecord {
                signal_type: SignalType::from_str(&row.signal_type)?,
                instance_id: row.instance_id,
                created_at: from_ms(row.created_at),
            })
        })
        .transpose()
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        owner: &str,
    ) -> Result<Checkpoint, CoreError> {
        let now = self.now_ms();
        let mut tx = self.pool.begin().await.map_err(db_err("save_checkpoint"))?;

        let owned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM workflow_instances WHERE id = ?1 AND assigned_owner = ?2",
        )
        .bind(&checkpoint.instance_id)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("save_checkpoint"))?;
        if owned.is_none() {
            return Err(CoreError::OwnershipLost {
                instance_id: checkpoint.instance_id.clone(),
                owner: owner.to_string(),
            });
        }

        let sql = format!(
            "SELECT {} FROM workflow_checkpoints WHERE instance_id = ?1",
            CHECKPOINT_COLUMNS
        );
        let existing = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(&checkpoint.instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("save_checkpoint"))?;

        let mut merged = match existing {
            Some(row) => row.decode()?,
            None => Checkpoint::new(checkpoint.instance_id.clone()),
        };
        merged.merge(checkpoint, from_ms(now));
        let encoded = encode_checkpoint(&merged)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints
                (instance_id, completed_node_ids, failed_node_ids, current_node_id,
                 node_outputs, context_snapshot, sequence, saved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (instance_id) DO UPDATE SET
                completed_node_ids = excluded.completed_node_ids,
                failed_node_ids = excluded.failed_node_ids,
                current_node_id = excluded.current_node_id,
                node_outputs = excluded.node_outputs,
                context_snapshot = excluded.context_snapshot,
                sequence = excluded.sequence,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(&merged.instance_id)
        .bind(&encoded.completed_node_ids)
        .bind(&encoded.failed_node_ids)
        .bind(&merged.current_node_id)
        .bind(&encoded.node_outputs)
        .bind(&encoded.context_snapshot)
        .bind(merged.sequence)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::CheckpointSaveFailed {
            instance_id: merged.instance_id.clone(),
            reason: e.to_string(),
        })?;

        tx.commit().await.map_err(db_err("save_checkpoint"))?;
        Ok(merged)
    }

    async fn load_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>, CoreError> {
        let sql = format!(
            "SELECT {} FROM workflow_checkpoints WHERE instance_id = ?1",
            CHECKPOINT_COLUMNS
        );
        let row = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load_checkpoint"))?;

        row.map(CheckpointRow::decode).transpose()
    }

    async fn reset_checkpoint(&self, instance_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM workflow_checkpoints WHERE instance_id = ?1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("reset_checkpoint"))?;

        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("health_check"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(30);

    /// In-memory store with a frozen clock.
    async fn test_store() -> (SqlitePersistence, ManualClock) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        let clock = ManualClock::new(
            DateTime::from_timestamp_millis(1_750_000_000_000).expect("valid timestamp"),
        );
        let store = SqlitePersistence::with_clock(pool, Arc::new(clock.clone()));
        (store, clock)
    }

    async fn running_instance(store: &SqlitePersistence, owner: &str) -> String {
        let id = Uuid::new_v4().to_string();
        store
            .create_instance(&NewInstance {
                id: id.clone(),
                definition_ref: "etl:v1".to_string(),
                input_data: Some(json!({"source": "s3://bucket"})),
                assigned_owner: Some(owner.to_string()),
                status: InstanceStatus::Running,
            })
            .await
            .expect("Failed to create instance");
        id
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_while_live() {
        let (store, clock) = test_store().await;

        assert!(
            store
                .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_acquire_lock("execution:a", "node-b", LockType::Execution, TTL)
                .await
                .unwrap()
        );
        // A live lock is not re-entrant, not even for its owner.
        assert!(
            !store
                .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
                .await
                .unwrap()
        );

        clock.advance(Duration::from_secs(29));
        assert!(store.is_lock_live("execution:a").await.unwrap());
        assert!(
            !store
                .try_acquire_lock("execution:a", "node-b", LockType::Execution, TTL)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_lock_is_free_at_expiry() {
        let (store, clock) = test_store().await;

        store
            .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
            .await
            .unwrap();
        clock.advance(TTL);

        assert!(!store.is_lock_live("execution:a").await.unwrap());
        assert!(
            store
                .try_acquire_lock("execution:a", "node-b", LockType::Execution, TTL)
                .await
                .unwrap()
        );

        let lock = store.get_lock("execution:a").await.unwrap().unwrap();
        assert_eq!(lock.owner, "node-b");
        assert_eq!(lock.version, 2);
        assert_eq!(lock.lock_type, LockType::Execution);

        // The previous owner has lost the lease for good.
        assert!(!store.renew_lock("execution:a", "node-a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (store, _clock) = test_store().await;

        let attempts = (0..8).map(|i| {
            let store = store.clone();
            async move {
                store
                    .try_acquire_lock(
                        "resource:nightly",
                        &format!("node-{}", i),
                        LockType::Resource,
                        TTL,
                    )
                    .await
                    .unwrap()
            }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_owner() {
        let (store, clock) = test_store().await;

        store
            .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(18));
        assert!(store.renew_lock("execution:a", "node-a", TTL).await.unwrap());
        assert!(!store.renew_lock("execution:a", "node-b", TTL).await.unwrap());

        // 18s + 18s is past the original expiry, but inside the renewed one.
        clock.advance(Duration::from_secs(18));
        assert!(store.is_lock_live("execution:a").await.unwrap());

        let lock = store.get_lock("execution:a").await.unwrap().unwrap();
        assert_eq!(lock.version, 2);
        assert_eq!(
            lock.expires_at,
            DateTime::from_timestamp_millis(1_750_000_000_000 + 18_000 + 30_000).unwrap()
        );
    }

    #[tokio::test]
    async fn test_renew_after_expiry_fails_even_without_thief() {
        let (store, clock) = test_store().await;

        store
            .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));

        assert!(!store.renew_lock("execution:a", "node-a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_owner_scoped() {
        let (store, _clock) = test_store().await;

        store
            .try_acquire_lock("execution:a", "node-a", LockType::Execution, TTL)
            .await
            .unwrap();

        assert!(!store.release_lock("execution:a", "node-b").await.unwrap());
        assert!(store.is_lock_live("execution:a").await.unwrap());

        assert!(store.release_lock("execution:a", "node-a").await.unwrap());
        assert!(!store.release_lock("execution:a", "node-a").await.unwrap());
        assert!(store.get_lock("execution:a").await.unwrap().is_none());

        // Released locks are immediately available.
        assert!(
            store
                .try_acquire_lock("execution:a", "node-b", LockType::Execution, TTL)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_reap_expired_locks() {
        let (store, clock) = test_store().await;

        for key in ["resource:a", "resource:b", "resource:c"] {
            store
                .try_acquire_lock(key, "node-a", LockType::Resource, Duration::from_secs(5))
                .await
                .unwrap();
        }
        store
            .try_acquire_lock("resource:d", "node-a", LockType::Resource, TTL)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.reap_expired_locks(2).await.unwrap(), 2);
        assert_eq!(store.reap_expired_locks(100).await.unwrap(), 1);
        assert_eq!(store.reap_expired_locks(100).await.unwrap(), 0);
        assert!(store.get_lock("resource:d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_instance_rejects_duplicates() {
        let (store, _clock) = test_store().await;
        let new = NewInstance {
            id: "dup".to_string(),
            definition_ref: "etl:v1".to_string(),
            input_data: None,
            assigned_owner: None,
            status: InstanceStatus::Pending,
        };

        let created = store.create_instance(&new).await.unwrap();
        assert_eq!(created.status, InstanceStatus::Pending);
        assert_eq!(created.recovery_attempts, 0);

        let err = store.create_instance(&new).await.unwrap_err();
        assert!(matches!(err, CoreError::InstanceAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_create_instance_directly_running() {
        let (store, _clock) = test_store().await;
        let created = store
            .create_instance(&NewInstance {
                id: "direct".to_string(),
                definition_ref: "etl:v1".to_string(),
                input_data: Some(json!({})),
                assigned_owner: Some("node-a".to_string()),
                status: InstanceStatus::Running,
            })
            .await
            .unwrap();

        assert_eq!(created.status, InstanceStatus::Running);
        assert_eq!(created.assigned_owner.as_deref(), Some("node-a"));
        assert!(
            store
                .list_instances(Some(InstanceStatus::Pending), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        assert!(
            !store
                .transition_instance_status(&id, InstanceStatus::Paused, InstanceStatus::Running)
                .await
                .unwrap()
        );
        assert!(
            store
                .transition_instance_status(&id, InstanceStatus::Running, InstanceStatus::Paused)
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete_instance_if_running(&id, InstanceStatus::Completed, None, None, None)
                .await
                .unwrap(),
            "paused instances cannot complete"
        );

        store
            .transition_instance_status(&id, InstanceStatus::Paused, InstanceStatus::Running)
            .await
            .unwrap();
        assert!(
            store
                .complete_instance_if_running(
                    &id,
                    InstanceStatus::Completed,
                    Some(&json!({"rows": 10})),
                    None,
                    Some("node-a"),
                )
                .await
                .unwrap()
        );

        let instance = store.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.output, Some(json!({"rows": 10})));
        assert!(instance.finished_at.is_some());

        let err = store
            .update_instance_status("missing", InstanceStatus::Failed, Some("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_suspected_abandoned() {
        let (store, clock) = test_store().await;
        let threshold = Duration::from_secs(60);

        let orphan = running_instance(&store, "node-a").await;
        let healthy = running_instance(&store, "node-b").await;
        let locked = running_instance(&store, "node-c").await;
        let paused = running_instance(&store, "node-d").await;
        store
            .update_instance_status(&paused, InstanceStatus::Paused, None)
            .await
            .unwrap();

        // Fresh instances are never suspects.
        assert!(
            store
                .find_suspected_abandoned(threshold, 100)
                .await
                .unwrap()
                .is_empty()
        );

        clock.advance(Duration::from_secs(61));
        // node-b keeps heartbeating; node-c's lock is still live but its heartbeat is stale.
        assert!(store.touch_instance(&healthy, "node-b").await.unwrap());
        store
            .try_acquire_lock(
                &format!("execution:{}", locked),
                "node-c",
                LockType::Execution,
                TTL,
            )
            .await
            .unwrap();

        let suspects = store.find_suspected_abandoned(threshold, 100).await.unwrap();
        assert_eq!(suspects, vec![orphan.clone()]);

        assert!(
            store
                .find_suspected_abandoned(threshold, 0)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_touch_requires_owner_and_running() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        assert!(store.touch_instance(&id, "node-a").await.unwrap());
        assert!(!store.touch_instance(&id, "node-b").await.unwrap());

        store.assign_owner(&id, "node-b").await.unwrap();
        assert!(store.touch_instance(&id, "node-b").await.unwrap());
        assert_eq!(
            store
                .get_instance(&id)
                .await
                .unwrap()
                .unwrap()
                .assigned_owner
                .as_deref(),
            Some("node-b")
        );
    }

    #[tokio::test]
    async fn test_recovery_attempts_counter() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        assert_eq!(store.increment_recovery_attempts(&id).await.unwrap(), 1);
        assert_eq!(store.increment_recovery_attempts(&id).await.unwrap(), 2);
        assert!(store.increment_recovery_attempts("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_save_merges_and_reset_clears() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        assert!(store.load_checkpoint(&id).await.unwrap().is_none());

        let mut first = Checkpoint::new(id.clone());
        first.complete_node("extract", json!({"rows": 3}));
        first.start_node("transform");
        let saved = store.save_checkpoint(&first, "node-a").await.unwrap();
        assert_eq!(saved.sequence, 1);

        // A writer that lost track of "extract" cannot erase it.
        let mut second = Checkpoint::new(id.clone());
        second.complete_node("transform", json!({"rows": 2}));
        second.context_snapshot = json!({"cursor": 2});
        store.save_checkpoint(&second, "node-a").await.unwrap();

        let loaded = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert!(loaded.is_completed("extract"));
        assert!(loaded.is_completed("transform"));
        assert_eq!(loaded.node_outputs.get("extract"), Some(&json!({"rows": 3})));
        assert_eq!(loaded.context_snapshot, json!({"cursor": 2}));
        assert_eq!(loaded.current_node_id, None);
        assert_eq!(loaded.sequence, 2);

        store.reset_checkpoint(&id).await.unwrap();
        assert!(store.load_checkpoint(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_by_previous_owner_are_rejected() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        let mut early = Checkpoint::new(id.clone());
        early.complete_node("extract", json!({"rows": 3}));
        store.save_checkpoint(&early, "node-a").await.unwrap();

        store.assign_owner(&id, "node-b").await.unwrap();

        let mut late = Checkpoint::new(id.clone());
        late.complete_node("transform", json!({"rows": 2}));
        let err = store.save_checkpoint(&late, "node-a").await.unwrap_err();
        assert!(matches!(err, CoreError::OwnershipLost { ref owner, .. } if owner == "node-a"));

        let err = store
            .update_instance_progress(&id, "node-a", &json!({"stale": true}), Some("transform"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "OWNERSHIP_LOST");

        assert!(
            !store
                .complete_instance_if_running(
                    &id,
                    InstanceStatus::Completed,
                    Some(&json!("stale")),
                    None,
                    Some("node-a"),
                )
                .await
                .unwrap()
        );

        let loaded = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert!(loaded.is_completed("extract"));
        assert!(!loaded.is_completed("transform"));
        let record = store.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
        assert_ne!(record.context_data, Some(json!({"stale": true})));

        // The new owner writes as usual.
        store.save_checkpoint(&late, "node-b").await.unwrap();
        store
            .update_instance_progress(&id, "node-b", &json!({"cursor": 2}), Some("transform"))
            .await
            .unwrap();
        assert!(
            store
                .complete_instance_if_running(
                    &id,
                    InstanceStatus::Completed,
                    Some(&json!("done")),
                    None,
                    Some("node-b"),
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_reported() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        store
            .save_checkpoint(&Checkpoint::new(id.clone()), "node-a")
            .await
            .unwrap();
        sqlx::query("UPDATE workflow_checkpoints SET completed_node_ids = '{oops' WHERE instance_id = ?1")
            .bind(&id)
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.load_checkpoint(&id).await.unwrap_err();
        assert_eq!(err.error_code(), "CHECKPOINT_CORRUPT");
    }

    #[tokio::test]
    async fn test_signals_are_consumed_once() {
        let (store, _clock) = test_store().await;
        let id = running_instance(&store, "node-a").await;

        store.insert_signal(&id, SignalType::Pause).await.unwrap();
        store.insert_signal(&id, SignalType::Cancel).await.unwrap();

        let signal = store.take_pending_signal(&id).await.unwrap().unwrap();
        assert_eq!(signal.signal_type, SignalType::Cancel);
        assert!(store.take_pending_signal(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("baton.db");

        let store = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(store.health_check_db().await.unwrap());
        assert!(path.exists());

        store
            .try_acquire_lock("resource:a", "node-a", LockType::Resource, TTL)
            .await
            .unwrap();
        drop(store);

        // Reopening applies no migrations twice and keeps the data.
        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(reopened.is_lock_live("resource:a").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_on_file_pool_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePersistence::from_path(dir.path().join("baton.db"))
            .await
            .unwrap();

        let attempts = (0..16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_acquire_lock(
                        "execution:contended",
                        &format!("node-{}", i),
                        LockType::Execution,
                        TTL,
                    )
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let mut winners = Vec::new();
        for (i, result) in results.into_iter().enumerate() {
            if result.unwrap().unwrap() {
                winners.push(format!("node-{}", i));
            }
        }
        assert_eq!(winners.len(), 1, "winners: {:?}", winners);

        let lock = store.get_lock("execution:contended").await.unwrap().unwrap();
        assert_eq!(lock.owner, winners[0]);
        assert_eq!(lock.version, 1);
    }
}
