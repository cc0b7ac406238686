// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Every expiry comparison uses the server's `NOW()`, so nodes with skewed
//! clocks still agree on whether a lease is live.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::checkpoint::Checkpoint;
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

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a `postgres://` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(db_err("connect"))?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self::new(pool))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct LockRow {
    key: String,
    owner: String,
    lock_type: String,
    expires_at: DateTime<Utc>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LockRow> for LockRecord {
    type Error = CoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        Ok(LockRecord {
            lock_type: LockType::from_str(&row.lock_type)?,
            key: row.key,
            owner: row.owner,
            expires_at: row.expires_at,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    definition_ref: String,
    status: String,
    assigned_owner: Option<String>,
    updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
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
            updated_at: row.updated_at,
            created_at: row.created_at,
            finished_at: row.finished_at,
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
    saved_at: DateTime<Utc>,
}

impl From<CheckpointRow> for RawCheckpoint {
    fn from(row: CheckpointRow) -> Self {
        RawCheckpoint {
            instance_id: row.instance_id,
            completed_node_ids: row.completed_node_ids,
            failed_node_ids: row.failed_node_ids,
            current_node_id: row.current_node_id,
            node_outputs: row.node_outputs,
            context_snapshot: row.context_snapshot,
            sequence: row.sequence,
            saved_at: row.saved_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SignalRow {
    instance_id: String,
    signal_type: String,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("try_acquire_lock"))?;

        let live: Option<bool> =
            sqlx::query_scalar("SELECT expires_at > NOW() FROM locks WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("try_acquire_lock"))?;

        let won = match live {
            Some(true) => false,
            Some(false) => {
                sqlx::query(
                    r#"
                    UPDATE locks
                    SET owner = $2,
                        lock_type = $3,
                        expires_at = NOW() + make_interval(secs => $4),
                        version = version + 1,
                        updated_at = NOW()
                    WHERE key = $1
                    "#,
                )
                .bind(key)
                .bind(owner)
                .bind(lock_type.as_str())
                .bind(ttl.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(db_err("try_acquire_lock"))?;
                true
            }
            None => {
                // A racing inserter blocks on the primary key and then does nothing.
                let result = sqlx::query(
                    r#"
                    INSERT INTO locks (key, owner, lock_type, expires_at, version, updated_at)
                    VALUES ($1, $2, $3, NOW() + make_interval(secs => $4), 1, NOW())
                    ON CONFLICT (key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(owner)
                .bind(lock_type.as_str())
                .bind(ttl.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(db_err("try_acquire_lock"))?;
                result.rows_affected() == 1
            }
        };

        tx.commit().await.map_err(db_err("try_acquire_lock"))?;
        Ok(won)
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE locks
            SET expires_at = NOW() + make_interval(secs => $3),
                version = version + 1,
                updated_at = NOW()
            WHERE key = $1 AND owner = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err("renew_lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err("release_lock"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, key: &str) -> Result<Option<LockRecord>, CoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT key, owner, lock_type, expires_at, version, updated_at FROM locks WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_lock"))?;

        row.map(LockRecord::try_from).transpose()
    }

    async fn is_lock_live(&self, key: &str) -> Result<bool, CoreError> {
        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM locks WHERE key = $1 AND expires_at > NOW())",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("is_lock_live"))?;

        Ok(live)
    }

    async fn reap_expired_locks(&self, limit: u32) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM locks
            WHERE key IN (
                SELECT key FROM locks
                WHERE expires_at <= NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await
        .map_err(db_err("reap_expired_locks"))?;

        Ok(result.rows_affected())
    }

    async fn store_now(&self) -> Result<DateTime<Utc>, CoreError> {
        sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("store_now"))
    }

    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError> {
        let sql = format!(
            r#"
            INSERT INTO workflow_instances (id, definition_ref, status, assigned_owner, input_data)
            VALUES ($1, $2, $5, $3, $4)
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(&instance.id)
            .bind(&instance.definition_ref)
            .bind(&instance.assigned_owner)
            .bind(instance.input_data.as_ref().map(encode_json))
            .bind(instance.status.as_str())
            .fetch_one(&self.pool)
            .await;

        match row {
            Ok(row) => InstanceRecord::try_from(row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::InstanceAlreadyExists {
                    instance_id: instance.id.clone(),
                })
            }
            Err(e) => Err(CoreError::from_sqlx("create_instance", e)),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM workflow_instances WHERE id = $1",
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
            SET status = $1,
                error = COALESCE($2, error),
                updated_at = NOW(),
                finished_at = CASE WHEN $3 THEN NOW() ELSE finished_at END
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
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
            SET status = $1,
                updated_at = NOW(),
                finished_at = CASE WHEN $2 THEN NOW() ELSE finished_at END
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(to.as_str())
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
            SET status = $1,
                output = $2,
                error = $3,
                updated_at = NOW(),
                finished_at = CASE WHEN $4 THEN NOW() ELSE finished_at END
            WHERE id = $5 AND status = 'running'
              AND ($6::text IS NULL OR assigned_owner = $6)
            "#,
        )
        .bind(status.as_str())
        .bind(output.map(encode_json))
        .bind(error)
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
            "UPDATE workflow_instances SET assigned_owner = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(owner)
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
            SET updated_at = NOW()
            WHERE id = $1 AND assigned_owner = $2 AND status = 'running'
            "#,
        )
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
            SET context_data = $1,
                last_attempted_node = COALESCE($2, last_attempted_node),
                updated_at = NOW()
            WHERE id = $3 AND assigned_owner = $4
            "#,
        )
        .bind(encode_json(context_data))
        .bind(last_attempted_node)
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
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT i.id
            FROM workflow_instances i
            WHERE i.status = 'running'
              AND i.updated_at < NOW() - make_interval(secs => $1)
              AND NOT EXISTS (
                  SELECT 1 FROM locks l
                  WHERE l.key = 'execution:' || i.id AND l.expires_at > NOW()
              )
            ORDER BY i.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(threshold.as_secs_f64())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("find_suspected_abandoned"))
    }

    async fn increment_recovery_attempts(&self, instance_id: &str) -> Result<i32, CoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE workflow_instances
            SET recovery_attempts = recovery_attempts + 1
            WHERE id = $1
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
        let sql = format!(
            r#"
            SELECT {}
            FROM workflow_instances
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
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
            VALUES ($1, $2, NOW())
            ON CONFLICT (instance_id) DO UPDATE SET
                signal_type = EXCLUDED.signal_type,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(instance_id)
        .bind(signal_type.as_str())
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
            WHERE instance_id = $1
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
                created_at: row.created_at,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        owner: &str,
    ) -> Result<Checkpoint, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("save_checkpoint"))?;

        // FOR SHARE holds off a concurrent reassignment until commit.
        let owned: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM workflow_instances WHERE id = $1 AND assigned_owner = $2 FOR SHARE",
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

        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("save_checkpoint"))?;

        let sql = format!(
            "SELECT {} FROM workflow_checkpoints WHERE instance_id = $1 FOR UPDATE",
            CHECKPOINT_COLUMNS
        );
        let existing = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(&checkpoint.instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("save_checkpoint"))?;

        let mut merged = match existing {
            Some(row) => RawCheckpoint::from(row).decode()?,
            None => Checkpoint::new(checkpoint.instance_id.clone()),
        };
        merged.merge(checkpoint, now);
        let encoded = encode_checkpoint(&merged)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints
                (instance_id, completed_node_ids, failed_node_ids, current_node_id,
                 node_outputs, context_snapshot, sequence, saved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                completed_node_ids = EXCLUDED.completed_node_ids,
                failed_node_ids = EXCLUDED.failed_node_ids,
                current_node_id = EXCLUDED.current_node_id,
                node_outputs = EXCLUDED.node_outputs,
                context_snapshot = EXCLUDED.context_snapshot,
                sequence = EXCLUDED.sequence,
                saved_at = EXCLUDED.saved_at
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
            "SELECT {} FROM workflow_checkpoints WHERE instance_id = $1",
            CHECKPOINT_COLUMNS
        );
        let row = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load_checkpoint"))?;

        row.map(|row| RawCheckpoint::from(row).decode()).transpose()
    }

    async fn reset_checkpoint(&self, instance_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM workflow_checkpoints WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("reset_checkpoint"))?;

        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("health_check"))?;
        Ok(row.0 == 1)
    }
}
