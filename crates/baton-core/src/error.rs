// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for baton-core.
//!
//! Store failures are classified at the boundary so callers can tell a lost
//! race or a busy database (retry with backoff) from a genuine defect.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during coordination operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in the store.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Instance already exists (duplicate creation).
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Instance is in an invalid state for the requested operation.
    InvalidInstanceState {
        /// The instance ID.
        instance_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// No checkpoint exists for the instance.
    CheckpointNotFound {
        /// The instance ID.
        instance_id: String,
    },

    /// Checkpoint save failed.
    CheckpointSaveFailed {
        /// The instance ID.
        instance_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Stored checkpoint could not be decoded.
    CheckpointCorrupt {
        /// The instance ID.
        instance_id: String,
        /// What could not be decoded.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The write was rejected because the instance is assigned to another owner.
    OwnershipLost {
        /// The instance ID.
        instance_id: String,
        /// The owner that attempted the write.
        owner: String,
    },

    /// The lock manager no longer accepts acquisitions (node is shutting down).
    ShuttingDown,

    /// The store rejected the operation because of contention
    /// (serialization failure, deadlock, lock timeout, busy database, racing insert).
    StoreConflict {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The store could not be reached (pool timeout, connection reset).
    StoreUnavailable {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::CheckpointSaveFailed { .. } => "CHECKPOINT_SAVE_FAILED",
            Self::CheckpointCorrupt { .. } => "CHECKPOINT_CORRUPT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::OwnershipLost { .. } => "OWNERSHIP_LOST",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::StoreConflict { .. } => "STORE_CONFLICT",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreConflict { .. } | Self::StoreUnavailable { .. }
        )
    }

    /// Classify a sqlx error raised while performing `operation`.
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        let details = err.to_string();
        let operation = operation.to_string();
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::StoreUnavailable { operation, details }
            }
            sqlx::Error::Database(db) => {
                let code = db.code();
                if code.as_deref().is_some_and(is_conflict_code) {
                    Self::StoreConflict { operation, details }
                } else {
                    Self::DatabaseError { operation, details }
                }
            }
            _ => Self::DatabaseError { operation, details },
        }
    }
}

/// `map_err` adapter tagging a sqlx error with the failing operation.
pub(crate) fn db_err(operation: &'static str) -> impl Fn(sqlx::Error) -> CoreError {
    move |e| CoreError::from_sqlx(operation, e)
}

/// Postgres SQLSTATEs and SQLite (extended) result codes that signal contention.
fn is_conflict_code(code: &str) -> bool {
    matches!(
        code,
        // Postgres: unique_violation, serialization_failure, deadlock_detected,
        // lock_not_available, query_canceled (statement/lock timeout)
        "23505" | "40001" | "40P01" | "55P03" | "57014"
        // SQLite: BUSY, LOCKED, BUSY_RECOVERY, LOCKED_SHAREDCACHE, BUSY_SNAPSHOT,
        // CONSTRAINT_PRIMARYKEY, CONSTRAINT_UNIQUE
        | "5" | "6" | "261" | "262" | "517" | "1555" | "2067"
    )
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::InstanceAlreadyExists { instance_id } => {
                write!(f, "Instance '{}' already exists", instance_id)
            }
            Self::InvalidInstanceState {
                instance_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Instance '{}' is in invalid state: expected '{}', got '{}'",
                    instance_id, expected, actual
                )
            }
            Self::CheckpointNotFound { instance_id } => {
                write!(f, "No checkpoint found for instance '{}'", instance_id)
            }
            Self::CheckpointSaveFailed {
                instance_id,
                reason,
            } => {
                write!(
                    f,
                    "Failed to save checkpoint for instance '{}': {}",
                    instance_id, reason
                )
            }
            Self::CheckpointCorrupt {
                instance_id,
                reason,
            } => {
                write!(
                    f,
                    "Checkpoint for instance '{}' is corrupt: {}",
                    instance_id, reason
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::OwnershipLost { instance_id, owner } => {
                write!(
                    f,
                    "Instance '{}' is no longer owned by '{}'",
                    instance_id, owner
                )
            }
            Self::ShuttingDown => write!(f, "Lock manager is shutting down"),
            Self::StoreConflict { operation, details } => {
                write!(f, "Store conflict during '{}': {}", operation, details)
            }
            Self::StoreUnavailable { operation, details } => {
                write!(f, "Store unavailable during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::from_sqlx("query", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
