// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for baton-coordinator.

use thiserror::Error;

/// Coordinator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] baton_core::config::ConfigError),

    /// Store or lock operation failed.
    #[error("Core error: {0}")]
    Core(#[from] baton_core::error::CoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// The requested transition is not allowed from the instance's status.
    #[error("Instance {instance_id} is {status}, cannot {action}")]
    InvalidState {
        /// The instance ID.
        instance_id: String,
        /// Current status.
        status: String,
        /// Attempted action.
        action: &'static str,
    },

    /// The execution lock is held by a live owner elsewhere.
    #[error("Execution lock for {0} is held by another owner")]
    LockUnavailable(String),

    /// This process no longer owns the instance.
    #[error("Ownership of {0} was lost")]
    OwnershipLost(String),

    /// Workflow definition is not registered with the engine.
    #[error("Unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// Workflow definition is malformed (cycle, missing dependency).
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Engine failure.
    #[error("Engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Core(e) => e.is_transient(),
            Error::LockUnavailable(_) => true,
            _ => false,
        }
    }

    /// Whether this node no longer owns the instance it was working on,
    /// either locally or as reported by the store.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            Error::OwnershipLost(_)
                | Error::Core(baton_core::error::CoreError::OwnershipLost { .. })
        )
    }
}

/// Result type using coordinator Error.
pub type Result<T> = std::result::Result<T, Error>;
