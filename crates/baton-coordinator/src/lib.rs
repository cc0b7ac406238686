// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Baton Coordinator - crash recovery for workflow instances
//!
//! Every node runs the same set of workers against a shared database. There
//! is no leader: the lock table decides who executes and who recovers.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────────────────┐
//!  API layer ──────►│     WorkflowCoordinator      │  create / status / pause / resume / cancel
//!                   └──────────────┬───────────────┘
//!                                  │ start(lease)
//!                   ┌──────────────▼───────────────┐     StepListener      ┌─────────────────┐
//!                   │        InstanceRunner        │◄──────────────────────│ ExecutionEngine │
//!                   │  tasks + in-memory checkpoint│──────────────────────►│  (GraphEngine)  │
//!                   └──────────────┬───────────────┘  execute / resume     └─────────────────┘
//!                                  │
//!   ┌──────────────┐  ┌────────────▼─────┐  ┌────────────────┐  ┌───────────┐
//!   │  Heartbeat   │  │   LockManager    │  │FailureDetector │─►│ Recovery  │
//!   │ renew leases │─►│  (baton-core)    │◄─│ scan abandoned │  │Coordinator│
//!   └──────────────┘  └──────────────────┘  └────────────────┘  └───────────┘
//! ```
//!
//! # Guarantees
//!
//! - An instance executes only on the node holding its `execution:<id>` lock.
//! - A node that fails to renew a lease stops executing that instance before
//!   its next step.
//! - A completed node is never re-run after recovery; the checkpoint is
//!   durable before the engine advances.
//! - Recovery of one instance is attempted by at most one node at a time and
//!   at most `max_recovery_attempts` times in total.

#![deny(missing_docs)]

/// Public coordinator API.
pub mod coordinator;

/// Execution engine boundary.
pub mod engine;

/// Error types.
pub mod error;

/// Abandoned-instance detection.
pub mod failure_detector;

/// Reference DAG engine.
pub mod graph_engine;

/// Lease renewal.
pub mod heartbeat;

/// Expired lock cleanup.
pub mod janitor;

/// Crash recovery.
pub mod recovery;

/// Local instance execution.
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Tracing setup.
pub mod telemetry;

pub use coordinator::{AdminAction, InstanceStatusView, WorkflowCoordinator};
pub use engine::{ExecutionContext, ExecutionEngine, ExecutionOutcome, ResumePoint, StepListener};
pub use error::{Error, Result};
pub use graph_engine::{
    GraphEngine, NodeSpec, StepExecutor, StepFailure, StepRequest, WorkflowDefinition,
};
pub use recovery::{RecoveryCoordinator, RecoveryOutcome, RecoveryState};
pub use runtime::{CoordinatorRuntime, shutdown_signal};
