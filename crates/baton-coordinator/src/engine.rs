// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary between the coordinator and the workflow execution engine.
//!
//! The engine runs steps; the coordinator owns locks, checkpoints and status.
//! They meet through two traits:
//!
//! - [`ExecutionEngine`]: called by the coordinator to start or resume an
//!   instance.
//! - [`StepListener`]: called by the engine around every step so progress is
//!   durable before the engine moves on.
//!
//! Engines must check [`ExecutionContext::step_boundary`] before each step;
//! that is where ownership loss and administrative signals are observed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use baton_core::Checkpoint;
use baton_core::persistence::SignalType;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// State an engine needs to continue an interrupted instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Nodes that must not run again.
    pub completed_node_ids: BTreeSet<String>,
    /// Nodes whose last attempt failed.
    pub failed_node_ids: BTreeSet<String>,
    /// Shared context at the last save.
    pub context_snapshot: Value,
    /// Node that was executing when progress was last saved.
    pub current_node_id: Option<String>,
    /// Outputs of completed nodes.
    pub node_outputs: BTreeMap<String, Value>,
}

impl From<Checkpoint> for ResumePoint {
    fn from(cp: Checkpoint) -> Self {
        Self {
            completed_node_ids: cp.completed_node_ids,
            failed_node_ids: cp.failed_node_ids,
            context_snapshot: cp.context_snapshot,
            current_node_id: cp.current_node_id,
            node_outputs: cp.node_outputs,
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// All nodes completed.
    Completed {
        /// Workflow output.
        output: Value,
    },
    /// Stopped at a step boundary after a pause signal.
    Paused,
    /// Stopped at a step boundary after a cancel signal.
    Cancelled,
    /// The execution lock was lost; no further side effects were made.
    OwnershipLost,
    /// A node failed permanently.
    Failed {
        /// Failing node, if the failure is tied to one.
        node_id: Option<String>,
        /// Failure reason.
        reason: String,
    },
}

/// Callbacks the engine makes around each step.
#[async_trait]
pub trait StepListener: Send + Sync {
    /// A node is about to run.
    async fn on_step_started(&self, instance_id: &str, node_id: &str) -> Result<()>;

    /// A node finished. Returns once the checkpoint is durable.
    async fn on_step_completed(
        &self,
        instance_id: &str,
        node_id: &str,
        output: Value,
        context: &Value,
    ) -> Result<()>;

    /// A node attempt failed.
    async fn on_step_failed(&self, instance_id: &str, node_id: &str, reason: &str) -> Result<()>;

    /// Take the pending administrative signal, if any.
    async fn poll_signal(&self, instance_id: &str) -> Result<Option<SignalType>>;
}

/// Everything an engine gets for one execution.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Instance being executed.
    pub instance_id: String,
    /// Workflow definition reference.
    pub definition_ref: String,
    /// Input data supplied at creation.
    pub input: Option<Value>,
    /// Cancelled when the execution lock is lost or the node shuts down.
    pub cancel: CancellationToken,
    /// Progress sink.
    pub listener: Arc<dyn StepListener>,
}

impl ExecutionContext {
    /// Check for ownership loss and pending signals between steps.
    ///
    /// Returns the outcome to stop with, or `None` to continue.
    pub async fn step_boundary(&self) -> Result<Option<ExecutionOutcome>> {
        if self.cancel.is_cancelled() {
            return Ok(Some(ExecutionOutcome::OwnershipLost));
        }
        let outcome = match self.listener.poll_signal(&self.instance_id).await? {
            Some(SignalType::Pause) => Some(ExecutionOutcome::Paused),
            Some(SignalType::Cancel) => Some(ExecutionOutcome::Cancelled),
            Some(SignalType::Resume) | None => None,
        };
        Ok(outcome)
    }
}

/// Executes workflow instances.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run an instance from the start.
    async fn execute_workflow(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome>;

    /// Continue an instance, skipping `resume.completed_node_ids`.
    async fn resume_from_breakpoint(
        &self,
        ctx: ExecutionContext,
        resume: ResumePoint,
    ) -> Result<ExecutionOutcome>;
}
