// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference [`ExecutionEngine`] running DAG workflows one node at a time.
//!
//! A [`WorkflowDefinition`] is a list of [`NodeSpec`]s with dependencies.
//! Node bodies are supplied by a [`StepExecutor`]; the engine handles order,
//! per-node retries, resume skipping and step-boundary checks.
//!
//! Each node's output is stored in the shared context under the node id, so
//! the context is always a JSON object:
//!
//! ```text
//! { "extract": {...}, "transform": {...} }
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::engine::{ExecutionContext, ExecutionEngine, ExecutionOutcome, ResumePoint};
use crate::error::{Error, Result};

/// One node of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id, unique within the workflow.
    pub id: String,
    /// Nodes that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Fail the instance instead of re-running the node when a crash
    /// interrupted it mid-step.
    #[serde(default)]
    pub at_most_once: bool,
    /// Attempts before a retryable failure becomes permanent.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    1
}

impl NodeSpec {
    /// Node without dependencies, re-run after an interrupted attempt.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            at_most_once: false,
            max_attempts: default_max_attempts(),
        }
    }

    /// Add a dependency.
    pub fn after(mut self, node_id: impl Into<String>) -> Self {
        self.depends_on.push(node_id.into());
        self
    }

    /// Never start the node a second time once an attempt has begun.
    ///
    /// For steps with side effects that cannot be repeated, such as sending
    /// a payment. An interrupted attempt fails the instance on recovery.
    pub fn at_most_once(mut self) -> Self {
        self.at_most_once = true;
        self
    }

    /// Allow up to `attempts` tries on retryable failures.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// A named DAG of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition reference stored on instances.
    pub id: String,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowDefinition {
    /// Empty workflow.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
        }
    }

    /// Append a node.
    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Topological order of node indices. Ties keep declaration order.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(Error::InvalidDefinition(format!(
                    "{}: duplicate node '{}'",
                    self.id, node.id
                )));
            }
        }

        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(Error::InvalidDefinition(format!(
                        "{}: node '{}' depends on unknown node '{}'",
                        self.id, node.id, dep
                    )));
                };
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::InvalidDefinition(format!(
                "{}: dependency cycle",
                self.id
            )));
        }
        Ok(order)
    }
}

/// Input to a single node execution.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Instance being executed.
    pub instance_id: String,
    /// Node to run.
    pub node_id: String,
    /// 1-based attempt number within this execution.
    pub attempt: u32,
    /// Instance input.
    pub input: Option<Value>,
    /// Shared context, including the outputs of earlier nodes.
    pub context: Value,
}

/// Why a node attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Failure reason.
    pub reason: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl StepFailure {
    /// Failure worth retrying.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Permanent failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Runs node bodies.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute one node and return its output.
    async fn execute(&self, request: StepRequest) -> std::result::Result<Value, StepFailure>;
}

struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    order: Vec<usize>,
    executor: Arc<dyn StepExecutor>,
}

/// Sequential DAG engine.
#[derive(Default)]
pub struct GraphEngine {
    workflows: HashMap<String, RegisteredWorkflow>,
}

impl GraphEngine {
    /// Engine with no workflows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition`, executed by `executor`.
    ///
    /// Fails on cycles, duplicate nodes or unknown dependencies.
    pub fn with_workflow(
        mut self,
        definition: WorkflowDefinition,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Self> {
        let order = definition.execution_order()?;
        self.workflows.insert(
            definition.id.clone(),
            RegisteredWorkflow {
                definition,
                order,
                executor,
            },
        );
        Ok(self)
    }

    /// Whether `definition_ref` is registered.
    pub fn has_workflow(&self, definition_ref: &str) -> bool {
        self.workflows.contains_key(definition_ref)
    }

    async fn run(
        &self,
        ctx: ExecutionContext,
        resume: Option<ResumePoint>,
    ) -> Result<ExecutionOutcome> {
        let workflow = self
            .workflows
            .get(&ctx.definition_ref)
            .ok_or_else(|| Error::UnknownDefinition(ctx.definition_ref.clone()))?;

        let (mut completed, mut context, in_flight) = match resume {
            Some(point) => (
                point.completed_node_ids,
                as_object(point.context_snapshot),
                point.current_node_id,
            ),
            None => (BTreeSet::new(), Map::new(), None),
        };
        let mut last_output = Value::Null;

        for &i in &workflow.order {
            let node = &workflow.definition.nodes[i];
            if completed.contains(&node.id) {
                debug!(instance_id = %ctx.instance_id, node_id = %node.id, "Skipping completed node");
                if let Some(output) = context.get(&node.id) {
                    last_output = output.clone();
                }
                continue;
            }

            if let Some(outcome) = ctx.step_boundary().await? {
                return Ok(outcome);
            }

            if in_flight.as_deref() == Some(node.id.as_str()) {
                if node.at_most_once {
                    warn!(
                        instance_id = %ctx.instance_id,
                        node_id = %node.id,
                        "At-most-once node was interrupted mid-step"
                    );
                    return Ok(ExecutionOutcome::Failed {
                        node_id: Some(node.id.clone()),
                        reason: format!("node '{}' was interrupted and runs at most once", node.id),
                    });
                }
                info!(instance_id = %ctx.instance_id, node_id = %node.id, "Re-running interrupted node");
            }

            ctx.listener
                .on_step_started(&ctx.instance_id, &node.id)
                .await?;

            let mut attempt = 0;
            let output = loop {
                attempt += 1;
                let request = StepRequest {
                    instance_id: ctx.instance_id.clone(),
                    node_id: node.id.clone(),
                    attempt,
                    input: ctx.input.clone(),
                    context: Value::Object(context.clone()),
                };

                let result = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        info!(instance_id = %ctx.instance_id, node_id = %node.id, "Step abandoned, ownership lost");
                        return Ok(ExecutionOutcome::OwnershipLost);
                    }
                    result = workflow.executor.execute(request) => result,
                };

                match result {
                    Ok(output) => break output,
                    Err(failure) => {
                        ctx.listener
                            .on_step_failed(&ctx.instance_id, &node.id, &failure.reason)
                            .await?;
                        if failure.retryable && attempt < node.max_attempts {
                            debug!(
                                instance_id = %ctx.instance_id,
                                node_id = %node.id,
                                attempt,
                                "Retrying node"
                            );
                            continue;
                        }
                        return Ok(ExecutionOutcome::Failed {
                            node_id: Some(node.id.clone()),
                            reason: failure.reason,
                        });
                    }
                }
            };

            context.insert(node.id.clone(), output.clone());
            // Durable before the next node can observe the output.
            ctx.listener
                .on_step_completed(
                    &ctx.instance_id,
                    &node.id,
                    output.clone(),
                    &Value::Object(context.clone()),
                )
                .await?;
            completed.insert(node.id.clone());
            last_output = output;
        }

        Ok(ExecutionOutcome::Completed {
            output: last_output,
        })
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl ExecutionEngine for GraphEngine {
    async fn execute_workflow(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome> {
        self.run(ctx, None).await
    }

    async fn resume_from_breakpoint(
        &self,
        ctx: ExecutionContext,
        resume: ResumePoint,
    ) -> Result<ExecutionOutcome> {
        self.run(ctx, Some(resume)).await
    }
}
