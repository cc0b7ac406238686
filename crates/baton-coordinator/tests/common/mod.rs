// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for baton-coordinator integration tests.
//!
//! A [`Node`] bundles the per-process components (lock manager, runner,
//! coordinator, heartbeat, failure detector, recovery) without spawning their
//! background loops, so tests drive heartbeats and scans explicitly against a
//! [`ManualClock`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::persistence::NewInstance;
use baton_core::{
    Checkpoint, Config, InstanceStatus, LockManager, ManualClock, OwnerId, Persistence,
    SqlitePersistence,
};
use baton_coordinator::engine::{ExecutionContext, ExecutionEngine, ExecutionOutcome, ResumePoint};
use baton_coordinator::failure_detector::{FailureDetector, FailureDetectorConfig};
use baton_coordinator::heartbeat::HeartbeatService;
use baton_coordinator::runner::InstanceRunner;
use baton_coordinator::{
    GraphEngine, RecoveryCoordinator, StepExecutor, StepFailure, StepRequest, WorkflowCoordinator,
    WorkflowDefinition,
};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

pub const LEASE_TTL: Duration = Duration::from_secs(30);

/// Config used by component-level tests.
pub fn test_config() -> Config {
    Config::new("sqlite::memory:")
        .with_lease_ttl(LEASE_TTL)
        .with_recovery_lock_ttl(Duration::from_secs(10))
        .with_max_recovery_attempts(3)
}

/// In-memory SQLite store whose "now" is `clock`.
pub async fn memory_store(clock: &ManualClock) -> Arc<dyn Persistence> {
    let mut sqlite = SqlitePersistence::connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    sqlite.set_clock(Arc::new(clock.clone()));
    Arc::new(sqlite)
}

/// A `running` instance whose owner died: no lock row and an `updated_at`
/// older than the detection threshold once the clock is advanced.
pub async fn orphaned_instance(
    store: &Arc<dyn Persistence>,
    clock: &ManualClock,
    id: &str,
    input: Option<Value>,
    checkpoint: Option<Checkpoint>,
) {
    store
        .create_instance(&NewInstance {
            id: id.to_string(),
            definition_ref: "etl".to_string(),
            input_data: input,
            assigned_owner: Some("dead-node".to_string()),
            status: InstanceStatus::Running,
        })
        .await
        .unwrap();
    if let Some(cp) = checkpoint {
        store.save_checkpoint(&cp, "dead-node").await.unwrap();
    }
    clock.advance(LEASE_TTL * 3);
}

/// One simulated coordinator process.
pub struct Node {
    pub owner: OwnerId,
    pub store: Arc<dyn Persistence>,
    pub lock_manager: Arc<LockManager>,
    pub runner: Arc<InstanceRunner>,
    pub coordinator: WorkflowCoordinator,
    pub recovery: RecoveryCoordinator,
    pub heartbeat: HeartbeatService,
    pub detector: FailureDetector,
}

impl Node {
    pub fn new(
        name: &str,
        store: Arc<dyn Persistence>,
        engine: Arc<dyn ExecutionEngine>,
        config: &Config,
    ) -> Self {
        let owner = OwnerId::new(name);
        let lock_manager = Arc::new(LockManager::from_config(store.clone(), owner.clone(), config));
        let runner = Arc::new(InstanceRunner::new(store.clone(), lock_manager.clone(), engine));
        Self {
            coordinator: WorkflowCoordinator::new(
                store.clone(),
                lock_manager.clone(),
                runner.clone(),
                config.lease_ttl,
            ),
            recovery: RecoveryCoordinator::new(
                store.clone(),
                lock_manager.clone(),
                runner.clone(),
                config,
            ),
            heartbeat: HeartbeatService::new(lock_manager.clone(), store.clone(), config.heartbeat_interval),
            detector: FailureDetector::new(store.clone(), FailureDetectorConfig::from_config(config)),
            owner,
            store,
            lock_manager,
            runner,
        }
    }

    /// Renew every held lease regardless of schedule.
    pub async fn force_heartbeat(&self) -> baton_coordinator::heartbeat::HeartbeatTick {
        self.heartbeat
            .tick(tokio::time::Instant::now() + Duration::from_secs(3600))
            .await
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Shared per-node call counts.
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl CallLog {
    pub fn record(&self, key: &str) {
        *self.calls.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, key: &str) -> u32 {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

/// Step executor that logs every call as `"<node>"` and, optionally,
/// blocks on a gate before finishing `gated_node`.
pub struct RecordingExecutor {
    pub log: CallLog,
    gated_node: Option<String>,
    gate: Arc<Semaphore>,
}

impl RecordingExecutor {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            gated_node: None,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Block `node_id` until a permit is added to [`gate`](Self::gate).
    pub fn gated(log: CallLog, node_id: &str) -> Self {
        Self {
            log,
            gated_node: Some(node_id.to_string()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(&self, request: StepRequest) -> Result<Value, StepFailure> {
        self.log.record(&request.node_id);
        if self.gated_node.as_deref() == Some(request.node_id.as_str()) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| StepFailure::fatal("gate closed"))?;
            permit.forget();
        }
        Ok(json!({ "node": request.node_id }))
    }
}

/// `extract -> transform -> load` with default node settings.
pub fn etl_definition() -> WorkflowDefinition {
    use baton_coordinator::NodeSpec;
    WorkflowDefinition::new("etl")
        .node(NodeSpec::new("extract"))
        .node(NodeSpec::new("transform").after("extract"))
        .node(NodeSpec::new("load").after("transform"))
}

pub fn graph_engine(executor: Arc<RecordingExecutor>) -> Arc<GraphEngine> {
    graph_engine_for(etl_definition(), executor)
}

pub fn graph_engine_for(
    definition: WorkflowDefinition,
    executor: Arc<RecordingExecutor>,
) -> Arc<GraphEngine> {
    Arc::new(
        GraphEngine::new()
            .with_workflow(definition, executor)
            .expect("valid definition"),
    )
}

/// Engine that counts calls and returns a fixed outcome.
pub struct ScriptedEngine {
    pub log: CallLog,
    outcome: ExecutionOutcome,
}

impl ScriptedEngine {
    pub fn new(outcome: ExecutionOutcome) -> Self {
        Self {
            log: CallLog::default(),
            outcome,
        }
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn execute_workflow(
        &self,
        _ctx: ExecutionContext,
    ) -> baton_coordinator::Result<ExecutionOutcome> {
        self.log.record("execute_workflow");
        Ok(self.outcome.clone())
    }

    async fn resume_from_breakpoint(
        &self,
        _ctx: ExecutionContext,
        resume: ResumePoint,
    ) -> baton_coordinator::Result<ExecutionOutcome> {
        self.log.record("resume_from_breakpoint");
        for node in &resume.completed_node_ids {
            self.log.record(&format!("skipped:{}", node));
        }
        Ok(self.outcome.clone())
    }
}
