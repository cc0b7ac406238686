// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery across simulated nodes sharing one store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use baton_core::{Checkpoint, InstanceStatus, ManualClock, Persistence, SqlitePersistence};
use baton_coordinator::{ExecutionOutcome, NodeSpec, RecoveryOutcome, WorkflowDefinition};
use common::*;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_status(store: &Arc<dyn Persistence>, id: &str, status: InstanceStatus) -> bool {
    eventually(WAIT, || async {
        store
            .get_instance(id)
            .await
            .unwrap()
            .is_some_and(|i| i.status == status)
    })
    .await
}

fn checkpoint_with(id: &str, completed: &[&str]) -> Checkpoint {
    let mut cp = Checkpoint::new(id);
    for node in completed {
        cp.complete_node(node, json!({ "node": node }));
    }
    cp
}

#[tokio::test]
async fn test_resume_skips_completed_nodes() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(
        &store,
        &clock,
        "inst-1",
        Some(json!({ "rows": 10 })),
        Some(checkpoint_with("inst-1", &["extract"])),
    )
    .await;

    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::Completed {
        output: json!("done"),
    }));
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &test_config());

    assert_eq!(node_b.detector.scan().await.unwrap(), vec!["inst-1".to_string()]);
    assert_eq!(
        node_b.recovery.recover("inst-1").await.unwrap(),
        RecoveryOutcome::Resumed
    );
    assert!(wait_for_status(&store, "inst-1", InstanceStatus::Completed).await);

    assert_eq!(engine.log.count("resume_from_breakpoint"), 1);
    assert_eq!(engine.log.count("skipped:extract"), 1);
    assert_eq!(engine.log.count("execute_workflow"), 0);

    let record = store.get_instance("inst-1").await.unwrap().unwrap();
    assert_eq!(record.assigned_owner.as_deref(), Some("node-b"));
    assert_eq!(record.recovery_attempts, 1);
    assert_eq!(record.output, Some(json!("done")));

    assert!(store.get_lock("recovery:inst-1").await.unwrap().is_none());
    assert!(
        eventually(WAIT, || async {
            !store.is_lock_live("execution:inst-1").await.unwrap()
        })
        .await
    );
}

#[tokio::test]
async fn test_concurrent_recovery_resumes_once() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(
        &store,
        &clock,
        "inst-1",
        None,
        Some(checkpoint_with("inst-1", &["extract", "transform"])),
    )
    .await;

    let outcome = ExecutionOutcome::Completed { output: json!({}) };
    let engine_b = Arc::new(ScriptedEngine::new(outcome.clone()));
    let engine_c = Arc::new(ScriptedEngine::new(outcome));
    let node_b = Node::new("node-b", store.clone(), engine_b.clone(), &test_config());
    let node_c = Node::new("node-c", store.clone(), engine_c.clone(), &test_config());

    let (b, c) = futures::join!(
        node_b.recovery.recover("inst-1"),
        node_c.recovery.recover("inst-1")
    );
    let outcomes = [b.unwrap(), c.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == RecoveryOutcome::Resumed)
            .count(),
        1,
        "exactly one node recovers: {:?}",
        outcomes
    );
    assert!(wait_for_status(&store, "inst-1", InstanceStatus::Completed).await);

    // A late duplicate suspect changes nothing.
    assert_eq!(
        node_c.recovery.recover("inst-1").await.unwrap(),
        RecoveryOutcome::Aborted
    );

    let resumes = engine_b.log.count("resume_from_breakpoint")
        + engine_c.log.count("resume_from_breakpoint");
    assert_eq!(resumes, 1);
    assert_eq!(
        store.get_instance("inst-1").await.unwrap().unwrap().recovery_attempts,
        1
    );
}

#[tokio::test]
async fn test_recovery_aborts_when_owner_is_alive() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(&store, &clock, "inst-1", Some(json!({})), None).await;

    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::Paused));
    let node_a = Node::new("node-a", store.clone(), engine.clone(), &test_config());
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &test_config());

    // node-a comes back and holds the lease before node-b verifies.
    node_a
        .lock_manager
        .acquire(&baton_core::LockKey::execution("inst-1"), LEASE_TTL)
        .await
        .unwrap();

    assert_eq!(
        node_b.recovery.recover("inst-1").await.unwrap(),
        RecoveryOutcome::Aborted
    );
    assert_eq!(engine.log.count("resume_from_breakpoint"), 0);
    assert_eq!(engine.log.count("execute_workflow"), 0);
    assert_eq!(
        store.get_instance("inst-1").await.unwrap().unwrap().recovery_attempts,
        0
    );
}

#[tokio::test]
async fn test_missing_checkpoint_restarts_from_input() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(&store, &clock, "inst-1", Some(json!({ "rows": 1 })), None).await;

    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::Completed {
        output: json!(1),
    }));
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &test_config());

    assert_eq!(
        node_b.recovery.recover("inst-1").await.unwrap(),
        RecoveryOutcome::Restarted
    );
    assert!(wait_for_status(&store, "inst-1", InstanceStatus::Completed).await);
    assert_eq!(engine.log.count("execute_workflow"), 1);
}

#[tokio::test]
async fn test_missing_checkpoint_without_input_fails() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(&store, &clock, "inst-1", None, None).await;

    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::Paused));
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &test_config());

    let outcome = node_b.recovery.recover("inst-1").await.unwrap();
    assert!(matches!(outcome, RecoveryOutcome::Failed { .. }));

    let record = store.get_instance("inst-1").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("checkpoint missing and no input data")
    );
    assert!(!store.is_lock_live("execution:inst-1").await.unwrap());
    assert_eq!(engine.log.count("execute_workflow"), 0);
}

#[tokio::test]
async fn test_corrupt_checkpoint_fails_instance() {
    let clock = ManualClock::default();
    let mut sqlite = SqlitePersistence::connect("sqlite::memory:").await.unwrap();
    sqlite.set_clock(Arc::new(clock.clone()));
    let pool = sqlite.pool().clone();
    let store: Arc<dyn Persistence> = Arc::new(sqlite);

    orphaned_instance(
        &store,
        &clock,
        "inst-1",
        Some(json!({})),
        Some(checkpoint_with("inst-1", &["extract"])),
    )
    .await;
    sqlx::query("UPDATE workflow_checkpoints SET completed_node_ids = 'not json' WHERE instance_id = ?1")
        .bind("inst-1")
        .execute(&pool)
        .await
        .unwrap();

    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::Paused));
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &test_config());

    match node_b.recovery.recover("inst-1").await.unwrap() {
        RecoveryOutcome::Failed { reason } => assert!(reason.starts_with("checkpoint corrupt")),
        other => panic!("expected failure, got {:?}", other),
    }
    let record = store.get_instance("inst-1").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Failed);
    assert_eq!(engine.log.count("resume_from_breakpoint"), 0);
    assert_eq!(engine.log.count("execute_workflow"), 0);
}

#[tokio::test]
async fn test_recovery_attempts_are_bounded() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    orphaned_instance(
        &store,
        &clock,
        "inst-1",
        None,
        Some(checkpoint_with("inst-1", &["extract"])),
    )
    .await;

    // Every recovered execution dies again without finishing.
    let engine = Arc::new(ScriptedEngine::new(ExecutionOutcome::OwnershipLost));
    let config = test_config().with_max_recovery_attempts(2);
    let node_b = Node::new("node-b", store.clone(), engine.clone(), &config);

    for attempt in 1..=2 {
        assert_eq!(
            node_b.recovery.recover("inst-1").await.unwrap(),
            RecoveryOutcome::Resumed,
            "attempt {}",
            attempt
        );
        assert!(eventually(WAIT, || async { node_b.runner.active_count() == 0 }).await);
        assert!(
            eventually(WAIT, || async {
                !store.is_lock_live("execution:inst-1").await.unwrap()
            })
            .await
        );
        clock.advance(LEASE_TTL * 3);
        assert_eq!(node_b.detector.scan().await.unwrap(), vec!["inst-1".to_string()]);
    }

    assert_eq!(
        node_b.recovery.recover("inst-1").await.unwrap(),
        RecoveryOutcome::Failed {
            reason: "recovery attempts exhausted".to_string()
        }
    );
    let record = store.get_instance("inst-1").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("recovery attempts exhausted"));
    assert_eq!(record.recovery_attempts, 3);
    assert_eq!(engine.log.count("resume_from_breakpoint"), 2);
}

#[tokio::test]
async fn test_crashed_owner_never_double_executes() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    let config = test_config();

    // node-a hangs inside "transform".
    let log_a = CallLog::default();
    let executor_a = Arc::new(RecordingExecutor::gated(log_a.clone(), "transform"));
    let node_a = Node::new("node-a", store.clone(), graph_engine(executor_a), &config);

    let log_b = CallLog::default();
    let executor_b = Arc::new(RecordingExecutor::new(log_b.clone()));
    let node_b = Node::new("node-b", store.clone(), graph_engine(executor_b), &config);

    let id = node_a
        .coordinator
        .create_and_lock_instance("etl", Some(json!({ "rows": 3 })))
        .await
        .unwrap();

    assert!(
        eventually(WAIT, || async {
            store
                .load_checkpoint(&id)
                .await
                .unwrap()
                .is_some_and(|cp| cp.current_node_id.as_deref() == Some("transform"))
        })
        .await
    );

    // node-a stops heartbeating; its lease and liveness record go stale.
    clock.advance(LEASE_TTL * 3);
    assert_eq!(node_b.detector.scan().await.unwrap(), vec![id.clone()]);
    assert_eq!(
        node_b.recovery.recover(&id).await.unwrap(),
        RecoveryOutcome::Resumed
    );
    assert!(wait_for_status(&store, &id, InstanceStatus::Completed).await);

    // node-a wakes up: its renewal fails and its execution is abandoned.
    let tick = node_a.force_heartbeat().await;
    assert_eq!(tick.lost, 1);
    assert!(eventually(WAIT, || async { node_a.runner.active_count() == 0 }).await);

    assert_eq!(log_a.count("extract"), 1);
    assert_eq!(log_a.count("transform"), 1);
    assert_eq!(log_a.count("load"), 0);
    assert_eq!(log_b.count("extract"), 0, "completed nodes are never re-run");
    assert_eq!(log_b.count("transform"), 1);
    assert_eq!(log_b.count("load"), 1);

    let status = node_b.coordinator.get_instance_status(&id).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.assigned_owner.as_deref(), Some("node-b"));
    assert_eq!(status.completed_nodes, vec!["extract", "load", "transform"]);
    assert_eq!(status.output, Some(json!({ "node": "load" })));
}

#[tokio::test]
async fn test_stale_owner_cannot_write_after_takeover() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    let config = test_config();

    let log_a = CallLog::default();
    let executor_a = Arc::new(RecordingExecutor::gated(log_a.clone(), "transform"));
    let gate_a = executor_a.gate();
    let node_a = Node::new("node-a", store.clone(), graph_engine(executor_a), &config);

    let log_b = CallLog::default();
    let executor_b = Arc::new(RecordingExecutor::new(log_b.clone()));
    let node_b = Node::new("node-b", store.clone(), graph_engine(executor_b), &config);

    let id = node_a
        .coordinator
        .create_and_lock_instance("etl", Some(json!({ "rows": 3 })))
        .await
        .unwrap();
    assert!(eventually(WAIT, || async { log_a.count("transform") == 1 }).await);

    clock.advance(LEASE_TTL * 3);
    assert_eq!(
        node_b.recovery.recover(&id).await.unwrap(),
        RecoveryOutcome::Resumed
    );
    assert!(wait_for_status(&store, &id, InstanceStatus::Completed).await);
    let finished = store.load_checkpoint(&id).await.unwrap().unwrap();

    // node-a resumes without ever renewing, so it still believes it holds
    // the lease. The store turns its writes away.
    assert!(node_a.runner.is_running(&id));
    gate_a.add_permits(1);
    assert!(eventually(WAIT, || async { node_a.runner.active_count() == 0 }).await);

    assert_eq!(log_a.count("load"), 0);
    assert_eq!(store.load_checkpoint(&id).await.unwrap(), Some(finished));

    let record = store.get_instance(&id).await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Completed);
    assert_eq!(record.assigned_owner.as_deref(), Some("node-b"));
    assert_eq!(record.output, Some(json!({ "node": "load" })));
}

#[tokio::test]
async fn test_interrupted_at_most_once_node_fails_on_recovery() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    let config = test_config();
    let definition = || {
        WorkflowDefinition::new("etl")
            .node(NodeSpec::new("extract"))
            .node(NodeSpec::new("transform").after("extract").at_most_once())
            .node(NodeSpec::new("load").after("transform"))
    };

    let log_a = CallLog::default();
    let executor_a = Arc::new(RecordingExecutor::gated(log_a.clone(), "transform"));
    let node_a = Node::new(
        "node-a",
        store.clone(),
        graph_engine_for(definition(), executor_a),
        &config,
    );

    let log_b = CallLog::default();
    let executor_b = Arc::new(RecordingExecutor::new(log_b.clone()));
    let node_b = Node::new(
        "node-b",
        store.clone(),
        graph_engine_for(definition(), executor_b),
        &config,
    );

    let id = node_a
        .coordinator
        .create_and_lock_instance("etl", Some(json!({ "rows": 3 })))
        .await
        .unwrap();
    assert!(eventually(WAIT, || async { log_a.count("transform") == 1 }).await);

    clock.advance(LEASE_TTL * 3);
    assert_eq!(
        node_b.recovery.recover(&id).await.unwrap(),
        RecoveryOutcome::Resumed
    );
    assert!(wait_for_status(&store, &id, InstanceStatus::Failed).await);

    assert_eq!(log_b.count("transform"), 0);
    assert_eq!(log_b.count("load"), 0);
    let record = store.get_instance(&id).await.unwrap().unwrap();
    assert!(record.error.unwrap().contains("transform"));
}

#[tokio::test]
async fn test_heartbeating_owner_is_never_suspected() {
    let clock = ManualClock::default();
    let store = memory_store(&clock).await;
    let config = test_config();

    let log = CallLog::default();
    let executor = Arc::new(RecordingExecutor::gated(log.clone(), "transform"));
    let gate = executor.gate();
    let node_a = Node::new("node-a", store.clone(), graph_engine(executor), &config);
    let node_b = Node::new(
        "node-b",
        store.clone(),
        Arc::new(ScriptedEngine::new(ExecutionOutcome::Paused)),
        &config,
    );

    let id = node_a
        .coordinator
        .create_and_lock_instance("etl", None)
        .await
        .unwrap();
    assert!(eventually(WAIT, || async { log.count("transform") == 1 }).await);

    for _ in 0..10 {
        clock.advance(config.heartbeat_interval);
        assert_eq!(node_a.force_heartbeat().await.renewed, 1);
        assert!(node_b.detector.scan().await.unwrap().is_empty());
    }

    gate.add_permits(1);
    assert!(wait_for_status(&store, &id, InstanceStatus::Completed).await);
    assert_eq!(log.count("transform"), 1);
}
