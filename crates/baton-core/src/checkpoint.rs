// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable progress snapshot of a workflow instance.
//!
//! A checkpoint only ever grows: `completed_node_ids` is a union across saves
//! and the only way to shrink it is an explicit reset of the instance
//! ([`Persistence::reset_checkpoint`](crate::persistence::Persistence::reset_checkpoint)).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Instance this checkpoint belongs to.
    pub instance_id: String,
    /// Nodes whose output has been durably recorded.
    pub completed_node_ids: BTreeSet<String>,
    /// Nodes whose last attempt failed and that have not completed since.
    pub failed_node_ids: BTreeSet<String>,
    /// Node that was executing when the snapshot was taken.
    pub current_node_id: Option<String>,
    /// Output of each completed node.
    pub node_outputs: BTreeMap<String, Value>,
    /// Shared workflow context.
    pub context_snapshot: Value,
    /// Number of saves merged into this snapshot.
    pub sequence: i64,
    /// When the snapshot was last written.
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Empty checkpoint for `instance_id`.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            completed_node_ids: BTreeSet::new(),
            failed_node_ids: BTreeSet::new(),
            current_node_id: None,
            node_outputs: BTreeMap::new(),
            context_snapshot: Value::Null,
            sequence: 0,
            saved_at: Utc::now(),
        }
    }

    /// Whether `node_id` has completed.
    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed_node_ids.contains(node_id)
    }

    /// Mark `node_id` as the node currently executing.
    pub fn start_node(&mut self, node_id: &str) {
        self.current_node_id = Some(node_id.to_string());
    }

    /// Record a completed node and its output.
    pub fn complete_node(&mut self, node_id: &str, output: Value) {
        self.completed_node_ids.insert(node_id.to_string());
        self.failed_node_ids.remove(node_id);
        self.node_outputs.insert(node_id.to_string(), output);
        if self.current_node_id.as_deref() == Some(node_id) {
            self.current_node_id = None;
        }
    }

    /// Record a failed attempt of `node_id`.
    pub fn fail_node(&mut self, node_id: &str) {
        if !self.is_completed(node_id) {
            self.failed_node_ids.insert(node_id.to_string());
        }
    }

    /// Node that was started but never completed, if any.
    pub fn in_flight_node(&self) -> Option<&str> {
        self.current_node_id
            .as_deref()
            .filter(|node| !self.is_completed(node))
    }

    /// Fold `incoming` into the stored snapshot.
    ///
    /// Completed nodes and outputs are unioned, a completed node leaves the
    /// failed set, current node and context are replaced, and the sequence
    /// advances by one.
    pub fn merge(&mut self, incoming: &Checkpoint, saved_at: DateTime<Utc>) {
        self.completed_node_ids
            .extend(incoming.completed_node_ids.iter().cloned());
        self.failed_node_ids
            .extend(incoming.failed_node_ids.iter().cloned());
        let completed = &self.completed_node_ids;
        self.failed_node_ids.retain(|node| !completed.contains(node));
        for (node, output) in &incoming.node_outputs {
            self.node_outputs.insert(node.clone(), output.clone());
        }
        self.current_node_id = incoming.current_node_id.clone();
        self.context_snapshot = incoming.context_snapshot.clone();
        self.sequence += 1;
        self.saved_at = saved_at;
    }
}
