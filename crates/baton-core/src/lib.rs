// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Baton Core - lease locks and checkpoints in a relational store
//!
//! This crate provides the storage half of baton: a lock table with lease
//! semantics, workflow instance records, mergeable checkpoints and
//! administrative signals, persisted to PostgreSQL or SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        baton-coordinator                                 │
//! │   (Heartbeat, Failure Detector, Recovery, Instance Runner, Janitor)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ acquire / renew / release                    │ instances, checkpoints
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │     LockManager       │───────────────────►│    dyn Persistence          │
//! │  held locks + tokens  │                    │  PostgreSQL | SQLite        │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Lock semantics
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `acquire` | Insert the row, or overwrite it if `expires_at <= now` |
//! | `renew`   | Push `expires_at` forward if the caller still owns a live lease |
//! | `release` | Delete the row if the caller owns it; idempotent |
//!
//! A lock is held by `owner` iff its row exists and `expires_at > now`, where
//! `now` is the store's clock. Keys are namespaced as `<lock_type>:<name>`.
//!
//! # Checkpoints
//!
//! Saving a checkpoint merges it into the stored one: completed nodes are a
//! growing set, so a stale or partial writer can never erase progress. Only
//! an explicit reset shrinks it.

#![deny(missing_docs)]

/// Checkpoint model and merge rules.
pub mod checkpoint;

/// Time sources (system and manual).
pub mod clock;

/// Configuration loading from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Lease lock manager.
pub mod lock_manager;

/// Embedded migrations.
pub mod migrations;

/// Owner identity.
pub mod owner;

/// Persistence trait and backends.
pub mod persistence;

/// Backoff for transient store errors.
pub mod retry;

pub use checkpoint::Checkpoint;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use error::{CoreError, Result};
pub use lock_manager::{Lease, LockManager};
pub use owner::OwnerId;
pub use persistence::{
    InstanceRecord, InstanceStatus, LockKey, LockRecord, LockType, NewInstance, Persistence,
    PostgresPersistence, SignalRecord, SignalType, SqlitePersistence,
};
pub use retry::RetryConfig;
