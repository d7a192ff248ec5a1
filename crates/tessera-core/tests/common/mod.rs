// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tessera-core integration tests.
//!
//! Provides a small `Ticket` entity and store backends that share a
//! [`ManualClock`], so lease expiry and retry delays can be stepped explicitly.

#![allow(dead_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tessera_core::{
    EntityMeta, EntityState, InMemoryStateEntityStore, ManualClock, SqliteStateEntityStore,
    StateEntityStore, StatefulEntity,
};

pub const LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketState {
    Open,
    Sending,
    Sent,
    Closed,
    Failed,
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TicketState::Open => "OPEN",
            TicketState::Sending => "SENDING",
            TicketState::Sent => "SENT",
            TicketState::Closed => "CLOSED",
            TicketState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl EntityState for TicketState {
    fn code(self) -> i32 {
        match self {
            TicketState::Open => 100,
            TicketState::Sending => 200,
            TicketState::Sent => 300,
            TicketState::Closed => 400,
            TicketState::Failed => 500,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            100 => Some(TicketState::Open),
            200 => Some(TicketState::Sending),
            300 => Some(TicketState::Sent),
            400 => Some(TicketState::Closed),
            500 => Some(TicketState::Failed),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, TicketState::Closed | TicketState::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use TicketState::*;
        matches!(
            (self, next),
            (Open, Sending) | (Sending, Sent) | (Sent, Closed) | (Open | Sending | Sent, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub owner: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Ticket {
    pub fn new(id: &str, state: TicketState, now: i64) -> Self {
        Self {
            meta: EntityMeta::new(id, state.code(), now),
            correlation_id: None,
            owner: "alice".to_string(),
            notes: Vec::new(),
        }
    }
}

impl StatefulEntity for Ticket {
    type State = TicketState;
    const KIND: &'static str = "ticket";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

/// A store handle plus whatever keeps its backing storage alive.
pub struct Backend {
    pub name: &'static str,
    pub store: Arc<dyn StateEntityStore<Ticket>>,
    _dir: Option<TempDir>,
}

pub fn memory_backend(clock: &ManualClock) -> Backend {
    let store = InMemoryStateEntityStore::<Ticket>::new("replica-a")
        .with_lease_duration(LEASE)
        .with_clock(Arc::new(clock.clone()));
    Backend {
        name: "memory",
        store: Arc::new(store),
        _dir: None,
    }
}

pub async fn sqlite_backend(clock: &ManualClock) -> Backend {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = SqliteStateEntityStore::<Ticket>::from_path(dir.path().join("state.db"), "replica-a")
        .await
        .expect("Failed to open SQLite store")
        .with_lease_duration(LEASE)
        .with_clock(Arc::new(clock.clone()));
    Backend {
        name: "sqlite",
        store: Arc::new(store),
        _dir: Some(dir),
    }
}

/// Both backends, sharing `clock`.
pub async fn backends(clock: &ManualClock) -> Vec<Backend> {
    vec![memory_backend(clock), sqlite_backend(clock).await]
}
