// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Core - recoverable state-machine engine
//!
//! This crate holds everything a long-running, multi-step protocol process
//! needs to survive crashes and run on more than one replica:
//!
//! - **Entities** ([`entity`]): a record with an integer state code, a retry
//!   counter, timestamps, a pending flag, an optimistic version and an
//!   optional lease.
//! - **Stores** ([`store`]): lease-aware persistence with an in-memory backend
//!   for tests and a SQLite backend for real deployments.
//! - **Retry policy** ([`retry`]): wait strategies and retry-limit accounting.
//! - **Runner** ([`state_machine`]): a polling loop that leases entities in a
//!   given state, runs the registered handler and persists the outcome.
//! - **Observers** ([`observe`]): fan-out of transition events to listeners.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────────────────────┐          ┌────────────────────────────┐
//!  │   StateMachineManager<E>   │          │   inbound protocol calls   │
//!  │  tick: next_not_leased()   │          │  find_by_*_and_lease()     │
//!  │  handler -> save()         │          │  mutate -> save()          │
//!  └─────────────┬──────────────┘          └─────────────┬──────────────┘
//!                │                                       │
//!                ▼                                       ▼
//!        ┌───────────────────────────────────────────────────────┐
//!        │            StateEntityStore<E> (lease + version)      │
//!        │      InMemoryStateEntityStore | SqliteStateEntityStore│
//!        └───────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation goes through a lease. A save checks the lease holder and
//! the version, clears the lease and bumps the version, so two replicas can
//! never both apply a change to the same entity.
//!
//! # Outcome table
//!
//! | Handler result            | Retries left | Persisted as                              |
//! |---------------------------|--------------|-------------------------------------------|
//! | success                   | -            | success state, `state_count = 0`          |
//! | retryable failure         | yes          | same state, `state_count + 1`             |
//! | retryable failure         | no           | failure state, `error_detail` set         |
//! | fatal failure             | -            | failure state, `error_detail` set         |
//! | panic / save error        | -            | nothing; lease expires, entity re-polled  |

pub mod clock;
pub mod entity;
pub mod error;
pub mod guard;
pub mod observe;
pub mod retry;
pub mod state_machine;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{EntityMeta, EntityState, Lease, StatefulEntity, TransitionError};
pub use error::{ResponseFailure, ResponseStatus, StatusResult, StoreError, StoreResult};
pub use guard::PendingGuard;
pub use observe::{NoopObserver, Observable, TransitionObserver};
pub use retry::{
    EntityRetryProcessConfiguration, ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy,
};
pub use state_machine::{
    FnHandler, StateHandler, StateMachineBuilder, StateMachineConfig, StateMachineManager, local,
};
pub use store::{
    Criterion, InMemoryStateEntityStore, Operator, QuerySpec, SortOrder, SqliteStateEntityStore,
    StateEntityStore,
};
