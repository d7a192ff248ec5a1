// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease-aware entity stores.
//!
//! A store handle is bound to one lease-holder name. Handles created through
//! [`StateEntityStore::for_holder`] share the same data but hold leases under
//! a different name, so the runner, the inbound protocol service and the local
//! API of one replica exclude each other exactly like separate replicas do.
//!
//! # Lease rules
//!
//! | Operation                          | Foreign live lease | Own or expired lease |
//! |------------------------------------|--------------------|----------------------|
//! | `next_not_leased`                  | skipped            | own: skipped, expired: leased |
//! | `find_by_id_and_lease`             | `AlreadyLeased`    | leased               |
//! | `save`                             | `ConcurrentModification` | saved, lease cleared |
//! | `break_lease`                      | `AlreadyLeased`    | cleared              |
//! | `delete`                           | `IllegalState`     | deleted              |

mod memory;
mod query;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::StatefulEntity;
use crate::error::StoreResult;

pub use memory::{DEFAULT_LEASE_DURATION, InMemoryStateEntityStore};
pub use query::{Criterion, Operator, QuerySpec, SortOrder};
pub use sqlite::SqliteStateEntityStore;

/// Persistence for one kind of stateful entity.
#[async_trait]
pub trait StateEntityStore<E: StatefulEntity>: Send + Sync {
    /// Name under which this handle acquires leases.
    fn lease_holder(&self) -> &str;

    /// Handle on the same data that leases under `holder`.
    fn for_holder(&self, holder: &str) -> Arc<dyn StateEntityStore<E>>;

    /// Persist `entity`.
    ///
    /// Fails with `ConcurrentModification` when another holder's lease is
    /// live or the stored version differs from `entity`'s version. On success
    /// the lease is released, the version incremented and the stored copy
    /// returned.
    async fn save(&self, entity: &E) -> StoreResult<E>;

    /// Lease up to `max` unleased entities matching all `criteria`, oldest
    /// `state_timestamp` first.
    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>>;

    /// Read without leasing.
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>>;

    /// Read and lease by id.
    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<E>;

    /// Read and lease by the counter-party's id for the same process.
    async fn find_by_correlation_id_and_lease(&self, correlation_id: &str) -> StoreResult<E>;

    /// Release this holder's lease without touching the version.
    async fn break_lease(&self, id: &str) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Filtered, sorted, paged listing without leasing.
    async fn find_all(&self, query: &QuerySpec) -> StoreResult<Vec<E>>;
}
