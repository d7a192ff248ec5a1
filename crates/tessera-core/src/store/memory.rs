// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Used for tests and single-process demos. Filtering runs against each
//! entity's serialized JSON so it behaves like the SQLite backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::query::{QuerySpec, matches_all};
use super::{Criterion, StateEntityStore};
use crate::clock::{Clock, SystemClock, duration_millis};
use crate::entity::{Lease, StatefulEntity};
use crate::error::{StoreError, StoreResult};

/// Default time a lease stays valid.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Shared-map store; clones and [`for_holder`](StateEntityStore::for_holder)
/// handles see the same entities.
pub struct InMemoryStateEntityStore<E> {
    entities: Arc<Mutex<HashMap<String, E>>>,
    holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl<E> Clone for InMemoryStateEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            entities: self.entities.clone(),
            holder: self.holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
        }
    }
}

impl<E: StatefulEntity> InMemoryStateEntityStore<E> {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            entities: Arc::new(Mutex::new(HashMap::new())),
            holder: holder.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Same data, different lease holder.
    pub fn with_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ..self.clone()
        }
    }

    fn new_lease(&self, now: i64) -> Lease {
        Lease {
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: now.saturating_add(duration_millis(self.lease_duration)),
        }
    }

    /// Lease `entity` in place unless someone else holds it.
    fn acquire(&self, entity: &mut E, now: i64) -> StoreResult<E> {
        if let Some(lease) = &entity.meta().lease
            && lease.blocks(&self.holder, now)
        {
            return Err(StoreError::AlreadyLeased {
                id: entity.id().to_string(),
                holder: lease.holder.clone(),
            });
        }
        entity.meta_mut().lease = Some(self.new_lease(now));
        Ok(entity.clone())
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for InMemoryStateEntityStore<E> {
    fn lease_holder(&self) -> &str {
        &self.holder
    }

    fn for_holder(&self, holder: &str) -> Arc<dyn StateEntityStore<E>> {
        Arc::new(self.with_holder(holder))
    }

    async fn save(&self, entity: &E) -> StoreResult<E> {
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;
        let id = entity.id().to_string();

        if let Some(existing) = entities.get(&id) {
            if let Some(lease) = &existing.meta().lease
                && lease.blocks(&self.holder, now)
            {
                return Err(StoreError::ConcurrentModification {
                    id,
                    reason: format!("leased by '{}'", lease.holder),
                });
            }
            if existing.meta().version != entity.meta().version {
                return Err(StoreError::ConcurrentModification {
                    reason: format!(
                        "expected version {}, found {}",
                        entity.meta().version,
                        existing.meta().version
                    ),
                    id,
                });
            }
        }

        let mut stored = entity.clone();
        let meta = stored.meta_mut();
        meta.lease = None;
        meta.version += 1;
        meta.updated_at = now;
        entities.insert(id, stored.clone());
        Ok(stored)
    }

    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;

        let mut candidates = Vec::new();
        for entity in entities.values() {
            let leased = entity
                .meta()
                .lease
                .as_ref()
                .is_some_and(|lease| !lease.is_expired(now));
            if leased {
                continue;
            }
            let document = serde_json::to_value(entity)?;
            if matches_all(criteria, &document)? {
                candidates.push((entity.meta().state_timestamp, entity.id().to_string()));
            }
        }
        candidates.sort();
        candidates.truncate(max);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(entity) = entities.get_mut(&id) {
                entity.meta_mut().lease = Some(self.new_lease(now));
                leased.push(entity.clone());
            }
        }
        Ok(leased)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        Ok(self.entities.lock().await.get(id).cloned())
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<E> {
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        self.acquire(entity, now)
    }

    async fn find_by_correlation_id_and_lease(&self, correlation_id: &str) -> StoreResult<E> {
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;
        let entity = entities
            .values_mut()
            .filter(|e| e.correlation_id() == Some(correlation_id))
            .min_by_key(|e| e.meta().state_timestamp)
            .ok_or_else(|| StoreError::not_found(correlation_id))?;
        self.acquire(entity, now)
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        if let Some(lease) = &entity.meta().lease
            && lease.blocks(&self.holder, now)
        {
            return Err(StoreError::AlreadyLeased {
                id: id.to_string(),
                holder: lease.holder.clone(),
            });
        }
        entity.meta_mut().lease = None;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut entities = self.entities.lock().await;
        let entity = entities.get(id).ok_or_else(|| StoreError::not_found(id))?;
        if let Some(lease) = &entity.meta().lease
            && lease.blocks(&self.holder, now)
        {
            return Err(StoreError::IllegalState {
                id: id.to_string(),
                reason: format!("leased by '{}'", lease.holder),
            });
        }
        entities.remove(id);
        Ok(())
    }

    async fn find_all(&self, query: &QuerySpec) -> StoreResult<Vec<E>> {
        let entities = self.entities.lock().await;
        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities.values() {
            rows.push((serde_json::to_value(entity)?, entity.clone()));
        }
        query.apply(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::test_support::{Job, Phase};

    fn store(clock: &ManualClock) -> InMemoryStateEntityStore<Job> {
        InMemoryStateEntityStore::new("runner")
            .with_lease_duration(Duration::from_secs(10))
            .with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_clears_lease() {
        let clock = ManualClock::new(1_000);
        let store = store(&clock);
        let saved = store.save(&Job::new("j-1", Phase::Start, 1_000)).await.unwrap();
        assert_eq!(saved.meta.version, 1);

        let leased = store.find_by_id_and_lease("j-1").await.unwrap();
        assert!(leased.meta.is_leased_by("runner", 1_000));

        let saved = store.save(&leased).await.unwrap();
        assert_eq!(saved.meta.version, 2);
        assert!(saved.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_holders_exclude_each_other_until_expiry() {
        let clock = ManualClock::new(0);
        let runner = store(&clock);
        let api = runner.with_holder("api");
        runner.save(&Job::new("j-1", Phase::Start, 0)).await.unwrap();

        runner.find_by_id_and_lease("j-1").await.unwrap();
        assert!(matches!(
            api.find_by_id_and_lease("j-1").await,
            Err(StoreError::AlreadyLeased { .. })
        ));

        clock.advance(Duration::from_secs(10));
        assert!(api.find_by_id_and_lease("j-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_break_lease_keeps_version() {
        let clock = ManualClock::new(0);
        let store = store(&clock);
        store.save(&Job::new("j-1", Phase::Start, 0)).await.unwrap();
        store.find_by_id_and_lease("j-1").await.unwrap();

        store.break_lease("j-1").await.unwrap();
        let stored = store.find_by_id("j-1").await.unwrap().unwrap();
        assert!(stored.meta.lease.is_none());
        assert_eq!(stored.meta.version, 1);
    }
}
