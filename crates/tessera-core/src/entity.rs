// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stateful entity model.
//!
//! A process kind (negotiation, transfer, ...) embeds an [`EntityMeta`] and
//! implements [`StatefulEntity`]. The meta carries everything the runner and
//! the stores need; the rest of the record is process specific and is
//! persisted as opaque JSON.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A closed set of states with integer codes and a transition relation.
pub trait EntityState:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// Persistent integer code.
    fn code(self) -> i32;

    /// Inverse of [`code`](Self::code).
    fn from_code(code: i32) -> Option<Self>;

    /// Terminal states never transition again.
    fn is_terminal(self) -> bool;

    /// Whether `self -> next` is a legal edge.
    fn can_transition_to(self, next: Self) -> bool;
}

/// Exclusive, time-bounded right to mutate an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lease {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }

    /// Held by someone other than `holder` and still valid at `now`.
    pub fn blocks(&self, holder: &str, now: i64) -> bool {
        !self.is_held_by(holder) && !self.is_expired(now)
    }
}

/// Bookkeeping fields shared by every stateful entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: String,
    pub state: i32,
    /// Consecutive attempts in the current state; 0 right after entering it.
    #[serde(default)]
    pub state_count: u32,
    /// When the state last changed or was re-entered on retry.
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Optimistic concurrency version, bumped by every save.
    #[serde(default)]
    pub version: i64,
}

impl EntityMeta {
    pub fn new(id: impl Into<String>, state: i32, now: i64) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            error_detail: None,
            pending: false,
            lease: None,
            version: 0,
        }
    }

    /// Whether `holder` may mutate this entity at `now`.
    pub fn is_leased_by(&self, holder: &str, now: i64) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.is_held_by(holder) && !lease.is_expired(now))
    }
}

/// Illegal state change attempted on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Entity '{id}' cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: String,
    pub to: String,
}

/// A persistent record driven through a state machine.
pub trait StatefulEntity:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// State enumeration of this process kind.
    type State: EntityState;

    /// Discriminator used when several kinds share one table.
    const KIND: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Id of the same process at the counter-party, once known.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Typed current state, `None` for an unknown persisted code.
    fn state(&self) -> Option<Self::State> {
        Self::State::from_code(self.meta().state)
    }

    fn state_count(&self) -> u32 {
        self.meta().state_count
    }

    fn is_pending(&self) -> bool {
        self.meta().pending
    }

    fn error_detail(&self) -> Option<&str> {
        self.meta().error_detail.as_deref()
    }

    fn is_terminal(&self) -> bool {
        self.state().is_some_and(EntityState::is_terminal)
    }

    /// Move to `next`, resetting the retry counter.
    fn transition_to(&mut self, next: Self::State, now: i64) -> Result<(), TransitionError> {
        let code = self.meta().state;
        match Self::State::from_code(code) {
            Some(current) if current.can_transition_to(next) => {
                let meta = self.meta_mut();
                meta.state = next.code();
                meta.state_count = 0;
                meta.state_timestamp = now;
                Ok(())
            }
            current => Err(TransitionError {
                id: self.id().to_string(),
                from: current.map_or_else(|| code.to_string(), |s| s.to_string()),
                to: next.to_string(),
            }),
        }
    }

    /// Re-enter the current state after a retryable failure.
    fn retry_state(&mut self, now: i64) {
        let meta = self.meta_mut();
        meta.state_count = meta.state_count.saturating_add(1);
        meta.state_timestamp = now;
    }

    /// Move to a failure state and record why.
    fn fail_to(
        &mut self,
        next: Self::State,
        detail: impl Into<String>,
        now: i64,
    ) -> Result<(), TransitionError> {
        self.transition_to(next, now)?;
        self.meta_mut().error_detail = Some(detail.into());
        Ok(())
    }

    fn set_pending(&mut self, pending: bool) {
        self.meta_mut().pending = pending;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Job, Phase};
    use super::*;

    #[test]
    fn test_transition_resets_state_count() {
        let mut job = Job::new("j-1", Phase::Start, 10);
        job.retry_state(20);
        job.retry_state(30);
        assert_eq!(job.state_count(), 2);
        assert_eq!(job.meta.state_timestamp, 30);

        job.transition_to(Phase::Working, 40).unwrap();
        assert_eq!(job.state(), Some(Phase::Working));
        assert_eq!(job.state_count(), 0);
        assert_eq!(job.meta.state_timestamp, 40);
    }

    #[test]
    fn test_terminal_state_rejects_transition() {
        let mut job = Job::new("j-2", Phase::Done, 0);
        let err = job.transition_to(Phase::Working, 1).unwrap_err();
        assert_eq!(err.from, "Done");
        assert_eq!(err.to, "Working");
        assert!(job.is_terminal());
    }

    #[test]
    fn test_fail_to_records_detail() {
        let mut job = Job::new("j-3", Phase::Working, 0);
        job.fail_to(Phase::Failed, "remote said no", 5).unwrap();
        assert_eq!(job.error_detail(), Some("remote said no"));
        assert_eq!(job.state(), Some(Phase::Failed));
    }

    #[test]
    fn test_meta_flattens_into_entity_json() {
        let job = Job::new("j-4", Phase::Start, 7);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], "j-4");
        assert_eq!(json["state"], 100);
        assert_eq!(json["pending"], false);
        assert!(json.get("lease").is_none());

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.meta, job.meta);
    }

    #[test]
    fn test_lease_blocks_other_holders_until_expiry() {
        let lease = Lease {
            holder: "a".to_string(),
            acquired_at: 0,
            expires_at: 100,
        };
        assert!(lease.blocks("b", 50));
        assert!(!lease.blocks("a", 50));
        assert!(!lease.blocks("b", 100));
    }
}
