// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy for state handlers.
//!
//! A retryable failure keeps the entity in its state and increments
//! `state_count`. Once `state_count` reaches the configured limit, the next
//! retryable failure is treated like a fatal one. Between attempts the runner
//! leaves the entity alone until the wait strategy's delay has elapsed since
//! `state_timestamp`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::duration_millis;
use crate::entity::StatefulEntity;

/// Delay before the next attempt, given how many attempts already failed.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    fn retry_in(&self, attempts: u32) -> Duration;
}

/// Exponential backoff: `base * 2^(attempts - 1)`, capped at `max`.
///
/// Zero attempts means no delay.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialWaitStrategy {
    base: Duration,
    max: Duration,
}

impl ExponentialWaitStrategy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn retry_in(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempts - 1);
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWaitStrategy(pub Duration);

impl WaitStrategy for FixedWaitStrategy {
    fn retry_in(&self, attempts: u32) -> Duration {
        if attempts == 0 { Duration::ZERO } else { self.0 }
    }
}

/// Produces a wait strategy; called whenever the runner needs one.
pub type WaitStrategyFactory = Arc<dyn Fn() -> Arc<dyn WaitStrategy> + Send + Sync>;

/// Retry limit plus wait strategy for one state machine.
#[derive(Clone)]
pub struct EntityRetryProcessConfiguration {
    retry_limit: u32,
    wait_strategy: WaitStrategyFactory,
}

impl EntityRetryProcessConfiguration {
    pub fn new(retry_limit: u32, wait_strategy: WaitStrategyFactory) -> Self {
        Self {
            retry_limit,
            wait_strategy,
        }
    }

    /// Exponential backoff with the given limit and bounds.
    pub fn exponential(retry_limit: u32, base: Duration, max: Duration) -> Self {
        let strategy: Arc<dyn WaitStrategy> = Arc::new(ExponentialWaitStrategy::new(base, max));
        Self::new(retry_limit, Arc::new(move || strategy.clone()))
    }

    /// Retries without any delay beyond the runner's tick interval.
    pub fn immediate(retry_limit: u32) -> Self {
        Self::new(
            retry_limit,
            Arc::new(|| Arc::new(FixedWaitStrategy(Duration::ZERO)) as Arc<dyn WaitStrategy>),
        )
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        (self.wait_strategy)()
    }

    /// The entity has used up its attempts in the current state.
    pub fn retries_exhausted<E: StatefulEntity>(&self, entity: &E) -> bool {
        entity.state_count() >= self.retry_limit
    }

    /// Earliest instant at which the entity may be attempted again, or `None`
    /// when it has not failed in its current state.
    pub fn next_attempt_at<E: StatefulEntity>(&self, entity: &E) -> Option<i64> {
        let meta = entity.meta();
        if meta.state_count == 0 {
            return None;
        }
        let delay = self.wait_strategy().retry_in(meta.state_count);
        Some(meta.state_timestamp.saturating_add(duration_millis(delay)))
    }

    /// Whether the retry delay has elapsed at `now`. A first attempt is always
    /// due, whatever clock stamped the entity.
    pub fn is_due<E: StatefulEntity>(&self, entity: &E, now: i64) -> bool {
        self.next_attempt_at(entity).is_none_or(|at| at <= now)
    }
}

impl Default for EntityRetryProcessConfiguration {
    fn default() -> Self {
        Self::exponential(7, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl fmt::Debug for EntityRetryProcessConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRetryProcessConfiguration")
            .field("retry_limit", &self.retry_limit)
            .field("wait_strategy", &self.wait_strategy())
            .finish()
    }
}
