// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic state-machine runner.
//!
//! A [`StateMachineManager`] owns a table of processors, one per state. Every
//! tick it walks the table in registration order, leases up to `batch_size`
//! non-pending entities in each state (never more than the free concurrency
//! permits) and runs the state's handler on each of them in its own task.
//!
//! Per entity the runner:
//! 1. re-reads the entity and abandons it if its state or lease changed,
//! 2. parks it as pending when the pending guard says so,
//! 3. releases it untouched while its retry delay is still running,
//! 4. runs the handler under a timeout and a panic boundary,
//! 5. persists the outcome (success, retry, or failure state) and notifies
//!    the observer once the save succeeded.
//!
//! A panic, an illegal transition or a failed save leaves the entity leased;
//! it is picked up again once the lease expires.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{ResponseFailure, StatusResult};
use crate::guard::PendingGuard;
use crate::observe::{NoopObserver, TransitionObserver};
use crate::retry::EntityRetryProcessConfiguration;
use crate::store::{Criterion, StateEntityStore};

/// Work performed for an entity in one state.
///
/// `Ok(None)` moves the entity to the processor's success state, `Ok(Some(s))`
/// to `s` instead. Mutations made to `entity` are persisted with whatever
/// outcome follows, including failures.
#[async_trait]
pub trait StateHandler<E: StatefulEntity>: Send + Sync {
    async fn handle(&self, entity: &mut E) -> StatusResult<Option<E::State>>;
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F>(F);

/// Wrap a synchronous closure as a [`StateHandler`].
pub fn local<E, F>(f: F) -> FnHandler<F>
where
    E: StatefulEntity,
    F: Fn(&mut E) -> StatusResult<Option<E::State>> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<E, F> StateHandler<E> for FnHandler<F>
where
    E: StatefulEntity,
    F: Fn(&mut E) -> StatusResult<Option<E::State>> + Send + Sync,
{
    async fn handle(&self, entity: &mut E) -> StatusResult<Option<E::State>> {
        (self.0)(entity)
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Pause between ticks that found nothing to start.
    pub iteration_wait: Duration,
    /// Maximum entities leased per state per tick.
    pub batch_size: usize,
    /// Maximum handlers running at once.
    pub max_concurrency: usize,
    /// Handler runs longer than this count as retryable failures.
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub drain_timeout: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            iteration_wait: Duration::from_millis(1000),
            batch_size: 20,
            max_concurrency: 16,
            handler_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

struct StateProcessor<E: StatefulEntity> {
    state: E::State,
    criteria: Vec<Criterion>,
    handler: Arc<dyn StateHandler<E>>,
    success: E::State,
    failure: E::State,
}

/// Builder for [`StateMachineManager`].
pub struct StateMachineBuilder<E: StatefulEntity> {
    name: String,
    store: Arc<dyn StateEntityStore<E>>,
    config: StateMachineConfig,
    retry: EntityRetryProcessConfiguration,
    guard: Option<Arc<dyn PendingGuard<E>>>,
    observer: Arc<dyn TransitionObserver<E>>,
    clock: Arc<dyn Clock>,
    processors: Vec<StateProcessor<E>>,
}

impl<E: StatefulEntity> StateMachineBuilder<E> {
    pub fn config(mut self, config: StateMachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: EntityRetryProcessConfiguration) -> Self {
        self.retry = retry;
        self
    }

    pub fn pending_guard(mut self, guard: Arc<dyn PendingGuard<E>>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TransitionObserver<E>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register the handler for `state`.
    pub fn processor(
        self,
        state: E::State,
        handler: impl StateHandler<E> + 'static,
        success: E::State,
        failure: E::State,
    ) -> Self {
        self.processor_where(state, Vec::new(), handler, success, failure)
    }

    /// Register the handler for `state`, restricted to entities that also
    /// match `criteria`.
    pub fn processor_where(
        mut self,
        state: E::State,
        criteria: Vec<Criterion>,
        handler: impl StateHandler<E> + 'static,
        success: E::State,
        failure: E::State,
    ) -> Self {
        self.processors.push(StateProcessor {
            state,
            criteria,
            handler: Arc::new(handler),
            success,
            failure,
        });
        self
    }

    pub fn build(self) -> StateMachineManager<E> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        StateMachineManager {
            engine: Arc::new(Engine {
                name: self.name,
                store: self.store,
                config: self.config,
                retry: self.retry,
                guard: self.guard,
                observer: self.observer,
                clock: self.clock,
                processors: self.processors,
                permits,
            }),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Polling runner for one entity kind.
pub struct StateMachineManager<E: StatefulEntity> {
    engine: Arc<Engine<E>>,
    shutdown: Arc<Notify>,
}

impl<E: StatefulEntity> Clone for StateMachineManager<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<E: StatefulEntity> StateMachineManager<E> {
    pub fn builder(
        name: impl Into<String>,
        store: Arc<dyn StateEntityStore<E>>,
    ) -> StateMachineBuilder<E> {
        StateMachineBuilder {
            name: name.into(),
            store,
            config: StateMachineConfig::default(),
            retry: EntityRetryProcessConfiguration::default(),
            guard: None,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            processors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.engine.name
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run ticks until shutdown is signalled, then drain in-flight handlers.
    pub async fn run(&self) {
        let engine = &self.engine;
        info!(
            name = %engine.name,
            states = engine.processors.len(),
            batch_size = engine.config.batch_size,
            max_concurrency = engine.config.max_concurrency,
            iteration_wait_ms = engine.config.iteration_wait.as_millis() as u64,
            "State machine started"
        );

        let mut tasks = JoinSet::new();
        loop {
            while let Some(result) = tasks.try_join_next() {
                engine.log_join(result);
            }

            let started = engine.dispatch_tick(&mut tasks).await;
            let wait = if started > 0 {
                Duration::ZERO
            } else {
                engine.config.iteration_wait
            };

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(name = %engine.name, in_flight = tasks.len(), "State machine shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        engine.drain(tasks).await;
        info!(name = %engine.name, "State machine stopped");
    }

    /// Run a single tick and wait for every handler it started.
    ///
    /// Returns the number of handlers started.
    pub async fn process_once(&self) -> usize {
        let mut tasks = JoinSet::new();
        let started = self.engine.dispatch_tick(&mut tasks).await;
        while let Some(result) = tasks.join_next().await {
            self.engine.log_join(result);
        }
        started
    }
}

struct Engine<E: StatefulEntity> {
    name: String,
    store: Arc<dyn StateEntityStore<E>>,
    config: StateMachineConfig,
    retry: EntityRetryProcessConfiguration,
    guard: Option<Arc<dyn PendingGuard<E>>>,
    observer: Arc<dyn TransitionObserver<E>>,
    clock: Arc<dyn Clock>,
    processors: Vec<StateProcessor<E>>,
    permits: Arc<Semaphore>,
}

impl<E: StatefulEntity> Engine<E> {
    /// Lease work for every state and spawn a task per due entity.
    async fn dispatch_tick(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> usize {
        let mut started = 0;
        for index in 0..self.processors.len() {
            let processor = &self.processors[index];
            let available = self.permits.available_permits().min(self.config.batch_size);
            if available == 0 {
                debug!(name = %self.name, "All handler permits in use, deferring");
                break;
            }

            let mut criteria = vec![
                Criterion::eq("state", processor.state.code()),
                Criterion::eq("pending", false),
            ];
            criteria.extend(processor.criteria.iter().cloned());

            let entities = match self.store.next_not_leased(available, &criteria).await {
                Ok(entities) => entities,
                Err(e) => {
                    error!(
                        name = %self.name,
                        state = %processor.state,
                        error = %e,
                        "Failed to lease entities"
                    );
                    continue;
                }
            };

            let now = self.clock.now_millis();
            for entity in entities {
                if !self.retry.is_due(&entity, now) {
                    self.release(entity.id()).await;
                    continue;
                }
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    self.release(entity.id()).await;
                    continue;
                };
                let engine = Arc::clone(self);
                tasks.spawn(async move {
                    engine.process(index, entity).await;
                    drop(permit);
                });
                started += 1;
            }
        }
        started
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id).await {
            warn!(name = %self.name, entity_id = %id, error = %e, "Failed to release lease");
        }
    }

    async fn process(&self, index: usize, leased: E) {
        let processor = &self.processors[index];
        let id = leased.id().to_string();

        let mut entity = match self.store.find_by_id(&id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(name = %self.name, entity_id = %id, "Leased entity disappeared");
                return;
            }
            Err(e) => {
                error!(name = %self.name, entity_id = %id, error = %e, "Failed to re-read entity");
                return;
            }
        };

        let now = self.clock.now_millis();
        if !entity.meta().is_leased_by(self.store.lease_holder(), now) {
            debug!(name = %self.name, entity_id = %id, "Lease lost before processing");
            return;
        }
        if entity.meta().state != processor.state.code() || entity.is_pending() {
            debug!(name = %self.name, entity_id = %id, "Entity changed since it was leased");
            self.release(&id).await;
            return;
        }

        if self.guard.as_ref().is_some_and(|guard| guard.test(&entity)) {
            entity.set_pending(true);
            if self.persist(&entity).await.is_some() {
                debug!(name = %self.name, entity_id = %id, state = %processor.state, "Entity parked as pending");
            }
            return;
        }

        let outcome = AssertUnwindSafe(tokio::time::timeout(
            self.config.handler_timeout,
            processor.handler.handle(&mut entity),
        ))
        .catch_unwind()
        .await;

        let outcome = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(ResponseFailure::retryable(format!(
                "handler timed out after {}ms",
                self.config.handler_timeout.as_millis()
            ))),
            Err(panic) => {
                error!(
                    name = %self.name,
                    entity_id = %id,
                    state = %processor.state,
                    panic = %panic_message(&panic),
                    "State handler panicked; entity stays leased until the lease expires"
                );
                return;
            }
        };

        self.apply(processor, entity, outcome).await;
    }

    async fn apply(
        &self,
        processor: &StateProcessor<E>,
        mut entity: E,
        outcome: StatusResult<Option<E::State>>,
    ) {
        let previous = processor.state;
        let now = self.clock.now_millis();

        match outcome {
            Ok(next) => {
                let target = next.unwrap_or(processor.success);
                if let Err(e) = entity.transition_to(target, now) {
                    error!(name = %self.name, error = %e, "Handler requested an illegal transition");
                    return;
                }
                if let Some(saved) = self.persist(&entity).await {
                    debug!(
                        name = %self.name,
                        entity_id = %saved.id(),
                        from = %previous,
                        to = %target,
                        "Entity transitioned"
                    );
                    self.observer.transitioned(&saved, previous);
                }
            }
            Err(failure) if failure.is_retryable() && !self.retry.retries_exhausted(&entity) => {
                if self.guard.as_ref().is_some_and(|guard| guard.test(&entity)) {
                    entity.set_pending(true);
                    self.persist(&entity).await;
                    return;
                }
                entity.retry_state(now);
                if let Some(saved) = self.persist(&entity).await {
                    let delay = self.retry.wait_strategy().retry_in(saved.state_count());
                    warn!(
                        name = %self.name,
                        entity_id = %saved.id(),
                        state = %previous,
                        attempt = saved.state_count(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Retryable failure, will retry"
                    );
                }
            }
            Err(failure) => {
                let detail = failure.detail();
                if let Err(e) = entity.fail_to(processor.failure, detail.clone(), now) {
                    error!(name = %self.name, error = %e, "Failure state is not reachable");
                    return;
                }
                if let Some(saved) = self.persist(&entity).await {
                    warn!(
                        name = %self.name,
                        entity_id = %saved.id(),
                        from = %previous,
                        to = %processor.failure,
                        error = %detail,
                        "Entity moved to failure state"
                    );
                    self.observer.failed(&saved, previous, &detail);
                }
            }
        }
    }

    async fn persist(&self, entity: &E) -> Option<E> {
        match self.store.save(entity).await {
            Ok(saved) => Some(saved),
            Err(e) => {
                error!(
                    name = %self.name,
                    entity_id = %entity.id(),
                    error = %e,
                    code = e.error_code(),
                    "Failed to persist entity; it will be retried after the lease expires"
                );
                None
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let in_flight = tasks.len();
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(result) = tasks.join_next().await {
                self.log_join(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                name = %self.name,
                in_flight,
                abandoned = tasks.len(),
                "Drain timeout elapsed; abandoning handlers to lease expiry"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn log_join(&self, result: Result<(), JoinError>) {
        if let Err(e) = result
            && !e.is_cancelled()
        {
            error!(name = %self.name, error = %e, "State machine task failed");
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
