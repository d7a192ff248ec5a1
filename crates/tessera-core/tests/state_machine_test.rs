// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner behaviour: outcomes, retries, pending guard, panics, concurrency and
//! shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use common::{LEASE, Ticket, TicketState, backends, memory_backend};
use tessera_core::{
    EntityRetryProcessConfiguration, ManualClock, ResponseFailure, StateEntityStore,
    StateHandler, StateMachineConfig, StateMachineManager, StatefulEntity, StatusResult,
    TransitionObserver, local,
};

fn fast_config() -> StateMachineConfig {
    StateMachineConfig {
        iteration_wait: Duration::from_millis(10),
        batch_size: 10,
        max_concurrency: 4,
        handler_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(1),
    }
}

fn sending_manager(
    store: Arc<dyn StateEntityStore<Ticket>>,
    clock: &ManualClock,
    retry: EntityRetryProcessConfiguration,
    handler: impl StateHandler<Ticket> + 'static,
) -> StateMachineManager<Ticket> {
    StateMachineManager::builder("tickets", store)
        .config(fast_config())
        .clock(Arc::new(clock.clone()))
        .retry(retry)
        .processor(TicketState::Sending, handler, TicketState::Sent, TicketState::Failed)
        .build()
}

async fn load(store: &Arc<dyn StateEntityStore<Ticket>>, id: &str) -> Ticket {
    store.find_by_id(id).await.unwrap().unwrap()
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl TransitionObserver<Ticket> for RecordingObserver {
    fn transitioned(&self, entity: &Ticket, previous: TicketState) {
        self.events.lock().unwrap().push(format!(
            "{}:{}->{}",
            entity.id(),
            previous,
            entity.state().unwrap()
        ));
    }

    fn failed(&self, entity: &Ticket, previous: TicketState, detail: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}-x {}", entity.id(), previous, detail));
    }
}

#[tokio::test]
async fn test_retry_limit_one_fails_on_second_attempt() {
    let clock = ManualClock::new(1_000);
    for backend in backends(&clock).await {
        let store = backend.store.clone();
        store
            .save(&Ticket::new("t-1", TicketState::Sending, 1_000))
            .await
            .unwrap();

        let manager = sending_manager(
            store.clone(),
            &clock,
            EntityRetryProcessConfiguration::immediate(1),
            local(|ticket: &mut Ticket| {
                ticket.notes.push("attempt".to_string());
                Err(ResponseFailure::retryable("peer unavailable"))
            }),
        );

        assert_eq!(manager.process_once().await, 1);
        let ticket = load(&store, "t-1").await;
        assert_eq!(ticket.state(), Some(TicketState::Sending), "backend {}", backend.name);
        assert_eq!(ticket.state_count(), 1);
        assert_eq!(ticket.notes.len(), 1);

        assert_eq!(manager.process_once().await, 1);
        let ticket = load(&store, "t-1").await;
        assert_eq!(ticket.state(), Some(TicketState::Failed), "backend {}", backend.name);
        assert_eq!(ticket.error_detail(), Some("peer unavailable"));
        assert_eq!(ticket.notes.len(), 2);
    }
}

#[tokio::test]
async fn test_fatal_failure_skips_retries() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Sending, 0)).await.unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let manager = StateMachineManager::builder("tickets", store.clone())
        .clock(Arc::new(clock.clone()))
        .retry(EntityRetryProcessConfiguration::immediate(5))
        .observer(observer.clone())
        .processor(
            TicketState::Sending,
            local(|_: &mut Ticket| Err(ResponseFailure::fatal("rejected by peer"))),
            TicketState::Sent,
            TicketState::Failed,
        )
        .build();

    manager.process_once().await;
    let ticket = load(&store, "t-1").await;
    assert_eq!(ticket.state(), Some(TicketState::Failed));
    assert_eq!(ticket.state_count(), 0);
    assert_eq!(
        *observer.events.lock().unwrap(),
        ["t-1:SENDING-x rejected by peer".to_string()]
    );
}

#[tokio::test]
async fn test_retry_waits_for_backoff_delay() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Sending, 0)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let manager = sending_manager(
        store.clone(),
        &clock,
        EntityRetryProcessConfiguration::exponential(
            5,
            Duration::from_secs(1),
            Duration::from_secs(60),
        ),
        local(move |_: &mut Ticket| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ResponseFailure::retryable("timeout"))
        }),
    );

    assert_eq!(manager.process_once().await, 1);
    assert_eq!(manager.process_once().await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the skipped entity must be released, not left leased
    assert!(load(&store, "t-1").await.meta.lease.is_none());

    clock.advance(Duration::from_millis(999));
    assert_eq!(manager.process_once().await, 0);
    clock.advance(Duration::from_millis(1));
    assert_eq!(manager.process_once().await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(load(&store, "t-1").await.state_count(), 2);
}

#[tokio::test]
async fn test_success_and_explicit_next_state() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("plain", TicketState::Sending, 0)).await.unwrap();
    let mut urgent = Ticket::new("urgent", TicketState::Sending, 1);
    urgent.owner = "ops".to_string();
    store.save(&urgent).await.unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let manager = StateMachineManager::builder("tickets", store.clone())
        .clock(Arc::new(clock.clone()))
        .observer(observer.clone())
        .processor(
            TicketState::Sending,
            local(|ticket: &mut Ticket| {
                if ticket.owner == "ops" {
                    Ok(Some(TicketState::Failed))
                } else {
                    Ok(None)
                }
            }),
            TicketState::Sent,
            TicketState::Failed,
        )
        .build();

    assert_eq!(manager.process_once().await, 2);
    assert_eq!(load(&store, "plain").await.state(), Some(TicketState::Sent));
    assert_eq!(load(&store, "urgent").await.state(), Some(TicketState::Failed));

    let mut events = observer.events.lock().unwrap().clone();
    events.sort();
    assert_eq!(events, ["plain:SENDING->SENT", "urgent:SENDING->FAILED"]);
}

#[tokio::test]
async fn test_pending_guard_parks_entity_without_running_handler() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    let mut held = Ticket::new("held", TicketState::Sending, 0);
    held.owner = "legal".to_string();
    store.save(&held).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let manager = StateMachineManager::builder("tickets", store.clone())
        .clock(Arc::new(clock.clone()))
        .pending_guard(Arc::new(|ticket: &Ticket| ticket.owner == "legal"))
        .processor(
            TicketState::Sending,
            local(move |_: &mut Ticket| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
            TicketState::Sent,
            TicketState::Failed,
        )
        .build();

    manager.process_once().await;
    let ticket = load(&store, "held").await;
    assert!(ticket.is_pending());
    assert_eq!(ticket.state(), Some(TicketState::Sending));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(manager.process_once().await, 0);
}

#[tokio::test]
async fn test_panicking_handler_leaves_entity_leased_until_expiry() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Sending, 0)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let manager = sending_manager(
        store.clone(),
        &clock,
        EntityRetryProcessConfiguration::immediate(3),
        local(move |_: &mut Ticket| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler bug");
            }
            Ok(None)
        }),
    );

    manager.process_once().await;
    let ticket = load(&store, "t-1").await;
    assert_eq!(ticket.state(), Some(TicketState::Sending));
    assert_eq!(ticket.meta.version, 1);
    assert!(ticket.meta.lease.is_some());

    assert_eq!(manager.process_once().await, 0);

    clock.advance(LEASE);
    assert_eq!(manager.process_once().await, 1);
    assert_eq!(load(&store, "t-1").await.state(), Some(TicketState::Sent));
}

#[tokio::test]
async fn test_illegal_transition_is_not_persisted() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Sending, 0)).await.unwrap();

    let manager = sending_manager(
        store.clone(),
        &clock,
        EntityRetryProcessConfiguration::immediate(3),
        local(|_: &mut Ticket| Ok(Some(TicketState::Closed))),
    );

    manager.process_once().await;
    let ticket = load(&store, "t-1").await;
    assert_eq!(ticket.state(), Some(TicketState::Sending));
    assert_eq!(ticket.meta.version, 1);
}

struct SlowHandler {
    running: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl StateHandler<Ticket> for Arc<SlowHandler> {
    async fn handle(&self, _ticket: &mut Ticket) -> StatusResult<Option<TicketState>> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_permits() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    for i in 0..6 {
        store
            .save(&Ticket::new(&format!("t-{}", i), TicketState::Sending, i))
            .await
            .unwrap();
    }

    let handler = Arc::new(SlowHandler {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        delay: Duration::from_millis(30),
    });
    let manager = StateMachineManager::builder("tickets", store.clone())
        .clock(Arc::new(clock.clone()))
        .config(StateMachineConfig {
            max_concurrency: 2,
            ..fast_config()
        })
        .processor(
            TicketState::Sending,
            handler.clone(),
            TicketState::Sent,
            TicketState::Failed,
        )
        .build();

    assert_eq!(manager.process_once().await, 2);
    assert_eq!(manager.process_once().await, 2);
    assert_eq!(manager.process_once().await, 2);
    assert_eq!(manager.process_once().await, 0);
    assert!(handler.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_handler_timeout_counts_as_retryable() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Sending, 0)).await.unwrap();

    let handler = Arc::new(SlowHandler {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        delay: Duration::from_millis(200),
    });
    let manager = StateMachineManager::builder("tickets", store.clone())
        .clock(Arc::new(clock.clone()))
        .retry(EntityRetryProcessConfiguration::immediate(3))
        .config(StateMachineConfig {
            handler_timeout: Duration::from_millis(20),
            ..fast_config()
        })
        .processor(TicketState::Sending, handler, TicketState::Sent, TicketState::Failed)
        .build();

    manager.process_once().await;
    let ticket = load(&store, "t-1").await;
    assert_eq!(ticket.state(), Some(TicketState::Sending));
    assert_eq!(ticket.state_count(), 1);
}

#[tokio::test]
async fn test_run_loop_processes_chain_and_stops_on_shutdown() {
    let clock = ManualClock::new(0);
    let backend = memory_backend(&clock);
    let store = backend.store.clone();
    store.save(&Ticket::new("t-1", TicketState::Open, 0)).await.unwrap();

    let manager = StateMachineManager::builder("tickets", store.clone())
        .config(fast_config())
        .clock(Arc::new(clock.clone()))
        .processor(
            TicketState::Open,
            local(|_: &mut Ticket| Ok(None)),
            TicketState::Sending,
            TicketState::Failed,
        )
        .processor(
            TicketState::Sending,
            local(|_: &mut Ticket| Ok(None)),
            TicketState::Sent,
            TicketState::Failed,
        )
        .build();

    let shutdown = manager.shutdown_handle();
    let runner = manager.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let mut reached = false;
    for _ in 0..200 {
        if load(&store, "t-1").await.state() == Some(TicketState::Sent) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "ticket never reached SENT");

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("runner did not stop")
        .unwrap();
}
