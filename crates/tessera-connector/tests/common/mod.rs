// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tessera-connector integration tests.
//!
//! Builds a consumer and a provider connector on one loopback network with a
//! shared [`ManualClock`]. The state machines are not spawned; tests step
//! them with [`Pair::settle`] so every run is deterministic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tessera_connector::dispatch::RemoteMessageDispatcher;
use tessera_connector::identity::{StaticIdentityService, TokenRepresentation};
use tessera_connector::loopback::{LOOPBACK_PROTOCOL, LoopbackDispatcher, LoopbackNetwork};
use tessera_connector::message::ProtocolMessage;
use tessera_connector::negotiation::{ContractNegotiationListener, ContractRequest};
use tessera_connector::transfer::{DataAddressProvisioner, TransferProcessListener, TransferRequest};
use tessera_connector::{
    ConnectorRuntime, ConnectorRuntimeBuilder, ConnectorRuntimeConfig, ConnectorStores,
    ContractNegotiation, ContractOffer, DataAddress, TransferProcess,
};
use tessera_core::{
    Criterion, EntityRetryProcessConfiguration, ManualClock, QuerySpec, ResponseFailure,
    StateEntityStore, StatefulEntity, StatusResult, StoreError, StoreResult,
};
use tokio::sync::Barrier;

pub const CONSUMER_ID: &str = "consumer-a";
pub const PROVIDER_ID: &str = "provider-b";
pub const CONSUMER_TOKEN: &str = "consumer-a-token";
pub const PROVIDER_TOKEN: &str = "provider-b-token";
pub const ASSET_ID: &str = "asset-1";
pub const LEASE: Duration = Duration::from_secs(30);
const MAX_ROUNDS: usize = 50;

/// Listener recording `<event>:<id>` for both process kinds.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: &str, id: &str) {
        self.events.lock().unwrap().push(format!("{event}:{id}"));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        let prefix = format!("{event}:");
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .count()
    }
}

impl ContractNegotiationListener for Recorder {
    fn initiated(&self, n: &ContractNegotiation) {
        self.push("initiated", n.id());
    }

    fn requested(&self, n: &ContractNegotiation) {
        self.push("requested", n.id());
    }

    fn offered(&self, n: &ContractNegotiation) {
        self.push("offered", n.id());
    }

    fn accepted(&self, n: &ContractNegotiation) {
        self.push("accepted", n.id());
    }

    fn agreed(&self, n: &ContractNegotiation) {
        self.push("agreed", n.id());
    }

    fn verified(&self, n: &ContractNegotiation) {
        self.push("verified", n.id());
    }

    fn finalized(&self, n: &ContractNegotiation) {
        self.push("finalized", n.id());
    }

    fn terminated(&self, n: &ContractNegotiation) {
        self.push("terminated", n.id());
    }

    fn failed(&self, n: &ContractNegotiation, _detail: &str) {
        self.push("failed", n.id());
    }
}

impl TransferProcessListener for Recorder {
    fn initiated(&self, p: &TransferProcess) {
        self.push("transfer-initiated", p.id());
    }

    fn provisioned(&self, p: &TransferProcess) {
        self.push("transfer-provisioned", p.id());
    }

    fn requested(&self, p: &TransferProcess) {
        self.push("transfer-requested", p.id());
    }

    fn started(&self, p: &TransferProcess) {
        self.push("transfer-started", p.id());
    }

    fn completed(&self, p: &TransferProcess) {
        self.push("transfer-completed", p.id());
    }

    fn terminated(&self, p: &TransferProcess) {
        self.push("transfer-terminated", p.id());
    }

    fn deprovisioned(&self, p: &TransferProcess) {
        self.push("transfer-deprovisioned", p.id());
    }

    fn failed(&self, p: &TransferProcess, _detail: &str) {
        self.push("transfer-failed", p.id());
    }
}

/// Dispatcher that counts attempts and always fails.
#[derive(Default)]
pub struct FailingDispatcher {
    pub attempts: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteMessageDispatcher for FailingDispatcher {
    fn protocol(&self) -> &str {
        LOOPBACK_PROTOCOL
    }

    async fn dispatch(&self, _address: &str, message: ProtocolMessage) -> StatusResult<()> {
        self.attempts.lock().unwrap().push(message.name().to_string());
        Err(ResponseFailure::retryable("connection refused"))
    }
}

/// Delivers every message, but reports the first `message` as timed out as
/// if the counter-party's reply was lost.
pub struct LostAck {
    inner: LoopbackDispatcher,
    message: &'static str,
    lost: AtomicBool,
}

impl LostAck {
    pub fn new(network: LoopbackNetwork, token: &str, message: &'static str) -> Self {
        Self {
            inner: LoopbackDispatcher::new(network, TokenRepresentation::new(token)),
            message,
            lost: AtomicBool::new(false),
        }
    }

    pub fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteMessageDispatcher for LostAck {
    fn protocol(&self) -> &str {
        LOOPBACK_PROTOCOL
    }

    async fn dispatch(&self, address: &str, message: ProtocolMessage) -> StatusResult<()> {
        let name = message.name();
        self.inner.dispatch(address, message).await?;
        if name == self.message && !self.lost.swap(true, Ordering::SeqCst) {
            return Err(ResponseFailure::retryable("read timeout"));
        }
        Ok(())
    }
}

/// Negotiation store whose first two correlation lookups that find nothing
/// wait for each other, so both callers go on to create the entity.
pub struct RacingLookups {
    inner: Arc<dyn StateEntityStore<ContractNegotiation>>,
    barrier: Arc<Barrier>,
    misses: Arc<AtomicUsize>,
}

impl RacingLookups {
    pub fn new(inner: Arc<dyn StateEntityStore<ContractNegotiation>>) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(2)),
            misses: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl StateEntityStore<ContractNegotiation> for RacingLookups {
    fn lease_holder(&self) -> &str {
        self.inner.lease_holder()
    }

    fn for_holder(&self, holder: &str) -> Arc<dyn StateEntityStore<ContractNegotiation>> {
        Arc::new(Self {
            inner: self.inner.for_holder(holder),
            barrier: self.barrier.clone(),
            misses: self.misses.clone(),
        })
    }

    async fn save(&self, entity: &ContractNegotiation) -> StoreResult<ContractNegotiation> {
        self.inner.save(entity).await
    }

    async fn next_not_leased(
        &self,
        max: usize,
        criteria: &[Criterion],
    ) -> StoreResult<Vec<ContractNegotiation>> {
        self.inner.next_not_leased(max, criteria).await
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<ContractNegotiation>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<ContractNegotiation> {
        self.inner.find_by_id_and_lease(id).await
    }

    async fn find_by_correlation_id_and_lease(
        &self,
        correlation_id: &str,
    ) -> StoreResult<ContractNegotiation> {
        let found = self.inner.find_by_correlation_id_and_lease(correlation_id).await;
        if matches!(found, Err(StoreError::NotFound { .. }))
            && self.misses.fetch_add(1, Ordering::SeqCst) < 2
        {
            self.barrier.wait().await;
        }
        found
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        self.inner.break_lease(id).await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn find_all(&self, query: &QuerySpec) -> StoreResult<Vec<ContractNegotiation>> {
        self.inner.find_all(query).await
    }
}

pub type Customize = Box<dyn FnOnce(ConnectorRuntimeBuilder) -> ConnectorRuntimeBuilder>;

/// Consumer and provider connectors wired on one loopback network.
pub struct Pair {
    pub clock: ManualClock,
    pub network: LoopbackNetwork,
    pub consumer: ConnectorRuntimeConfig,
    pub provider: ConnectorRuntimeConfig,
    pub consumer_events: Arc<Recorder>,
    pub provider_events: Arc<Recorder>,
    _dir: Option<TempDir>,
}

impl Pair {
    pub async fn new() -> Self {
        Self::with(Box::new(|b| b), Box::new(|b| b)).await
    }

    /// Consumer persisted in a temporary SQLite database.
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("consumer.db").display());
        let clock = ManualClock::new(1_000_000);
        let stores = ConnectorStores::sqlite(
            &url,
            &format!("{CONSUMER_ID}/api"),
            LEASE,
            Arc::new(clock.clone()),
        )
        .await
        .expect("Failed to open SQLite stores");
        let mut pair = Self::build(
            clock,
            LoopbackNetwork::new(),
            Box::new(move |b| b.stores(stores)),
            Box::new(|b| b),
        );
        pair._dir = Some(dir);
        pair
    }

    pub async fn with(consumer: Customize, provider: Customize) -> Self {
        Self::on_network(LoopbackNetwork::new(), consumer, provider).await
    }

    /// Like [`Pair::with`], on a network the caller already holds, e.g. for
    /// dispatchers that wrap the loopback one.
    pub async fn on_network(
        network: LoopbackNetwork,
        consumer: Customize,
        provider: Customize,
    ) -> Self {
        Self::build(ManualClock::new(1_000_000), network, consumer, provider)
    }

    fn build(
        clock: ManualClock,
        network: LoopbackNetwork,
        consumer: Customize,
        provider: Customize,
    ) -> Self {
        let identity = Arc::new(
            StaticIdentityService::new()
                .with_token(CONSUMER_TOKEN, CONSUMER_ID)
                .with_token(PROVIDER_TOKEN, PROVIDER_ID),
        );
        let consumer_events = Arc::new(Recorder::default());
        let provider_events = Arc::new(Recorder::default());

        let base = |participant: &str, token: &str, events: &Arc<Recorder>| {
            ConnectorRuntime::builder()
                .participant_id(participant)
                .identity(identity.clone())
                .dispatcher(Arc::new(LoopbackDispatcher::new(
                    network.clone(),
                    TokenRepresentation::new(token),
                )))
                .negotiation_listener(events.clone())
                .transfer_listener(events.clone())
                .retry(EntityRetryProcessConfiguration::immediate(3))
                .lease_duration(LEASE)
                .clock(Arc::new(clock.clone()))
        };

        let consumer = consumer(base(CONSUMER_ID, CONSUMER_TOKEN, &consumer_events))
            .build()
            .expect("Failed to build consumer");
        let provider = provider(
            base(PROVIDER_ID, PROVIDER_TOKEN, &provider_events).provisioner(Arc::new(
                DataAddressProvisioner::new().with_source(
                    ASSET_ID,
                    DataAddress::new("HttpData").with_property("baseUrl", "https://provider.test/asset-1"),
                ),
            )),
        )
        .build()
        .expect("Failed to build provider");

        network.register(consumer.protocol_address(), consumer.endpoint());
        network.register(provider.protocol_address(), provider.endpoint());

        Self {
            clock,
            network,
            consumer,
            provider,
            consumer_events,
            provider_events,
            _dir: None,
        }
    }

    /// One tick of every state machine; returns the handlers started.
    pub async fn step(&self) -> usize {
        self.consumer.negotiation_manager().process_once().await
            + self.provider.negotiation_manager().process_once().await
            + self.consumer.transfer_manager().process_once().await
            + self.provider.transfer_manager().process_once().await
    }

    /// Step until a round starts nothing.
    pub async fn settle(&self) {
        for _ in 0..MAX_ROUNDS {
            if self.step().await == 0 {
                return;
            }
        }
        panic!("state machines did not settle after {MAX_ROUNDS} rounds");
    }

    pub fn contract_request(&self) -> ContractRequest {
        ContractRequest {
            counter_party_id: PROVIDER_ID.to_string(),
            counter_party_address: self.provider.protocol_address().to_string(),
            protocol: LOOPBACK_PROTOCOL.to_string(),
            offer: offer("offer-1"),
            callback_addresses: Vec::new(),
        }
    }

    pub fn transfer_request(&self, contract_id: &str) -> TransferRequest {
        TransferRequest {
            counter_party_address: self.provider.protocol_address().to_string(),
            protocol: LOOPBACK_PROTOCOL.to_string(),
            contract_id: contract_id.to_string(),
            destination: DataAddress::new("HttpProxy"),
            callback_addresses: Vec::new(),
        }
    }

    /// The provider side of the consumer negotiation `consumer_id`.
    pub async fn provider_negotiation(&self, consumer_id: &str) -> ContractNegotiation {
        let consumer = self.consumer.negotiations().find_by_id(consumer_id).await.unwrap();
        let provider_id = consumer
            .correlation_id
            .expect("consumer negotiation is not correlated yet");
        self.provider.negotiations().find_by_id(&provider_id).await.unwrap()
    }

    /// Negotiate `offer-1` to FINALIZED on both sides and return the consumer
    /// negotiation.
    pub async fn finalized_negotiation(&self) -> ContractNegotiation {
        let negotiation = self
            .consumer
            .negotiations()
            .initiate(self.contract_request())
            .await
            .unwrap();
        self.settle().await;
        self.consumer.negotiations().find_by_id(negotiation.id()).await.unwrap()
    }
}

pub fn offer(id: &str) -> ContractOffer {
    ContractOffer {
        id: id.to_string(),
        asset_id: ASSET_ID.to_string(),
        provider_id: PROVIDER_ID.to_string(),
        policy: serde_json::json!({ "permission": [{ "action": "use" }] }),
    }
}
