// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tessera-connector.
//!
//! [`ConnectorRuntime`] wires stores, protocol services, local services and
//! the two state machines of one participant, and runs the state machines as
//! background tasks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_connector::identity::{StaticIdentityService, TokenRepresentation};
//! use tessera_connector::loopback::{LoopbackDispatcher, LoopbackNetwork};
//! use tessera_connector::runtime::ConnectorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = LoopbackNetwork::new();
//!     let identity = StaticIdentityService::new().with_token("provider-token", "provider-b");
//!
//!     let config = ConnectorRuntime::builder()
//!         .participant_id("consumer-a")
//!         .protocol_address("loopback://consumer-a")
//!         .identity(Arc::new(identity))
//!         .dispatcher(Arc::new(LoopbackDispatcher::new(network.clone(), TokenRepresentation::new("consumer-token"))))
//!         .build()?;
//!
//!     // Make the connector reachable before its state machines start.
//!     network.register(config.protocol_address(), config.endpoint());
//!     let runtime = config.start().await?;
//!
//!     // ... drive negotiations through runtime.negotiations() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Lease holders
//!
//! Every component leases under its own name, derived from the participant
//! id and the instance id of this process:
//! `<participant>/<instance>/negotiation-manager`,
//! `<participant>/<instance>/transfer-manager`, `<participant>/<instance>/protocol`
//! and `<participant>/<instance>/api`. Replicas of one participant sharing a
//! database therefore never mistake each other's leases for their own. The
//! instance id is random unless set with
//! [`ConnectorRuntimeBuilder::instance_id`].
//!
//! A protocol message that arrives while the runner holds the entity is
//! answered with a conflict and retried by the sender.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tessera_core::{
    Clock, EntityRetryProcessConfiguration, InMemoryStateEntityStore, PendingGuard,
    SqliteStateEntityStore, StateEntityStore, StateMachineConfig, StateMachineManager,
    SystemClock,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::dispatch::{RemoteMessageDispatcher, RemoteMessageDispatcherRegistry};
use crate::error::Error;
use crate::identity::IdentityService;
use crate::loopback::LoopbackEndpoint;
use crate::negotiation::{
    ContractNegotiation, ContractNegotiationListener, ContractNegotiationObservable,
    ContractNegotiationProtocolService, ContractNegotiationService, NegotiationContext,
    build_negotiation_manager,
};
use crate::transfer::{
    ContractAgreementResolver, DataAddressProvisioner, Provisioner, TransferContext,
    TransferProcess, TransferProcessListener, TransferProcessObservable,
    TransferProcessProtocolService, TransferProcessService, build_transfer_manager,
};
use crate::validation::{ContractValidationService, DefaultContractValidationService};

/// Stores for both process kinds.
#[derive(Clone)]
pub struct ConnectorStores {
    pub negotiations: Arc<dyn StateEntityStore<ContractNegotiation>>,
    pub transfers: Arc<dyn StateEntityStore<TransferProcess>>,
}

impl ConnectorStores {
    pub fn in_memory(holder: &str, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            negotiations: Arc::new(
                InMemoryStateEntityStore::new(holder)
                    .with_lease_duration(lease_duration)
                    .with_clock(clock.clone()),
            ),
            transfers: Arc::new(
                InMemoryStateEntityStore::new(holder)
                    .with_lease_duration(lease_duration)
                    .with_clock(clock),
            ),
        }
    }

    /// Both kinds in one SQLite database, sharing a pool.
    pub async fn sqlite(
        url: &str,
        holder: &str,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> crate::error::Result<Self> {
        let negotiations = SqliteStateEntityStore::<ContractNegotiation>::connect(url, holder)
            .await?
            .with_lease_duration(lease_duration)
            .with_clock(clock.clone());
        let transfers =
            SqliteStateEntityStore::<TransferProcess>::new(negotiations.pool().clone(), holder)
                .with_lease_duration(lease_duration)
                .with_clock(clock);
        Ok(Self {
            negotiations: Arc::new(negotiations),
            transfers: Arc::new(transfers),
        })
    }
}

/// Builder for configuring a [`ConnectorRuntime`].
pub struct ConnectorRuntimeBuilder {
    participant_id: Option<String>,
    instance_id: Option<String>,
    protocol_address: Option<String>,
    stores: Option<ConnectorStores>,
    identity: Option<Arc<dyn IdentityService>>,
    validation: Arc<dyn ContractValidationService>,
    dispatchers: RemoteMessageDispatcherRegistry,
    provisioner: Arc<dyn Provisioner>,
    negotiation_listeners: Vec<Arc<dyn ContractNegotiationListener>>,
    transfer_listeners: Vec<Arc<dyn TransferProcessListener>>,
    negotiation_guard: Option<Arc<dyn PendingGuard<ContractNegotiation>>>,
    transfer_guard: Option<Arc<dyn PendingGuard<TransferProcess>>>,
    state_machine: StateMachineConfig,
    retry: EntityRetryProcessConfiguration,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for ConnectorRuntimeBuilder {
    fn default() -> Self {
        Self {
            participant_id: None,
            instance_id: None,
            protocol_address: None,
            stores: None,
            identity: None,
            validation: Arc::new(DefaultContractValidationService),
            dispatchers: RemoteMessageDispatcherRegistry::new(),
            provisioner: Arc::new(DataAddressProvisioner::new()),
            negotiation_listeners: Vec::new(),
            transfer_listeners: Vec::new(),
            negotiation_guard: None,
            transfer_guard: None,
            state_machine: StateMachineConfig::default(),
            retry: EntityRetryProcessConfiguration::default(),
            lease_duration: tessera_core::store::DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ConnectorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the participant id (required).
    pub fn participant_id(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    /// Name of this replica in lease holders.
    ///
    /// Default: a random UUID per build.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Address counter-parties reach this connector at.
    ///
    /// Default: `loopback://<participant_id>`.
    pub fn protocol_address(mut self, address: impl Into<String>) -> Self {
        self.protocol_address = Some(address.into());
        self
    }

    /// Use these stores instead of in-memory ones.
    pub fn stores(mut self, stores: ConnectorStores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Set the identity service for inbound messages (required).
    pub fn identity(mut self, identity: Arc<dyn IdentityService>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn validation(mut self, validation: Arc<dyn ContractValidationService>) -> Self {
        self.validation = validation;
        self
    }

    /// Register a dispatcher; one per protocol.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        self.dispatchers = self.dispatchers.with_dispatcher(dispatcher);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn negotiation_listener(mut self, listener: Arc<dyn ContractNegotiationListener>) -> Self {
        self.negotiation_listeners.push(listener);
        self
    }

    pub fn transfer_listener(mut self, listener: Arc<dyn TransferProcessListener>) -> Self {
        self.transfer_listeners.push(listener);
        self
    }

    pub fn negotiation_guard(mut self, guard: Arc<dyn PendingGuard<ContractNegotiation>>) -> Self {
        self.negotiation_guard = Some(guard);
        self
    }

    pub fn transfer_guard(mut self, guard: Arc<dyn PendingGuard<TransferProcess>>) -> Self {
        self.transfer_guard = Some(guard);
        self
    }

    /// Polling, batching and concurrency of both state machines.
    pub fn state_machine(mut self, config: StateMachineConfig) -> Self {
        self.state_machine = config;
        self
    }

    /// Retry policy for failing protocol steps.
    pub fn retry(mut self, retry: EntityRetryProcessConfiguration) -> Self {
        self.retry = retry;
        self
    }

    /// Lease duration of the default in-memory stores.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<ConnectorRuntimeConfig> {
        let participant_id = self
            .participant_id
            .ok_or(Error::MissingComponent("participant_id"))?;
        let identity = self.identity.ok_or(Error::MissingComponent("identity"))?;
        let protocol_address = self
            .protocol_address
            .unwrap_or_else(|| format!("loopback://{participant_id}"));

        let instance_id = self
            .instance_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let holder = |role: &str| lease_holder(&participant_id, &instance_id, role);
        let stores = self.stores.unwrap_or_else(|| {
            ConnectorStores::in_memory(&holder("api"), self.lease_duration, self.clock.clone())
        });
        let dispatcher = Arc::new(self.dispatchers);

        let negotiation_observable = Arc::new(ContractNegotiationObservable::new(
            self.negotiation_listeners,
        ));
        let transfer_observable = Arc::new(TransferProcessObservable::new(self.transfer_listeners));

        let negotiations = Arc::new(ContractNegotiationService::new(
            stores.negotiations.for_holder(&holder("api")),
            negotiation_observable.clone(),
            self.clock.clone(),
        ));
        let agreements: Arc<dyn ContractAgreementResolver> = negotiations.clone();

        let negotiation_protocol = Arc::new(ContractNegotiationProtocolService::new(
            stores.negotiations.for_holder(&holder("protocol")),
            identity.clone(),
            self.validation.clone(),
            negotiation_observable.clone(),
            self.clock.clone(),
        ));
        let transfers = Arc::new(TransferProcessService::new(
            stores.transfers.for_holder(&holder("api")),
            agreements.clone(),
            transfer_observable.clone(),
            self.clock.clone(),
        ));
        let transfer_protocol = Arc::new(TransferProcessProtocolService::new(
            stores.transfers.for_holder(&holder("protocol")),
            identity,
            self.validation,
            agreements,
            transfer_observable.clone(),
            self.clock.clone(),
        ));

        let negotiation_manager = build_negotiation_manager(
            stores.negotiations.for_holder(&holder("negotiation-manager")),
            Arc::new(NegotiationContext {
                participant_id: participant_id.clone(),
                protocol_address: protocol_address.clone(),
                dispatcher: dispatcher.clone(),
                clock: self.clock.clone(),
            }),
            negotiation_observable,
            self.state_machine.clone(),
            self.retry.clone(),
            self.negotiation_guard,
        );
        let transfer_manager = build_transfer_manager(
            stores.transfers.for_holder(&holder("transfer-manager")),
            Arc::new(TransferContext {
                protocol_address: protocol_address.clone(),
                dispatcher,
                provisioner: self.provisioner,
                clock: self.clock,
            }),
            transfer_observable,
            self.state_machine,
            self.retry,
            self.transfer_guard,
        );

        Ok(ConnectorRuntimeConfig {
            participant_id,
            instance_id,
            protocol_address,
            negotiation_manager,
            transfer_manager,
            negotiations,
            negotiation_protocol,
            transfers,
            transfer_protocol,
        })
    }
}

fn lease_holder(participant_id: &str, instance_id: &str, role: &str) -> String {
    format!("{participant_id}/{instance_id}/{role}")
}

/// Fully wired connector, not yet running.
///
/// The managers can be driven by hand with
/// [`StateMachineManager::process_once`], which is what the tests do.
pub struct ConnectorRuntimeConfig {
    participant_id: String,
    instance_id: String,
    protocol_address: String,
    negotiation_manager: StateMachineManager<ContractNegotiation>,
    transfer_manager: StateMachineManager<TransferProcess>,
    negotiations: Arc<ContractNegotiationService>,
    negotiation_protocol: Arc<ContractNegotiationProtocolService>,
    transfers: Arc<TransferProcessService>,
    transfer_protocol: Arc<TransferProcessProtocolService>,
}

impl ConnectorRuntimeConfig {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Lease holder name of one component (`api`, `protocol`,
    /// `negotiation-manager` or `transfer-manager`).
    pub fn lease_holder(&self, role: &str) -> String {
        lease_holder(&self.participant_id, &self.instance_id, role)
    }

    pub fn protocol_address(&self) -> &str {
        &self.protocol_address
    }

    /// Inbound side, for registration on a loopback network.
    pub fn endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint {
            negotiation: self.negotiation_protocol.clone(),
            transfer: self.transfer_protocol.clone(),
        }
    }

    pub fn negotiation_manager(&self) -> &StateMachineManager<ContractNegotiation> {
        &self.negotiation_manager
    }

    pub fn transfer_manager(&self) -> &StateMachineManager<TransferProcess> {
        &self.transfer_manager
    }

    pub fn negotiations(&self) -> &Arc<ContractNegotiationService> {
        &self.negotiations
    }

    pub fn transfers(&self) -> &Arc<TransferProcessService> {
        &self.transfers
    }

    /// Start both state machines.
    pub async fn start(self) -> Result<ConnectorRuntime> {
        info!(
            participant_id = %self.participant_id,
            instance_id = %self.instance_id,
            protocol_address = %self.protocol_address,
            "Starting connector runtime"
        );

        let negotiation_shutdown = self.negotiation_manager.shutdown_handle();
        let manager = self.negotiation_manager.clone();
        let negotiation_handle = tokio::spawn(async move { manager.run().await });

        let transfer_shutdown = self.transfer_manager.shutdown_handle();
        let manager = self.transfer_manager.clone();
        let transfer_handle = tokio::spawn(async move { manager.run().await });

        info!(participant_id = %self.participant_id, "Connector runtime started");

        Ok(ConnectorRuntime {
            config: self,
            negotiation_handle,
            negotiation_shutdown,
            transfer_handle,
            transfer_shutdown,
        })
    }
}

/// Handle to a running connector.
pub struct ConnectorRuntime {
    config: ConnectorRuntimeConfig,
    negotiation_handle: JoinHandle<()>,
    negotiation_shutdown: Arc<Notify>,
    transfer_handle: JoinHandle<()>,
    transfer_shutdown: Arc<Notify>,
}

impl ConnectorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ConnectorRuntimeBuilder {
        ConnectorRuntimeBuilder::new()
    }

    pub fn participant_id(&self) -> &str {
        self.config.participant_id()
    }

    pub fn negotiations(&self) -> &Arc<ContractNegotiationService> {
        self.config.negotiations()
    }

    pub fn transfers(&self) -> &Arc<TransferProcessService> {
        self.config.transfers()
    }

    pub fn endpoint(&self) -> LoopbackEndpoint {
        self.config.endpoint()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals both state machines to stop polling, then waits until their
    /// in-flight handlers have drained.
    pub async fn shutdown(self) -> Result<()> {
        info!(participant_id = %self.config.participant_id, "Connector runtime shutting down...");

        self.negotiation_shutdown.notify_one();
        self.transfer_shutdown.notify_one();

        let mut failed = false;
        if let Err(e) = self.negotiation_handle.await {
            error!("Negotiation state machine task panicked: {}", e);
            failed = true;
        }
        if let Err(e) = self.transfer_handle.await {
            error!("Transfer state machine task panicked: {}", e);
            failed = true;
        }

        if failed {
            return Err(anyhow::anyhow!("state machine task panicked"));
        }
        info!("Connector runtime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.negotiation_handle.is_finished() && !self.transfer_handle.is_finished()
    }
}
