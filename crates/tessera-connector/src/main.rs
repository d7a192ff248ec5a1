// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Connector - demo
//!
//! Runs the configured participant as a consumer next to an in-process
//! provider (`demo-provider`) on a loopback network, negotiates a contract
//! for `demo-asset`, transfers it, and keeps both connectors running until
//! Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, bail};
use tessera_connector::identity::{StaticIdentityService, TokenRepresentation};
use tessera_connector::loopback::{LOOPBACK_PROTOCOL, LoopbackDispatcher, LoopbackNetwork};
use tessera_connector::negotiation::{ContractNegotiationListener, ContractRequest};
use tessera_connector::transfer::{
    DataAddressProvisioner, TransferProcessListener, TransferRequest,
};
use tessera_connector::{
    ConnectorConfig, ConnectorRuntime, ConnectorStores, ContractNegotiation,
    ContractNegotiationState, ContractOffer, DataAddress, TransferProcess,
};
use tessera_core::{Clock, EntityState, SystemClock};
use tokio::sync::mpsc;
use tracing::{info, warn};

const PROVIDER_ID: &str = "demo-provider";
const PROVIDER_TOKEN: &str = "demo-provider-token";
const CONSUMER_TOKEN: &str = "demo-consumer-token";
const ASSET_ID: &str = "demo-asset";

/// Forwards negotiations that reached a terminal state.
struct NegotiationOutcome(mpsc::UnboundedSender<ContractNegotiation>);

impl ContractNegotiationListener for NegotiationOutcome {
    fn finalized(&self, negotiation: &ContractNegotiation) {
        let _ = self.0.send(negotiation.clone());
    }

    fn terminated(&self, negotiation: &ContractNegotiation) {
        let _ = self.0.send(negotiation.clone());
    }
}

struct TransferLog;

impl TransferProcessListener for TransferLog {
    fn started(&self, process: &TransferProcess) {
        info!(
            transfer_id = %process.meta.id,
            data_address = ?process.content_data_address,
            "Transfer started"
        );
    }

    fn deprovisioned(&self, process: &TransferProcess) {
        info!(transfer_id = %process.meta.id, "Transfer resources released");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_connector=info,tessera_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = ConnectorConfig::from_env()?;

    info!(
        participant_id = %config.participant_id,
        protocol_address = %config.protocol_address,
        persistent = config.database_url.is_some(),
        "Starting Tessera Connector"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let network = LoopbackNetwork::new();
    let identity = Arc::new(
        StaticIdentityService::new()
            .with_token(CONSUMER_TOKEN, &config.participant_id)
            .with_token(PROVIDER_TOKEN, PROVIDER_ID),
    );

    let consumer_stores = match &config.database_url {
        Some(url) => {
            let stores = ConnectorStores::sqlite(
                url,
                &format!("{}/api", config.participant_id),
                config.lease_duration,
                clock.clone(),
            )
            .await?;
            info!("Connected to database");
            stores
        }
        None => ConnectorStores::in_memory(
            &format!("{}/api", config.participant_id),
            config.lease_duration,
            clock.clone(),
        ),
    };

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let mut consumer = ConnectorRuntime::builder().participant_id(&config.participant_id);
    if let Some(instance_id) = &config.instance_id {
        consumer = consumer.instance_id(instance_id);
    }
    let consumer = consumer
        .protocol_address(&config.protocol_address)
        .stores(consumer_stores)
        .identity(identity.clone())
        .dispatcher(Arc::new(LoopbackDispatcher::new(
            network.clone(),
            TokenRepresentation::new(CONSUMER_TOKEN),
        )))
        .negotiation_listener(Arc::new(NegotiationOutcome(outcome_tx)))
        .transfer_listener(Arc::new(TransferLog))
        .state_machine(config.state_machine())
        .retry(config.send_retry())
        .lease_duration(config.lease_duration)
        .clock(clock.clone())
        .build()?;

    let provider = ConnectorRuntime::builder()
        .participant_id(PROVIDER_ID)
        .identity(identity)
        .dispatcher(Arc::new(LoopbackDispatcher::new(
            network.clone(),
            TokenRepresentation::new(PROVIDER_TOKEN),
        )))
        .provisioner(Arc::new(DataAddressProvisioner::new().with_source(
            ASSET_ID,
            DataAddress::new("HttpData").with_property("baseUrl", "https://provider.example/demo"),
        )))
        .state_machine(config.state_machine())
        .retry(config.send_retry())
        .lease_duration(config.lease_duration)
        .clock(clock)
        .build()?;

    network.register(consumer.protocol_address(), consumer.endpoint());
    network.register(provider.protocol_address(), provider.endpoint());
    let provider_address = provider.protocol_address().to_string();

    let consumer = consumer.start().await?;
    let provider = provider.start().await?;

    let negotiation = consumer
        .negotiations()
        .initiate(ContractRequest {
            counter_party_id: PROVIDER_ID.to_string(),
            counter_party_address: provider_address.clone(),
            protocol: LOOPBACK_PROTOCOL.to_string(),
            offer: ContractOffer {
                id: "demo-offer".to_string(),
                asset_id: ASSET_ID.to_string(),
                provider_id: PROVIDER_ID.to_string(),
                policy: serde_json::json!({ "permission": [{ "action": "use" }] }),
            },
            callback_addresses: Vec::new(),
        })
        .await?;
    info!(negotiation_id = %negotiation.meta.id, "Negotiation initiated");

    let negotiation = outcome_rx
        .recv()
        .await
        .context("negotiation listener closed")?;
    if negotiation.meta.state != ContractNegotiationState::Finalized.code() {
        bail!(
            "negotiation {} ended in state {}: {}",
            negotiation.meta.id,
            negotiation.meta.state,
            negotiation.meta.error_detail.unwrap_or_default()
        );
    }
    let agreement = negotiation
        .contract_agreement
        .context("finalized negotiation without agreement")?;
    let signed = chrono::DateTime::from_timestamp_millis(agreement.contract_signing_date)
        .map(|date| date.to_rfc3339())
        .unwrap_or_default();
    info!(agreement_id = %agreement.id, signed = %signed, "Contract agreed");

    let transfer = consumer
        .transfers()
        .initiate(TransferRequest {
            counter_party_address: provider_address,
            protocol: LOOPBACK_PROTOCOL.to_string(),
            contract_id: agreement.id,
            destination: DataAddress::new("HttpProxy"),
            callback_addresses: Vec::new(),
        })
        .await?;
    info!(transfer_id = %transfer.meta.id, "Transfer initiated");

    info!("Connector ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    consumer.shutdown().await?;
    provider.shutdown().await?;

    Ok(())
}
