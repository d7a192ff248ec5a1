// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport.
//!
//! Connectors registered on the same [`LoopbackNetwork`] deliver protocol
//! messages by calling each other's protocol services directly. Used by the
//! demo binary and the integration tests; the failure classification is the
//! same a network transport would apply.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tessera_core::{ResponseFailure, StatusResult};
use tracing::debug;

use crate::dispatch::RemoteMessageDispatcher;
use crate::error::ServiceFailure;
use crate::identity::TokenRepresentation;
use crate::message::ProtocolMessage;
use crate::negotiation::ContractNegotiationProtocolService;
use crate::transfer::TransferProcessProtocolService;

pub const LOOPBACK_PROTOCOL: &str = "loopback";

/// Inbound side of one connector.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    pub negotiation: Arc<ContractNegotiationProtocolService>,
    pub transfer: Arc<TransferProcessProtocolService>,
}

/// Address book shared by every connector in the process.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<RwLock<HashMap<String, LoopbackEndpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, endpoint: LoopbackEndpoint) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), endpoint);
    }

    pub fn unregister(&self, address: &str) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn endpoint(&self, address: &str) -> Option<LoopbackEndpoint> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

/// Dispatcher presenting `token` to whichever endpoint owns the address.
pub struct LoopbackDispatcher {
    network: LoopbackNetwork,
    token: TokenRepresentation,
}

impl LoopbackDispatcher {
    pub fn new(network: LoopbackNetwork, token: TokenRepresentation) -> Self {
        Self { network, token }
    }

    async fn deliver(
        &self,
        endpoint: &LoopbackEndpoint,
        message: ProtocolMessage,
    ) -> Result<(), ServiceFailure> {
        let token = &self.token;
        match message {
            ProtocolMessage::ContractRequest(m) => {
                endpoint.negotiation.notify_requested(token, m).await?;
            }
            ProtocolMessage::ContractOffer(m) => {
                endpoint.negotiation.notify_offered(token, m).await?;
            }
            ProtocolMessage::ContractAgreement(m) => {
                endpoint.negotiation.notify_agreed(token, m).await?;
            }
            ProtocolMessage::ContractAgreementVerification(m) => {
                endpoint.negotiation.notify_verified(token, m).await?;
            }
            ProtocolMessage::ContractNegotiationEvent(m) => {
                endpoint.negotiation.notify_event(token, m).await?;
            }
            ProtocolMessage::ContractNegotiationTermination(m) => {
                endpoint.negotiation.notify_terminated(token, m).await?;
            }
            ProtocolMessage::TransferRequest(m) => {
                endpoint.transfer.notify_requested(token, m).await?;
            }
            ProtocolMessage::TransferStart(m) => {
                endpoint.transfer.notify_started(token, m).await?;
            }
            ProtocolMessage::TransferCompletion(m) => {
                endpoint.transfer.notify_completed(token, m).await?;
            }
            ProtocolMessage::TransferTermination(m) => {
                endpoint.transfer.notify_terminated(token, m).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteMessageDispatcher for LoopbackDispatcher {
    fn protocol(&self) -> &str {
        LOOPBACK_PROTOCOL
    }

    async fn dispatch(&self, counter_party_address: &str, message: ProtocolMessage) -> StatusResult<()> {
        let Some(endpoint) = self.network.endpoint(counter_party_address) else {
            return Err(ResponseFailure::retryable(format!(
                "no connector listening at '{counter_party_address}'"
            )));
        };
        let name = message.name();
        self.deliver(&endpoint, message).await.map_err(|failure| {
            debug!(
                address = %counter_party_address,
                message = name,
                error = %failure,
                "Loopback delivery failed"
            );
            failure.to_response_failure()
        })
    }
}
