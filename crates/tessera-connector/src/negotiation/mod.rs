// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract negotiation.
//!
//! A negotiation exists on both sides: the CONSUMER entity starts in
//! `REQUESTING` from a local call, the PROVIDER entity is created in
//! `REQUESTED` by the first inbound request. Each side keeps the other's id
//! in `correlation_id`.
//!
//! ```text
//!  consumer                                      provider
//!  REQUESTING ──ContractRequest──────────────▶  REQUESTED
//!  REQUESTED  ◀──────────────ContractAgreement  AGREEING
//!  AGREED
//!  VERIFYING  ──AgreementVerification────────▶  VERIFIED
//!  FINALIZED  ◀─────────────────Event:FINALIZED FINALIZING
//! ```
//!
//! With a counter-offer the provider parks `REQUESTED` as pending, a local
//! [`ContractNegotiationService::offer`] moves it to `OFFERING`, and the
//! consumer answers from `OFFERED` with [`ContractNegotiationService::accept`].

mod listener;
mod manager;
mod protocol;
mod service;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{EntityMeta, EntityState, StatefulEntity};

use crate::message::{CallbackAddress, ProtocolMessages};

pub use listener::{ContractNegotiationListener, ContractNegotiationObservable};
pub use manager::{NegotiationContext, build_negotiation_manager};
pub use protocol::ContractNegotiationProtocolService;
pub use service::{ContractNegotiationService, ContractRequest};

/// Offer for one asset under one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub policy: Value,
}

/// The agreed contract, built once by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub provider_id: String,
    pub consumer_id: String,
    pub asset_id: String,
    #[serde(default)]
    pub policy: Value,
    /// Milliseconds since the epoch.
    pub contract_signing_date: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationType {
    Consumer,
    Provider,
}

impl NegotiationType {
    /// Serialized form, usable in store criteria.
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationType::Consumer => "CONSUMER",
            NegotiationType::Provider => "PROVIDER",
        }
    }
}

impl fmt::Display for NegotiationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractNegotiationState {
    Requesting,
    Requested,
    Offering,
    Offered,
    Accepting,
    Accepted,
    Agreeing,
    Agreed,
    Verifying,
    Verified,
    Finalizing,
    Finalized,
    Terminating,
    Terminated,
}

impl ContractNegotiationState {
    pub const ALL: [ContractNegotiationState; 14] = [
        ContractNegotiationState::Requesting,
        ContractNegotiationState::Requested,
        ContractNegotiationState::Offering,
        ContractNegotiationState::Offered,
        ContractNegotiationState::Accepting,
        ContractNegotiationState::Accepted,
        ContractNegotiationState::Agreeing,
        ContractNegotiationState::Agreed,
        ContractNegotiationState::Verifying,
        ContractNegotiationState::Verified,
        ContractNegotiationState::Finalizing,
        ContractNegotiationState::Finalized,
        ContractNegotiationState::Terminating,
        ContractNegotiationState::Terminated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ContractNegotiationState::Requesting => "REQUESTING",
            ContractNegotiationState::Requested => "REQUESTED",
            ContractNegotiationState::Offering => "OFFERING",
            ContractNegotiationState::Offered => "OFFERED",
            ContractNegotiationState::Accepting => "ACCEPTING",
            ContractNegotiationState::Accepted => "ACCEPTED",
            ContractNegotiationState::Agreeing => "AGREEING",
            ContractNegotiationState::Agreed => "AGREED",
            ContractNegotiationState::Verifying => "VERIFYING",
            ContractNegotiationState::Verified => "VERIFIED",
            ContractNegotiationState::Finalizing => "FINALIZING",
            ContractNegotiationState::Finalized => "FINALIZED",
            ContractNegotiationState::Terminating => "TERMINATING",
            ContractNegotiationState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ContractNegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl EntityState for ContractNegotiationState {
    fn code(self) -> i32 {
        match self {
            ContractNegotiationState::Requesting => 100,
            ContractNegotiationState::Requested => 200,
            ContractNegotiationState::Offering => 300,
            ContractNegotiationState::Offered => 400,
            ContractNegotiationState::Accepting => 700,
            ContractNegotiationState::Accepted => 800,
            ContractNegotiationState::Agreeing => 825,
            ContractNegotiationState::Agreed => 850,
            ContractNegotiationState::Verifying => 1050,
            ContractNegotiationState::Verified => 1100,
            ContractNegotiationState::Finalizing => 1150,
            ContractNegotiationState::Finalized => 1200,
            ContractNegotiationState::Terminating => 1300,
            ContractNegotiationState::Terminated => 1400,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            ContractNegotiationState::Finalized | ContractNegotiationState::Terminated
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use ContractNegotiationState::*;

        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            (_, Terminating | Terminated) => true,
            (Terminating, _) => false,
            (Requesting, Requested) => true,
            (Requested, Offering | Offered | Agreeing | Agreed) => true,
            (Offering, Offered) => true,
            (Offered, Requesting | Requested | Accepting | Accepted) => true,
            (Accepting, Accepted) => true,
            (Accepted, Agreeing | Agreed) => true,
            (Agreeing, Agreed) => true,
            (Agreed, Verifying | Verified) => true,
            (Verifying, Verified) => true,
            (Verified, Finalizing | Finalized) => true,
            (Finalizing, Finalized) => true,
            // The counter-party already answered a message whose delivery
            // we are still retrying.
            (Requesting, Offered | Agreed) => true,
            (Offering, Requested | Accepted) => true,
            (Accepting, Agreed) => true,
            (Agreeing, Verified) => true,
            (Verifying, Finalized) => true,
            _ => false,
        }
    }
}

/// One side of a contract negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(rename = "type")]
    pub negotiation_type: NegotiationType,
    /// The counter-party's id for this negotiation.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    /// Append-only; the last offer is the current one.
    #[serde(default)]
    pub contract_offers: Vec<ContractOffer>,
    #[serde(default)]
    pub contract_agreement: Option<ContractAgreement>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
    #[serde(flatten)]
    pub protocol_messages: ProtocolMessages,
}

impl ContractNegotiation {
    pub fn new(
        id: impl Into<String>,
        negotiation_type: NegotiationType,
        state: ContractNegotiationState,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, state.code(), now),
            negotiation_type,
            correlation_id: None,
            counter_party_id: counter_party_id.into(),
            counter_party_address: counter_party_address.into(),
            protocol: protocol.into(),
            contract_offers: Vec::new(),
            contract_agreement: None,
            callback_addresses: Vec::new(),
            protocol_messages: ProtocolMessages::default(),
        }
    }

    pub fn with_offer(mut self, offer: ContractOffer) -> Self {
        self.contract_offers.push(offer);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_callback_addresses(mut self, callback_addresses: Vec<CallbackAddress>) -> Self {
        self.callback_addresses = callback_addresses;
        self
    }

    pub fn last_contract_offer(&self) -> Option<&ContractOffer> {
        self.contract_offers.last()
    }

    pub fn is_type(&self, negotiation_type: NegotiationType) -> bool {
        self.negotiation_type == negotiation_type
    }
}

impl StatefulEntity for ContractNegotiation {
    type State = ContractNegotiationState;
    const KIND: &'static str = "contract_negotiation";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}
