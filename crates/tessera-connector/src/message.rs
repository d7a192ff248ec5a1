// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol messages exchanged between connectors.
//!
//! Every message carries a [`MessageHeader`]: a stable message id, the
//! sender's process id, the receiver's process id once the sender knows it,
//! and the protocol tag used to pick a dispatcher. Outbound retries of the
//! same step reuse the message id (see [`ProtocolMessages::outgoing_id`]) so
//! the receiver can drop duplicates.

use serde::{Deserialize, Serialize};
use tessera_core::EntityMeta;
use uuid::Uuid;

use crate::negotiation::{ContractAgreement, ContractOffer};
use crate::transfer::DataAddress;

/// Where the owner of a process wants to hear about its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAddress {
    pub uri: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub transactional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Stable id of this message; identical across re-sends of one step.
    pub id: String,
    /// Sender's process id.
    pub process_id: String,
    /// Receiver's process id, when the sender already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub protocol: String,
    /// Address the receiver answers to.
    pub callback_address: String,
}

/// Outbound and inbound message bookkeeping embedded in every process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_protocol_message_id: Option<String>,
    /// State code the last message was sent from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_protocol_message_state: Option<i32>,
    #[serde(default)]
    pub received_protocol_message_ids: Vec<String>,
}

impl ProtocolMessages {
    /// Id for the message about to be sent from the entity's current state.
    ///
    /// A retry of the step that sent the last message gets the same id back;
    /// anything else mints and remembers a fresh one.
    pub fn outgoing_id(&mut self, meta: &EntityMeta) -> String {
        if meta.state_count > 0
            && self.last_sent_protocol_message_state == Some(meta.state)
            && let Some(id) = &self.last_sent_protocol_message_id
        {
            return id.clone();
        }
        let id = Uuid::new_v4().to_string();
        self.last_sent_protocol_message_id = Some(id.clone());
        self.last_sent_protocol_message_state = Some(meta.state);
        id
    }

    pub fn has_received(&self, message_id: &str) -> bool {
        self.received_protocol_message_ids
            .iter()
            .any(|id| id == message_id)
    }

    pub fn record_received(&mut self, message_id: &str) {
        if !self.has_received(message_id) {
            self.received_protocol_message_ids
                .push(message_id.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRequestMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub offer: ContractOffer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOfferMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub offer: ContractOffer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreementMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub agreement: ContractAgreement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAgreementVerificationMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationEventType {
    Accepted,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractNegotiationEventMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub event_type: NegotiationEventType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractNegotiationTerminationMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequestMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub contract_id: String,
    pub asset_id: String,
    pub data_destination: DataAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStartMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_address: Option<DataAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompletionMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTerminationMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub reason: String,
}

/// Any message a dispatcher can deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    ContractRequest(ContractRequestMessage),
    ContractOffer(ContractOfferMessage),
    ContractAgreement(ContractAgreementMessage),
    ContractAgreementVerification(ContractAgreementVerificationMessage),
    ContractNegotiationEvent(ContractNegotiationEventMessage),
    ContractNegotiationTermination(ContractNegotiationTerminationMessage),
    TransferRequest(TransferRequestMessage),
    TransferStart(TransferStartMessage),
    TransferCompletion(TransferCompletionMessage),
    TransferTermination(TransferTerminationMessage),
}

impl ProtocolMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            ProtocolMessage::ContractRequest(m) => &m.header,
            ProtocolMessage::ContractOffer(m) => &m.header,
            ProtocolMessage::ContractAgreement(m) => &m.header,
            ProtocolMessage::ContractAgreementVerification(m) => &m.header,
            ProtocolMessage::ContractNegotiationEvent(m) => &m.header,
            ProtocolMessage::ContractNegotiationTermination(m) => &m.header,
            ProtocolMessage::TransferRequest(m) => &m.header,
            ProtocolMessage::TransferStart(m) => &m.header,
            ProtocolMessage::TransferCompletion(m) => &m.header,
            ProtocolMessage::TransferTermination(m) => &m.header,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::ContractRequest(_) => "contract_request",
            ProtocolMessage::ContractOffer(_) => "contract_offer",
            ProtocolMessage::ContractAgreement(_) => "contract_agreement",
            ProtocolMessage::ContractAgreementVerification(_) => "contract_agreement_verification",
            ProtocolMessage::ContractNegotiationEvent(_) => "contract_negotiation_event",
            ProtocolMessage::ContractNegotiationTermination(_) => {
                "contract_negotiation_termination"
            }
            ProtocolMessage::TransferRequest(_) => "transfer_request",
            ProtocolMessage::TransferStart(_) => "transfer_start",
            ProtocolMessage::TransferCompletion(_) => "transfer_completion",
            ProtocolMessage::TransferTermination(_) => "transfer_termination",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(state: i32, state_count: u32) -> EntityMeta {
        let mut meta = EntityMeta::new("n-1", state, 0);
        meta.state_count = state_count;
        meta
    }

    #[test]
    fn test_retry_of_same_step_reuses_message_id() {
        let mut messages = ProtocolMessages::default();
        let first = messages.outgoing_id(&meta(100, 0));
        let retried = messages.outgoing_id(&meta(100, 1));
        assert_eq!(first, retried);
    }

    #[test]
    fn test_new_step_mints_new_message_id() {
        let mut messages = ProtocolMessages::default();
        let request = messages.outgoing_id(&meta(100, 0));
        let verification = messages.outgoing_id(&meta(1050, 0));
        assert_ne!(request, verification);

        // re-entering a state fresh is a new step even if the code matches
        let again = messages.outgoing_id(&meta(1050, 0));
        assert_ne!(verification, again);
    }

    #[test]
    fn test_received_ids_are_recorded_once() {
        let mut messages = ProtocolMessages::default();
        messages.record_received("m-1");
        messages.record_received("m-1");
        assert!(messages.has_received("m-1"));
        assert_eq!(messages.received_protocol_message_ids.len(), 1);
    }

    #[test]
    fn test_message_is_tagged_by_type() {
        let message = ProtocolMessage::TransferCompletion(TransferCompletionMessage {
            header: MessageHeader {
                id: "m-1".to_string(),
                process_id: "t-1".to_string(),
                correlation_id: Some("t-9".to_string()),
                protocol: "loopback".to_string(),
                callback_address: "loopback://consumer".to_string(),
            },
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "transfer_completion");
        assert_eq!(json["process_id"], "t-1");

        let back: ProtocolMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.header().correlation_id.as_deref(), Some("t-9"));
        assert_eq!(back.name(), "transfer_completion");
    }
}
