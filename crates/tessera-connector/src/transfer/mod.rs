// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data transfer processes.
//!
//! A transfer runs under a finalized contract agreement. Both sides provision
//! their resources first (destination on the consumer, source on the
//! provider), then the consumer requests and the provider starts the
//! transfer. COMPLETED and TERMINATED close the protocol exchange; the only
//! way out of them is deprovisioning.

mod listener;
mod manager;
mod protocol;
mod provision;
mod service;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::{EntityMeta, EntityState, StatefulEntity};

use crate::message::{CallbackAddress, ProtocolMessages};

pub use listener::{TransferProcessListener, TransferProcessObservable};
pub use manager::{TransferContext, build_transfer_manager};
pub use protocol::TransferProcessProtocolService;
pub use provision::{DataAddressProvisioner, Provisioner};
pub use service::{ContractAgreementResolver, TransferProcessService, TransferRequest};

/// Location of data, interpreted by whoever moves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    pub fn new(address_type: impl Into<String>) -> Self {
        Self {
            address_type: address_type.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// What to transfer and where to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub id: String,
    pub asset_id: String,
    pub contract_id: String,
    pub destination: DataAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Source,
    Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub id: String,
    pub kind: ResourceKind,
    pub address: DataAddress,
}

/// Provisioning plan computed once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManifest {
    #[serde(default)]
    pub definitions: Vec<ResourceDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub resource_definition_id: String,
    pub kind: ResourceKind,
    pub data_address: DataAddress,
    #[serde(default)]
    pub deprovisioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferProcessType {
    Consumer,
    Provider,
}

impl TransferProcessType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferProcessType::Consumer => "CONSUMER",
            TransferProcessType::Provider => "PROVIDER",
        }
    }
}

impl fmt::Display for TransferProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferProcessState {
    Initial,
    Provisioning,
    Provisioned,
    Requesting,
    Requested,
    Starting,
    Started,
    Completing,
    Completed,
    Terminating,
    Terminated,
    Deprovisioning,
    Deprovisioned,
}

impl TransferProcessState {
    pub const ALL: [TransferProcessState; 13] = [
        TransferProcessState::Initial,
        TransferProcessState::Provisioning,
        TransferProcessState::Provisioned,
        TransferProcessState::Requesting,
        TransferProcessState::Requested,
        TransferProcessState::Starting,
        TransferProcessState::Started,
        TransferProcessState::Completing,
        TransferProcessState::Completed,
        TransferProcessState::Terminating,
        TransferProcessState::Terminated,
        TransferProcessState::Deprovisioning,
        TransferProcessState::Deprovisioned,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TransferProcessState::Initial => "INITIAL",
            TransferProcessState::Provisioning => "PROVISIONING",
            TransferProcessState::Provisioned => "PROVISIONED",
            TransferProcessState::Requesting => "REQUESTING",
            TransferProcessState::Requested => "REQUESTED",
            TransferProcessState::Starting => "STARTING",
            TransferProcessState::Started => "STARTED",
            TransferProcessState::Completing => "COMPLETING",
            TransferProcessState::Completed => "COMPLETED",
            TransferProcessState::Terminating => "TERMINATING",
            TransferProcessState::Terminated => "TERMINATED",
            TransferProcessState::Deprovisioning => "DEPROVISIONING",
            TransferProcessState::Deprovisioned => "DEPROVISIONED",
        }
    }

    /// COMPLETED, TERMINATED and the deprovisioning states after them.
    pub fn is_protocol_final(self) -> bool {
        matches!(
            self,
            TransferProcessState::Completed
                | TransferProcessState::Terminated
                | TransferProcessState::Deprovisioning
                | TransferProcessState::Deprovisioned
        )
    }
}

impl fmt::Display for TransferProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl EntityState for TransferProcessState {
    fn code(self) -> i32 {
        match self {
            TransferProcessState::Initial => 100,
            TransferProcessState::Provisioning => 200,
            TransferProcessState::Provisioned => 300,
            TransferProcessState::Requesting => 400,
            TransferProcessState::Requested => 500,
            TransferProcessState::Starting => 550,
            TransferProcessState::Started => 600,
            TransferProcessState::Completing => 700,
            TransferProcessState::Completed => 800,
            TransferProcessState::Terminating => 825,
            TransferProcessState::Terminated => 850,
            TransferProcessState::Deprovisioning => 900,
            TransferProcessState::Deprovisioned => 1000,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    fn is_terminal(self) -> bool {
        self == TransferProcessState::Deprovisioned
    }

    fn can_transition_to(self, next: Self) -> bool {
        use TransferProcessState::*;

        if self == next || self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Completed | Terminated, Deprovisioning) => true,
            (Deprovisioning, Deprovisioned) => true,
            (current, Terminating | Terminated) => !current.is_protocol_final()
                && (current != Terminating || next == Terminated),
            (Terminating, _) => false,
            (Initial, Provisioning) => true,
            (Provisioning, Provisioned) => true,
            (Provisioned, Requesting | Starting) => true,
            (Requesting, Requested) => true,
            (Requested | Starting, Started) => true,
            (Started, Completing | Completed) => true,
            (Completing, Completed) => true,
            // The counter-party moved on while our last send is being retried.
            (Requesting, Started) => true,
            (Starting, Completed) => true,
            _ => false,
        }
    }
}

/// One side of a data transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(rename = "type")]
    pub transfer_type: TransferProcessType,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    pub data_request: DataRequest,
    #[serde(default)]
    pub resource_manifest: Option<ResourceManifest>,
    /// One entry per provisioned definition; never removed.
    #[serde(default)]
    pub provisioned_resources: Vec<ProvisionedResource>,
    #[serde(default)]
    pub content_data_address: Option<DataAddress>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
    #[serde(flatten)]
    pub protocol_messages: ProtocolMessages,
}

impl TransferProcess {
    pub fn new(
        id: impl Into<String>,
        transfer_type: TransferProcessType,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        data_request: DataRequest,
        now: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, TransferProcessState::Initial.code(), now),
            transfer_type,
            correlation_id: None,
            counter_party_id: counter_party_id.into(),
            counter_party_address: counter_party_address.into(),
            protocol: protocol.into(),
            data_request,
            resource_manifest: None,
            provisioned_resources: Vec::new(),
            content_data_address: None,
            callback_addresses: Vec::new(),
            protocol_messages: ProtocolMessages::default(),
        }
    }

    pub fn is_type(&self, transfer_type: TransferProcessType) -> bool {
        self.transfer_type == transfer_type
    }

    pub fn is_provisioned(&self, definition_id: &str) -> bool {
        self.provisioned_resources
            .iter()
            .any(|resource| resource.resource_definition_id == definition_id)
    }

    /// Address of the first provisioned resource of `kind`.
    pub fn provisioned_address(&self, kind: ResourceKind) -> Option<&DataAddress> {
        self.provisioned_resources
            .iter()
            .find(|resource| resource.kind == kind)
            .map(|resource| &resource.data_address)
    }
}

impl StatefulEntity for TransferProcess {
    type State = TransferProcessState;
    const KIND: &'static str = "transfer_process";

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

#[cfg(test)]
mod tests {
    use super::TransferProcessState::*;
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in TransferProcessState::ALL {
            assert_eq!(TransferProcessState::from_code(state.code()), Some(state));
        }
    }

    #[test]
    fn test_protocol_final_states_only_deprovision() {
        for final_state in [Completed, Terminated] {
            for next in TransferProcessState::ALL {
                assert_eq!(
                    final_state.can_transition_to(next),
                    next == Deprovisioning,
                    "{final_state} -> {next}"
                );
            }
        }
        assert!(Deprovisioning.can_transition_to(Deprovisioned));
        assert!(!Deprovisioning.can_transition_to(Terminated));
    }

    #[test]
    fn test_active_states_can_terminate() {
        for state in [Initial, Provisioning, Provisioned, Requesting, Requested, Starting, Started, Completing] {
            assert!(state.can_transition_to(Terminating), "{state}");
            assert!(state.can_transition_to(Terminated), "{state}");
        }
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Terminating.can_transition_to(Started));
    }

    #[test]
    fn test_happy_paths() {
        let consumer = [Initial, Provisioning, Provisioned, Requesting, Requested, Started, Completing, Completed, Deprovisioning, Deprovisioned];
        for pair in consumer.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        let provider = [Initial, Provisioning, Provisioned, Starting, Started, Completed];
        for pair in provider.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_unacknowledged_sends_accept_the_answer() {
        assert!(Requesting.can_transition_to(Started));
        assert!(Starting.can_transition_to(Completed));
        assert!(!Requesting.can_transition_to(Completed));
        assert!(!Initial.can_transition_to(Started));
    }
}
