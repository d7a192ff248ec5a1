// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource provisioning for transfers.

use std::collections::HashMap;

use async_trait::async_trait;
use tessera_core::{ResponseFailure, StatusResult};
use tracing::debug;
use uuid::Uuid;

use super::{
    DataAddress, ProvisionedResource, ResourceDefinition, ResourceKind, ResourceManifest,
    TransferProcess, TransferProcessType,
};

/// Plans and sets up the resources a transfer needs on this side.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Compute the provisioning plan. Called once per process.
    fn manifest(&self, process: &TransferProcess) -> StatusResult<ResourceManifest>;

    async fn provision(&self, definition: &ResourceDefinition) -> StatusResult<ProvisionedResource>;

    async fn deprovision(&self, resource: &ProvisionedResource) -> StatusResult<()>;
}

/// Provisioner for data that is already addressable.
///
/// The provider looks up a registered source address per asset; the consumer
/// uses the destination from the data request as is.
#[derive(Debug, Clone, Default)]
pub struct DataAddressProvisioner {
    sources: HashMap<String, DataAddress>,
}

impl DataAddressProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, asset_id: impl Into<String>, address: DataAddress) -> Self {
        self.sources.insert(asset_id.into(), address);
        self
    }
}

#[async_trait]
impl Provisioner for DataAddressProvisioner {
    fn manifest(&self, process: &TransferProcess) -> StatusResult<ResourceManifest> {
        let definition = match process.transfer_type {
            TransferProcessType::Consumer => ResourceDefinition {
                id: Uuid::new_v4().to_string(),
                kind: ResourceKind::Destination,
                address: process.data_request.destination.clone(),
            },
            TransferProcessType::Provider => {
                let asset_id = &process.data_request.asset_id;
                let address = self.sources.get(asset_id).ok_or_else(|| {
                    ResponseFailure::fatal(format!("no data source registered for asset '{asset_id}'"))
                })?;
                ResourceDefinition {
                    id: Uuid::new_v4().to_string(),
                    kind: ResourceKind::Source,
                    address: address.clone(),
                }
            }
        };
        Ok(ResourceManifest {
            definitions: vec![definition],
        })
    }

    async fn provision(&self, definition: &ResourceDefinition) -> StatusResult<ProvisionedResource> {
        debug!(definition_id = %definition.id, kind = ?definition.kind, "Provisioning resource");
        Ok(ProvisionedResource {
            id: Uuid::new_v4().to_string(),
            resource_definition_id: definition.id.clone(),
            kind: definition.kind,
            data_address: definition.address.clone(),
            deprovisioned: false,
        })
    }

    async fn deprovision(&self, resource: &ProvisionedResource) -> StatusResult<()> {
        debug!(resource_id = %resource.id, "Deprovisioning resource");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::DataRequest;

    fn process(transfer_type: TransferProcessType) -> TransferProcess {
        TransferProcess::new(
            "t-1",
            transfer_type,
            "peer",
            "loopback://peer",
            "loopback",
            DataRequest {
                id: "dr-1".to_string(),
                asset_id: "asset-1".to_string(),
                contract_id: "agreement-1".to_string(),
                destination: DataAddress::new("inbox").with_property("path", "/tmp/in"),
            },
            0,
        )
    }

    #[test]
    fn test_consumer_manifest_targets_destination() {
        let manifest = DataAddressProvisioner::new()
            .manifest(&process(TransferProcessType::Consumer))
            .unwrap();
        assert_eq!(manifest.definitions.len(), 1);
        assert_eq!(manifest.definitions[0].kind, ResourceKind::Destination);
        assert_eq!(manifest.definitions[0].address.address_type, "inbox");
    }

    #[test]
    fn test_provider_manifest_requires_registered_source() {
        let failure = DataAddressProvisioner::new()
            .manifest(&process(TransferProcessType::Provider))
            .unwrap_err();
        assert!(!failure.is_retryable());

        let provisioner =
            DataAddressProvisioner::new().with_source("asset-1", DataAddress::new("bucket"));
        let manifest = provisioner
            .manifest(&process(TransferProcessType::Provider))
            .unwrap();
        assert_eq!(manifest.definitions[0].kind, ResourceKind::Source);
    }
}
