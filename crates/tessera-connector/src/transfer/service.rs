// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local API for transfer processes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{Clock, QuerySpec, StateEntityStore, StatefulEntity};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    DataAddress, DataRequest, TransferProcess, TransferProcessObservable, TransferProcessState,
    TransferProcessType,
};
use crate::error::{ServiceFailure, ServiceResult};
use crate::message::CallbackAddress;
use crate::negotiation::{ContractAgreement, ContractNegotiationService};

/// Looks up finalized agreements a transfer may run under.
#[async_trait]
pub trait ContractAgreementResolver: Send + Sync {
    async fn find_agreement(&self, agreement_id: &str) -> ServiceResult<Option<ContractAgreement>>;
}

#[async_trait]
impl ContractAgreementResolver for ContractNegotiationService {
    async fn find_agreement(&self, agreement_id: &str) -> ServiceResult<Option<ContractAgreement>> {
        ContractNegotiationService::find_agreement(self, agreement_id).await
    }
}

/// Input for [`TransferProcessService::initiate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub counter_party_address: String,
    pub protocol: String,
    /// Id of the finalized agreement.
    pub contract_id: String,
    pub destination: DataAddress,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
}

pub struct TransferProcessService {
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    agreements: Arc<dyn ContractAgreementResolver>,
    observable: Arc<TransferProcessObservable>,
    clock: Arc<dyn Clock>,
}

impl TransferProcessService {
    pub fn new(
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        agreements: Arc<dyn ContractAgreementResolver>,
        observable: Arc<TransferProcessObservable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            agreements,
            observable,
            clock,
        }
    }

    /// Start a consumer transfer in INITIAL under a finalized agreement.
    pub async fn initiate(&self, request: TransferRequest) -> ServiceResult<TransferProcess> {
        let agreement = self
            .agreements
            .find_agreement(&request.contract_id)
            .await?
            .ok_or_else(|| {
                ServiceFailure::BadRequest(format!(
                    "no finalized agreement '{}'",
                    request.contract_id
                ))
            })?;

        let data_request = DataRequest {
            id: Uuid::new_v4().to_string(),
            asset_id: agreement.asset_id,
            contract_id: agreement.id,
            destination: request.destination,
        };
        let mut process = TransferProcess::new(
            Uuid::new_v4().to_string(),
            TransferProcessType::Consumer,
            agreement.provider_id,
            request.counter_party_address,
            request.protocol,
            data_request,
            self.clock.now_millis(),
        );
        process.callback_addresses = request.callback_addresses;

        let saved = self.store.save(&process).await?;
        info!(
            transfer_id = %saved.id(),
            contract_id = %saved.data_request.contract_id,
            "Transfer process initiated"
        );
        self.observable.initiated(&saved);
        Ok(saved)
    }

    pub async fn find_by_id(&self, id: &str) -> ServiceResult<TransferProcess> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceFailure::not_found("transfer process", id))
    }

    pub async fn query(&self, query: &QuerySpec) -> ServiceResult<Vec<TransferProcess>> {
        Ok(self.store.find_all(query).await?)
    }

    /// Signal that the data has arrived or has been sent in full.
    pub async fn complete(&self, id: &str) -> ServiceResult<TransferProcess> {
        self.mutate(id, |process, now| {
            process
                .transition_to(TransferProcessState::Completing, now)
                .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
        })
        .await
    }

    pub async fn terminate(&self, id: &str, reason: &str) -> ServiceResult<TransferProcess> {
        let reason = reason.to_string();
        self.mutate(id, move |process, now| {
            process
                .fail_to(TransferProcessState::Terminating, reason, now)
                .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
        })
        .await
    }

    pub async fn release_pending(&self, id: &str) -> ServiceResult<TransferProcess> {
        self.mutate(id, |process, _| {
            if process.is_pending() {
                Ok(())
            } else {
                Err(ServiceFailure::BadRequest(format!(
                    "transfer '{}' is not pending",
                    process.id()
                )))
            }
        })
        .await
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> ServiceResult<TransferProcess>
    where
        F: FnOnce(&mut TransferProcess, i64) -> ServiceResult<()> + Send,
    {
        let mut process = self.store.find_by_id_and_lease(id).await?;
        if let Err(failure) = apply(&mut process, self.clock.now_millis()) {
            if let Err(e) = self.store.break_lease(id).await {
                warn!(transfer_id = %id, error = %e, "Failed to release transfer lease");
            }
            return Err(failure);
        }
        process.set_pending(false);
        let saved = self.store.save(&process).await?;
        self.observable.state_entered(&saved);
        Ok(saved)
    }
}
