// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound transfer messages.

use std::sync::Arc;

use tessera_core::{Clock, EntityState, StateEntityStore, StatefulEntity, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ContractAgreementResolver, DataRequest, TransferProcess, TransferProcessObservable,
    TransferProcessState, TransferProcessType,
};
use crate::error::{ServiceFailure, ServiceResult};
use crate::identity::{ClaimToken, IdentityService, TokenRepresentation};
use crate::message::{
    MessageHeader, TransferCompletionMessage, TransferRequestMessage, TransferStartMessage,
    TransferTerminationMessage,
};
use crate::validation::ContractValidationService;

pub struct TransferProcessProtocolService {
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    identity: Arc<dyn IdentityService>,
    validation: Arc<dyn ContractValidationService>,
    agreements: Arc<dyn ContractAgreementResolver>,
    observable: Arc<TransferProcessObservable>,
    clock: Arc<dyn Clock>,
}

impl TransferProcessProtocolService {
    pub fn new(
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        identity: Arc<dyn IdentityService>,
        validation: Arc<dyn ContractValidationService>,
        agreements: Arc<dyn ContractAgreementResolver>,
        observable: Arc<TransferProcessObservable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            identity,
            validation,
            agreements,
            observable,
            clock,
        }
    }

    /// Provider side: create the process in INITIAL under a valid agreement.
    pub async fn notify_requested(
        &self,
        token: &TokenRepresentation,
        message: TransferRequestMessage,
    ) -> ServiceResult<TransferProcess> {
        let claim = self.authenticate(token).await?;
        let header = &message.header;

        let id = provider_process_id(&claim, header);
        if let Some(existing) = self.store.find_by_id(&id).await? {
            debug!(transfer_id = %id, message_id = %header.id, "Duplicate transfer request ignored");
            return Ok(existing);
        }

        let agreement = self
            .agreements
            .find_agreement(&message.contract_id)
            .await?
            .ok_or_else(|| {
                ServiceFailure::BadRequest(format!("unknown agreement '{}'", message.contract_id))
            })?;
        self.validation
            .validate_agreement(&claim, &agreement)
            .map_err(|e| ServiceFailure::BadRequest(e.to_string()))?;
        if agreement.asset_id != message.asset_id {
            return Err(ServiceFailure::BadRequest(format!(
                "agreement '{}' does not cover asset '{}'",
                agreement.id, message.asset_id
            )));
        }

        let mut process = TransferProcess::new(
            id,
            TransferProcessType::Provider,
            claim.participant_id.clone(),
            header.callback_address.clone(),
            header.protocol.clone(),
            DataRequest {
                id: header.process_id.clone(),
                asset_id: message.asset_id.clone(),
                contract_id: message.contract_id.clone(),
                destination: message.data_destination.clone(),
            },
            self.clock.now_millis(),
        );
        process.correlation_id = Some(header.process_id.clone());
        process.protocol_messages.record_received(&header.id);

        let saved = self.store.save(&process).await?;
        info!(
            transfer_id = %saved.id(),
            correlation_id = %header.process_id,
            contract_id = %message.contract_id,
            "Transfer requested"
        );
        self.observable.initiated(&saved);
        Ok(saved)
    }

    /// Consumer side: the provider started the transfer.
    pub async fn notify_started(
        &self,
        token: &TokenRepresentation,
        message: TransferStartMessage,
    ) -> ServiceResult<TransferProcess> {
        let claim = self.authenticate(token).await?;
        let TransferStartMessage {
            header,
            data_address,
        } = message;
        self.resolve_and_apply(
            &claim,
            &header,
            TransferProcessState::Started,
            Some(TransferProcessType::Consumer),
            move |process| {
                process.content_data_address = data_address;
                Ok(())
            },
        )
        .await
    }

    pub async fn notify_completed(
        &self,
        token: &TokenRepresentation,
        message: TransferCompletionMessage,
    ) -> ServiceResult<TransferProcess> {
        let claim = self.authenticate(token).await?;
        self.resolve_and_apply(
            &claim,
            &message.header,
            TransferProcessState::Completed,
            None,
            |_| Ok(()),
        )
        .await
    }

    pub async fn notify_terminated(
        &self,
        token: &TokenRepresentation,
        message: TransferTerminationMessage,
    ) -> ServiceResult<TransferProcess> {
        let claim = self.authenticate(token).await?;
        let TransferTerminationMessage { header, reason } = message;
        self.resolve_and_apply(
            &claim,
            &header,
            TransferProcessState::Terminated,
            None,
            move |process| {
                process.meta.error_detail = Some(reason);
                Ok(())
            },
        )
        .await
    }

    pub async fn find_by_id(
        &self,
        token: &TokenRepresentation,
        id: &str,
    ) -> ServiceResult<TransferProcess> {
        let claim = self.authenticate(token).await?;
        match self.store.find_by_id(id).await? {
            Some(process) if process.counter_party_id == claim.participant_id => Ok(process),
            _ => Err(ServiceFailure::not_found("transfer process", id)),
        }
    }

    async fn authenticate(&self, token: &TokenRepresentation) -> ServiceResult<ClaimToken> {
        self.identity.verify_token(token).await.map_err(|e| {
            warn!(error = %e, "Rejected inbound transfer message");
            ServiceFailure::Unauthorized(e.to_string())
        })
    }

    async fn resolve(&self, header: &MessageHeader) -> ServiceResult<TransferProcess> {
        match self
            .store
            .find_by_correlation_id_and_lease(&header.process_id)
            .await
        {
            Ok(process) => return Ok(process),
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let Some(local_id) = header.correlation_id.as_deref() else {
            return Err(ServiceFailure::NotFound(format!(
                "no transfer process correlated with process '{}'",
                header.process_id
            )));
        };
        let process = self.store.find_by_id_and_lease(local_id).await?;
        if let Some(bound) = process.correlation_id.as_deref()
            && bound != header.process_id
        {
            let failure = ServiceFailure::BadRequest(format!(
                "transfer '{local_id}' is correlated with '{bound}', not '{}'",
                header.process_id
            ));
            self.release(local_id).await;
            return Err(failure);
        }
        Ok(process)
    }

    async fn resolve_and_apply<F>(
        &self,
        claim: &ClaimToken,
        header: &MessageHeader,
        target: TransferProcessState,
        expected_type: Option<TransferProcessType>,
        mutate: F,
    ) -> ServiceResult<TransferProcess>
    where
        F: FnOnce(&mut TransferProcess) -> ServiceResult<()> + Send,
    {
        let mut process = self.resolve(header).await?;
        let id = process.id().to_string();

        if let Err(failure) = authorize(claim, &process, expected_type) {
            return Err(self.reject(&id, header, target, failure).await);
        }

        if process.protocol_messages.has_received(&header.id) || process.state() == Some(target) {
            debug!(transfer_id = %id, message_id = %header.id, "Duplicate transfer message ignored");
            self.release(&id).await;
            process.meta.lease = None;
            return Ok(process);
        }

        if let Err(failure) = check_transition(&process, target).and_then(|()| mutate(&mut process)) {
            return Err(self.reject(&id, header, target, failure).await);
        }

        if let Err(e) = process.transition_to(target, self.clock.now_millis()) {
            self.release(&id).await;
            return Err(ServiceFailure::BadRequest(e.to_string()));
        }
        process.set_pending(false);
        process.protocol_messages.record_received(&header.id);
        if process.correlation_id.is_none() {
            process.correlation_id = Some(header.process_id.clone());
        }

        let saved = self.store.save(&process).await?;
        info!(transfer_id = %id, state = %target, "Transfer process updated by counter-party");
        self.observable.state_entered(&saved);
        Ok(saved)
    }

    async fn reject(
        &self,
        id: &str,
        header: &MessageHeader,
        target: TransferProcessState,
        failure: ServiceFailure,
    ) -> ServiceFailure {
        warn!(
            transfer_id = %id,
            message_id = %header.id,
            state = %target,
            error = %failure,
            "Inbound transfer message rejected"
        );
        self.release(id).await;
        failure
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id).await {
            warn!(transfer_id = %id, error = %e, "Failed to release transfer lease");
        }
    }
}

/// The caller must be this process's counter-party and the message must be
/// meant for this side of the transfer.
fn authorize(
    claim: &ClaimToken,
    process: &TransferProcess,
    expected_type: Option<TransferProcessType>,
) -> ServiceResult<()> {
    if let Some(expected) = expected_type
        && !process.is_type(expected)
    {
        return Err(ServiceFailure::BadRequest(format!(
            "transfer '{}' is a {} process",
            process.id(),
            process.transfer_type
        )));
    }
    if process.counter_party_id != claim.participant_id {
        return Err(ServiceFailure::BadRequest(format!(
            "'{}' is not the counter-party of transfer '{}'",
            claim.participant_id,
            process.id()
        )));
    }
    Ok(())
}

fn check_transition(process: &TransferProcess, target: TransferProcessState) -> ServiceResult<()> {
    match process.state() {
        Some(current) if current.can_transition_to(target) && !current.is_protocol_final() => {
            Ok(())
        }
        current => Err(ServiceFailure::BadRequest(format!(
            "transfer '{}' cannot move from {} to {target}",
            process.id(),
            current.map_or_else(|| process.meta.state.to_string(), |s| s.to_string())
        ))),
    }
}

fn provider_process_id(claim: &ClaimToken, header: &MessageHeader) -> String {
    let name = format!("transfer/{}/{}", claim.participant_id, header.process_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
