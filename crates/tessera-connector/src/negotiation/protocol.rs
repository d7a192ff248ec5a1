// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound negotiation messages.
//!
//! Each `notify_*` call is one read-modify-write under a lease: authenticate,
//! resolve and lease the negotiation, check the caller, drop duplicates,
//! validate the transition, apply, save.
//! Rejections release the lease without touching the stored entity.

use std::sync::Arc;

use tessera_core::{Clock, EntityState, StateEntityStore, StatefulEntity, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ContractNegotiation, ContractNegotiationObservable, ContractNegotiationState, NegotiationType,
};
use crate::error::{ServiceFailure, ServiceResult};
use crate::identity::{ClaimToken, IdentityService, TokenRepresentation};
use crate::message::{
    ContractAgreementMessage, ContractAgreementVerificationMessage,
    ContractNegotiationEventMessage, ContractNegotiationTerminationMessage, ContractOfferMessage,
    ContractRequestMessage, MessageHeader, NegotiationEventType,
};
use crate::validation::ContractValidationService;

pub struct ContractNegotiationProtocolService {
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    identity: Arc<dyn IdentityService>,
    validation: Arc<dyn ContractValidationService>,
    observable: Arc<ContractNegotiationObservable>,
    clock: Arc<dyn Clock>,
}

impl ContractNegotiationProtocolService {
    pub fn new(
        store: Arc<dyn StateEntityStore<ContractNegotiation>>,
        identity: Arc<dyn IdentityService>,
        validation: Arc<dyn ContractValidationService>,
        observable: Arc<ContractNegotiationObservable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            identity,
            validation,
            observable,
            clock,
        }
    }

    /// Provider side: a new request, or a counter-request on an offered
    /// negotiation.
    pub async fn notify_requested(
        &self,
        token: &TokenRepresentation,
        message: ContractRequestMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        let ContractRequestMessage { header, offer } = message;

        let existing = match self
            .store
            .find_by_correlation_id_and_lease(&header.process_id)
            .await
        {
            Ok(negotiation) => Some(negotiation),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(negotiation) = existing {
            let validation = self.validation.clone();
            let offer_claim = claim.clone();
            return self
                .apply(
                    &claim,
                    negotiation,
                    &header,
                    ContractNegotiationState::Requested,
                    Some(NegotiationType::Provider),
                    move |negotiation| {
                        validation
                            .validate_initial_offer(&offer_claim, &offer)
                            .map_err(|e| ServiceFailure::BadRequest(e.to_string()))?;
                        negotiation.contract_offers.push(offer);
                        Ok(())
                    },
                )
                .await;
        }

        self.validation
            .validate_initial_offer(&claim, &offer)
            .map_err(|e| ServiceFailure::BadRequest(e.to_string()))?;

        let now = self.clock.now_millis();
        let mut negotiation = ContractNegotiation::new(
            provider_negotiation_id(&claim, &header),
            NegotiationType::Provider,
            ContractNegotiationState::Requested,
            claim.participant_id.clone(),
            header.callback_address.clone(),
            header.protocol.clone(),
            now,
        )
        .with_correlation_id(header.process_id.clone())
        .with_offer(offer);
        negotiation.protocol_messages.record_received(&header.id);

        let saved = self.store.save(&negotiation).await?;
        info!(
            negotiation_id = %saved.id(),
            correlation_id = %header.process_id,
            counter_party = %claim.participant_id,
            "Contract negotiation requested"
        );
        self.observable.state_entered(&saved);
        Ok(saved)
    }

    /// Consumer side: the provider made a (counter-)offer.
    pub async fn notify_offered(
        &self,
        token: &TokenRepresentation,
        message: ContractOfferMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        let ContractOfferMessage { header, offer } = message;
        self.resolve_and_apply(
            &claim,
            &header,
            ContractNegotiationState::Offered,
            Some(NegotiationType::Consumer),
            move |negotiation| {
                negotiation.contract_offers.push(offer);
                Ok(())
            },
        )
        .await
    }

    /// Consumer side: the provider sent its agreement.
    pub async fn notify_agreed(
        &self,
        token: &TokenRepresentation,
        message: ContractAgreementMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        let ContractAgreementMessage { header, agreement } = message;
        let validation = self.validation.clone();
        let agreement_claim = claim.clone();
        self.resolve_and_apply(
            &claim,
            &header,
            ContractNegotiationState::Agreed,
            Some(NegotiationType::Consumer),
            move |negotiation| {
                validation
                    .validate_confirmed(
                        &agreement_claim,
                        &agreement,
                        negotiation.last_contract_offer(),
                    )
                    .map_err(|e| ServiceFailure::BadRequest(e.to_string()))?;
                negotiation.contract_agreement = Some(agreement);
                Ok(())
            },
        )
        .await
    }

    /// Provider side: the consumer accepted the current offer.
    pub async fn notify_accepted(
        &self,
        token: &TokenRepresentation,
        message: ContractNegotiationEventMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        self.resolve_and_apply(
            &claim,
            &message.header,
            ContractNegotiationState::Accepted,
            Some(NegotiationType::Provider),
            |_| Ok(()),
        )
        .await
    }

    /// Provider side: the consumer verified the agreement.
    pub async fn notify_verified(
        &self,
        token: &TokenRepresentation,
        message: ContractAgreementVerificationMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        self.resolve_and_apply(
            &claim,
            &message.header,
            ContractNegotiationState::Verified,
            Some(NegotiationType::Provider),
            |_| Ok(()),
        )
        .await
    }

    /// Consumer side: the provider finalized the negotiation.
    pub async fn notify_finalized(
        &self,
        token: &TokenRepresentation,
        message: ContractNegotiationEventMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        self.resolve_and_apply(
            &claim,
            &message.header,
            ContractNegotiationState::Finalized,
            Some(NegotiationType::Consumer),
            |_| Ok(()),
        )
        .await
    }

    /// Route an event message by its type.
    pub async fn notify_event(
        &self,
        token: &TokenRepresentation,
        message: ContractNegotiationEventMessage,
    ) -> ServiceResult<ContractNegotiation> {
        match message.event_type {
            NegotiationEventType::Accepted => self.notify_accepted(token, message).await,
            NegotiationEventType::Finalized => self.notify_finalized(token, message).await,
        }
    }

    /// Either side: the counter-party terminated the negotiation.
    pub async fn notify_terminated(
        &self,
        token: &TokenRepresentation,
        message: ContractNegotiationTerminationMessage,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        let ContractNegotiationTerminationMessage { header, reason } = message;
        self.resolve_and_apply(
            &claim,
            &header,
            ContractNegotiationState::Terminated,
            None,
            move |negotiation| {
                negotiation.meta.error_detail = Some(reason);
                Ok(())
            },
        )
        .await
    }

    /// Read a negotiation on behalf of its counter-party.
    pub async fn find_by_id(
        &self,
        token: &TokenRepresentation,
        id: &str,
    ) -> ServiceResult<ContractNegotiation> {
        let claim = self.authenticate(token).await?;
        let negotiation = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceFailure::not_found("contract negotiation", id))?;
        self.validation
            .validate_request(&claim, &negotiation)
            .map_err(|_| ServiceFailure::not_found("contract negotiation", id))?;
        Ok(negotiation)
    }

    async fn authenticate(&self, token: &TokenRepresentation) -> ServiceResult<ClaimToken> {
        self.identity.verify_token(token).await.map_err(|e| {
            warn!(error = %e, "Rejected inbound negotiation message");
            ServiceFailure::Unauthorized(e.to_string())
        })
    }

    /// Lease the negotiation a message refers to: by the sender's process id,
    /// or on the sender's first answer by our own id in `correlation_id`.
    async fn resolve(&self, header: &MessageHeader) -> ServiceResult<ContractNegotiation> {
        match self
            .store
            .find_by_correlation_id_and_lease(&header.process_id)
            .await
        {
            Ok(negotiation) => return Ok(negotiation),
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let Some(local_id) = header.correlation_id.as_deref() else {
            return Err(ServiceFailure::NotFound(format!(
                "no contract negotiation correlated with process '{}'",
                header.process_id
            )));
        };
        let negotiation = self.store.find_by_id_and_lease(local_id).await?;
        if let Some(bound) = negotiation.correlation_id.as_deref()
            && bound != header.process_id
        {
            let failure = ServiceFailure::BadRequest(format!(
                "negotiation '{local_id}' is correlated with '{bound}', not '{}'",
                header.process_id
            ));
            self.release(local_id).await;
            return Err(failure);
        }
        Ok(negotiation)
    }

    async fn resolve_and_apply<F>(
        &self,
        claim: &ClaimToken,
        header: &MessageHeader,
        target: ContractNegotiationState,
        expected_type: Option<NegotiationType>,
        mutate: F,
    ) -> ServiceResult<ContractNegotiation>
    where
        F: FnOnce(&mut ContractNegotiation) -> ServiceResult<()> + Send,
    {
        let negotiation = self.resolve(header).await?;
        self.apply(claim, negotiation, header, target, expected_type, mutate)
            .await
    }

    async fn apply<F>(
        &self,
        claim: &ClaimToken,
        mut negotiation: ContractNegotiation,
        header: &MessageHeader,
        target: ContractNegotiationState,
        expected_type: Option<NegotiationType>,
        mutate: F,
    ) -> ServiceResult<ContractNegotiation>
    where
        F: FnOnce(&mut ContractNegotiation) -> ServiceResult<()> + Send,
    {
        let id = negotiation.id().to_string();

        if let Err(failure) = self.authorize(claim, &negotiation, expected_type) {
            return Err(self.reject(&id, header, target, failure).await);
        }

        if negotiation.protocol_messages.has_received(&header.id)
            || negotiation.state() == Some(target)
        {
            debug!(
                negotiation_id = %id,
                message_id = %header.id,
                state = %target,
                "Duplicate negotiation message ignored"
            );
            self.release(&id).await;
            negotiation.meta.lease = None;
            return Ok(negotiation);
        }

        let checked = check_transition(&negotiation, target).and_then(|()| mutate(&mut negotiation));
        if let Err(failure) = checked {
            return Err(self.reject(&id, header, target, failure).await);
        }

        let previous = negotiation.state();
        if let Err(e) = negotiation.transition_to(target, self.clock.now_millis()) {
            self.release(&id).await;
            return Err(ServiceFailure::BadRequest(e.to_string()));
        }
        negotiation.set_pending(false);
        negotiation.protocol_messages.record_received(&header.id);
        if negotiation.correlation_id.is_none() {
            negotiation.correlation_id = Some(header.process_id.clone());
        }

        let saved = self.store.save(&negotiation).await?;
        info!(
            negotiation_id = %id,
            from = ?previous,
            to = %target,
            "Contract negotiation updated by counter-party"
        );
        self.observable.state_entered(&saved);
        Ok(saved)
    }

    /// The caller must be the negotiation's counter-party and the message
    /// must be meant for this side.
    fn authorize(
        &self,
        claim: &ClaimToken,
        negotiation: &ContractNegotiation,
        expected_type: Option<NegotiationType>,
    ) -> ServiceResult<()> {
        if let Some(expected) = expected_type
            && !negotiation.is_type(expected)
        {
            return Err(ServiceFailure::BadRequest(format!(
                "negotiation '{}' is a {} negotiation",
                negotiation.id(),
                negotiation.negotiation_type
            )));
        }
        self.validation
            .validate_request(claim, negotiation)
            .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
    }

    async fn reject(
        &self,
        id: &str,
        header: &MessageHeader,
        target: ContractNegotiationState,
        failure: ServiceFailure,
    ) -> ServiceFailure {
        warn!(
            negotiation_id = %id,
            message_id = %header.id,
            state = %target,
            error = %failure,
            "Inbound negotiation message rejected"
        );
        self.release(id).await;
        failure
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id).await {
            warn!(negotiation_id = %id, error = %e, "Failed to release negotiation lease");
        }
    }
}

fn check_transition(
    negotiation: &ContractNegotiation,
    target: ContractNegotiationState,
) -> ServiceResult<()> {
    match negotiation.state() {
        Some(current) if current.can_transition_to(target) => Ok(()),
        current => Err(ServiceFailure::BadRequest(format!(
            "negotiation '{}' cannot move from {} to {target}",
            negotiation.id(),
            current.map_or_else(|| negotiation.meta.state.to_string(), |s| s.to_string())
        ))),
    }
}

/// Deterministic id so a re-delivered first request cannot create a second
/// negotiation.
fn provider_negotiation_id(claim: &ClaimToken, header: &MessageHeader) -> String {
    let name = format!("{}/{}", claim.participant_id, header.process_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
