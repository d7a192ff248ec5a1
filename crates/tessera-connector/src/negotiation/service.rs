// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local API for contract negotiations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_core::{
    Clock, Criterion, EntityState, QuerySpec, StateEntityStore, StatefulEntity,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    ContractAgreement, ContractNegotiation, ContractNegotiationObservable,
    ContractNegotiationState, ContractOffer, NegotiationType,
};
use crate::error::{ServiceFailure, ServiceResult};
use crate::message::CallbackAddress;

/// Input for [`ContractNegotiationService::initiate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRequest {
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    pub offer: ContractOffer,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
}

pub struct ContractNegotiationService {
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    observable: Arc<ContractNegotiationObservable>,
    clock: Arc<dyn Clock>,
}

impl ContractNegotiationService {
    pub fn new(
        store: Arc<dyn StateEntityStore<ContractNegotiation>>,
        observable: Arc<ContractNegotiationObservable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            clock,
        }
    }

    /// Start a consumer negotiation in REQUESTING.
    pub async fn initiate(&self, request: ContractRequest) -> ServiceResult<ContractNegotiation> {
        if request.counter_party_address.is_empty() {
            return Err(ServiceFailure::BadRequest(
                "counter-party address is required".to_string(),
            ));
        }
        if request.offer.asset_id.is_empty() {
            return Err(ServiceFailure::BadRequest(format!(
                "offer '{}' has no asset",
                request.offer.id
            )));
        }

        let negotiation = ContractNegotiation::new(
            Uuid::new_v4().to_string(),
            NegotiationType::Consumer,
            ContractNegotiationState::Requesting,
            request.counter_party_id,
            request.counter_party_address,
            request.protocol,
            self.clock.now_millis(),
        )
        .with_offer(request.offer)
        .with_callback_addresses(request.callback_addresses);

        let saved = self.store.save(&negotiation).await?;
        info!(
            negotiation_id = %saved.id(),
            counter_party = %saved.counter_party_id,
            "Contract negotiation initiated"
        );
        self.observable.initiated(&saved);
        Ok(saved)
    }

    pub async fn find_by_id(&self, id: &str) -> ServiceResult<ContractNegotiation> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceFailure::not_found("contract negotiation", id))
    }

    pub async fn query(&self, query: &QuerySpec) -> ServiceResult<Vec<ContractNegotiation>> {
        Ok(self.store.find_all(query).await?)
    }

    pub async fn get_state(&self, id: &str) -> ServiceResult<ContractNegotiationState> {
        let negotiation = self.find_by_id(id).await?;
        negotiation.state().ok_or_else(|| {
            ServiceFailure::Internal(format!(
                "negotiation '{id}' has unknown state code {}",
                negotiation.meta.state
            ))
        })
    }

    pub async fn get_agreement(&self, id: &str) -> ServiceResult<Option<ContractAgreement>> {
        Ok(self.find_by_id(id).await?.contract_agreement)
    }

    /// Agreement of a finalized negotiation, looked up by agreement id.
    pub async fn find_agreement(&self, agreement_id: &str) -> ServiceResult<Option<ContractAgreement>> {
        let query = QuerySpec::new()
            .filter(Criterion::eq("contract_agreement.id", agreement_id))
            .filter(Criterion::eq(
                "state",
                ContractNegotiationState::Finalized.code(),
            ))
            .limit(1);
        Ok(self
            .store
            .find_all(&query)
            .await?
            .into_iter()
            .find_map(|negotiation| negotiation.contract_agreement))
    }

    /// Consumer accepts the provider's current offer.
    pub async fn accept(&self, id: &str) -> ServiceResult<ContractNegotiation> {
        self.mutate(id, |negotiation, now| {
            require_type(negotiation, NegotiationType::Consumer)?;
            transition(negotiation, ContractNegotiationState::Accepting, now)
        })
        .await
    }

    /// Provider answers a request with a counter-offer.
    pub async fn offer(&self, id: &str, offer: ContractOffer) -> ServiceResult<ContractNegotiation> {
        self.mutate(id, move |negotiation, now| {
            require_type(negotiation, NegotiationType::Provider)?;
            transition(negotiation, ContractNegotiationState::Offering, now)?;
            negotiation.contract_offers.push(offer);
            Ok(())
        })
        .await
    }

    /// Consumer answers an offer with a new request.
    pub async fn request(
        &self,
        id: &str,
        offer: ContractOffer,
    ) -> ServiceResult<ContractNegotiation> {
        self.mutate(id, move |negotiation, now| {
            require_type(negotiation, NegotiationType::Consumer)?;
            transition(negotiation, ContractNegotiationState::Requesting, now)?;
            negotiation.contract_offers.push(offer);
            Ok(())
        })
        .await
    }

    /// Move a live negotiation to TERMINATING; the runner tells the
    /// counter-party.
    pub async fn terminate(&self, id: &str, reason: &str) -> ServiceResult<ContractNegotiation> {
        let reason = reason.to_string();
        self.mutate(id, move |negotiation, now| {
            negotiation
                .fail_to(ContractNegotiationState::Terminating, reason, now)
                .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
        })
        .await
    }

    pub async fn decline(&self, id: &str) -> ServiceResult<ContractNegotiation> {
        self.terminate(id, "declined").await
    }

    /// Clear the pending flag so the runner picks the negotiation up again.
    pub async fn release_pending(&self, id: &str) -> ServiceResult<ContractNegotiation> {
        self.mutate(id, |negotiation, _| {
            if !negotiation.is_pending() {
                return Err(ServiceFailure::BadRequest(format!(
                    "negotiation '{}' is not pending",
                    negotiation.id()
                )));
            }
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> ServiceResult<ContractNegotiation>
    where
        F: FnOnce(&mut ContractNegotiation, i64) -> ServiceResult<()> + Send,
    {
        let mut negotiation = self.store.find_by_id_and_lease(id).await?;
        if let Err(failure) = apply(&mut negotiation, self.clock.now_millis()) {
            if let Err(e) = self.store.break_lease(id).await {
                warn!(negotiation_id = %id, error = %e, "Failed to release negotiation lease");
            }
            return Err(failure);
        }
        negotiation.set_pending(false);
        let saved = self.store.save(&negotiation).await?;
        info!(negotiation_id = %id, state = saved.meta.state, "Contract negotiation updated locally");
        self.observable.state_entered(&saved);
        Ok(saved)
    }
}

fn require_type(negotiation: &ContractNegotiation, expected: NegotiationType) -> ServiceResult<()> {
    if negotiation.is_type(expected) {
        Ok(())
    } else {
        Err(ServiceFailure::BadRequest(format!(
            "negotiation '{}' is a {} negotiation",
            negotiation.id(),
            negotiation.negotiation_type
        )))
    }
}

fn transition(
    negotiation: &mut ContractNegotiation,
    next: ContractNegotiationState,
    now: i64,
) -> ServiceResult<()> {
    negotiation
        .transition_to(next, now)
        .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
}
