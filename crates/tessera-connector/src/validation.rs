// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation of inbound negotiation and transfer requests.
//!
//! Checks here are pure: they look at the verified caller, the message
//! payload and the current entity, never at the store.

use thiserror::Error;

use crate::identity::ClaimToken;
use crate::negotiation::{ContractAgreement, ContractNegotiation, ContractOffer};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationFailure(pub String);

pub type ValidationResult = Result<(), ValidationFailure>;

pub trait ContractValidationService: Send + Sync {
    /// First offer of a new negotiation.
    fn validate_initial_offer(&self, claim: &ClaimToken, offer: &ContractOffer) -> ValidationResult;

    /// Any message acting on an existing negotiation.
    fn validate_request(&self, claim: &ClaimToken, negotiation: &ContractNegotiation)
    -> ValidationResult;

    /// Agreement sent by the provider against the consumer's latest offer.
    fn validate_confirmed(
        &self,
        claim: &ClaimToken,
        agreement: &ContractAgreement,
        latest_offer: Option<&ContractOffer>,
    ) -> ValidationResult;

    /// Agreement referenced by a transfer request.
    fn validate_agreement(&self, claim: &ClaimToken, agreement: &ContractAgreement)
    -> ValidationResult;
}

/// Identity and consistency checks without policy evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContractValidationService;

impl ContractValidationService for DefaultContractValidationService {
    fn validate_initial_offer(&self, _claim: &ClaimToken, offer: &ContractOffer) -> ValidationResult {
        if offer.id.is_empty() {
            return Err(ValidationFailure("offer id is empty".to_string()));
        }
        if offer.asset_id.is_empty() {
            return Err(ValidationFailure(format!("offer '{}' has no asset", offer.id)));
        }
        Ok(())
    }

    fn validate_request(
        &self,
        claim: &ClaimToken,
        negotiation: &ContractNegotiation,
    ) -> ValidationResult {
        if claim.participant_id != negotiation.counter_party_id {
            return Err(ValidationFailure(format!(
                "'{}' is not the counter-party of negotiation '{}'",
                claim.participant_id, negotiation.meta.id
            )));
        }
        Ok(())
    }

    fn validate_confirmed(
        &self,
        claim: &ClaimToken,
        agreement: &ContractAgreement,
        latest_offer: Option<&ContractOffer>,
    ) -> ValidationResult {
        if agreement.provider_id != claim.participant_id {
            return Err(ValidationFailure(format!(
                "agreement '{}' is not issued by '{}'",
                agreement.id, claim.participant_id
            )));
        }
        let Some(offer) = latest_offer else {
            return Err(ValidationFailure(format!(
                "no offer to confirm agreement '{}' against",
                agreement.id
            )));
        };
        if offer.asset_id != agreement.asset_id {
            return Err(ValidationFailure(format!(
                "agreement asset '{}' does not match offered asset '{}'",
                agreement.asset_id, offer.asset_id
            )));
        }
        if offer.provider_id != agreement.provider_id {
            return Err(ValidationFailure(format!(
                "agreement provider '{}' does not match offer provider '{}'",
                agreement.provider_id, offer.provider_id
            )));
        }
        if offer.policy != agreement.policy {
            return Err(ValidationFailure(format!(
                "agreement '{}' policy differs from offer '{}'",
                agreement.id, offer.id
            )));
        }
        Ok(())
    }

    fn validate_agreement(&self, claim: &ClaimToken, agreement: &ContractAgreement) -> ValidationResult {
        if agreement.consumer_id != claim.participant_id {
            return Err(ValidationFailure(format!(
                "agreement '{}' was not concluded with '{}'",
                agreement.id, claim.participant_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn claim(participant: &str) -> ClaimToken {
        ClaimToken {
            participant_id: participant.to_string(),
        }
    }

    fn offer() -> ContractOffer {
        ContractOffer {
            id: "offer-1".to_string(),
            asset_id: "asset-1".to_string(),
            provider_id: "provider-b".to_string(),
            policy: json!({"permission": "use"}),
        }
    }

    fn agreement() -> ContractAgreement {
        ContractAgreement {
            id: "agreement-1".to_string(),
            provider_id: "provider-b".to_string(),
            consumer_id: "consumer-a".to_string(),
            asset_id: "asset-1".to_string(),
            policy: json!({"permission": "use"}),
            contract_signing_date: 0,
        }
    }

    #[test]
    fn test_confirmed_agreement_must_match_offer() {
        let validation = DefaultContractValidationService;
        assert!(
            validation
                .validate_confirmed(&claim("provider-b"), &agreement(), Some(&offer()))
                .is_ok()
        );

        let mut other_asset = agreement();
        other_asset.asset_id = "asset-2".to_string();
        assert!(
            validation
                .validate_confirmed(&claim("provider-b"), &other_asset, Some(&offer()))
                .is_err()
        );

        assert!(
            validation
                .validate_confirmed(&claim("intruder"), &agreement(), Some(&offer()))
                .is_err()
        );
        assert!(
            validation
                .validate_confirmed(&claim("provider-b"), &agreement(), None)
                .is_err()
        );
    }

    #[test]
    fn test_agreement_bound_to_consumer() {
        let validation = DefaultContractValidationService;
        assert!(validation.validate_agreement(&claim("consumer-a"), &agreement()).is_ok());
        assert!(validation.validate_agreement(&claim("consumer-z"), &agreement()).is_err());
    }

    #[test]
    fn test_initial_offer_needs_asset() {
        let mut bare = offer();
        bare.asset_id.clear();
        let err = DefaultContractValidationService
            .validate_initial_offer(&claim("consumer-a"), &bare)
            .unwrap_err();
        assert!(err.0.contains("has no asset"));
    }
}
