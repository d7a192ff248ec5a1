// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner table for contract negotiations.

use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{
    Clock, Criterion, EntityRetryProcessConfiguration, PendingGuard, ResponseFailure,
    StateEntityStore, StateHandler, StateMachineConfig, StateMachineManager, StatefulEntity,
    StatusResult, local,
};
use uuid::Uuid;

use super::{
    ContractAgreement, ContractNegotiation, ContractNegotiationObservable,
    ContractNegotiationState, NegotiationType,
};
use crate::dispatch::RemoteMessageDispatcherRegistry;
use crate::message::{
    ContractAgreementMessage, ContractAgreementVerificationMessage,
    ContractNegotiationEventMessage, ContractNegotiationTerminationMessage, ContractOfferMessage,
    ContractRequestMessage, MessageHeader, NegotiationEventType, ProtocolMessage,
};

/// What the negotiation handlers need besides the entity.
pub struct NegotiationContext {
    pub participant_id: String,
    /// Address counter-parties answer to.
    pub protocol_address: String,
    pub dispatcher: Arc<RemoteMessageDispatcherRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl NegotiationContext {
    fn header(&self, negotiation: &mut ContractNegotiation) -> MessageHeader {
        MessageHeader {
            id: negotiation.protocol_messages.outgoing_id(&negotiation.meta),
            process_id: negotiation.meta.id.clone(),
            correlation_id: negotiation.correlation_id.clone(),
            protocol: negotiation.protocol.clone(),
            callback_address: self.protocol_address.clone(),
        }
    }
}

type MessageBuilder =
    fn(&NegotiationContext, &mut ContractNegotiation, MessageHeader) -> StatusResult<ProtocolMessage>;

/// Builds a message for the entity and sends it to the counter-party.
struct Dispatch {
    ctx: Arc<NegotiationContext>,
    build: MessageBuilder,
}

#[async_trait]
impl StateHandler<ContractNegotiation> for Dispatch {
    async fn handle(
        &self,
        negotiation: &mut ContractNegotiation,
    ) -> StatusResult<Option<ContractNegotiationState>> {
        let header = self.ctx.header(negotiation);
        let message = (self.build)(&self.ctx, negotiation, header)?;
        self.ctx
            .dispatcher
            .dispatch(&negotiation.counter_party_address, message)
            .await?;
        Ok(None)
    }
}

fn current_offer(negotiation: &ContractNegotiation) -> StatusResult<super::ContractOffer> {
    negotiation.last_contract_offer().cloned().ok_or_else(|| {
        ResponseFailure::fatal(format!("negotiation '{}' has no contract offer", negotiation.id()))
    })
}

fn request(
    _ctx: &NegotiationContext,
    negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    let offer = current_offer(negotiation)?;
    Ok(ProtocolMessage::ContractRequest(ContractRequestMessage { header, offer }))
}

fn offer(
    _ctx: &NegotiationContext,
    negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    let offer = current_offer(negotiation)?;
    Ok(ProtocolMessage::ContractOffer(ContractOfferMessage { header, offer }))
}

fn accepted(
    _ctx: &NegotiationContext,
    _negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    Ok(ProtocolMessage::ContractNegotiationEvent(
        ContractNegotiationEventMessage {
            header,
            event_type: NegotiationEventType::Accepted,
        },
    ))
}

/// The agreement is created on the first attempt and re-sent unchanged on
/// retries.
fn agreement(
    ctx: &NegotiationContext,
    negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    if negotiation.contract_agreement.is_none() {
        let offer = current_offer(negotiation)?;
        negotiation.contract_agreement = Some(ContractAgreement {
            id: Uuid::new_v4().to_string(),
            provider_id: ctx.participant_id.clone(),
            consumer_id: negotiation.counter_party_id.clone(),
            asset_id: offer.asset_id,
            policy: offer.policy,
            contract_signing_date: ctx.clock.now_millis(),
        });
    }
    let agreement = negotiation.contract_agreement.clone().ok_or_else(|| {
        ResponseFailure::fatal(format!("negotiation '{}' has no agreement", negotiation.id()))
    })?;
    Ok(ProtocolMessage::ContractAgreement(ContractAgreementMessage {
        header,
        agreement,
    }))
}

fn verification(
    _ctx: &NegotiationContext,
    _negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    Ok(ProtocolMessage::ContractAgreementVerification(
        ContractAgreementVerificationMessage { header },
    ))
}

fn finalized(
    _ctx: &NegotiationContext,
    _negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    Ok(ProtocolMessage::ContractNegotiationEvent(
        ContractNegotiationEventMessage {
            header,
            event_type: NegotiationEventType::Finalized,
        },
    ))
}

fn termination(
    _ctx: &NegotiationContext,
    negotiation: &mut ContractNegotiation,
    header: MessageHeader,
) -> StatusResult<ProtocolMessage> {
    let reason = negotiation
        .error_detail()
        .unwrap_or("terminated by counter-party")
        .to_string();
    Ok(ProtocolMessage::ContractNegotiationTermination(
        ContractNegotiationTerminationMessage { header, reason },
    ))
}

fn side(negotiation_type: NegotiationType) -> Vec<Criterion> {
    vec![Criterion::eq("type", negotiation_type.as_str())]
}

/// Assemble the negotiation runner.
///
/// | Side     | State       | Action                          | Success     |
/// |----------|-------------|---------------------------------|-------------|
/// | consumer | REQUESTING  | send request                    | REQUESTED   |
/// | consumer | ACCEPTING   | send ACCEPTED event             | ACCEPTED    |
/// | consumer | AGREED      | local                           | VERIFYING   |
/// | consumer | VERIFYING   | send verification               | VERIFIED    |
/// | provider | OFFERING    | send offer                      | OFFERED     |
/// | provider | REQUESTED   | local                           | AGREEING    |
/// | provider | ACCEPTED    | local                           | AGREEING    |
/// | provider | AGREEING    | build agreement once, send it   | AGREED      |
/// | provider | VERIFIED    | local                           | FINALIZING  |
/// | provider | FINALIZING  | send FINALIZED event            | FINALIZED   |
/// | both     | TERMINATING | send termination                | TERMINATED  |
///
/// Failures lead to TERMINATING, except from TERMINATING itself which gives
/// up straight to TERMINATED.
pub fn build_negotiation_manager(
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    ctx: Arc<NegotiationContext>,
    observable: Arc<ContractNegotiationObservable>,
    config: StateMachineConfig,
    retry: EntityRetryProcessConfiguration,
    guard: Option<Arc<dyn PendingGuard<ContractNegotiation>>>,
) -> StateMachineManager<ContractNegotiation> {
    use ContractNegotiationState::*;
    use NegotiationType::{Consumer, Provider};

    let send = |build: MessageBuilder| Dispatch {
        ctx: ctx.clone(),
        build,
    };
    let pass = || local(|_: &mut ContractNegotiation| Ok(None));

    let mut builder = StateMachineManager::builder("contract-negotiation", store)
        .config(config)
        .retry(retry)
        .clock(ctx.clock.clone())
        .observer(observable)
        .processor_where(Requesting, side(Consumer), send(request), Requested, Terminating)
        .processor_where(Accepting, side(Consumer), send(accepted), Accepted, Terminating)
        .processor_where(Agreed, side(Consumer), pass(), Verifying, Terminating)
        .processor_where(Verifying, side(Consumer), send(verification), Verified, Terminating)
        .processor_where(Offering, side(Provider), send(offer), Offered, Terminating)
        .processor_where(Requested, side(Provider), pass(), Agreeing, Terminating)
        .processor_where(Accepted, side(Provider), pass(), Agreeing, Terminating)
        .processor_where(Agreeing, side(Provider), send(agreement), Agreed, Terminating)
        .processor_where(Verified, side(Provider), pass(), Finalizing, Terminating)
        .processor_where(Finalizing, side(Provider), send(finalized), Finalized, Terminating)
        .processor(Terminating, send(termination), Terminated, Terminated);

    if let Some(guard) = guard {
        builder = builder.pending_guard(guard);
    }
    builder.build()
}
