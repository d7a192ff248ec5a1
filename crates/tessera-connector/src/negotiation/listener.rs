// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Negotiation event listeners.

use std::sync::Arc;

use tessera_core::{Observable, StatefulEntity, TransitionObserver};
use tracing::debug;

use super::{ContractNegotiation, ContractNegotiationState};

/// Callbacks fired after a negotiation change was saved.
///
/// Every method defaults to doing nothing; implement the ones you need.
pub trait ContractNegotiationListener: Send + Sync {
    fn initiated(&self, _negotiation: &ContractNegotiation) {}

    fn requested(&self, _negotiation: &ContractNegotiation) {}

    fn offered(&self, _negotiation: &ContractNegotiation) {}

    fn accepted(&self, _negotiation: &ContractNegotiation) {}

    fn agreed(&self, _negotiation: &ContractNegotiation) {}

    fn verified(&self, _negotiation: &ContractNegotiation) {}

    fn finalized(&self, _negotiation: &ContractNegotiation) {}

    fn terminated(&self, _negotiation: &ContractNegotiation) {}

    /// The runner gave up on a step and moved the negotiation to its failure
    /// state.
    fn failed(&self, _negotiation: &ContractNegotiation, _detail: &str) {}
}

/// Fans negotiation events out to the registered listeners.
#[derive(Default)]
pub struct ContractNegotiationObservable {
    listeners: Observable<dyn ContractNegotiationListener>,
}

impl ContractNegotiationObservable {
    pub fn new(listeners: Vec<Arc<dyn ContractNegotiationListener>>) -> Self {
        Self {
            listeners: listeners.into_iter().collect(),
        }
    }

    pub fn initiated(&self, negotiation: &ContractNegotiation) {
        self.listeners.invoke_for_each(|l| l.initiated(negotiation));
    }

    /// Fire the event belonging to the negotiation's current state, if any.
    pub fn state_entered(&self, negotiation: &ContractNegotiation) {
        let Some(state) = negotiation.state() else {
            return;
        };
        match state {
            ContractNegotiationState::Requested => {
                self.listeners.invoke_for_each(|l| l.requested(negotiation))
            }
            ContractNegotiationState::Offered => {
                self.listeners.invoke_for_each(|l| l.offered(negotiation))
            }
            ContractNegotiationState::Accepted => {
                self.listeners.invoke_for_each(|l| l.accepted(negotiation))
            }
            ContractNegotiationState::Agreed => {
                self.listeners.invoke_for_each(|l| l.agreed(negotiation))
            }
            ContractNegotiationState::Verified => {
                self.listeners.invoke_for_each(|l| l.verified(negotiation))
            }
            ContractNegotiationState::Finalized => {
                self.listeners.invoke_for_each(|l| l.finalized(negotiation))
            }
            ContractNegotiationState::Terminated => {
                self.listeners.invoke_for_each(|l| l.terminated(negotiation))
            }
            other => debug!(negotiation_id = %negotiation.id(), state = %other, "No listener event"),
        }
    }

    pub fn notify_failed(&self, negotiation: &ContractNegotiation, detail: &str) {
        self.listeners
            .invoke_for_each(|l| l.failed(negotiation, detail));
    }
}

impl TransitionObserver<ContractNegotiation> for ContractNegotiationObservable {
    fn transitioned(&self, entity: &ContractNegotiation, _previous: ContractNegotiationState) {
        self.state_entered(entity);
    }

    fn failed(&self, entity: &ContractNegotiation, _previous: ContractNegotiationState, detail: &str) {
        self.notify_failed(entity, detail);
        self.state_entered(entity);
    }
}
