// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use tessera_core::{Observable, StatefulEntity, TransitionObserver};

use super::{TransferProcess, TransferProcessState};

/// Callbacks fired after a transfer change was saved.
pub trait TransferProcessListener: Send + Sync {
    fn initiated(&self, _process: &TransferProcess) {}

    fn provisioned(&self, _process: &TransferProcess) {}

    fn requested(&self, _process: &TransferProcess) {}

    fn started(&self, _process: &TransferProcess) {}

    fn completed(&self, _process: &TransferProcess) {}

    fn terminated(&self, _process: &TransferProcess) {}

    fn deprovisioned(&self, _process: &TransferProcess) {}

    fn failed(&self, _process: &TransferProcess, _detail: &str) {}
}

#[derive(Default)]
pub struct TransferProcessObservable {
    listeners: Observable<dyn TransferProcessListener>,
}

impl TransferProcessObservable {
    pub fn new(listeners: Vec<Arc<dyn TransferProcessListener>>) -> Self {
        Self {
            listeners: listeners.into_iter().collect(),
        }
    }

    pub fn initiated(&self, process: &TransferProcess) {
        self.listeners.invoke_for_each(|l| l.initiated(process));
    }

    pub fn state_entered(&self, process: &TransferProcess) {
        match process.state() {
            Some(TransferProcessState::Provisioned) => {
                self.listeners.invoke_for_each(|l| l.provisioned(process))
            }
            Some(TransferProcessState::Requested) => {
                self.listeners.invoke_for_each(|l| l.requested(process))
            }
            Some(TransferProcessState::Started) => {
                self.listeners.invoke_for_each(|l| l.started(process))
            }
            Some(TransferProcessState::Completed) => {
                self.listeners.invoke_for_each(|l| l.completed(process))
            }
            Some(TransferProcessState::Terminated) => {
                self.listeners.invoke_for_each(|l| l.terminated(process))
            }
            Some(TransferProcessState::Deprovisioned) => {
                self.listeners.invoke_for_each(|l| l.deprovisioned(process))
            }
            _ => {}
        }
    }

    pub fn notify_failed(&self, process: &TransferProcess, detail: &str) {
        self.listeners.invoke_for_each(|l| l.failed(process, detail));
    }
}

impl TransitionObserver<TransferProcess> for TransferProcessObservable {
    fn transitioned(&self, entity: &TransferProcess, _previous: TransferProcessState) {
        self.state_entered(entity);
    }

    fn failed(&self, entity: &TransferProcess, _previous: TransferProcessState, detail: &str) {
        self.notify_failed(entity, detail);
        // failure states are reached through a transition too
        self.state_entered(entity);
    }
}
