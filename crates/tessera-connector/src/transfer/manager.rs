// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner table for transfer processes.

use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{
    Clock, Criterion, EntityRetryProcessConfiguration, PendingGuard, StateEntityStore,
    StateHandler, StateMachineConfig, StateMachineManager, StatefulEntity, StatusResult, local,
};
use tracing::info;

use super::{
    Provisioner, ResourceKind, TransferProcess, TransferProcessObservable, TransferProcessState,
    TransferProcessType,
};
use crate::dispatch::RemoteMessageDispatcherRegistry;
use crate::message::{
    MessageHeader, ProtocolMessage, TransferCompletionMessage, TransferRequestMessage,
    TransferStartMessage, TransferTerminationMessage,
};

pub struct TransferContext {
    pub protocol_address: String,
    pub dispatcher: Arc<RemoteMessageDispatcherRegistry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub clock: Arc<dyn Clock>,
}

impl TransferContext {
    fn header(&self, process: &mut TransferProcess) -> MessageHeader {
        MessageHeader {
            id: process.protocol_messages.outgoing_id(&process.meta),
            process_id: process.meta.id.clone(),
            correlation_id: process.correlation_id.clone(),
            protocol: process.protocol.clone(),
            callback_address: self.protocol_address.clone(),
        }
    }
}

type MessageBuilder = fn(&mut TransferProcess, MessageHeader) -> ProtocolMessage;

struct Dispatch {
    ctx: Arc<TransferContext>,
    build: MessageBuilder,
}

#[async_trait]
impl StateHandler<TransferProcess> for Dispatch {
    async fn handle(&self, process: &mut TransferProcess) -> StatusResult<Option<TransferProcessState>> {
        let header = self.ctx.header(process);
        let message = (self.build)(process, header);
        self.ctx
            .dispatcher
            .dispatch(&process.counter_party_address, message)
            .await?;
        Ok(None)
    }
}

fn request(process: &mut TransferProcess, header: MessageHeader) -> ProtocolMessage {
    ProtocolMessage::TransferRequest(TransferRequestMessage {
        header,
        contract_id: process.data_request.contract_id.clone(),
        asset_id: process.data_request.asset_id.clone(),
        data_destination: process.data_request.destination.clone(),
    })
}

fn start(process: &mut TransferProcess, header: MessageHeader) -> ProtocolMessage {
    let data_address = process.provisioned_address(ResourceKind::Source).cloned();
    process.content_data_address = data_address.clone();
    ProtocolMessage::TransferStart(TransferStartMessage {
        header,
        data_address,
    })
}

fn completion(_process: &mut TransferProcess, header: MessageHeader) -> ProtocolMessage {
    ProtocolMessage::TransferCompletion(TransferCompletionMessage { header })
}

fn termination(process: &mut TransferProcess, header: MessageHeader) -> ProtocolMessage {
    let reason = process
        .error_detail()
        .unwrap_or("terminated by counter-party")
        .to_string();
    ProtocolMessage::TransferTermination(TransferTerminationMessage { header, reason })
}

/// Computes the manifest on entry.
struct Plan(Arc<TransferContext>);

#[async_trait]
impl StateHandler<TransferProcess> for Plan {
    async fn handle(&self, process: &mut TransferProcess) -> StatusResult<Option<TransferProcessState>> {
        if process.resource_manifest.is_none() {
            process.resource_manifest = Some(self.0.provisioner.manifest(process)?);
        }
        Ok(None)
    }
}

/// Provisions every definition that has no resource yet. Progress survives
/// a failure part-way, so a retry only provisions what is missing.
struct Provision(Arc<TransferContext>);

#[async_trait]
impl StateHandler<TransferProcess> for Provision {
    async fn handle(&self, process: &mut TransferProcess) -> StatusResult<Option<TransferProcessState>> {
        let definitions = process
            .resource_manifest
            .as_ref()
            .map(|manifest| manifest.definitions.clone())
            .unwrap_or_default();
        for definition in definitions {
            if process.is_provisioned(&definition.id) {
                continue;
            }
            let resource = self.0.provisioner.provision(&definition).await?;
            process.provisioned_resources.push(resource);
        }
        info!(
            transfer_id = %process.id(),
            resources = process.provisioned_resources.len(),
            "Transfer resources provisioned"
        );
        Ok(None)
    }
}

struct Deprovision(Arc<TransferContext>);

#[async_trait]
impl StateHandler<TransferProcess> for Deprovision {
    async fn handle(&self, process: &mut TransferProcess) -> StatusResult<Option<TransferProcessState>> {
        for resource in process.provisioned_resources.iter_mut() {
            if resource.deprovisioned {
                continue;
            }
            self.0.provisioner.deprovision(resource).await?;
            resource.deprovisioned = true;
        }
        Ok(None)
    }
}

/// Assemble the transfer runner.
///
/// PROVISIONED branches by side: consumers request the transfer, providers
/// start it. Everything that fails before COMPLETED goes to TERMINATING;
/// TERMINATING, COMPLETED and TERMINATED never get stuck and always move on
/// towards DEPROVISIONED.
pub fn build_transfer_manager(
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    ctx: Arc<TransferContext>,
    observable: Arc<TransferProcessObservable>,
    config: StateMachineConfig,
    retry: EntityRetryProcessConfiguration,
    guard: Option<Arc<dyn PendingGuard<TransferProcess>>>,
) -> StateMachineManager<TransferProcess> {
    use TransferProcessState::*;

    let send = |build: MessageBuilder| Dispatch {
        ctx: ctx.clone(),
        build,
    };
    let consumer = vec![Criterion::eq("type", TransferProcessType::Consumer.as_str())];
    let provider = vec![Criterion::eq("type", TransferProcessType::Provider.as_str())];

    let mut builder = StateMachineManager::builder("transfer-process", store)
        .config(config)
        .retry(retry)
        .clock(ctx.clock.clone())
        .observer(observable)
        .processor(Initial, Plan(ctx.clone()), Provisioning, Terminating)
        .processor(Provisioning, Provision(ctx.clone()), Provisioned, Terminating)
        .processor(
            Provisioned,
            local(|process: &mut TransferProcess| {
                Ok(Some(match process.transfer_type {
                    TransferProcessType::Consumer => Requesting,
                    TransferProcessType::Provider => Starting,
                }))
            }),
            Requesting,
            Terminating,
        )
        .processor_where(Requesting, consumer, send(request), Requested, Terminating)
        .processor_where(Starting, provider, send(start), Started, Terminating)
        .processor(Completing, send(completion), Completed, Terminating)
        .processor(Terminating, send(termination), Terminated, Terminated)
        .processor(Completed, local(|_: &mut TransferProcess| Ok(None)), Deprovisioning, Deprovisioning)
        .processor(Terminated, local(|_: &mut TransferProcess| Ok(None)), Deprovisioning, Deprovisioning)
        .processor(Deprovisioning, Deprovision(ctx.clone()), Deprovisioned, Deprovisioned);

    if let Some(guard) = guard {
        builder = builder.pending_guard(guard);
    }
    builder.build()
}
