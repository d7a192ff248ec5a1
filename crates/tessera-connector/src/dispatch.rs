// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound message delivery.
//!
//! A dispatcher owns one protocol tag and decides whether a failed delivery is
//! worth retrying. The registry routes each message by the `protocol` in its
//! header.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{ResponseFailure, StatusResult};
use tracing::debug;

use crate::message::ProtocolMessage;

#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    /// Protocol tag this dispatcher serves.
    fn protocol(&self) -> &str;

    /// Deliver `message` to `counter_party_address`.
    ///
    /// Transport problems and remote contention are retryable; an explicit
    /// rejection by the counter-party is fatal.
    async fn dispatch(&self, counter_party_address: &str, message: ProtocolMessage)
    -> StatusResult<()>;
}

/// Dispatchers keyed by protocol; immutable once built.
#[derive(Clone, Default)]
pub struct RemoteMessageDispatcherRegistry {
    dispatchers: HashMap<String, Arc<dyn RemoteMessageDispatcher>>,
}

impl RemoteMessageDispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        self.dispatchers
            .insert(dispatcher.protocol().to_string(), dispatcher);
        self
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }

    pub async fn dispatch(
        &self,
        counter_party_address: &str,
        message: ProtocolMessage,
    ) -> StatusResult<()> {
        let protocol = message.header().protocol.clone();
        let Some(dispatcher) = self.dispatchers.get(&protocol) else {
            return Err(ResponseFailure::fatal(format!(
                "no dispatcher registered for protocol '{protocol}'"
            )));
        };
        debug!(
            protocol = %protocol,
            message = message.name(),
            message_id = %message.header().id,
            address = %counter_party_address,
            "Dispatching protocol message"
        );
        dispatcher.dispatch(counter_party_address, message).await
    }
}
