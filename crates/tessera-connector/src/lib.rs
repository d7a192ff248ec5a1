// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Connector - contract negotiation and data transfer processes
//!
//! This crate runs the two long-lived processes of a dataspace connector on
//! top of the `tessera-core` state-machine engine:
//!
//! - **Contract negotiation** ([`negotiation`]): consumer and provider agree
//!   on an offer for one asset and end with a shared [`ContractAgreement`].
//! - **Transfer process** ([`transfer`]): under a finalized agreement, the
//!   provider provisions a source, the consumer a destination, and the data
//!   flows between them.
//!
//! Each process has three entry points:
//!
//! | Entry point            | Called by                    | Leases as                  |
//! |------------------------|------------------------------|----------------------------|
//! | local service          | the application              | `<participant>/api`        |
//! | protocol service       | the counter-party, inbound   | `<participant>/protocol`   |
//! | state machine handlers | the runner, outbound sends   | `<participant>/<kind>-manager` |
//!
//! # Architecture
//!
//! ```text
//!   application                         counter-party
//!       │                                     │ ProtocolMessage
//!       ▼                                     ▼
//!  ┌──────────────┐                  ┌──────────────────┐
//!  │ *Service     │                  │ *ProtocolService │
//!  └──────┬───────┘                  └────────┬─────────┘
//!         │          ┌──────────────┐         │
//!         └─────────▶│ entity store │◀────────┘
//!                    └──────┬───────┘
//!                           │ next_not_leased
//!                    ┌──────▼───────────────┐   dispatch   ┌──────────────────┐
//!                    │ StateMachineManager  │─────────────▶│ RemoteMessage-   │
//!                    └──────────────────────┘              │ DispatcherRegistry│
//!                                                          └──────────────────┘
//! ```
//!
//! # Embedding
//!
//! [`runtime::ConnectorRuntime`] wires all of the above for one participant.
//! The [`loopback`] transport connects runtimes living in the same process.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod loopback;
pub mod message;
pub mod negotiation;
pub mod runtime;
pub mod transfer;
pub mod validation;

pub use config::ConnectorConfig;
pub use error::{Error, Result, ServiceFailure, ServiceResult};
pub use negotiation::{
    ContractAgreement, ContractNegotiation, ContractNegotiationState, ContractOffer,
    NegotiationType,
};
pub use runtime::{ConnectorRuntime, ConnectorRuntimeBuilder, ConnectorRuntimeConfig, ConnectorStores};
pub use transfer::{DataAddress, TransferProcess, TransferProcessState, TransferProcessType};
