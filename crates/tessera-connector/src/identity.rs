// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller authentication for inbound protocol messages.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential presented with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRepresentation {
    pub token: String,
}

impl TokenRepresentation {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

/// Verified principal behind a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Token is not recognised")]
    UnknownToken,

    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn verify_token(&self, token: &TokenRepresentation) -> Result<ClaimToken, IdentityError>;
}

/// Fixed token to participant table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityService {
    tokens: HashMap<String, String>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, participant_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), participant_id.into());
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn verify_token(&self, token: &TokenRepresentation) -> Result<ClaimToken, IdentityError> {
        self.tokens
            .get(&token.token)
            .map(|participant_id| ClaimToken {
                participant_id: participant_id.clone(),
            })
            .ok_or(IdentityError::UnknownToken)
    }
}
