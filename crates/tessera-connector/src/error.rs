// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tessera-connector.

use tessera_core::{ResponseFailure, StoreError};
use thiserror::Error;

/// Connector wiring errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store setup or access failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A required runtime component was not provided.
    #[error("Missing runtime component: {0}")]
    MissingComponent(&'static str),
}

/// Result type using connector Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed outcome of a local API call or an inbound protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceFailure {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is malformed or not valid for the entity's current state.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Another worker holds the entity or changed it concurrently.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Storage failure unrelated to the request itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceFailure>;

impl ServiceFailure {
    pub fn not_found(kind: &str, id: &str) -> Self {
        ServiceFailure::NotFound(format!("{kind} '{id}' not found"))
    }

    /// Classify for a remote sender: only contention and internal errors are
    /// worth retrying, everything else will fail the same way again.
    pub fn to_response_failure(&self) -> ResponseFailure {
        match self {
            ServiceFailure::Conflict(_) | ServiceFailure::Internal(_) => {
                ResponseFailure::retryable(self.to_string())
            }
            ServiceFailure::NotFound(_)
            | ServiceFailure::BadRequest(_)
            | ServiceFailure::Unauthorized(_) => ResponseFailure::fatal(self.to_string()),
        }
    }
}

impl From<StoreError> for ServiceFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ServiceFailure::NotFound(err.to_string()),
            StoreError::AlreadyLeased { .. }
            | StoreError::ConcurrentModification { .. }
            | StoreError::IllegalState { .. } => ServiceFailure::Conflict(err.to_string()),
            StoreError::InvalidQuery(_) => ServiceFailure::BadRequest(err.to_string()),
            other => ServiceFailure::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_service_failures() {
        let leased = StoreError::AlreadyLeased {
            id: "n-1".to_string(),
            holder: "runner".to_string(),
        };
        assert!(matches!(ServiceFailure::from(leased), ServiceFailure::Conflict(_)));

        let missing = StoreError::NotFound { id: "n-2".to_string() };
        assert!(matches!(ServiceFailure::from(missing), ServiceFailure::NotFound(_)));

        let query = StoreError::InvalidQuery("unknown operator".to_string());
        assert!(matches!(ServiceFailure::from(query), ServiceFailure::BadRequest(_)));
    }

    #[test]
    fn test_response_classification() {
        assert!(ServiceFailure::Conflict("busy".into()).to_response_failure().is_retryable());
        assert!(!ServiceFailure::BadRequest("no".into()).to_response_failure().is_retryable());
        assert!(!ServiceFailure::Unauthorized("who".into()).to_response_failure().is_retryable());
    }
}
