// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tessera-core.
//!
//! Two families live here:
//! - [`StoreError`]: what a [`StateEntityStore`](crate::store::StateEntityStore) reports.
//! - [`ResponseFailure`]: what a state handler or a remote dispatch reports,
//!   classified as retryable or fatal.

use std::fmt;

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for handler and dispatch operations.
pub type StatusResult<T> = std::result::Result<T, ResponseFailure>;

/// Errors reported by entity stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No entity matched the lookup.
    #[error("Entity '{id}' not found")]
    NotFound {
        /// Identifier or correlation id that was looked up.
        id: String,
    },

    /// The entity is held by another lease holder whose lease has not expired.
    #[error("Entity '{id}' is already leased by '{holder}'")]
    AlreadyLeased {
        /// Entity id.
        id: String,
        /// Current lease holder.
        holder: String,
    },

    /// A save lost the race: stale version or foreign lease.
    #[error("Entity '{id}' was modified concurrently: {reason}")]
    ConcurrentModification {
        /// Entity id.
        id: String,
        /// What did not match.
        reason: String,
    },

    /// The operation is not allowed in the entity's current condition.
    #[error("Illegal state for entity '{id}': {reason}")]
    IllegalState {
        /// Entity id.
        id: String,
        /// Explanation.
        reason: String,
    },

    /// A filter or sort expression could not be understood.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Entity payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Stable machine-readable code, used in logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::AlreadyLeased { .. } => "ALREADY_LEASED",
            StoreError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            StoreError::IllegalState { .. } => "ILLEGAL_STATE",
            StoreError::InvalidQuery(_) => "INVALID_QUERY",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Migration(_) => "MIGRATION_ERROR",
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound { id: id.into() }
    }
}

/// Classification of a failed handler or dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Transient; the same step may be attempted again.
    ErrorRetry,
    /// Permanent; retrying cannot help.
    FatalError,
}

/// A failed operation with its retry classification and messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFailure {
    status: ResponseStatus,
    messages: Vec<String>,
}

impl ResponseFailure {
    /// Create a failure with an explicit status.
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            messages: vec![message.into()],
        }
    }

    /// Transient failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::ErrorRetry, message)
    }

    /// Permanent failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::FatalError, message)
    }

    /// Append another message, keeping the status.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn is_retryable(&self) -> bool {
        self.status == ResponseStatus::ErrorRetry
    }

    /// Messages joined into a single line, stored as `error_detail`.
    pub fn detail(&self) -> String {
        self.messages.join(", ")
    }
}

impl fmt::Display for ResponseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.status {
            ResponseStatus::ErrorRetry => "retryable",
            ResponseStatus::FatalError => "fatal",
        };
        write!(f, "{} failure: {}", kind, self.detail())
    }
}

impl std::error::Error for ResponseFailure {}
