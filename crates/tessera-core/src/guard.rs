// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending guard: a predicate that parks entities instead of processing them.
//!
//! When the guard matches a leased entity, the runner sets `pending = true`
//! and saves it without calling the handler. Pending entities are excluded
//! from polling until something external clears the flag.

/// Predicate deciding whether an entity should be parked as pending.
pub trait PendingGuard<E>: Send + Sync {
    fn test(&self, entity: &E) -> bool;
}

impl<E, F> PendingGuard<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn test(&self, entity: &E) -> bool {
        self(entity)
    }
}
