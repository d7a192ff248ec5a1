// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition observers.
//!
//! The runner reports every persisted outcome to a [`TransitionObserver`].
//! Process kinds translate those into their own listener callbacks through an
//! [`Observable`], which isolates listeners from each other: a panicking
//! listener is logged and skipped, the rest still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use crate::entity::StatefulEntity;

/// Receives the runner's persisted outcomes.
///
/// Both methods are invoked after the save succeeded, never before.
pub trait TransitionObserver<E: StatefulEntity>: Send + Sync {
    /// The entity moved from `previous` into its current state.
    fn transitioned(&self, entity: &E, previous: E::State);

    /// The entity moved from `previous` into a failure state.
    fn failed(&self, entity: &E, previous: E::State, detail: &str);
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<E: StatefulEntity> TransitionObserver<E> for NoopObserver {
    fn transitioned(&self, _entity: &E, _previous: E::State) {}

    fn failed(&self, _entity: &E, _previous: E::State, _detail: &str) {}
}

/// Immutable list of listeners of type `L`.
pub struct Observable<L: ?Sized> {
    listeners: Vec<Arc<L>>,
}

impl<L: ?Sized> Observable<L> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<L>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listeners(&self) -> &[Arc<L>] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Call `f` for every listener in registration order.
    pub fn invoke_for_each<F>(&self, f: F)
    where
        F: Fn(&L),
    {
        for (index, listener) in self.listeners.iter().enumerate() {
            let listener: &L = listener;
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                warn!(listener = index, "Listener panicked; continuing with the rest");
            }
        }
    }
}

impl<L: ?Sized> Default for Observable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> FromIterator<Arc<L>> for Observable<L> {
    fn from_iter<I: IntoIterator<Item = Arc<L>>>(iter: I) -> Self {
        Self {
            listeners: iter.into_iter().collect(),
        }
    }
}
