//! In-Flight Push Table
//!
//! At most one push per record id is in flight at a time. Registering a new
//! push atomically replaces the previous holder and fires its cancellation
//! channel; the superseded push observes this through its receiver and
//! completes with `Cancelled` exactly once. Deletes cancel through the same
//! channel.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

struct Entry {
    token: u64,
    type_name: &'static str,
    cancel: oneshot::Sender<()>,
}

/// Per-id in-flight registrations, keyed by record id.
pub struct InFlightTable {
    entries: DashMap<Uuid, Entry>,
    next_token: AtomicU64,
}

/// Proof of an active registration.
///
/// Dropping the guard deregisters the id, but only while this registration
/// is still the current holder.
pub struct InFlightGuard {
    table: Arc<InFlightTable>,
    id: Uuid,
    token: u64,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a push for `id`, cancelling any previous holder.
    ///
    /// The returned receiver fires when this registration is itself
    /// superseded or cancelled.
    pub fn register(
        self: &Arc<Self>,
        id: Uuid,
        type_name: &'static str,
    ) -> (InFlightGuard, oneshot::Receiver<()>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();

        if let Some(previous) = self.entries.insert(
            id,
            Entry {
                token,
                type_name,
                cancel,
            },
        ) {
            tracing::debug!("superseding in-flight push for {id}");
            let _ = previous.cancel.send(());
        }

        let guard = InFlightGuard {
            table: Arc::clone(self),
            id,
            token,
        };
        (guard, cancelled)
    }

    /// Cancel the in-flight push for `id`, if any. Returns whether one was
    /// cancelled.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                let _ = entry.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight push for one record type. Returns how many
    /// were cancelled.
    pub fn cancel_type(&self, type_name: &str) -> usize {
        let ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.value().type_name == type_name)
            .map(|entry| *entry.key())
            .collect();

        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Cancel every in-flight push. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Deregister only if no newer push has taken the slot.
        self.table
            .entries
            .remove_if(&self.id, |_, entry| entry.token == self.token);
    }
}
