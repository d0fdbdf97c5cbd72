//! Transport Port
//!
//! The wire contract against the remote object store, as an outbound port.
//! The engine never talks HTTP or WebSocket itself; hosts plug in their own
//! implementation. [`MemoryTransport`] is the in-process reference remote:
//! it enforces the optimistic-concurrency check exactly as a conforming
//! server must, assigns checksums server-side, and feeds live subscribers.

use crate::envelope::{payload_checksum, Envelope, Timestamp};
use crate::error::{ObjectError, ObjectErrorKind, SyncError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Remote object store operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Store one envelope. The remote validates `previous_checksum` against
    /// its stored checksum and returns the stored envelope with the new
    /// server-assigned checksum.
    async fn save(&self, envelope: Envelope) -> Result<Envelope, SyncError>;

    /// Store a batch. On partial failure the remote keeps the valid ones and
    /// reports per-object errors via `SyncError::ApiErrors`.
    async fn save_all(&self, envelopes: Vec<Envelope>) -> Result<Vec<Envelope>, SyncError>;

    async fn fetch(&self, id: Uuid) -> Result<Envelope, SyncError>;

    /// All envelopes, or only those updated strictly after `after`.
    async fn fetch_all(&self, after: Option<Timestamp>) -> Result<Vec<Envelope>, SyncError>;

    /// Delete one object. `NotFound` when the remote never had it.
    async fn delete(&self, id: Uuid) -> Result<(), SyncError>;

    /// Delete every object, or only those of one type.
    async fn delete_all(&self, type_name: Option<&str>) -> Result<(), SyncError>;

    /// Live stream of envelopes as other devices store them.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, SyncError>;

    /// Fetch several objects by id, skipping ids the remote does not know.
    async fn fetch_many(&self, ids: &[Uuid]) -> Result<Vec<Envelope>, SyncError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch(*id).await {
                Ok(envelope) => found.push(envelope),
                Err(SyncError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }
}

const SUBSCRIBE_BUFFER: usize = 64;

/// In-memory conforming remote.
pub struct MemoryTransport {
    store: DashMap<Uuid, Envelope>,
    subscribers: Mutex<Vec<mpsc::Sender<Envelope>>>,
    /// One-shot injected failures, keyed by id. Consumed on the next save.
    injected_failures: DashMap<Uuid, String>,
    /// Last assigned storage timestamp, kept strictly monotonic.
    clock: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            injected_failures: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Next storage timestamp: wall clock, bumped past the previous one so
    /// ordering is unambiguous even within a microsecond.
    fn tick(&self) -> Timestamp {
        let now = Timestamp::now().as_micros();
        let mut previous = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.clock.compare_exchange_weak(
                previous,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Timestamp::from_micros(next),
                Err(p) => previous = p,
            }
        }
    }

    /// Make the next save of `id` fail with a non-checksum error.
    pub fn fail_next_save(&self, id: Uuid, message: impl Into<String>) {
        self.injected_failures.insert(id, message.into());
    }

    /// Seed the remote directly, bypassing concurrency checks. The stored
    /// checksum is recomputed from the payload.
    pub fn seed(&self, mut envelope: Envelope) -> String {
        envelope.checksum = payload_checksum(&envelope.payload);
        envelope.previous_checksum = None;
        let checksum = envelope.checksum.clone();
        self.store.insert(envelope.id, envelope);
        checksum
    }

    /// The checksum currently stored for `id`.
    pub fn stored_checksum(&self, id: &Uuid) -> Option<String> {
        self.store.get(id).map(|e| e.checksum.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.store.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Validate and apply one envelope, returning the stored version.
    fn apply(&self, mut envelope: Envelope) -> Result<Envelope, SyncError> {
        if let Some((_, message)) = self.injected_failures.remove(&envelope.id) {
            return Err(SyncError::Transport(message));
        }

        let stored_checksum = self.store.get(&envelope.id).map(|e| e.checksum.clone());
        if stored_checksum != envelope.previous_checksum {
            return Err(SyncError::InvalidChecksum { id: envelope.id });
        }

        envelope.checksum = payload_checksum(&envelope.payload);
        envelope.previous_checksum = None;
        envelope.updated_at = self.tick();
        self.store.insert(envelope.id, envelope.clone());
        Ok(envelope)
    }

    async fn broadcast(&self, envelope: &Envelope) {
        // Snapshot the senders so the lock is not held across await.
        let senders: Vec<mpsc::Sender<Envelope>> = self.subscribers.lock().clone();
        for sender in senders {
            if sender.send(envelope.clone()).await.is_err() {
                self.subscribers
                    .lock()
                    .retain(|s| !s.same_channel(&sender));
            }
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn save(&self, envelope: Envelope) -> Result<Envelope, SyncError> {
        let stored = self.apply(envelope)?;
        self.broadcast(&stored).await;
        Ok(stored)
    }

    async fn save_all(&self, envelopes: Vec<Envelope>) -> Result<Vec<Envelope>, SyncError> {
        let mut saved = Vec::with_capacity(envelopes.len());
        let mut errors = Vec::new();

        for envelope in envelopes {
            let id = envelope.id;
            match self.apply(envelope) {
                Ok(stored) => saved.push(stored),
                Err(SyncError::InvalidChecksum { .. }) => errors.push(ObjectError {
                    id,
                    kind: ObjectErrorKind::InvalidChecksum,
                }),
                Err(e) => errors.push(ObjectError {
                    id,
                    kind: ObjectErrorKind::Other(e.to_string()),
                }),
            }
        }

        for stored in &saved {
            self.broadcast(stored).await;
        }

        if errors.is_empty() {
            Ok(saved)
        } else {
            Err(SyncError::ApiErrors { errors, saved })
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Envelope, SyncError> {
        self.store
            .get(&id)
            .map(|e| e.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn fetch_all(&self, after: Option<Timestamp>) -> Result<Vec<Envelope>, SyncError> {
        Ok(self
            .store
            .iter()
            .filter(|entry| match after {
                Some(watermark) => entry.value().updated_at > watermark,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<(), SyncError> {
        match self.store.remove(&id) {
            Some(_) => Ok(()),
            None => Err(SyncError::NotFound),
        }
    }

    async fn delete_all(&self, type_name: Option<&str>) -> Result<(), SyncError> {
        match type_name {
            Some(type_name) => self.store.retain(|_, e| e.type_name != type_name),
            None => self.store.clear(),
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, SyncError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}
