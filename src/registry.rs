//! Type Registry
//!
//! Maps wire type tags to registered domain delegates. Type erasure happens
//! here: [`DelegateAdapter`] wraps a typed [`DomainDelegate`] behind the
//! object-safe [`ErasedDelegate`] so the pull pipeline and the sync-all
//! fan-out can dispatch envelopes without knowing the record type. The
//! registry is an explicit object injected into the agent; there is no
//! global state.

use crate::agent::SyncAgent;
use crate::delegate::{ConflictPolicy, DomainDelegate, SyncRecord};
use crate::envelope::{Envelope, Timestamp};
use crate::error::SyncError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Object-safe view over a registered delegate.
#[async_trait]
pub trait ErasedDelegate: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn conflict_policy(&self) -> ConflictPolicy;

    /// Decode a group of same-type envelopes and apply them through the
    /// delegate. Returns how many were applied after skipping unchanged
    /// ones. With `mark_missing_deleted`, locally-known ids absent from the
    /// group are handed to the delegate's deletion hook.
    async fn dispatch_envelopes(
        &self,
        envelopes: Vec<Envelope>,
        mark_missing_deleted: bool,
    ) -> Result<usize, SyncError>;

    /// Export the delegate's records and push them as one batch through the
    /// agent. Returns how many ended up saved.
    async fn save_all_on(
        &self,
        agent: Arc<SyncAgent>,
        updated_since: Option<Timestamp>,
        force: bool,
    ) -> Result<usize, SyncError>;

    /// Forget the checksum records for every locally-known id.
    async fn clear_all_checksums(&self) -> Result<(), SyncError>;
}

/// Bridges a typed delegate into [`ErasedDelegate`].
pub struct DelegateAdapter<T, D> {
    delegate: Arc<D>,
    _record: std::marker::PhantomData<fn() -> T>,
}

impl<T, D> DelegateAdapter<T, D> {
    pub fn new(delegate: Arc<D>) -> Self {
        Self {
            delegate,
            _record: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, D> ErasedDelegate for DelegateAdapter<T, D>
where
    T: SyncRecord,
    D: DomainDelegate<T> + 'static,
{
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        self.delegate.conflict_policy()
    }

    async fn dispatch_envelopes(
        &self,
        envelopes: Vec<Envelope>,
        mark_missing_deleted: bool,
    ) -> Result<usize, SyncError> {
        let ids: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
        let stored = self.delegate.checksums_for_ids(&ids).await?;

        // Nothing stored yet means a first sync; apply everything.
        let to_apply: Vec<&Envelope> = if stored.is_empty() {
            envelopes.iter().collect()
        } else {
            envelopes
                .iter()
                .filter(|e| stored.get(&e.id) != Some(&e.checksum))
                .collect()
        };

        let mut decoded = Vec::with_capacity(to_apply.len());
        let mut applied_checksums = Vec::with_capacity(to_apply.len());
        let mut decode_errors = Vec::new();

        for envelope in to_apply {
            match envelope.decode::<T>() {
                Ok(record) => {
                    applied_checksums.push((envelope.id, envelope.checksum.clone()));
                    decoded.push(record);
                }
                // A mismatched tag is a dispatch integrity fault; a payload
                // that will not decode only poisons that one object.
                Err(e @ SyncError::InvalidObjectType { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("skipping undecodable {} envelope: {e}", T::TYPE_NAME);
                    decode_errors.push(e);
                }
            }
        }

        let applied = decoded.len();
        if !decoded.is_empty() {
            self.delegate.received_objects(decoded).await?;
        }

        if mark_missing_deleted {
            let received: HashSet<Uuid> = ids.iter().copied().collect();
            let missing: Vec<Uuid> = self
                .delegate
                .all_objects(None)
                .await?
                .iter()
                .map(|o| o.record_id())
                .filter(|id| !received.contains(id))
                .collect();
            if !missing.is_empty() {
                tracing::info!(
                    "full sync: {} local {} object(s) gone remotely",
                    missing.len(),
                    T::TYPE_NAME
                );
                self.delegate.delete_missing(missing).await?;
            }
        }

        if !applied_checksums.is_empty() {
            self.delegate.persist_checksums(&applied_checksums).await?;
        }

        if decode_errors.is_empty() {
            Ok(applied)
        } else {
            Err(SyncError::MultipleErrors(decode_errors))
        }
    }

    async fn save_all_on(
        &self,
        agent: Arc<SyncAgent>,
        updated_since: Option<Timestamp>,
        force: bool,
    ) -> Result<usize, SyncError> {
        let objects = self.delegate.all_objects(updated_since).await?;
        if objects.is_empty() {
            return Ok(0);
        }

        let saved = agent
            .save_objects(self.delegate.as_ref(), objects, force)
            .await
            .map_err(|e| e.into_sync_error())?;
        Ok(saved.len())
    }

    async fn clear_all_checksums(&self) -> Result<(), SyncError> {
        let ids: Vec<Uuid> = self
            .delegate
            .all_objects(None)
            .await?
            .iter()
            .map(|o| o.record_id())
            .collect();
        self.delegate.clear_checksums(&ids).await
    }
}

/// Registered delegates, keyed by type tag.
pub struct TypeRegistry {
    delegates: RwLock<HashMap<&'static str, Arc<dyn ErasedDelegate>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            delegates: RwLock::new(HashMap::new()),
        }
    }

    /// Register a delegate for `T`. A second registration for the same type
    /// tag replaces the first.
    pub fn register<T, D>(&self, delegate: Arc<D>)
    where
        T: SyncRecord,
        D: DomainDelegate<T> + 'static,
    {
        let adapter: Arc<dyn ErasedDelegate> = Arc::new(DelegateAdapter::new(delegate));
        self.delegates.write().insert(T::TYPE_NAME, adapter);
    }

    pub fn lookup(&self, type_name: &str) -> Option<Arc<dyn ErasedDelegate>> {
        self.delegates.read().get(type_name).cloned()
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.delegates.read().contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.delegates.read().keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Every registered erased delegate, for fan-out.
    pub fn all(&self) -> Vec<Arc<dyn ErasedDelegate>> {
        self.delegates.read().values().cloned().collect()
    }

    pub fn unregister_all(&self) {
        self.delegates.write().clear();
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
