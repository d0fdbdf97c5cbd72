//! Sync Agent
//!
//! The orchestrator. Owns the transport, the type registry, the in-flight
//! table, and the delta-sync watermark; the push, pull, and conflict
//! pipelines are implemented on it in their own modules.

use crate::config::{AuthState, ConfigError, SyncConfig};
use crate::delegate::{DomainDelegate, SyncRecord};
use crate::envelope::{Envelope, Timestamp};
use crate::error::SyncError;
use crate::inflight::InFlightTable;
use crate::pull::PullKind;
use crate::registry::TypeRegistry;
use crate::transport::Transport;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// What a full sync pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Remote objects applied locally.
    pub pulled: usize,
    /// Local objects confirmed in sync by the push phase, counting ones
    /// skipped as already saved.
    pub pushed: usize,
}

/// Orchestrates synchronization between registered delegates and the remote
/// object store.
pub struct SyncAgent {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) auth: Arc<AuthState>,
    pub(crate) config: SyncConfig,
    pub(crate) inflight: Arc<InFlightTable>,
    last_received_at: RwLock<Option<Timestamp>>,
    full_sync_running: AtomicBool,
    shutdown: AtomicBool,
}

impl SyncAgent {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<TypeRegistry>,
        auth: Arc<AuthState>,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let last_received_at = RwLock::new(config.last_received_at);

        Ok(Self {
            transport,
            registry,
            auth,
            config,
            inflight: Arc::new(InFlightTable::new()),
            last_received_at,
            full_sync_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The delta-sync watermark, for the host to persist across restarts.
    pub fn last_received_at(&self) -> Option<Timestamp> {
        *self.last_received_at.read()
    }

    /// Stop the live update loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_authenticated(&self) -> Result<(), SyncError> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(SyncError::NotAuthenticated)
        }
    }

    /// Move the watermark forward to the newest envelope seen. Never moves
    /// backwards.
    pub(crate) fn advance_watermark(&self, envelopes: &[Envelope]) {
        let Some(newest) = envelopes.iter().map(|e| e.updated_at).max() else {
            return;
        };
        let mut watermark = self.last_received_at.write();
        if watermark.map_or(true, |current| newest > current) {
            *watermark = Some(newest);
        }
    }

    /// Fetch one envelope, bounded by the configured fetch timeout.
    pub(crate) async fn fetch_envelope(&self, id: Uuid) -> Result<Envelope, SyncError> {
        tokio::time::timeout(self.config.fetch_timeout, self.transport.fetch(id))
            .await
            .map_err(|_| SyncError::Timeout(self.config.fetch_timeout))?
    }

    /// Fetch and decode one remote object.
    pub async fn fetch_object<T: SyncRecord>(&self, id: Uuid) -> Result<T, SyncError> {
        self.ensure_authenticated()?;
        self.fetch_envelope(id).await?.decode()
    }

    /// Delete one object remotely and forget its checksum record. A remote
    /// that never had the object counts as success.
    pub async fn delete<T, D>(&self, delegate: &D, id: Uuid) -> Result<(), SyncError>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        self.ensure_authenticated()?;
        self.inflight.cancel(&id);

        match self.transport.delete(id).await {
            Ok(()) | Err(SyncError::NotFound) => {}
            Err(e) => return Err(e),
        }

        delegate.clear_checksums(&[id]).await
    }

    /// Delete every remote object, or only one type's. In-flight pushes for
    /// the affected type(s) are cancelled first so nothing resurrects the
    /// deleted objects, then checksum records are cleared.
    pub async fn delete_all(&self, type_name: Option<&str>) -> Result<(), SyncError> {
        self.ensure_authenticated()?;

        let cancelled = match type_name {
            Some(type_name) => self.inflight.cancel_type(type_name),
            None => self.inflight.cancel_all(),
        };
        if cancelled > 0 {
            tracing::debug!("cancelled {cancelled} in-flight push(es) before delete-all");
        }

        self.transport.delete_all(type_name).await?;

        match type_name {
            Some(type_name) => match self.registry.lookup(type_name) {
                Some(erased) => erased.clear_all_checksums().await?,
                None => tracing::warn!("delete-all for unregistered type {type_name}"),
            },
            None => {
                for erased in self.registry.all() {
                    erased.clear_all_checksums().await?;
                }
            }
        }

        Ok(())
    }

    /// Full sync pass: pull, then push every registered delegate's records,
    /// one branch per type. Only one pass runs at a time.
    pub async fn sync_all(self: &Arc<Self>, kind: PullKind, force: bool) -> Result<SyncReport, SyncError> {
        self.ensure_authenticated()?;

        if self
            .full_sync_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncAlreadyRunning);
        }

        let result = self.sync_all_inner(kind, force).await;
        self.full_sync_running.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_all_inner(
        self: &Arc<Self>,
        kind: PullKind,
        force: bool,
    ) -> Result<SyncReport, SyncError> {
        let pulled = self.pull_all(kind).await?;

        let mut branches: JoinSet<(&'static str, Result<usize, SyncError>)> = JoinSet::new();
        for erased in self.registry.all() {
            let agent = Arc::clone(self);
            branches.spawn(async move {
                let type_name = erased.type_name();
                (type_name, erased.save_all_on(agent, None, force).await)
            });
        }

        let mut pushed = 0;
        let mut errors = Vec::new();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((type_name, Ok(count))) => {
                    tracing::debug!("save-all pushed {count} {type_name} object(s)");
                    pushed += count;
                }
                Ok((type_name, Err(e))) => {
                    tracing::warn!("save-all for {type_name} failed: {e}");
                    errors.push(e);
                }
                Err(e) => errors.push(SyncError::Transport(format!(
                    "save-all branch panicked: {e}"
                ))),
            }
        }

        if errors.is_empty() {
            tracing::info!("sync pass done: pulled={pulled} pushed={pushed}");
            Ok(SyncReport { pulled, pushed })
        } else {
            Err(SyncError::MultipleErrors(errors))
        }
    }

    /// Consume the transport's live stream until shutdown. Each envelope
    /// goes through the same per-type dispatch as a pull of size one;
    /// failures are logged and the stream continues.
    pub async fn spawn_live_updates(self: &Arc<Self>) -> Result<JoinHandle<()>, SyncError> {
        self.ensure_authenticated()?;
        let mut updates = self.transport.subscribe().await?;
        let agent = Arc::clone(self);

        Ok(tokio::spawn(async move {
            tracing::info!("live update loop started");
            loop {
                if agent.is_shutdown() {
                    break;
                }
                tokio::select! {
                    maybe = updates.recv() => match maybe {
                        Some(envelope) => agent.apply_live_update(envelope).await,
                        None => break,
                    },
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
            tracing::info!("live update loop stopped");
        }))
    }

    async fn apply_live_update(&self, envelope: Envelope) {
        let type_name = envelope.type_name.clone();
        match self.registry.lookup(&type_name) {
            Some(erased) => {
                self.advance_watermark(std::slice::from_ref(&envelope));
                if let Err(e) = erased.dispatch_envelopes(vec![envelope], false).await {
                    tracing::warn!("live update for {type_name} failed: {e}");
                }
            }
            None => tracing::warn!("live update for unknown type {type_name}, skipping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ConflictPolicy, MemoryDelegate};
    use crate::transport::MemoryTransport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Uuid,
        title: String,
        updated_at: Timestamp,
    }

    impl SyncRecord for Note {
        const TYPE_NAME: &'static str = "note";

        fn record_id(&self) -> Uuid {
            self.id
        }

        fn updated_at(&self) -> Timestamp {
            self.updated_at
        }
    }

    fn agent() -> (Arc<SyncAgent>, Arc<MemoryTransport>, Arc<MemoryDelegate<Note>>) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(TypeRegistry::new());
        let delegate = Arc::new(MemoryDelegate::<Note>::new(ConflictPolicy::Replace));
        registry.register::<Note, _>(Arc::clone(&delegate));

        let agent = SyncAgent::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry,
            Arc::new(AuthState::new(true)),
            SyncConfig::default(),
        )
        .unwrap();
        (Arc::new(agent), transport, delegate)
    }

    fn note(title: &str, micros: u64) -> Note {
        Note {
            id: Uuid::new_v4(),
            title: title.to_string(),
            updated_at: Timestamp::from_micros(micros),
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let transport = Arc::new(MemoryTransport::new());
        let result = SyncAgent::new(
            transport,
            Arc::new(TypeRegistry::new()),
            Arc::new(AuthState::new(true)),
            SyncConfig::new().with_max_chunk(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_watermark_seeded_from_config_and_monotonic() {
        let transport = Arc::new(MemoryTransport::new());
        let agent = SyncAgent::new(
            transport,
            Arc::new(TypeRegistry::new()),
            Arc::new(AuthState::new(true)),
            SyncConfig::new().with_last_received_at(Some(Timestamp::from_micros(500))),
        )
        .unwrap();

        assert_eq!(agent.last_received_at(), Some(Timestamp::from_micros(500)));

        let newer = Envelope {
            id: Uuid::new_v4(),
            type_name: "note".to_string(),
            payload: vec![],
            checksum: String::new(),
            previous_checksum: None,
            updated_at: Timestamp::from_micros(900),
        };
        let older = Envelope {
            updated_at: Timestamp::from_micros(100),
            ..newer.clone()
        };

        agent.advance_watermark(&[older.clone()]);
        assert_eq!(agent.last_received_at(), Some(Timestamp::from_micros(500)));

        agent.advance_watermark(&[older, newer]);
        assert_eq!(agent.last_received_at(), Some(Timestamp::from_micros(900)));
    }

    #[tokio::test]
    async fn test_operations_require_auth() {
        let (agent, _, delegate) = agent();
        agent.auth.set_authenticated(false);

        let err = agent.delete_all(None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));

        let err = agent
            .delete(delegate.as_ref(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));

        let err = agent.fetch_object::<Note>(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_delete_unknown_remote_counts_as_success() {
        let (agent, _, delegate) = agent();
        let n = note("ghost", 100);
        delegate
            .persist_checksums(&[(n.record_id(), "aaaa".to_string())])
            .await
            .unwrap();

        agent.delete(delegate.as_ref(), n.record_id()).await.unwrap();
        assert!(delegate.checksum(&n.record_id()).is_none());
    }

    #[tokio::test]
    async fn test_sync_all_excludes_concurrent_pass() {
        let (agent, _, _) = agent();
        agent.full_sync_running.store(true, Ordering::SeqCst);

        let err = agent.sync_all(PullKind::Delta, false).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncAlreadyRunning));
    }

    #[tokio::test]
    async fn test_shutdown_flag() {
        let (agent, _, _) = agent();
        assert!(!agent.is_shutdown());
        agent.shutdown();
        assert!(agent.is_shutdown());
    }
}
