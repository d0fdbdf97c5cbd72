//! Conflict Resolution
//!
//! A rejected push means the remote moved on: fetch the winning envelope,
//! adopt its checksum, merge through the delegate, and hand the merged
//! record back for resubmission. Under the fetch-remote-and-error policy
//! nothing is merged; the caller gets a descriptor with everything needed to
//! decide. The steps are a linear `Result` chain; the caller owns the
//! resubmission loop and its depth bound.

use crate::agent::SyncAgent;
use crate::delegate::{ConflictPolicy, DomainDelegate, SyncRecord};
use crate::envelope::Envelope;
use crate::error::{ConflictDescriptor, SaveError, SyncError};
use std::collections::HashMap;
use uuid::Uuid;

impl SyncAgent {
    /// Resolve one rejected object, returning the record to resubmit.
    ///
    /// A remote that no longer has the object clears the checksum record so
    /// the resubmission is a create. Otherwise the remote checksum is
    /// persisted before merging, so the resubmission carries it as its
    /// previous-checksum token.
    pub(crate) async fn resolve_conflict<T, D>(
        &self,
        delegate: &D,
        local: T,
    ) -> Result<T, SaveError<T>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        let id = local.record_id();

        let remote_envelope = match self.fetch_envelope(id).await {
            Ok(envelope) => envelope,
            Err(SyncError::NotFound) => {
                tracing::debug!("{} {id} gone remotely, resending as create", T::TYPE_NAME);
                delegate.clear_checksums(&[id]).await?;
                return match delegate.conflict_policy() {
                    ConflictPolicy::Replace => Ok(local),
                    ConflictPolicy::FetchRemoteAndError => {
                        Err(SaveError::Conflict(ConflictDescriptor {
                            conflicted_objects: vec![local],
                            good_objects: Vec::new(),
                            remote_objects: Vec::new(),
                        }))
                    }
                };
            }
            Err(e) => return Err(e.into()),
        };

        match delegate.conflict_policy() {
            ConflictPolicy::FetchRemoteAndError => {
                Err(SaveError::Conflict(ConflictDescriptor {
                    conflicted_objects: vec![local],
                    good_objects: Vec::new(),
                    remote_objects: vec![remote_envelope],
                }))
            }
            ConflictPolicy::Replace => {
                let remote: T = remote_envelope.decode()?;
                delegate
                    .persist_checksums(&[(id, remote_envelope.checksum.clone())])
                    .await?;

                let merged = delegate.manage_conflict(local, remote);
                delegate
                    .save_objects_after_conflict(vec![merged.clone()])
                    .await?;
                Ok(merged)
            }
        }
    }

    /// Resolve a batch of rejected objects under the replace policy.
    ///
    /// Remote copies are fetched in one round; ids the remote no longer has
    /// get their checksum records cleared and are kept as-is for the create
    /// resubmission. All merged records are persisted locally before the
    /// caller resubmits them.
    pub(crate) async fn resolve_many_conflicts<T, D>(
        &self,
        delegate: &D,
        locals: Vec<T>,
    ) -> Result<Vec<T>, SyncError>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        let ids: Vec<Uuid> = locals.iter().map(|o| o.record_id()).collect();
        let mut remote_by_id: HashMap<Uuid, Envelope> = self
            .transport
            .fetch_many(&ids)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        let mut merged = Vec::with_capacity(locals.len());
        let mut adopted = Vec::new();
        let mut cleared = Vec::new();

        for local in locals {
            let id = local.record_id();
            match remote_by_id.remove(&id) {
                Some(remote_envelope) => {
                    let remote: T = remote_envelope.decode()?;
                    adopted.push((id, remote_envelope.checksum));
                    merged.push(delegate.manage_conflict(local, remote));
                }
                None => {
                    cleared.push(id);
                    merged.push(local);
                }
            }
        }

        if !adopted.is_empty() {
            delegate.persist_checksums(&adopted).await?;
        }
        if !cleared.is_empty() {
            delegate.clear_checksums(&cleared).await?;
        }
        delegate.save_objects_after_conflict(merged.clone()).await?;

        tracing::debug!(
            "resolved {} {} conflict(s) ({} create resend(s))",
            merged.len(),
            T::TYPE_NAME,
            cleared.len()
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthState, SyncConfig};
    use crate::delegate::MemoryDelegate;
    use crate::envelope::Timestamp;
    use crate::registry::TypeRegistry;
    use crate::transport::{MemoryTransport, Transport};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

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

    fn note(title: &str, micros: u64) -> Note {
        Note {
            id: Uuid::new_v4(),
            title: title.to_string(),
            updated_at: Timestamp::from_micros(micros),
        }
    }

    fn harness(
        policy: ConflictPolicy,
    ) -> (Arc<SyncAgent>, Arc<MemoryTransport>, Arc<MemoryDelegate<Note>>) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(TypeRegistry::new());
        let delegate = Arc::new(MemoryDelegate::<Note>::new(policy));
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

    fn seed_remote(transport: &MemoryTransport, note: &Note) -> String {
        transport.seed(Envelope::encode(note).unwrap())
    }

    #[tokio::test]
    async fn test_resolve_adopts_remote_checksum_and_newer_content() {
        let (agent, transport, delegate) = harness(ConflictPolicy::Replace);

        let local = note("local", 100);
        let remote_note = Note {
            title: "remote".to_string(),
            updated_at: Timestamp::from_micros(200),
            ..local.clone()
        };
        let remote_checksum = seed_remote(&transport, &remote_note);

        let merged = agent
            .resolve_conflict(delegate.as_ref(), local.clone())
            .await
            .unwrap();

        // Remote is newer: its content wins, its checksum is adopted, and
        // the merged record is already persisted locally.
        assert_eq!(merged, remote_note);
        assert_eq!(
            delegate.checksum(&local.record_id()),
            Some(remote_checksum)
        );
        assert_eq!(delegate.get(&local.record_id()), Some(remote_note));
    }

    #[tokio::test]
    async fn test_resolve_missing_remote_becomes_create() {
        let (agent, _, delegate) = harness(ConflictPolicy::Replace);
        let local = note("local", 100);
        delegate
            .persist_checksums(&[(local.record_id(), "stale000".to_string())])
            .await
            .unwrap();

        let merged = agent
            .resolve_conflict(delegate.as_ref(), local.clone())
            .await
            .unwrap();

        assert_eq!(merged, local);
        assert!(delegate.checksum(&local.record_id()).is_none());
    }

    #[tokio::test]
    async fn test_resolve_fetch_remote_and_error_never_merges() {
        let (agent, transport, delegate) = harness(ConflictPolicy::FetchRemoteAndError);

        let local = note("local", 100);
        let remote_note = Note {
            title: "remote".to_string(),
            updated_at: Timestamp::from_micros(200),
            ..local.clone()
        };
        seed_remote(&transport, &remote_note);

        let err = agent
            .resolve_conflict(delegate.as_ref(), local.clone())
            .await
            .unwrap_err();

        match err {
            SaveError::Conflict(descriptor) => {
                assert_eq!(descriptor.conflicted_objects, vec![local.clone()]);
                assert_eq!(descriptor.remote_objects.len(), 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Local store untouched.
        assert!(delegate.get(&local.record_id()).is_none());
    }

    #[tokio::test]
    async fn test_resolve_many_mixes_merges_and_creates() {
        let (agent, transport, delegate) = harness(ConflictPolicy::Replace);

        let present = note("present-local", 300);
        let gone = note("gone-local", 100);
        let remote_note = Note {
            title: "present-remote".to_string(),
            updated_at: Timestamp::from_micros(200),
            ..present.clone()
        };
        let remote_checksum = seed_remote(&transport, &remote_note);
        delegate
            .persist_checksums(&[(gone.record_id(), "stale000".to_string())])
            .await
            .unwrap();

        let merged = agent
            .resolve_many_conflicts(delegate.as_ref(), vec![present.clone(), gone.clone()])
            .await
            .unwrap();

        assert_eq!(merged.len(), 2);
        // Local copy of `present` is newer, so it survives the merge; the
        // remote checksum is still adopted for the resubmission token.
        assert!(merged.contains(&present));
        assert!(merged.contains(&gone));
        assert_eq!(
            delegate.checksum(&present.record_id()),
            Some(remote_checksum)
        );
        assert!(delegate.checksum(&gone.record_id()).is_none());
    }
}
