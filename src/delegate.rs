//! Domain Delegate Contract
//!
//! The engine syncs records it cannot interpret. Everything domain-specific —
//! loading records, applying remote ones, persisting checksum records,
//! merging conflicts — lives behind [`DomainDelegate`], one implementation
//! per record type. [`MemoryDelegate`] is the in-memory reference
//! implementation, also used heavily by the test suite.

use crate::envelope::Timestamp;
use crate::error::SyncError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// How checksum conflicts are resolved for a record type.
///
/// The policy is static per delegate, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fetch the remote object, merge via the delegate, adopt the remote
    /// checksum, and resubmit.
    Replace,
    /// Never auto-resolve; surface a conflict descriptor to the caller.
    FetchRemoteAndError,
}

/// A record the engine can replicate.
pub trait SyncRecord:
    Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static
{
    /// Type tag selecting the registered delegate. Must be unique across the
    /// registry.
    const TYPE_NAME: &'static str;

    /// Stable identity across devices.
    fn record_id(&self) -> Uuid;

    /// Last local modification time, used by the watermark and the default
    /// last-write-wins merge.
    fn updated_at(&self) -> Timestamp;
}

/// Domain collaborator, one per record type.
///
/// The checksum record (`id -> previous checksum`) is owned and persisted by
/// the delegate, alongside its own records; the engine only ever mutates it
/// through these callbacks.
#[async_trait]
pub trait DomainDelegate<T: SyncRecord>: Send + Sync {
    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::Replace
    }

    /// All local records, or only those modified after `updated_since`.
    async fn all_objects(&self, updated_since: Option<Timestamp>) -> Result<Vec<T>, SyncError>;

    /// Apply a batch of remote records locally. Must be idempotent.
    async fn received_objects(&self, objects: Vec<T>) -> Result<(), SyncError>;

    /// Durably store the new previous checksum for each id.
    async fn persist_checksums(&self, checksums: &[(Uuid, String)]) -> Result<(), SyncError>;

    /// Stored previous checksums for the given ids. Ids never pushed are
    /// simply absent from the result.
    async fn checksums_for_ids(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, String>, SyncError>;

    /// Forget the checksum records for these ids; the next push sends them
    /// as creates.
    async fn clear_checksums(&self, ids: &[Uuid]) -> Result<(), SyncError>;

    /// Merge a rejected local record with the winning remote one.
    ///
    /// Default: last-write-wins on `updated_at`, local wins ties.
    fn manage_conflict(&self, local: T, remote: T) -> T {
        if remote.updated_at() > local.updated_at() {
            remote
        } else {
            local
        }
    }

    /// Persist merged records locally, before the follow-up push lands.
    async fn save_objects_after_conflict(&self, objects: Vec<T>) -> Result<(), SyncError>;

    /// A full pull with deletion inference found these locally-known ids
    /// missing remotely. Default: ignore.
    async fn delete_missing(&self, _ids: Vec<Uuid>) -> Result<(), SyncError> {
        Ok(())
    }
}

/// In-memory [`DomainDelegate`].
///
/// Records, checksum records, and inferred deletions all live in `DashMap`s;
/// good enough as a cache-backed delegate and as the test double.
pub struct MemoryDelegate<T> {
    objects: DashMap<Uuid, T>,
    checksums: DashMap<Uuid, String>,
    deleted: DashMap<Uuid, ()>,
    policy: ConflictPolicy,
}

impl<T: SyncRecord> MemoryDelegate<T> {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            objects: DashMap::new(),
            checksums: DashMap::new(),
            deleted: DashMap::new(),
            policy,
        }
    }

    /// Store a record locally without touching its checksum record.
    pub fn insert(&self, object: T) {
        self.objects.insert(object.record_id(), object);
    }

    pub fn get(&self, id: &Uuid) -> Option<T> {
        self.objects.get(id).map(|o| o.clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<T> {
        self.objects.remove(id).map(|(_, o)| o)
    }

    pub fn checksum(&self, id: &Uuid) -> Option<String> {
        self.checksums.get(id).map(|c| c.clone())
    }

    /// Ids handed to `delete_missing` so far.
    pub fn deleted_ids(&self) -> Vec<Uuid> {
        self.deleted.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl<T: SyncRecord> DomainDelegate<T> for MemoryDelegate<T> {
    fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }

    async fn all_objects(&self, updated_since: Option<Timestamp>) -> Result<Vec<T>, SyncError> {
        Ok(self
            .objects
            .iter()
            .filter(|entry| match updated_since {
                Some(since) => entry.value().updated_at() > since,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn received_objects(&self, objects: Vec<T>) -> Result<(), SyncError> {
        for object in objects {
            let id = object.record_id();
            self.deleted.remove(&id);
            self.objects.insert(id, object);
        }
        Ok(())
    }

    async fn persist_checksums(&self, checksums: &[(Uuid, String)]) -> Result<(), SyncError> {
        for (id, checksum) in checksums {
            self.checksums.insert(*id, checksum.clone());
        }
        Ok(())
    }

    async fn checksums_for_ids(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, String>, SyncError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.checksums.get(id).map(|c| (*id, c.clone())))
            .collect())
    }

    async fn clear_checksums(&self, ids: &[Uuid]) -> Result<(), SyncError> {
        for id in ids {
            self.checksums.remove(id);
        }
        Ok(())
    }

    async fn save_objects_after_conflict(&self, objects: Vec<T>) -> Result<(), SyncError> {
        for object in objects {
            self.objects.insert(object.record_id(), object);
        }
        Ok(())
    }

    async fn delete_missing(&self, ids: Vec<Uuid>) -> Result<(), SyncError> {
        for id in ids {
            self.objects.remove(&id);
            self.deleted.insert(id, ());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

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

    #[test]
    fn test_default_merge_prefers_newer_remote() {
        let delegate = MemoryDelegate::<Note>::new(ConflictPolicy::Replace);
        let local = note("local", 100);
        let remote = Note {
            updated_at: Timestamp::from_micros(200),
            ..local.clone()
        };

        let merged = delegate.manage_conflict(local, remote.clone());
        assert_eq!(merged, remote);
    }

    #[test]
    fn test_default_merge_keeps_local_on_tie_or_newer() {
        let delegate = MemoryDelegate::<Note>::new(ConflictPolicy::Replace);
        let local = note("local", 200);
        let remote = Note {
            title: "remote".to_string(),
            updated_at: Timestamp::from_micros(200),
            ..local.clone()
        };

        let merged = delegate.manage_conflict(local.clone(), remote);
        assert_eq!(merged, local);
    }

    #[tokio::test]
    async fn test_all_objects_filters_by_updated_since() {
        let delegate = MemoryDelegate::<Note>::new(ConflictPolicy::Replace);
        delegate.insert(note("old", 100));
        delegate.insert(note("new", 300));

        let all = delegate.all_objects(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let recent = delegate
            .all_objects(Some(Timestamp::from_micros(200)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title, "new");
    }

    #[tokio::test]
    async fn test_checksum_store_round_trip() {
        let delegate = MemoryDelegate::<Note>::new(ConflictPolicy::Replace);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        delegate
            .persist_checksums(&[(a, "aaaa".to_string()), (b, "bbbb".to_string())])
            .await
            .unwrap();

        let found = delegate.checksums_for_ids(&[a, b, Uuid::new_v4()]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(&a).map(String::as_str), Some("aaaa"));

        delegate.clear_checksums(&[a]).await.unwrap();
        let found = delegate.checksums_for_ids(&[a, b]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.get(&a).is_none());
    }

    #[tokio::test]
    async fn test_received_objects_upserts_and_revives() {
        let delegate = MemoryDelegate::<Note>::new(ConflictPolicy::Replace);
        let n = note("first", 100);
        let id = n.record_id();

        delegate.received_objects(vec![n.clone()]).await.unwrap();
        assert_eq!(delegate.len(), 1);

        delegate.delete_missing(vec![id]).await.unwrap();
        assert!(delegate.is_empty());
        assert_eq!(delegate.deleted_ids(), vec![id]);

        // Re-receiving revives the record.
        delegate.received_objects(vec![n]).await.unwrap();
        assert_eq!(delegate.len(), 1);
        assert!(delegate.deleted_ids().is_empty());
    }
}
