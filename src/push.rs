//! Push Pipeline
//!
//! Encode, attach the stored previous checksum, send, persist the returned
//! checksum. Three entry points: one object, a batch, and a debounced
//! variant for non-urgent saves. Checksum conflicts are handed to the
//! conflict module and the survivors resubmitted, bounded by the configured
//! depth.

use crate::agent::SyncAgent;
use crate::delegate::{ConflictPolicy, DomainDelegate, SyncRecord};
use crate::envelope::Envelope;
use crate::error::{ConflictDescriptor, SaveError, SyncError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

impl SyncAgent {
    /// Push one object now.
    ///
    /// Registers the push in the in-flight table first: any previous push
    /// for the same id completes with `Cancelled`, and this one will if a
    /// newer push supersedes it. Unchanged objects are skipped unless
    /// `force` is set.
    pub async fn save_object<T, D>(
        &self,
        delegate: &D,
        object: T,
        force: bool,
    ) -> Result<T, SaveError<T>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        self.ensure_authenticated()?;
        let id = object.record_id();
        let (guard, mut cancelled) = self.inflight.register(id, T::TYPE_NAME);

        let result = tokio::select! {
            _ = &mut cancelled => Err(SaveError::Sync(SyncError::Cancelled)),
            result = self.save_object_pipeline(delegate, object, force) => result,
        };

        drop(guard);
        result
    }

    /// Push one object after the debounce window.
    ///
    /// The sleeper holds the in-flight registration for the whole window, so
    /// a newer `save_later` or `save_object` for the same id supersedes it
    /// before anything hits the wire. The receiver resolves with the final
    /// outcome.
    pub fn save_later<T, D>(
        self: &Arc<Self>,
        delegate: Arc<D>,
        object: T,
    ) -> oneshot::Receiver<Result<T, SaveError<T>>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + 'static,
    {
        let (done, outcome) = oneshot::channel();
        let id = object.record_id();
        let (guard, mut cancelled) = self.inflight.register(id, T::TYPE_NAME);
        let agent = Arc::clone(self);

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = &mut cancelled => Err(SaveError::Sync(SyncError::Cancelled)),
                result = async {
                    tokio::time::sleep(agent.config.debounce).await;
                    agent.ensure_authenticated()?;
                    agent.save_object_pipeline(delegate.as_ref(), object, false).await
                } => result,
            };
            drop(guard);
            let _ = done.send(result);
        });

        outcome
    }

    /// Push a batch, chunked to the configured maximum.
    ///
    /// Every input object is accounted for in the outcome: the success set,
    /// the conflict descriptor, or the error carry each id exactly once.
    pub async fn save_objects<T, D>(
        &self,
        delegate: &D,
        objects: Vec<T>,
        force: bool,
    ) -> Result<Vec<T>, SaveError<T>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        self.ensure_authenticated()?;
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let mut saved = Vec::with_capacity(objects.len());
        for chunk in objects.chunks(self.config.max_chunk) {
            saved.extend(
                self.save_objects_chunk(delegate, chunk.to_vec(), force, 0)
                    .await?,
            );
        }
        Ok(saved)
    }

    /// Encode, attach, send, persist: the shared single-object pipeline.
    /// Callers own the in-flight registration.
    pub(crate) async fn save_object_pipeline<T, D>(
        &self,
        delegate: &D,
        object: T,
        force: bool,
    ) -> Result<T, SaveError<T>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        let id = object.record_id();
        let mut current = object;
        let mut force = force;
        let mut depth = 0u32;

        loop {
            let mut envelope = Envelope::encode(&current)?;
            let stored = delegate.checksums_for_ids(&[id]).await?.remove(&id);

            if !force && stored.as_deref() == Some(envelope.checksum.as_str()) {
                tracing::debug!("{} {id} unchanged since last push, skipping", T::TYPE_NAME);
                return Ok(current);
            }
            envelope.previous_checksum = stored;

            match self.transport.save(envelope).await {
                Ok(saved) => {
                    delegate.persist_checksums(&[(id, saved.checksum)]).await?;
                    return Ok(current);
                }
                Err(e) if e.is_checksum_conflict() => {
                    depth += 1;
                    if depth > self.config.max_resubmit_depth {
                        return Err(SyncError::ResubmitDepthExceeded.into());
                    }
                    tracing::debug!(
                        "checksum conflict on {} {id}, resolving (round {depth})",
                        T::TYPE_NAME
                    );
                    current = self.resolve_conflict(delegate, current).await?;
                    // The resubmission must reach the wire even if the merge
                    // adopted the remote content wholesale.
                    force = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn save_objects_chunk<'a, T, D>(
        &'a self,
        delegate: &'a D,
        objects: Vec<T>,
        force: bool,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<T>, SaveError<T>>> + Send + 'a>>
    where
        T: SyncRecord,
        D: DomainDelegate<T> + ?Sized,
    {
        Box::pin(async move {
            if depth > self.config.max_resubmit_depth {
                return Err(SyncError::ResubmitDepthExceeded.into());
            }

            let ids: Vec<Uuid> = objects.iter().map(|o| o.record_id()).collect();
            let by_id: HashMap<Uuid, T> = objects
                .iter()
                .map(|o| (o.record_id(), o.clone()))
                .collect();
            let stored = delegate.checksums_for_ids(&ids).await?;

            let mut envelopes = Vec::with_capacity(objects.len());
            let mut skipped = Vec::new();
            for object in &objects {
                let mut envelope = Envelope::encode(object)?;
                let previous = stored.get(&object.record_id()).cloned();
                if !force && previous.as_deref() == Some(envelope.checksum.as_str()) {
                    skipped.push(object.clone());
                    continue;
                }
                envelope.previous_checksum = previous;
                envelopes.push(envelope);
            }

            if envelopes.is_empty() {
                tracing::debug!(
                    "all {} {} object(s) unchanged, nothing to push",
                    objects.len(),
                    T::TYPE_NAME
                );
                return Ok(skipped);
            }

            match self.transport.save_all(envelopes).await {
                Ok(saved) => {
                    let checksums: Vec<(Uuid, String)> =
                        saved.iter().map(|e| (e.id, e.checksum.clone())).collect();
                    delegate.persist_checksums(&checksums).await?;

                    let mut result: Vec<T> = saved
                        .iter()
                        .filter_map(|e| by_id.get(&e.id).cloned())
                        .collect();
                    result.extend(skipped);
                    Ok(result)
                }
                Err(SyncError::ApiErrors { errors, saved }) => {
                    // A non-checksum failure means something is wrong beyond
                    // concurrency; abort with the original errors intact.
                    if errors.iter().any(|e| !e.is_checksum()) {
                        return Err(SyncError::ApiErrors { errors, saved }.into());
                    }

                    // Whatever did land carries a new checksum to keep.
                    let checksums: Vec<(Uuid, String)> =
                        saved.iter().map(|e| (e.id, e.checksum.clone())).collect();
                    delegate.persist_checksums(&checksums).await?;

                    let mut good: Vec<T> = saved
                        .iter()
                        .filter_map(|e| by_id.get(&e.id).cloned())
                        .collect();
                    good.extend(skipped);

                    let conflicted_ids: Vec<Uuid> = errors.iter().map(|e| e.id).collect();
                    let conflicted: Vec<T> = conflicted_ids
                        .iter()
                        .filter_map(|id| by_id.get(id).cloned())
                        .collect();

                    tracing::debug!(
                        "batch push: {} {} conflict(s), {} good",
                        conflicted.len(),
                        T::TYPE_NAME,
                        good.len()
                    );

                    match delegate.conflict_policy() {
                        ConflictPolicy::FetchRemoteAndError => {
                            let remote_objects =
                                self.transport.fetch_many(&conflicted_ids).await?;
                            Err(SaveError::Conflict(ConflictDescriptor {
                                conflicted_objects: conflicted,
                                good_objects: good,
                                remote_objects,
                            }))
                        }
                        ConflictPolicy::Replace => {
                            let merged =
                                self.resolve_many_conflicts(delegate, conflicted).await?;
                            let resubmitted = self
                                .save_objects_chunk(delegate, merged, true, depth + 1)
                                .await?;
                            good.extend(resubmitted);
                            Ok(good)
                        }
                    }
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}
