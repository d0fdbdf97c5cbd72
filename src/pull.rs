//! Pull Pipeline
//!
//! Fetch remote envelopes — everything, or only what moved past the
//! watermark — group them by type tag, and dispatch each group through its
//! registered delegate. Deletion inference from absence only happens when a
//! caller explicitly asks for it.

use crate::agent::SyncAgent;
use crate::envelope::Envelope;
use crate::error::SyncError;
use std::collections::HashMap;

/// Which flavor of pull to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    /// Only objects updated after the watermark.
    Delta,
    /// Everything, applied additively; nothing is ever deleted.
    Full,
    /// Everything, and locally-known objects the remote no longer has are
    /// handed to the delegates' deletion hooks.
    FullWithDeletions,
}

impl SyncAgent {
    /// Run one pull pass. Returns how many remote objects were applied.
    ///
    /// A delta pull that finds nothing is a successful no-op and leaves the
    /// watermark untouched. Groups with no registered delegate are logged
    /// and skipped; per-group failures are aggregated and reported after
    /// every group has been given its chance.
    pub async fn pull_all(&self, kind: PullKind) -> Result<usize, SyncError> {
        self.ensure_authenticated()?;

        let after = match kind {
            PullKind::Delta => self.last_received_at(),
            PullKind::Full | PullKind::FullWithDeletions => None,
        };

        let envelopes = self.transport.fetch_all(after).await?;
        let infer_deletions = kind == PullKind::FullWithDeletions;

        if envelopes.is_empty() && !infer_deletions {
            tracing::debug!("pull: nothing new past watermark");
            return Ok(0);
        }

        // The watermark moves as soon as the fetch lands; a dispatch failure
        // below must not make the next delta re-download everything.
        self.advance_watermark(&envelopes);

        let mut groups: HashMap<String, Vec<Envelope>> = HashMap::new();
        for envelope in envelopes {
            groups
                .entry(envelope.type_name.clone())
                .or_default()
                .push(envelope);
        }

        // Deletion inference must also reach types the remote returned
        // nothing for.
        if infer_deletions {
            for type_name in self.registry.registered_types() {
                groups.entry(type_name.to_string()).or_default();
            }
        }

        let mut applied = 0;
        let mut errors = Vec::new();
        for (type_name, group) in groups {
            let Some(erased) = self.registry.lookup(&type_name) else {
                tracing::warn!(
                    "pulled {} object(s) of unknown type {type_name}, skipping",
                    group.len()
                );
                continue;
            };

            match erased.dispatch_envelopes(group, infer_deletions).await {
                Ok(count) => applied += count,
                Err(e) => {
                    tracing::warn!("pull dispatch for {type_name} failed: {e}");
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            tracing::debug!("pull applied {applied} object(s)");
            Ok(applied)
        } else {
            Err(SyncError::MultipleErrors(errors))
        }
    }
}
