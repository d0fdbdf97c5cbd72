//! Error Taxonomy
//!
//! All failures the engine can surface. `SyncError` is the type-erased
//! taxonomy used throughout; `SaveError<T>` wraps it for push entry points so
//! a checksum conflict under the fetch-remote-and-error policy can carry the
//! typed objects involved.

use crate::envelope::Envelope;
use uuid::Uuid;

/// One failed object inside a batch save.
#[derive(Debug, Clone)]
pub struct ObjectError {
    pub id: Uuid,
    pub kind: ObjectErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectErrorKind {
    /// The previous-checksum token did not match the stored checksum.
    InvalidChecksum,
    /// Anything else the remote reported for this object.
    Other(String),
}

impl ObjectError {
    pub fn is_checksum(&self) -> bool {
        self.kind == ObjectErrorKind::InvalidChecksum
    }
}

/// Everything that can go wrong while syncing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not authenticated")]
    NotAuthenticated,

    /// Optimistic-concurrency rejection for a single object.
    #[error("invalid previous checksum for object {id}")]
    InvalidChecksum { id: Uuid },

    /// Per-object failures from a batch save. `saved` holds the envelopes the
    /// remote did accept, so their new checksums are never lost.
    #[error("batch save failed for {} object(s)", .errors.len())]
    ApiErrors {
        errors: Vec<ObjectError>,
        saved: Vec<Envelope>,
    },

    #[error("{} error(s) during sync", .0.len())]
    MultipleErrors(Vec<SyncError>),

    #[error("object not found")]
    NotFound,

    #[error("cannot decode {type_name} payload for {id}: {reason}")]
    Decoding {
        type_name: String,
        id: Uuid,
        reason: String,
    },

    #[error("cannot encode {type_name} object {id}: {reason}")]
    Encoding {
        type_name: String,
        id: Uuid,
        reason: String,
    },

    /// An envelope carried a different type tag than the dispatch target.
    #[error("object {id} has type {actual}, expected {expected}")]
    InvalidObjectType {
        id: Uuid,
        expected: String,
        actual: String,
    },

    /// This push was superseded by a newer push for the same id, or cancelled
    /// by a delete. Delivered exactly once per in-flight registration.
    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("a full sync is already running")]
    SyncAlreadyRunning,

    /// Conflict resubmission hit the nesting bound without converging.
    #[error("conflict resubmission nested too deep")]
    ResubmitDepthExceeded,

    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// True for the conflict-class errors that the replace policy may
    /// auto-resolve. Everything else always surfaces untouched.
    pub fn is_checksum_conflict(&self) -> bool {
        matches!(self, SyncError::InvalidChecksum { .. })
    }
}

/// What a push hands back when the conflict policy refuses to auto-merge.
///
/// `good_objects` already carry their new server checksums persisted;
/// `remote_objects` are the winning envelopes fetched for inspection.
#[derive(Debug, Clone)]
pub struct ConflictDescriptor<T> {
    pub conflicted_objects: Vec<T>,
    pub good_objects: Vec<T>,
    pub remote_objects: Vec<Envelope>,
}

/// Result error of the typed push entry points.
#[derive(Debug, thiserror::Error)]
pub enum SaveError<T: std::fmt::Debug> {
    #[error("checksum conflict on {} object(s)", .0.conflicted_objects.len())]
    Conflict(ConflictDescriptor<T>),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl<T: std::fmt::Debug> SaveError<T> {
    /// Collapse into the type-erased taxonomy, trading the typed descriptor
    /// for one `InvalidChecksum` per conflicted object.
    pub fn into_sync_error(self) -> SyncError
    where
        T: crate::delegate::SyncRecord,
    {
        match self {
            SaveError::Sync(e) => e,
            SaveError::Conflict(descriptor) => SyncError::MultipleErrors(
                descriptor
                    .conflicted_objects
                    .iter()
                    .map(|o| SyncError::InvalidChecksum { id: o.record_id() })
                    .collect(),
            ),
        }
    }
}
