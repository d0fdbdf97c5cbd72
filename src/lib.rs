//! objsync Library
//!
//! A generic object synchronization engine: keeps heterogeneous local
//! records consistent with a remote object store across devices and
//! concurrent edits, using server-assigned checksums as
//! optimistic-concurrency tokens.

pub mod agent;
pub mod config;
pub mod delegate;
pub mod envelope;
pub mod error;
pub mod inflight;
pub mod pull;
pub mod registry;
pub mod transport;

mod conflict;
mod push;

// Re-export commonly used types
pub use agent::{SyncAgent, SyncReport};
pub use config::{AuthState, ConfigError, SyncConfig};
pub use delegate::{ConflictPolicy, DomainDelegate, MemoryDelegate, SyncRecord};
pub use envelope::{payload_checksum, Envelope, Timestamp};
pub use error::{ConflictDescriptor, ObjectError, ObjectErrorKind, SaveError, SyncError};
pub use pull::PullKind;
pub use registry::TypeRegistry;
pub use transport::{MemoryTransport, Transport};
