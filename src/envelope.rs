//! Envelope Model
//!
//! The opaque, type-tagged, checksummed unit everything on the wire travels
//! in. Envelopes are built fresh for every network call and never persisted;
//! the durable pieces are the domain record and its checksum record, both
//! owned by the domain delegate.

use crate::delegate::SyncRecord;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Wall-clock timestamp, microseconds since the Unix epoch.
///
/// Totally ordered; the pull watermark and last-write-wins merges compare
/// these directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self(micros)
    }

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Content hash of a payload, hex-encoded CRC32.
///
/// The server-assigned checksum on a stored envelope is authoritative; the
/// client computes the same hash locally only to skip pushes of unchanged
/// records.
pub fn payload_checksum(payload: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(payload))
}

/// Wire representation of any domain record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable identity of the record across devices.
    pub id: Uuid,
    /// Type tag selecting the registered delegate on the receiving side.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Serialized domain record, opaque to the engine.
    #[serde(rename = "data")]
    pub payload: Vec<u8>,
    /// Server-assigned checksum of the payload.
    pub checksum: String,
    /// Optimistic-concurrency token: the checksum the sender last saw for
    /// this id. `None` means "create".
    #[serde(rename = "previousChecksum")]
    pub previous_checksum: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Timestamp,
}

impl Envelope {
    /// Build an outgoing envelope from a domain record.
    ///
    /// The checksum is computed over the serialized payload; the
    /// previous-checksum token is attached later by the push pipeline.
    pub fn encode<T: SyncRecord>(record: &T) -> Result<Envelope, SyncError> {
        let payload = serde_json::to_vec(record).map_err(|e| SyncError::Encoding {
            type_name: T::TYPE_NAME.to_string(),
            id: record.record_id(),
            reason: e.to_string(),
        })?;
        let checksum = payload_checksum(&payload);

        Ok(Envelope {
            id: record.record_id(),
            type_name: T::TYPE_NAME.to_string(),
            payload,
            checksum,
            previous_checksum: None,
            updated_at: record.updated_at(),
        })
    }

    /// Decode the payload back into a typed record.
    ///
    /// Fails with `InvalidObjectType` when the envelope carries a different
    /// type tag than `T` — a dispatch integrity fault, never auto-retried.
    pub fn decode<T: SyncRecord>(&self) -> Result<T, SyncError> {
        if self.type_name != T::TYPE_NAME {
            return Err(SyncError::InvalidObjectType {
                id: self.id,
                expected: T::TYPE_NAME.to_string(),
                actual: self.type_name.clone(),
            });
        }

        serde_json::from_slice(&self.payload).map_err(|e| SyncError::Decoding {
            type_name: self.type_name.clone(),
            id: self.id,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn sample_note() -> Note {
        Note {
            id: Uuid::new_v4(),
            title: "hello".to_string(),
            updated_at: Timestamp::from_micros(1_000_000),
        }
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::from_micros(100);
        let b = Timestamp::from_micros(200);
        assert!(a < b);
        assert_eq!(a, Timestamp::from_micros(100));
    }

    #[test]
    fn test_timestamp_now_is_nonzero() {
        assert!(Timestamp::now().as_micros() > 0);
    }

    #[test]
    fn test_payload_checksum_is_hex() {
        let checksum = payload_checksum(b"hello world");
        assert_eq!(checksum.len(), 8);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_payload_checksum_deterministic() {
        assert_eq!(payload_checksum(b"abc"), payload_checksum(b"abc"));
        assert_ne!(payload_checksum(b"abc"), payload_checksum(b"abd"));
    }

    #[test]
    fn test_encode_sets_checksum_and_type() {
        let note = sample_note();
        let envelope = Envelope::encode(&note).unwrap();

        assert_eq!(envelope.id, note.id);
        assert_eq!(envelope.type_name, "note");
        assert_eq!(envelope.checksum, payload_checksum(&envelope.payload));
        assert_eq!(envelope.previous_checksum, None);
        assert_eq!(envelope.updated_at, note.updated_at);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let note = sample_note();
        let envelope = Envelope::encode(&note).unwrap();
        let decoded: Note = envelope.decode().unwrap();
        assert_eq!(decoded, note);
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let note = sample_note();
        let mut envelope = Envelope::encode(&note).unwrap();
        envelope.type_name = "password".to_string();

        let err = envelope.decode::<Note>().unwrap_err();
        assert!(matches!(err, SyncError::InvalidObjectType { .. }));
    }

    #[test]
    fn test_decode_reports_garbage_payload() {
        let note = sample_note();
        let mut envelope = Envelope::encode(&note).unwrap();
        envelope.payload = b"not json".to_vec();

        let err = envelope.decode::<Note>().unwrap_err();
        assert!(matches!(err, SyncError::Decoding { .. }));
    }

    #[test]
    fn test_wire_field_names() {
        let note = sample_note();
        let envelope = Envelope::encode(&note).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json.get("type").is_some());
        assert!(json.get("data").is_some());
        assert!(json.get("previousChecksum").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("type_name").is_none());
    }
}
