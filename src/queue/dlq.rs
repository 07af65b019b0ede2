// ============================================================================
// Dead Letter Queue Types
// ============================================================================
//
// Terminal holding queue for jobs that exhausted their retry budget,
// failed permanently, or arrived with an unparseable payload. Entries
// keep the original payload so they can be inspected or replayed by an
// operator; nothing in the pipeline consumes them automatically.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DispatchJob;

/// A job that was routed to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Original payload, kept verbatim even when it failed to deserialize
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    /// Processing attempts consumed before dead-lettering
    pub attempt: u32,
    /// Last failure description (sanitized)
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(payload: Vec<u8>, attempt: u32, reason: &str) -> Self {
        Self {
            payload,
            attempt,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Decode the original job, when the payload was valid in the first
    /// place. Corrupt payloads return None.
    pub fn job(&self) -> Option<DispatchJob> {
        DispatchJob::decode(&self.payload).ok()
    }
}

/// Compact byte-array encoding for MessagePack; serde's default Vec<u8>
/// handling writes one element per byte.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("byte array")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(byte) = seq.next_element()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(BytesVisitor)
    }
}
