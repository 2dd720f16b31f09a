//! Snapshot Codec
//!
//! Snapshots are stored as a JSON envelope carrying a schema version and a
//! SHA-256 checksum of the canonical snapshot encoding. Any mismatch is
//! reported as [`StateError::Corrupt`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::StateSnapshot;
use crate::error::StateError;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    schema_version: u32,
    checksum: String,
    snapshot: &'a Value,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    schema_version: u32,
    #[serde(default)]
    checksum: Option<String>,
    snapshot: Value,
}

/// `serde_json::Value` keeps object keys sorted, so re-encoding a parsed
/// value yields the same bytes that were hashed on write.
fn canonical_checksum(value: &Value) -> Result<String, StateError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn serialize(snapshot: &StateSnapshot) -> Result<Vec<u8>, StateError> {
    let value = serde_json::to_value(snapshot)?;
    let envelope = EnvelopeOut {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        checksum: canonical_checksum(&value)?,
        snapshot: &value,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

pub fn deserialize(bytes: &[u8]) -> Result<StateSnapshot, StateError> {
    let envelope: EnvelopeIn = serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        reason: format!("unreadable envelope: {}", e),
    })?;

    if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(StateError::Corrupt {
            reason: format!(
                "schema version {} does not match supported version {}",
                envelope.schema_version, SNAPSHOT_SCHEMA_VERSION
            ),
        });
    }

    if let Some(expected) = &envelope.checksum {
        let actual = canonical_checksum(&envelope.snapshot)?;
        if &actual != expected {
            return Err(StateError::Corrupt {
                reason: format!("checksum mismatch: expected {}, computed {}", expected, actual),
            });
        }
    }

    serde_json::from_value(envelope.snapshot).map_err(|e| StateError::Corrupt {
        reason: format!("snapshot does not match schema: {}", e),
    })
}
