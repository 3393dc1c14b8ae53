//! Versioned envelope for persisted records.
//!
//! Every record written through the KV store (triggers, secrets, named
//! keys) is prefixed with a single schema-version byte so the layout can
//! migrate without guessing at old bytes.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Current schema version for all persisted records.
pub const RECORD_VERSION: u8 = 1;

/// Serialize `value` as JSON behind the version byte.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| Error::Unknown(format!("record encode: {}", e)))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(RECORD_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a record previously produced by [`encode`].
///
/// Unknown versions and malformed bodies are [`Error::Corruption`]; bulk
/// loaders log and skip such records instead of failing the whole load.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (&version, body) = bytes
        .split_first()
        .ok_or_else(|| Error::Corruption("empty record".to_string()))?;
    if version != RECORD_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported record version {}",
            version
        )));
    }
    serde_json::from_slice(body).map_err(|e| Error::Corruption(format!("record decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    #[test]
    fn test_round_trip() {
        let sample = Sample { name: "t1".to_string(), count: 3 };
        let bytes = encode(&sample).unwrap();
        assert_eq!(bytes[0], RECORD_VERSION);
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_unknown_version_is_corruption() {
        let sample = Sample { name: "t1".to_string(), count: 3 };
        let mut bytes = encode(&sample).unwrap();
        bytes[0] = 9;
        let err = decode::<Sample>(&bytes).unwrap_err();
        assert_eq!(err.kind(), "Corruption");
    }

    #[test]
    fn test_empty_record_is_corruption() {
        let err = decode::<Sample>(&[]).unwrap_err();
        assert_eq!(err.kind(), "Corruption");
    }
}
