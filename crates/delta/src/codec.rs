//! Wire encoding of a [`DeltaPlan`](crate::DeltaPlan) as the JSON payload
//! shape the remote file service expects: `delta_type` tags the variant,
//! block indices are string keys so the payload survives round-trips through
//! JSON implementations that do not support integer map keys, and all bytes
//! are base64.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DeltaPlan;

/// Errors produced while decoding a [`DeltaPayload`] back into a
/// [`DeltaPlan`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A `content` or block value was not valid base64.
    #[error("invalid base64 in delta payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    /// A block index key could not be parsed as an integer.
    #[error("invalid block index {0:?}")]
    InvalidBlockIndex(String),
    /// The payload's `delta_type` required a field that was absent.
    #[error("delta_type {delta_type:?} requires field {field}")]
    MissingField {
        /// The `delta_type` value that was being decoded.
        delta_type: String,
        /// The field name that was required but missing.
        field: &'static str,
    },
}

/// The over-the-wire representation of a [`DeltaPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPayload {
    /// One of `"none"`, `"full"`, `"delta"`.
    pub delta_type: String,
    /// Whole-file digest of the content this payload represents.
    pub full_hash: String,
    /// Size, in bytes, of the content this payload represents.
    pub size: u64,
    /// Base64 whole-file content; present only when `delta_type == "full"`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    /// Base64 block bodies keyed by stringified index; present only when
    /// `delta_type == "delta"`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blocks: Option<BTreeMap<String, String>>,
}

/// Encodes a [`DeltaPlan`] into its [`DeltaPayload`] wire form.
#[must_use]
pub fn encode(plan: &DeltaPlan) -> DeltaPayload {
    match plan {
        DeltaPlan::None { size, whole_digest } => DeltaPayload {
            delta_type: "none".to_owned(),
            full_hash: whole_digest.clone(),
            size: *size,
            content: None,
            blocks: None,
        },
        DeltaPlan::Full {
            size,
            whole_digest,
            bytes,
        } => DeltaPayload {
            delta_type: "full".to_owned(),
            full_hash: whole_digest.clone(),
            size: *size,
            content: Some(BASE64.encode(bytes)),
            blocks: None,
        },
        DeltaPlan::Delta {
            size,
            whole_digest,
            blocks,
        } => DeltaPayload {
            delta_type: "delta".to_owned(),
            full_hash: whole_digest.clone(),
            size: *size,
            content: None,
            blocks: Some(
                blocks
                    .iter()
                    .map(|(index, bytes)| (index.to_string(), BASE64.encode(bytes)))
                    .collect(),
            ),
        },
    }
}

/// Decodes a [`DeltaPayload`] back into a [`DeltaPlan`].
///
/// # Errors
///
/// Returns [`DecodeError`] if base64 content is malformed, a block index key
/// is not a valid integer, or a variant-required field is missing.
pub fn decode(payload: &DeltaPayload) -> Result<DeltaPlan, DecodeError> {
    match payload.delta_type.as_str() {
        "none" => Ok(DeltaPlan::None {
            size: payload.size,
            whole_digest: payload.full_hash.clone(),
        }),
        "full" => {
            let content = payload.content.as_ref().ok_or(DecodeError::MissingField {
                delta_type: payload.delta_type.clone(),
                field: "content",
            })?;
            let bytes = BASE64.decode(content)?;
            Ok(DeltaPlan::Full {
                size: payload.size,
                whole_digest: payload.full_hash.clone(),
                bytes,
            })
        }
        "delta" => {
            let raw_blocks = payload.blocks.as_ref().ok_or(DecodeError::MissingField {
                delta_type: payload.delta_type.clone(),
                field: "blocks",
            })?;
            let mut blocks = BTreeMap::new();
            for (index_str, encoded) in raw_blocks {
                let index: usize = index_str
                    .parse()
                    .map_err(|_| DecodeError::InvalidBlockIndex(index_str.clone()))?;
                blocks.insert(index, BASE64.decode(encoded)?);
            }
            Ok(DeltaPlan::Delta {
                size: payload.size,
                whole_digest: payload.full_hash.clone(),
                blocks,
            })
        }
        other => Err(DecodeError::MissingField {
            delta_type: other.to_owned(),
            field: "delta_type (expected none|full|delta)",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    #[test]
    fn none_round_trips() {
        let plan = DeltaPlan::None {
            size: 6,
            whole_digest: "abc123".to_owned(),
        };
        let payload = encode(&plan);
        assert_eq!(payload.delta_type, "none");
        assert_eq!(decode(&payload).unwrap(), plan);
    }

    #[test]
    fn full_round_trips_with_base64_content() {
        let plan = DeltaPlan::Full {
            size: 5,
            whole_digest: "abc123".to_owned(),
            bytes: b"hello".to_vec(),
        };
        let payload = encode(&plan);
        assert_eq!(payload.content.as_deref(), Some("aGVsbG8="));
        assert_eq!(decode(&payload).unwrap(), plan);
    }

    #[test]
    fn delta_round_trips_with_string_indices() {
        let mut blocks = Map::new();
        blocks.insert(1usize, b"xyz".to_vec());
        let plan = DeltaPlan::Delta {
            size: 10_000,
            whole_digest: "def456".to_owned(),
            blocks,
        };
        let payload = encode(&plan);
        assert!(payload.blocks.as_ref().unwrap().contains_key("1"));
        assert_eq!(decode(&payload).unwrap(), plan);
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let plan = DeltaPlan::Full {
            size: 5,
            whole_digest: "h".to_owned(),
            bytes: b"hello".to_vec(),
        };
        let payload = encode(&plan);
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: DeltaPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(decode(&parsed).unwrap(), plan);
    }

    #[test]
    fn full_without_content_is_rejected() {
        let payload = DeltaPayload {
            delta_type: "full".to_owned(),
            full_hash: "h".to_owned(),
            size: 1,
            content: None,
            blocks: None,
        };
        assert!(matches!(decode(&payload), Err(DecodeError::MissingField { .. })));
    }
}
