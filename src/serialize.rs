//! Opaque-text encoding for checkpointed values.
//!
//! spec.md §6 leaves the wire format up to the caller and only requires
//! round-trip stability. Plain JSON values are stored as-is; the one value
//! that needs its Rust type recovered on decode, [`crate::error::DbosError`],
//! goes through [`EncodedError`] instead of round-tripping through
//! `serde_json::Value` directly.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DbosError;

/// Encode any serializable value into the opaque text blob stored in
/// `output`/`input`/`message`/`value` columns.
pub fn encode<T: Serialize>(value: &T) -> Result<String, DbosError> {
    serde_json::to_string(value).map_err(DbosError::from)
}

/// Decode a value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, DbosError> {
    serde_json::from_str(text).map_err(DbosError::from)
}

/// A serializable projection of a [`DbosError`], used to round-trip user
/// errors through the `error` columns of `operation_outputs` and
/// `transaction_outputs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedError {
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

impl From<&DbosError> for EncodedError {
    fn from(err: &DbosError) -> Self {
        match err {
            DbosError::User { message, payload } => EncodedError {
                message: message.clone(),
                payload: payload.clone(),
            },
            other => EncodedError {
                message: other.to_string(),
                payload: None,
            },
        }
    }
}

impl EncodedError {
    pub fn into_dbos_error(self) -> DbosError {
        DbosError::User {
            message: self.message,
            payload: self.payload,
        }
    }

    pub fn encode(&self) -> Result<String, DbosError> {
        encode(self)
    }

    pub fn decode(text: &str) -> Result<Self, DbosError> {
        decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_json() {
        let value = serde_json::json!({"a": 1, "b": [1, 2, 3]});
        let text = encode(&value).unwrap();
        let decoded: serde_json::Value = decode(&text).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn round_trips_strings_and_tuples() {
        let value = ("bob".to_string(), "bob".to_string());
        let text = encode(&value).unwrap();
        let decoded: (String, String) = decode(&text).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn round_trips_encoded_error() {
        let err = DbosError::user_with_payload("boom", serde_json::json!({"code": 7}));
        let encoded = EncodedError::from(&err);
        let text = encoded.encode().unwrap();
        let decoded = EncodedError::decode(&text).unwrap();
        assert_eq!(decoded.message, "boom");
        assert_eq!(decoded.payload, Some(serde_json::json!({"code": 7})));
    }
}
