//! Opaque pagination cursors
//!
//! A cursor is the ordering position of the last item of the previous page,
//! bound to a fingerprint of the filters that produced it. The token is
//! URL-safe base64 over JSON.

use crate::error::{QueryError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Ordering values of the last returned item
    pub after: Vec<Value>,
    /// Hex SHA-256 of the filter set
    pub fingerprint: String,
}

impl PageCursor {
    pub fn new(after: Vec<Value>, fingerprint: String) -> Self {
        Self { after, fingerprint }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| QueryError::invalid_input(format!("malformed cursor: {e}")))?;
        let cursor: PageCursor = serde_json::from_slice(&bytes)
            .map_err(|e| QueryError::invalid_input(format!("malformed cursor: {e}")))?;
        if cursor.after.is_empty() {
            return Err(QueryError::invalid_input("cursor carries no position"));
        }
        Ok(cursor)
    }

    /// Decode a token and check it was issued for `fingerprint`
    pub fn resume(token: &str, fingerprint: &str) -> Result<Vec<Value>> {
        let cursor = Self::decode(token)?;
        if cursor.fingerprint != fingerprint {
            return Err(QueryError::invalid_input(
                "cursor was issued for a different filter set",
            ));
        }
        Ok(cursor.after)
    }
}

/// Stable fingerprint of any serialisable filter set
pub fn fingerprint<T: Serialize>(filters: &T) -> Result<String> {
    let bytes = serde_json::to_vec(filters)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_is_opaque_and_resumable() {
        let fp = fingerprint(&json!({"regions": ["west"]})).unwrap();
        let token = PageCursor::new(vec![json!(1700), json!("job-9")], fp.clone())
            .encode()
            .unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let after = PageCursor::resume(&token, &fp).unwrap();
        assert_eq!(after, vec![json!(1700), json!("job-9")]);
    }

    #[test]
    fn test_cursor_bound_to_filters() {
        let issued = fingerprint(&json!({"regions": ["west"]})).unwrap();
        let other = fingerprint(&json!({"regions": ["midwest"]})).unwrap();
        assert_ne!(issued, other);

        let token = PageCursor::new(vec![json!(1)], issued).encode().unwrap();
        let err = PageCursor::resume(&token, &other).unwrap_err();
        assert!(matches!(err, QueryError::InvalidInput(_)));
    }

    #[test]
    fn test_garbage_tokens_are_invalid_input() {
        for token in ["%%%", "bm90IGpzb24", ""] {
            let err = PageCursor::decode(token).unwrap_err();
            assert!(matches!(err, QueryError::InvalidInput(_)), "{token}");
        }
    }
}
