//! Content hashing and identifier encoding.
//!
//! A content hash is the SHA-256 digest of a byte string, encoded as URL-safe
//! base64 with padding (always 44 characters). The same encoding is used for
//! content-addressed storage keys and for task ids.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Length of an encoded SHA-256 digest
pub const HASH_LEN: usize = 44;

const DIGEST_LEN: usize = 32;

/// Validated content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a byte string.
    pub fn of(data: &[u8]) -> Self {
        Self(encode_id(&Sha256::digest(data)))
    }

    /// Parse an encoded hash, rejecting anything that is not a base64 SHA-256 digest.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidHash {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.len() != HASH_LEN {
            return Err(invalid("wrong length"));
        }
        let decoded = URL_SAFE
            .decode(value.as_bytes())
            .map_err(|e| invalid(&e.to_string()))?;
        if decoded.len() != DIGEST_LEN {
            return Err(invalid("not a SHA-256 digest"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `data` hashes to this value.
    pub fn matches(&self, data: &[u8]) -> bool {
        *self == Self::of(data)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encode raw bytes the way hashes and ids are encoded.
pub fn encode_id(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("") = e3b0c442...b855
        let hash = ContentHash::of(b"");
        assert_eq!(hash.as_str(), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU=");
        assert_eq!(hash.as_str().len(), HASH_LEN);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(ContentHash::of(b"abc"), ContentHash::of(b"abc"));
        assert_ne!(ContentHash::of(b"abc"), ContentHash::of(b"abd"));
    }

    #[test]
    fn test_parse_accepts_own_output() {
        let hash = ContentHash::of(b"some content");
        let parsed: ContentHash = hash.as_str().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ContentHash::parse("").is_err());
        assert!(ContentHash::parse("../etc/passwd").is_err());
        assert!(ContentHash::parse(&"!".repeat(HASH_LEN)).is_err());
        // Standard alphabet characters are not part of the URL-safe encoding
        assert!(ContentHash::parse("47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=").is_err());
    }

    #[test]
    fn test_matches() {
        let hash = ContentHash::of(b"payload");
        assert!(hash.matches(b"payload"));
        assert!(!hash.matches(b"payload2"));
    }

    #[test]
    fn test_serde_validates() {
        let hash = ContentHash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"nope\"").is_err());
    }
}
