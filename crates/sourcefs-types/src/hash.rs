use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 20;

/// A 20-byte content hash identifying a blob or tree in the object store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LEN]);

/// Error parsing a hash from its hex form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    /// Input was not exactly 40 hex characters.
    #[error("hash must be {expected} hex characters, got {0}", expected = HASH_LEN * 2)]
    BadLength(usize),
    /// Input contained a non-hex character.
    #[error("invalid hex character {0:?}")]
    BadCharacter(char),
}

impl Hash {
    /// Wraps raw hash bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The all-zero hash, used as a sentinel for "no object".
    pub const fn zero() -> Self {
        Hash([0u8; HASH_LEN])
    }

    /// Returns true if this is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_LEN * 2 {
            return Err(HashParseError::BadLength(s.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_value(chunk[0])?;
            let lo = hex_value(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Hash(bytes))
    }
}

fn hex_value(c: u8) -> Result<u8, HashParseError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        other => Err(HashParseError::BadCharacter(other as char)),
    }
}

/// Error decoding a serialized proxy-hash entry from the local store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyHashDecodeError {
    /// Entry was shorter than the fixed revision-hash prefix.
    #[error("proxy hash entry truncated: {0} bytes")]
    Truncated(usize),
    /// The path component was not valid UTF-8.
    #[error("proxy hash path is not valid UTF-8")]
    BadPath,
}

/// Translation of a content [`Hash`] into the source-control-native identity
/// the remote importer understands: a repo path plus the revision hash of the
/// file at that path.
///
/// Proxy entries are persisted in the local store as `revision ++ path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyHash {
    /// Repo-relative path of the file.
    pub path: String,
    /// Source-control revision hash of the file contents.
    pub revision: Hash,
}

impl ProxyHash {
    /// Creates a proxy hash from its two components.
    pub fn new(path: impl Into<String>, revision: Hash) -> Self {
        ProxyHash {
            path: path.into(),
            revision,
        }
    }

    /// Serializes this entry into the local-store value format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_LEN + self.path.len());
        out.extend_from_slice(self.revision.as_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out
    }

    /// Decodes a local-store value back into a proxy hash.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProxyHashDecodeError> {
        if bytes.len() < HASH_LEN {
            return Err(ProxyHashDecodeError::Truncated(bytes.len()));
        }
        let mut revision = [0u8; HASH_LEN];
        revision.copy_from_slice(&bytes[..HASH_LEN]);
        let path = std::str::from_utf8(&bytes[HASH_LEN..])
            .map_err(|_| ProxyHashDecodeError::BadPath)?
            .to_string();
        Ok(ProxyHash {
            path,
            revision: Hash::from_bytes(revision),
        })
    }
}

impl fmt::Display for ProxyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> Hash {
        let mut bytes = [0u8; HASH_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        Hash::from_bytes(bytes)
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        let hash = sample_hash();
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_from_str_rejects_short_input() {
        let result = Hash::from_str("abcd");
        assert_eq!(result, Err(HashParseError::BadLength(4)));
    }

    #[test]
    fn test_from_str_rejects_non_hex() {
        let bad = "zz".repeat(HASH_LEN);
        let result = Hash::from_str(&bad);
        assert!(matches!(result, Err(HashParseError::BadCharacter('z'))));
    }

    #[test]
    fn test_from_str_accepts_uppercase() {
        let upper = "AB".repeat(HASH_LEN);
        let hash = Hash::from_str(&upper).unwrap();
        assert_eq!(hash.as_bytes()[0], 0xAB);
    }

    #[test]
    fn test_zero_hash_is_zero() {
        assert!(Hash::zero().is_zero());
        assert!(!sample_hash().is_zero());
    }

    #[test]
    fn test_proxy_hash_encode_decode_round_trip() {
        let proxy = ProxyHash::new("tools/build/main.rs", sample_hash());
        let decoded = ProxyHash::decode(&proxy.encode()).unwrap();
        assert_eq!(decoded, proxy);
    }

    #[test]
    fn test_proxy_hash_decode_rejects_truncated() {
        let result = ProxyHash::decode(&[0u8; 5]);
        assert_eq!(result, Err(ProxyHashDecodeError::Truncated(5)));
    }

    #[test]
    fn test_proxy_hash_empty_path_is_valid() {
        let proxy = ProxyHash::new("", sample_hash());
        let decoded = ProxyHash::decode(&proxy.encode()).unwrap();
        assert_eq!(decoded.path, "");
        assert_eq!(decoded.revision, sample_hash());
    }

    #[test]
    fn test_proxy_hash_decode_rejects_bad_utf8() {
        let mut bytes = sample_hash().as_bytes().to_vec();
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(ProxyHash::decode(&bytes), Err(ProxyHashDecodeError::BadPath));
    }
}
