//! Unified hash facade over MD5, SHA-1, SHA-256 and git-blob framing.
//!
//! The `GitBlob` type hashes `"blob " || ascii_len || NUL || data` with
//! SHA-1, matching how Git addresses blob objects; it is the scheme used
//! for all content keys in this crate (`compute_hash`). The remaining
//! types are one-to-one with their RustCrypto hashers and support
//! incremental updates.

use std::{fmt::Display, str::FromStr};

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use sha2::{Sha256, Sha512};

/// Supported hash algorithms (selector only, no data attached).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashType {
    Md5,
    Sha1,
    Sha256,
    /// SHA-1 over the Git blob framing `"blob " || len || NUL || data`.
    GitBlob,
}

impl HashType {
    /// Byte length of the digest output.
    pub const fn digest_length(&self) -> usize {
        match self {
            HashType::Md5 => 16,
            HashType::Sha1 | HashType::GitBlob => 20,
            HashType::Sha256 => 32,
        }
    }

    /// Hex string length of the digest output.
    pub const fn hex_len(&self) -> usize {
        self.digest_length() * 2
    }

    /// Lowercase name of the hash algorithm.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashType::Md5 => "md5",
            HashType::Sha1 => "sha1",
            HashType::Sha256 => "sha256",
            HashType::GitBlob => "git",
        }
    }
}

impl Display for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashType::Md5),
            "sha1" => Ok(HashType::Sha1),
            "sha256" => Ok(HashType::Sha256),
            "git" => Ok(HashType::GitBlob),
            _ => Err("Invalid hash type".to_string()),
        }
    }
}

/// Digest value carrying the raw bytes and the algorithm that produced them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashDigest {
    hash_type: HashType,
    bytes: Vec<u8>,
}

impl HashDigest {
    /// Raw bytes of the digest; length matches `hash_type.digest_length()`.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex encoding of the digest.
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Parse a hex digest of the expected width for `hash_type`.
    pub fn from_hex(hash_type: HashType, s: &str) -> Result<Self, String> {
        if s.len() != hash_type.hex_len() {
            return Err(format!(
                "Invalid hash length: got {}, expected {}",
                s.len(),
                hash_type.hex_len()
            ));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        Ok(HashDigest { hash_type, bytes })
    }
}

impl Display for HashDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    // Git framing needs the total length up front; incremental updates are
    // rejected and finalize yields None.
    GitBlob,
}

/// Incremental hasher for a fixed `HashType`.
///
/// `GitBlob` does not support incremental hashing (the framing requires the
/// input length before the first byte); `update` returns false and
/// `finalize` returns `None` for it.
pub struct Hasher {
    state: HasherState,
    hash_type: HashType,
}

impl Hasher {
    pub fn new(hash_type: HashType) -> Self {
        let state = match hash_type {
            HashType::Md5 => HasherState::Md5(Md5::new()),
            HashType::Sha1 => HasherState::Sha1(Sha1::new()),
            HashType::Sha256 => HasherState::Sha256(Sha256::new()),
            HashType::GitBlob => HasherState::GitBlob,
        };
        Hasher { state, hash_type }
    }

    /// Feed data to the hasher. Returns false if the algorithm cannot take
    /// incremental input.
    pub fn update(&mut self, data: &[u8]) -> bool {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::GitBlob => return false,
        }
        true
    }

    /// Finalize and return the digest, or `None` for `GitBlob`.
    pub fn finalize(self) -> Option<HashDigest> {
        let bytes = match self.state {
            HasherState::Md5(h) => h.finalize().to_vec(),
            HasherState::Sha1(h) => h.finalize().to_vec(),
            HasherState::Sha256(h) => h.finalize().to_vec(),
            HasherState::GitBlob => return None,
        };
        Some(HashDigest {
            hash_type: self.hash_type,
            bytes,
        })
    }
}

/// Run the selected hash function over `data` in one shot.
pub fn one_shot(hash_type: HashType, data: &[u8]) -> HashDigest {
    let bytes = match hash_type {
        HashType::Md5 => Md5::digest(data).to_vec(),
        HashType::Sha1 => Sha1::digest(data).to_vec(),
        HashType::Sha256 => Sha256::digest(data).to_vec(),
        HashType::GitBlob => {
            let mut h = Sha1::new();
            h.update(b"blob ");
            h.update(data.len().to_string().as_bytes());
            h.update([0u8]);
            h.update(data);
            h.finalize().to_vec()
        }
    };
    HashDigest { hash_type, bytes }
}

/// SHA-512 one-shot, used for the optional `sha512` archive checksum.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// Hex digest of `data` in the content-addressing scheme used throughout
/// the crate (git-blob SHA-1).
pub fn compute_hash(data: &[u8]) -> String {
    one_shot(HashType::GitBlob, data).hex()
}

/// Check that `s` consists of hex digits only; returns an error message
/// suitable for a map logger otherwise.
pub fn is_hex_hash(s: &str) -> Result<(), String> {
    if s.is_empty() || !s.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid hash {s:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_one_shot(hash_type: HashType, expected: &str) {
        assert_eq!(one_shot(hash_type, b"test").hex(), expected);
    }

    fn check_incremental(hash_type: HashType, expected: &str) {
        let mut hasher = Hasher::new(hash_type);
        assert!(hasher.update(b"te"));
        assert!(hasher.update(b"st"));
        let digest = hasher.finalize().expect("incremental digest");
        assert_eq!(digest.hex(), expected);
    }

    /// Known digests of "test" for every supported algorithm.
    #[test]
    fn test_known_digests() {
        check_one_shot(HashType::Md5, "098f6bcd4621d373cade4e832627b4f6");
        check_one_shot(HashType::Sha1, "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
        check_one_shot(
            HashType::Sha256,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        );
        check_one_shot(HashType::GitBlob, "30d74d258442c7c65512eafab474568dd706c430");
    }

    /// Incremental hashing matches one-shot for the stream-capable types.
    #[test]
    fn test_incremental_digests() {
        check_incremental(HashType::Md5, "098f6bcd4621d373cade4e832627b4f6");
        check_incremental(HashType::Sha1, "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
        check_incremental(
            HashType::Sha256,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        );
    }

    /// Git framing needs the full length up front, so the incremental
    /// surface rejects it.
    #[test]
    fn test_git_blob_not_incremental() {
        let mut hasher = Hasher::new(HashType::GitBlob);
        assert!(!hasher.update(b"test"));
        assert!(hasher.finalize().is_none());
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(one_shot(HashType::Md5, b"").bytes().len(), 16);
        assert_eq!(one_shot(HashType::Sha1, b"").bytes().len(), 20);
        assert_eq!(one_shot(HashType::Sha256, b"").bytes().len(), 32);
        assert_eq!(one_shot(HashType::GitBlob, b"").bytes().len(), 20);
    }

    #[test]
    fn test_hex_validation() {
        assert!(is_hex_hash("30d74d258442c7c65512eafab474568dd706c430").is_ok());
        assert!(is_hex_hash("").is_err());
        assert!(is_hex_hash("xyz").is_err());
    }

    #[test]
    fn test_compute_hash_uses_git_framing() {
        // same as: git hash-object --stdin <<< "test" (without newline)
        assert_eq!(compute_hash(b"test"), "30d74d258442c7c65512eafab474568dd706c430");
    }
}
