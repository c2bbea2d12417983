use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const BYTES_LEN: usize = 32;

/// A 32-byte SHA-256 digest, displayed and serialized as base58.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Hash {
    bytes: [u8; BYTES_LEN],
}

impl Hash {
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(data).into(),
        }
    }

    /// Hashes the JSON serialization of `data`.
    pub fn hash_json<T: Serialize>(data: &T) -> serde_json::Result<Self> {
        let mut hasher = Sha256::default();

        serde_json::to_writer(&mut hasher, data)?;

        Ok(Self {
            bytes: hasher.finalize().into(),
        })
    }

    /// Chains this hash with additional data, producing the next link.
    #[must_use]
    pub fn chain(&self, data: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(self.bytes);
        hasher.update(data);

        Self {
            bytes: hasher.finalize().into(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.bytes
    }

    #[must_use]
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.bytes).into_string()
    }
}

impl From<[u8; BYTES_LEN]> for Hash {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self { bytes }
    }
}

impl From<Hash> for [u8; BYTES_LEN] {
    fn from(hash: Hash) -> Self {
        hash.bytes
    }
}

impl Deref for Hash {
    type Target = [u8; BYTES_LEN];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidHash {
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("invalid hash length: expected {BYTES_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for Hash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s).into_vec()?;
        let len = decoded.len();

        let bytes: [u8; BYTES_LEN] = decoded
            .try_into()
            .map_err(|_| InvalidHash::Length(len))?;

        Ok(Self { bytes })
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_base58())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_base58()).finish()
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // An owned String, not &str: value- and reader-based deserializers
        // cannot hand out borrowed strings.
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
