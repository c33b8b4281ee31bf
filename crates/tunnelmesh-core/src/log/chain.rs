//! Local hash chain over appended records.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Record 0    │───▶│  Record 1    │───▶│  Record 2    │
//! │  d0 = H(G|c0)│    │  d1 = H(d0|c1)│   │  d2 = H(d1|c2)│
//! └──────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! `G` is 32 zero bytes and `cN` the record's ciphertext blob. The chain only
//! covers records this node appended itself; merged records are not linked.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Domain tag for chain digests
const CHAIN_DOMAIN: &[u8] = b"tunnelmesh.v1.chain";

/// A 32-byte BLAKE3 chain digest, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainDigest([u8; 32]);

impl ChainDigest {
    /// Digest preceding the first link.
    pub const GENESIS: ChainDigest = ChainDigest([0u8; 32]);

    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the genesis digest.
    pub fn is_genesis(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Default for ChainDigest {
    fn default() -> Self {
        Self::GENESIS
    }
}

impl fmt::Debug for ChainDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChainDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ChainDigest {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainDigest {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("chain digest must be 32 bytes"))?;
        Ok(Self(array))
    }
}

/// Digest of the link following `prev` for a record with this ciphertext.
pub fn next_digest(prev: &ChainDigest, ciphertext: &[u8]) -> ChainDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHAIN_DOMAIN);
    hasher.update(&prev.0);
    hasher.update(ciphertext);
    ChainDigest(*hasher.finalize().as_bytes())
}

/// One position in the local chain.
///
/// Links outlive their records: after a record expires its link keeps the
/// digest so the rest of the chain still verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Id of the record this link covers
    pub record_id: String,
    /// Running digest after this record
    pub digest: ChainDigest,
}
