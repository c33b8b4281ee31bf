//! Key derivation for tunnels.
//!
//! A shared secret yields two things:
//!
//! - a [`TunnelId`]: truncated SHA-256 of the secret, used as the log namespace
//! - a [`SymmetricKey`]: PBKDF2-HMAC-SHA256 of the secret with an
//!   application-fixed salt
//!
//! In evolving mode every sender's key moves forward after each message it
//! sends: `k' = SHA-256(k || plaintext)`. Records carry the epoch (position in
//! the sender's chain) they were encrypted at, and a reader recovers the keys
//! by replaying each sender's messages from genesis ([`KeyRing`]).

use crate::config::{KeyMode, MeshConfig};
use crate::error::{MeshError, MeshResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes
pub const KEY_SIZE: usize = 32;

/// Application-fixed PBKDF2 salt
pub const KDF_SALT: &[u8] = b"tunnelmesh.v1.kdf-salt";

/// Lowest accepted PBKDF2 iteration count
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// PBKDF2 iteration count used unless configured otherwise
pub const DEFAULT_KDF_ITERATIONS: u32 = 210_000;

/// Shortest supported tunnel id (hex characters)
pub const MIN_TUNNEL_ID_LEN: usize = 12;

/// Longest supported tunnel id (hex characters)
pub const MAX_TUNNEL_ID_LEN: usize = 20;

/// Tunnel id length used unless configured otherwise
pub const DEFAULT_TUNNEL_ID_LEN: usize = 16;

/// Namespace of one shared secret: a fixed-length lowercase hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(String);

impl TunnelId {
    /// Parse a tunnel id received from outside (import, CLI).
    pub fn parse(s: &str) -> MeshResult<Self> {
        let valid_len = (MIN_TUNNEL_ID_LEN..=MAX_TUNNEL_ID_LEN).contains(&s.len());
        let valid_chars = s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid_len || !valid_chars {
            return Err(MeshError::MalformedImport(format!(
                "invalid tunnel id '{}'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte symmetric key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> MeshResult<Self> {
        let array: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| MeshError::Crypto(format!("key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(array))
    }

    /// Generate a random key. Only useful for tests and benchmarks; tunnel
    /// keys come from [`derive_key`].
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short non-secret fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..4])
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}

/// Derive the tunnel id for a secret.
///
/// Fails with [`MeshError::InvalidSecret`] on an empty secret.
pub fn tunnel_id(secret: &str, len: usize) -> MeshResult<TunnelId> {
    if secret.is_empty() {
        return Err(MeshError::InvalidSecret);
    }
    if !(MIN_TUNNEL_ID_LEN..=MAX_TUNNEL_ID_LEN).contains(&len) {
        return Err(MeshError::InvalidConfig(format!(
            "tunnel id length {} outside {}..={}",
            len, MIN_TUNNEL_ID_LEN, MAX_TUNNEL_ID_LEN
        )));
    }
    let digest = hex::encode(Sha256::digest(secret.as_bytes()));
    Ok(TunnelId(digest[..len].to_string()))
}

/// Derive the symmetric key for a secret with PBKDF2-HMAC-SHA256.
pub fn derive_key(secret: &str, salt: &[u8], iterations: u32) -> MeshResult<SymmetricKey> {
    if secret.is_empty() {
        return Err(MeshError::InvalidSecret);
    }
    if iterations < MIN_KDF_ITERATIONS {
        return Err(MeshError::InvalidConfig(format!(
            "kdf iterations {} below minimum {}",
            iterations, MIN_KDF_ITERATIONS
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut key);
    Ok(SymmetricKey(key))
}

/// Next key in an evolving chain: `SHA-256(key || plaintext)`.
pub fn evolve_key(current: &SymmetricKey, plaintext: &[u8]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(current.as_bytes());
    hasher.update(plaintext);
    SymmetricKey(hasher.finalize().into())
}

/// Everything a secret derives to.
#[derive(Debug, Clone)]
pub struct TunnelKeys {
    /// Log namespace
    pub tunnel_id: TunnelId,
    /// Base key (epoch 0 in evolving mode)
    pub key: SymmetricKey,
}

impl TunnelKeys {
    /// Derive id and key using the configured lengths and iteration count.
    pub fn derive(secret: &str, config: &MeshConfig) -> MeshResult<Self> {
        Ok(Self {
            tunnel_id: tunnel_id(secret, config.tunnel_id_len)?,
            key: derive_key(secret, KDF_SALT, config.kdf_iterations)?,
        })
    }
}

/// One sender's position in its key chain.
///
/// In static mode the schedule never moves and reports no epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchedule {
    mode: KeyMode,
    epoch: u64,
    current: SymmetricKey,
    /// The step before the last advance, kept so a resubmitted message can
    /// be recognised after the key already moved on.
    previous: Option<(u64, SymmetricKey)>,
}

impl KeySchedule {
    /// Start a schedule at epoch 0 from the tunnel's base key.
    pub fn new(mode: KeyMode, base: &SymmetricKey) -> Self {
        Self {
            mode,
            epoch: 0,
            current: base.clone(),
            previous: None,
        }
    }

    /// Key to encrypt the next message with.
    pub fn current_key(&self) -> &SymmetricKey {
        &self.current
    }

    /// Epoch stamped on the next record (`None` in static mode).
    pub fn epoch(&self) -> Option<u64> {
        match self.mode {
            KeyMode::Static => None,
            KeyMode::Evolving => Some(self.epoch),
        }
    }

    /// The step used for the most recent message, if the key has moved.
    pub fn previous(&self) -> Option<(u64, &SymmetricKey)> {
        self.previous.as_ref().map(|(epoch, key)| (*epoch, key))
    }

    /// Move past a successfully appended message.
    pub fn advance(&mut self, plaintext: &[u8]) {
        if self.mode == KeyMode::Static {
            return;
        }
        let next = evolve_key(&self.current, plaintext);
        let prev = std::mem::replace(&mut self.current, next);
        self.previous = Some((self.epoch, prev));
        self.epoch += 1;
    }
}

/// Every evolved key this node has learned, per sender.
///
/// Epoch 0 of every sender is the tunnel's base key; the ring stores the
/// keys of epochs 1.. in order. A key is learned by decrypting the message
/// of the previous epoch ([`KeyRing::accept`]), so keys are only recovered
/// by replaying a sender's messages from genesis without gaps. Keys stay
/// learned after their messages expire, which keeps later messages readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    #[serde(with = "chains_hex")]
    chains: BTreeMap<String, Vec<SymmetricKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of epochs of `sender` whose key is known (at least 1: the base).
    pub fn known_epochs(&self, sender: &str) -> u64 {
        self.chains.get(sender).map_or(0, Vec::len) as u64 + 1
    }

    /// Key for `sender`'s message at `epoch`, if the chain has reached it.
    pub fn key_for(&self, base: &SymmetricKey, sender: &str, epoch: u64) -> Option<SymmetricKey> {
        if epoch == 0 {
            return Some(base.clone());
        }
        let index = usize::try_from(epoch - 1).ok()?;
        self.chains.get(sender)?.get(index).cloned()
    }

    /// Record that `sender`'s message at `epoch` decrypted to `plaintext`.
    ///
    /// Only the newest known epoch extends the chain; returns whether a new
    /// key was learned.
    pub fn accept(&mut self, base: &SymmetricKey, sender: &str, epoch: u64, plaintext: &[u8]) -> bool {
        if epoch + 1 != self.known_epochs(sender) {
            return false;
        }
        let Some(key) = self.key_for(base, sender, epoch) else {
            return false;
        };
        self.chains
            .entry(sender.to_string())
            .or_default()
            .push(evolve_key(&key, plaintext));
        true
    }

    /// Sending schedule for `sender`, positioned after its newest known key.
    pub fn schedule(&self, mode: KeyMode, base: &SymmetricKey, sender: &str) -> KeySchedule {
        if mode == KeyMode::Static {
            return KeySchedule::new(mode, base);
        }
        let epoch = self.known_epochs(sender) - 1;
        let current = self.key_for(base, sender, epoch).unwrap_or_else(|| base.clone());
        let previous = epoch
            .checked_sub(1)
            .and_then(|prev| self.key_for(base, sender, prev).map(|key| (prev, key)));
        KeySchedule {
            mode,
            epoch,
            current,
            previous,
        }
    }

    /// Forget `sender`'s keys past the first `known_epochs` epochs.
    pub(crate) fn truncate(&mut self, sender: &str, known_epochs: u64) {
        let keep = usize::try_from(known_epochs.saturating_sub(1)).unwrap_or(usize::MAX);
        if let Some(chain) = self.chains.get_mut(sender) {
            chain.truncate(keep);
            if chain.is_empty() {
                self.chains.remove(sender);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

mod chains_hex {
    use super::SymmetricKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        chains: &BTreeMap<String, Vec<SymmetricKey>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, Vec<String>> = chains
            .iter()
            .map(|(sender, keys)| {
                let keys = keys.iter().map(|k| hex::encode(k.as_bytes())).collect();
                (sender.as_str(), keys)
            })
            .collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, Vec<SymmetricKey>>, D::Error> {
        let encoded: BTreeMap<String, Vec<String>> = BTreeMap::deserialize(d)?;
        encoded
            .into_iter()
            .map(|(sender, keys)| {
                let keys = keys
                    .iter()
                    .map(|text| {
                        let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
                        SymmetricKey::from_slice(&bytes).map_err(serde::de::Error::custom)
                    })
                    .collect::<Result<Vec<_>, D::Error>>()?;
                Ok((sender, keys))
            })
            .collect()
    }
}
