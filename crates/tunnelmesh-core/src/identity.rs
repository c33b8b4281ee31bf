//! Record signing.
//!
//! Two schemes sign event records:
//!
//! - [`SharedKeySigner`]: HMAC-SHA256 with a MAC key expanded (HKDF) from the
//!   tunnel key. Everyone holding the tunnel secret can sign and verify.
//! - [`NodeIdentity`]: Ed25519 with the node's persisted key pair. The record
//!   sender is the node's public id, so [`IdentityVerifier`] needs nothing
//!   but the record itself.
//!
//! Signatures travel as lowercase hex strings.

use crate::error::{MeshError, MeshResult};
use crate::keys::SymmetricKey;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info string for the record MAC key
const MAC_KEY_INFO: &[u8] = b"tunnelmesh.v1.record-mac";

/// Produces record signatures.
pub trait Signer: Send + Sync {
    /// Sign canonical record bytes.
    fn sign(&self, message: &[u8]) -> String;
}

/// Checks record signatures.
pub trait Verifier {
    /// Whether `signature` is valid for `message` as sent by `sender`.
    fn verify(&self, sender: &str, message: &[u8], signature: &str) -> bool;
}

/// HMAC-SHA256 signer/verifier bound to a tunnel key.
#[derive(Clone)]
pub struct SharedKeySigner {
    mac_key: Zeroizing<[u8; 32]>,
}

impl SharedKeySigner {
    /// Expand a MAC key from the tunnel's base key.
    pub fn new(tunnel_key: &SymmetricKey) -> Self {
        let hk = Hkdf::<Sha256>::new(None, tunnel_key.as_bytes());
        let mut mac_key = Zeroizing::new([0u8; 32]);
        // 32 bytes is far below HKDF-SHA256's output limit.
        if hk.expand(MAC_KEY_INFO, &mut mac_key[..]).is_err() {
            unreachable!("HKDF output length is fixed at 32 bytes");
        }
        Self { mac_key }
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.mac_key[..]) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any length"),
        }
    }
}

impl Signer for SharedKeySigner {
    fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl Verifier for SharedKeySigner {
    fn verify(&self, _sender: &str, message: &[u8], signature: &str) -> bool {
        let Ok(tag) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(message);
        mac.verify_slice(&tag).is_ok()
    }
}

impl fmt::Debug for SharedKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeySigner").finish_non_exhaustive()
    }
}

/// The node's persisted Ed25519 identity.
#[derive(Clone)]
pub struct NodeIdentity {
    signing: SigningKey,
}

impl NodeIdentity {
    /// Generate a new random identity.
    pub fn generate() -> MeshResult<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut seed[..])
            .map_err(|e| MeshError::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MeshError::Identity("Identity seed must be 32 bytes".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Secret seed for persistence.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Public identifier: hex of the Ed25519 verifying key.
    pub fn public_id(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// Short form for display.
    pub fn short_id(&self) -> String {
        self.public_id()[..16].to_string()
    }
}

impl Signer for NodeIdentity {
    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_id", &self.public_id())
            .finish_non_exhaustive()
    }
}

/// Verifies Ed25519 record signatures using the sender as the public key.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityVerifier;

impl Verifier for IdentityVerifier {
    fn verify(&self, sender: &str, message: &[u8], signature: &str) -> bool {
        let Some(key) = decode_array::<32>(sender).and_then(|b| VerifyingKey::from_bytes(&b).ok())
        else {
            return false;
        };
        let Some(sig) = decode_array::<64>(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig)).is_ok()
    }
}

fn decode_array<const N: usize>(s: &str) -> Option<[u8; N]> {
    hex::decode(s).ok()?.try_into().ok()
}
