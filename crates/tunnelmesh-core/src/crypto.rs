//! Triadic envelope encryption using ChaCha20-Poly1305 AEAD
//!
//! A payload is sealed into one blob and the blob is cut into three
//! contiguous fragments. The fragments only make sense together and in
//! order; this is obfuscation on top of the AEAD, not secret sharing.
//!
//! # Wire Format
//!
//! Blob: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`, split at
//! `n / 3` and `2n / 3` (integer division, the last fragment takes the rest).

use crate::error::{MeshError, MeshResult};
use crate::keys::SymmetricKey;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Number of fragments per envelope
pub const FRAGMENT_COUNT: usize = 3;

/// Context string for deriving the synthetic-nonce key from a tunnel key
const NONCE_KEY_CONTEXT: &str = "tunnelmesh v1 envelope synthetic nonce";

/// Exactly three ordered byte fragments of one encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvelopeFragments([Vec<u8>; FRAGMENT_COUNT]);

impl EnvelopeFragments {
    /// Split a sealed blob at the one-third and two-thirds offsets.
    pub fn split(blob: &[u8]) -> Self {
        let n = blob.len();
        let (first, second) = (n / 3, 2 * n / 3);
        Self([
            blob[..first].to_vec(),
            blob[first..second].to_vec(),
            blob[second..].to_vec(),
        ])
    }

    /// Assemble fragments received from elsewhere.
    pub fn from_parts(parts: [Vec<u8>; FRAGMENT_COUNT]) -> Self {
        Self(parts)
    }

    /// Fragments in order.
    pub fn parts(&self) -> &[Vec<u8>; FRAGMENT_COUNT] {
        &self.0
    }

    /// Concatenate the fragments back into one blob.
    pub fn join(&self) -> Vec<u8> {
        self.0.concat()
    }

    /// Total length across fragments.
    pub fn total_len(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }
}

impl Serialize for EnvelopeFragments {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = self.0.iter().map(|part| BASE64.encode(part)).collect();
        encoded.serialize(s)
    }
}

impl<'de> Deserialize<'de> for EnvelopeFragments {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let encoded: Vec<String> = Vec::deserialize(d)?;
        if encoded.len() != FRAGMENT_COUNT {
            return Err(serde::de::Error::invalid_length(
                encoded.len(),
                &"exactly 3 fragments",
            ));
        }
        let mut parts: [Vec<u8>; FRAGMENT_COUNT] = Default::default();
        for (slot, text) in parts.iter_mut().zip(&encoded) {
            *slot = BASE64.decode(text).map_err(serde::de::Error::custom)?;
        }
        Ok(Self(parts))
    }
}

/// Envelope encryption for one tunnel key.
///
/// # Example
///
/// ```
/// use tunnelmesh_core::crypto::EnvelopeCodec;
/// use tunnelmesh_core::keys::SymmetricKey;
///
/// let codec = EnvelopeCodec::new(&SymmetricKey::generate());
///
/// let fragments = codec.encrypt(b"Hello, tunnel!").unwrap();
/// let decrypted = codec.decrypt(&fragments).unwrap();
///
/// assert_eq!(decrypted, b"Hello, tunnel!");
/// ```
pub struct EnvelopeCodec {
    cipher: ChaCha20Poly1305,
    nonce_key: [u8; 32],
}

impl EnvelopeCodec {
    /// Create a codec for a 32-byte key.
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            nonce_key: blake3::derive_key(NONCE_KEY_CONTEXT, key.as_bytes()),
        }
    }

    /// Encrypt with a fresh random nonce.
    ///
    /// The same plaintext produces different fragments on every call.
    pub fn encrypt(&self, plaintext: &[u8]) -> MeshResult<EnvelopeFragments> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        self.seal(&nonce, plaintext)
    }

    /// Encrypt with a nonce derived from `binding` and the plaintext.
    ///
    /// Identical `(key, binding, plaintext)` always yields identical
    /// fragments, which is what lets the event log recognise a resubmitted
    /// message. Different bindings or plaintexts give unrelated nonces.
    pub fn encrypt_bound(&self, plaintext: &[u8], binding: &[u8]) -> MeshResult<EnvelopeFragments> {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(&(binding.len() as u64).to_le_bytes());
        hasher.update(binding);
        hasher.update(plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_SIZE]);
        self.seal(&nonce, plaintext)
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> MeshResult<EnvelopeFragments> {
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| MeshError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(EnvelopeFragments::split(&blob))
    }

    /// Reassemble and decrypt.
    ///
    /// Fails with [`MeshError::DecryptionFailed`] on a wrong key, on
    /// reordered, truncated or corrupted fragments, or on a tag mismatch.
    pub fn decrypt(&self, fragments: &EnvelopeFragments) -> MeshResult<Vec<u8>> {
        let blob = fragments.join();
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(MeshError::DecryptionFailed(
                "Envelope too short to contain nonce and tag".to_string(),
            ));
        }

        let (nonce, encrypted) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|e| MeshError::DecryptionFailed(format!("{}", e)))
    }
}

/// Convenience functions for one-off encryption/decryption.
///
/// These build a temporary codec per call. For repeated operations with the
/// same key, prefer [`EnvelopeCodec`].
pub mod stateless {
    use super::*;

    /// Encrypt with a random nonce and split into fragments.
    pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> MeshResult<EnvelopeFragments> {
        EnvelopeCodec::new(key).encrypt(plaintext)
    }

    /// Join fragments and decrypt.
    pub fn decrypt(key: &SymmetricKey, fragments: &EnvelopeFragments) -> MeshResult<Vec<u8>> {
        EnvelopeCodec::new(key).decrypt(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(&SymmetricKey::generate())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let codec = codec();
        let fragments = codec.encrypt(b"Hello, World!").unwrap();
        assert_eq!(codec.decrypt(&fragments).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let codec = codec();
        let fragments = codec.encrypt(b"").unwrap();
        assert_eq!(fragments.total_len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(codec.decrypt(&fragments).unwrap(), b"");
    }

    #[test]
    fn test_encrypt_decrypt_large_data() {
        let codec = codec();
        let plaintext: Vec<u8> = (0..1_000_000).map(|i| (i % 256) as u8).collect();
        let fragments = codec.encrypt(&plaintext).unwrap();
        assert_eq!(codec.decrypt(&fragments).unwrap(), plaintext);
    }

    #[test]
    fn test_split_offsets() {
        let blob: Vec<u8> = (0..10).collect();
        let fragments = EnvelopeFragments::split(&blob);
        let [a, b, c] = fragments.parts();
        assert_eq!(a, &vec![0, 1, 2]);
        assert_eq!(b, &vec![3, 4, 5]);
        assert_eq!(c, &vec![6, 7, 8, 9]);
        assert_eq!(fragments.join(), blob);
    }

    #[test]
    fn test_split_tiny_blob() {
        let fragments = EnvelopeFragments::split(&[7]);
        let [a, b, c] = fragments.parts();
        assert!(a.is_empty());
        assert!(b.is_empty());
        assert_eq!(c, &vec![7]);
    }

    #[test]
    fn test_same_plaintext_different_fragments() {
        let codec = codec();
        let f1 = codec.encrypt(b"Deterministic test").unwrap();
        let f2 = codec.encrypt(b"Deterministic test").unwrap();
        assert_ne!(f1, f2);
    }

    #[test]
    fn test_bound_encryption_is_deterministic() {
        let codec = codec();
        let f1 = codec.encrypt_bound(b"hello", b"u1|1000").unwrap();
        let f2 = codec.encrypt_bound(b"hello", b"u1|1000").unwrap();
        let f3 = codec.encrypt_bound(b"hello", b"u1|1001").unwrap();
        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
        assert_eq!(codec.decrypt(&f3).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_key_fails() {
        let fragments = codec().encrypt(b"Secret").unwrap();
        let result = codec().decrypt(&fragments);
        assert!(matches!(result, Err(MeshError::DecryptionFailed(_))));
    }

    #[test]
    fn test_swapped_fragments_fail() {
        let codec = codec();
        let fragments = codec.encrypt(b"Original message").unwrap();
        let [a, b, c] = fragments.parts().clone();
        let swapped = EnvelopeFragments::from_parts([b, a, c]);
        assert!(matches!(
            codec.decrypt(&swapped),
            Err(MeshError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_fragment_fails() {
        let codec = codec();
        let fragments = codec.encrypt(b"Original message").unwrap();
        let mut parts = fragments.parts().clone();
        parts[1][0] ^= 0xFF;
        let tampered = EnvelopeFragments::from_parts(parts);
        assert!(codec.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_truncated_fails() {
        let codec = codec();
        let fragments = codec.encrypt(b"Original message").unwrap();
        let mut parts = fragments.parts().clone();
        parts[2].truncate(3);
        let truncated = EnvelopeFragments::from_parts(parts);
        assert!(matches!(
            codec.decrypt(&truncated),
            Err(MeshError::DecryptionFailed(_))
        ));

        let empty = EnvelopeFragments::from_parts(Default::default());
        match codec.decrypt(&empty) {
            Err(MeshError::DecryptionFailed(msg)) => assert!(msg.contains("too short")),
            other => panic!("Expected DecryptionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_stateless_roundtrip() {
        let key = SymmetricKey::generate();
        let fragments = stateless::encrypt(&key, b"Stateless test").unwrap();
        assert_eq!(stateless::decrypt(&key, &fragments).unwrap(), b"Stateless test");
        assert!(stateless::decrypt(&SymmetricKey::generate(), &fragments).is_err());
    }

    #[test]
    fn test_fragments_serde_base64() {
        let fragments = EnvelopeFragments::from_parts([vec![0xde, 0xad], vec![], vec![0xbe, 0xef]]);
        let json = serde_json::to_string(&fragments).unwrap();
        assert_eq!(json, r#"["3q0=","","vu8="]"#);
        let back: EnvelopeFragments = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fragments);
    }

    #[test]
    fn test_fragments_serde_rejects_wrong_count() {
        assert!(serde_json::from_str::<EnvelopeFragments>(r#"["AA==","AA=="]"#).is_err());
        assert!(serde_json::from_str::<EnvelopeFragments>(r#"["AA==","AA==","%%"]"#).is_err());
    }
}
