//! Edge case and boundary condition tests
//!
//! These tests verify the system handles unusual inputs,
//! error conditions, and boundary values correctly.

use std::time::Duration;
use tunnelmesh_core::keys::{KDF_SALT, MIN_KDF_ITERATIONS};
use tunnelmesh_core::{
    derive_key, import_log, tunnel_id, EnvelopeCodec, EnvelopeFragments, EventLog, MediaKind,
    MeshConfig, MeshError, NewEvent, PresenceTracker, SharedKeySigner, SymmetricKey, TunnelStore,
};

fn fast_config() -> MeshConfig {
    MeshConfig {
        kdf_iterations: MIN_KDF_ITERATIONS,
        ..Default::default()
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Only the empty secret is rejected
#[test]
fn test_unusual_secrets() {
    assert!(matches!(tunnel_id("", 16), Err(MeshError::InvalidSecret)));

    for secret in [" ", "\n", "ünïcødé 🔑", &"x".repeat(10_000)] {
        let id = tunnel_id(secret, 16).unwrap();
        assert_eq!(id.as_str().len(), 16);
        derive_key(secret, KDF_SALT, MIN_KDF_ITERATIONS).unwrap();
    }
}

/// Secrets differing only in whitespace are different tunnels
#[test]
fn test_secret_is_not_normalised() {
    assert_ne!(tunnel_id("alpha", 16).unwrap(), tunnel_id("alpha ", 16).unwrap());
    assert_ne!(tunnel_id("alpha", 16).unwrap(), tunnel_id("Alpha", 16).unwrap());
}

// ============================================================================
// Payloads
// ============================================================================

/// Empty payloads still produce three fragments that decrypt
#[test]
fn test_empty_payload() {
    let codec = EnvelopeCodec::new(&SymmetricKey::generate());
    let fragments = codec.encrypt(b"").unwrap();
    assert!(fragments.parts().iter().all(|p| !p.is_empty()));
    assert_eq!(codec.decrypt(&fragments).unwrap(), b"");
}

/// All-empty fragments are rejected rather than panicking
#[test]
fn test_empty_fragments() {
    let codec = EnvelopeCodec::new(&SymmetricKey::generate());
    let empty = EnvelopeFragments::from_parts(Default::default());
    assert!(matches!(
        codec.decrypt(&empty),
        Err(MeshError::DecryptionFailed(_))
    ));
}

/// Binary media is carried untouched and keeps its tag
#[test]
fn test_binary_media_roundtrip() {
    let store = TunnelStore::in_memory(fast_config()).unwrap();
    let tunnel = store.open_tunnel("alpha").unwrap();
    let bytes: Vec<u8> = (0..=255).collect();

    tunnel
        .send(
            NewEvent::media("u1", MediaKind::from_tag("image/webp"), bytes.clone(), 1)
                .with_title("gradient"),
        )
        .unwrap();

    let signals = tunnel.list(2);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].record.media_kind.as_tag(), "image/webp");
    assert_eq!(signals[0].record.title.as_deref(), Some("gradient"));
    assert_eq!(signals[0].text(), None);
    assert_eq!(
        signals[0].content,
        tunnelmesh_core::SignalContent::Decrypted(bytes)
    );
}

/// Identical text from different senders is two messages
#[test]
fn test_same_text_different_senders() {
    let key = SymmetricKey::generate();
    let signer = SharedKeySigner::new(&key);
    let mut log = EventLog::new(tunnel_id("alpha", 16).unwrap(), true);
    log.append(&NewEvent::text("u1", "hi", 1), &key, None, &signer)
        .unwrap();
    log.append(&NewEvent::text("u2", "hi", 1), &key, None, &signer)
        .unwrap();
    assert_eq!(log.len(), 2);
}

// ============================================================================
// Expiry Boundaries
// ============================================================================

/// A record expires exactly at `expires_at`
#[test]
fn test_expiry_exact_boundary() {
    let key = SymmetricKey::generate();
    let signer = SharedKeySigner::new(&key);
    let mut log = EventLog::new(tunnel_id("alpha", 16).unwrap(), false);
    let event = NewEvent::text("u1", "tick", 1_000).with_ttl(Duration::from_millis(500));
    log.append(&event, &key, None, &signer).unwrap();

    assert_eq!(log.list(1_499).len(), 1);
    assert_eq!(log.list(1_500).len(), 0);
}

/// A zero TTL expires immediately
#[test]
fn test_zero_ttl() {
    let key = SymmetricKey::generate();
    let signer = SharedKeySigner::new(&key);
    let mut log = EventLog::new(tunnel_id("alpha", 16).unwrap(), false);
    let event = NewEvent::text("u1", "gone", 1_000).with_ttl(Duration::ZERO);
    log.append(&event, &key, None, &signer).unwrap();
    assert!(log.list(1_000).is_empty());
}

/// Huge TTLs saturate instead of overflowing
#[test]
fn test_huge_ttl() {
    let event = NewEvent::text("u1", "forever-ish", i64::MAX - 10)
        .with_ttl(Duration::from_secs(u64::MAX));
    assert_eq!(event.expires_at(), Some(i64::MAX));
}

/// Presence TTL boundary: exactly ttl old is inactive
#[test]
fn test_presence_boundary() {
    let mut tracker = PresenceTracker::new();
    tracker.heartbeat("u1", 0);
    assert_eq!(tracker.active_count(29_999, Duration::from_secs(30)), 1);
    assert_eq!(tracker.active_count(30_000, Duration::from_secs(30)), 0);
}

// ============================================================================
// Imports
// ============================================================================

/// Malformed imports leave the tunnel untouched
#[test]
fn test_malformed_imports_do_not_mutate() {
    let store = TunnelStore::in_memory(fast_config()).unwrap();
    let tunnel = store.open_tunnel("alpha").unwrap();
    tunnel.send(NewEvent::text("u1", "keep me", 1)).unwrap();
    let before = tunnel.log();

    let valid = tunnel.export(2).unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&valid).unwrap();
    doc["log"]["records"][0]["created_at"] = 99.into();

    for bad in [
        "",
        "{",
        "null",
        r#"{"version":1,"exported_at":0}"#,
        &doc.to_string(),
    ] {
        assert!(matches!(
            tunnel.import(bad),
            Err(MeshError::MalformedImport(_))
        ));
    }
    assert_eq!(tunnel.log(), before);
}

/// An empty exported log imports as a no-op
#[test]
fn test_import_empty_log() {
    let store = TunnelStore::in_memory(fast_config()).unwrap();
    let tunnel = store.open_tunnel("alpha").unwrap();
    let other = TunnelStore::in_memory(fast_config()).unwrap();
    let empty = other.open_tunnel("alpha").unwrap().export(0).unwrap();

    let report = tunnel.import(&empty).unwrap();
    assert!(report.is_noop());
    assert_eq!(import_log(&empty).unwrap().len(), 0);
}

// ============================================================================
// Configuration
// ============================================================================

/// Invalid configurations are refused when building a store
#[test]
fn test_invalid_config_rejected() {
    let config = MeshConfig {
        kdf_iterations: 1,
        ..Default::default()
    };
    assert!(matches!(
        TunnelStore::in_memory(config),
        Err(MeshError::InvalidConfig(_))
    ));

    let config = MeshConfig {
        tunnel_id_len: 64,
        ..Default::default()
    };
    assert!(matches!(
        TunnelStore::in_memory(config),
        Err(MeshError::InvalidConfig(_))
    ));
}
