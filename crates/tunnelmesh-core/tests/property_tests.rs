//! Property-based tests for envelopes, event logs and merging
//!
//! Uses proptest to verify invariants that must hold for any payload and
//! any split of messages between two logs.

use proptest::prelude::*;
use std::collections::BTreeSet;
use tunnelmesh_core::{
    merge, tunnel_id, EnvelopeCodec, EnvelopeFragments, EventLog, MeshError, NewEvent,
    SharedKeySigner, SymmetricKey,
};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Arbitrary payloads, including empty ones
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

/// Short message texts
fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 ]{0,40}").expect("valid regex")
}

/// Which side(s) of a two-node exchange each message is sent on
#[derive(Debug, Clone, Copy)]
enum Side {
    Local,
    Remote,
    Both,
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Local), Just(Side::Remote), Just(Side::Both)]
}

struct Fixture {
    key: SymmetricKey,
    signer: SharedKeySigner,
}

impl Fixture {
    fn new() -> Self {
        let key = SymmetricKey::from_bytes([42; 32]);
        let signer = SharedKeySigner::new(&key);
        Self { key, signer }
    }

    fn empty_log(&self) -> EventLog {
        EventLog::new(tunnel_id("property", 16).unwrap(), true)
    }

    fn build(&self, messages: &[(String, Side)]) -> (EventLog, EventLog) {
        let mut local = self.empty_log();
        let mut remote = self.empty_log();
        for (i, (text, side)) in messages.iter().enumerate() {
            let event = NewEvent::text("u1", text, i as i64);
            if matches!(side, Side::Local | Side::Both) {
                local.append(&event, &self.key, None, &self.signer).unwrap();
            }
            if matches!(side, Side::Remote | Side::Both) {
                remote.append(&event, &self.key, None, &self.signer).unwrap();
            }
        }
        (local, remote)
    }
}

fn live_ids(log: &EventLog) -> BTreeSet<String> {
    log.records().iter().map(|r| r.id.clone()).collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Decrypting an encrypted payload gives the payload back
    #[test]
    fn envelope_roundtrip(payload in payload_strategy()) {
        let codec = EnvelopeCodec::new(&SymmetricKey::from_bytes([7; 32]));
        let fragments = codec.encrypt(&payload).unwrap();
        prop_assert_eq!(codec.decrypt(&fragments).unwrap(), payload);
    }

    /// A different key never decrypts
    #[test]
    fn envelope_wrong_key_fails(payload in payload_strategy(), other in any::<[u8; 32]>()) {
        prop_assume!(other != [7; 32]);
        let fragments = EnvelopeCodec::new(&SymmetricKey::from_bytes([7; 32]))
            .encrypt(&payload)
            .unwrap();
        let result = EnvelopeCodec::new(&SymmetricKey::from_bytes(other)).decrypt(&fragments);
        prop_assert!(matches!(result, Err(MeshError::DecryptionFailed(_))));
    }

    /// Reordering two non-empty fragments breaks decryption
    #[test]
    fn envelope_fragment_swap_fails(payload in payload_strategy(), swap in 0usize..3) {
        let codec = EnvelopeCodec::new(&SymmetricKey::from_bytes([7; 32]));
        let fragments = codec.encrypt(&payload).unwrap();
        let mut parts = fragments.parts().clone();
        let (i, j) = [(0, 1), (1, 2), (0, 2)][swap];
        prop_assume!(parts[i] != parts[j]);
        parts.swap(i, j);
        let swapped = EnvelopeFragments::from_parts(parts);
        prop_assert!(codec.decrypt(&swapped).is_err());
    }

    /// Fragment sizes follow the one-third split
    #[test]
    fn envelope_split_sizes(payload in payload_strategy()) {
        let codec = EnvelopeCodec::new(&SymmetricKey::from_bytes([7; 32]));
        let fragments = codec.encrypt(&payload).unwrap();
        let n = payload.len() + 28;
        let [a, b, c] = fragments.parts();
        prop_assert_eq!(a.len(), n / 3);
        prop_assert_eq!(b.len(), 2 * n / 3 - n / 3);
        prop_assert_eq!(c.len(), n - 2 * n / 3);
    }

    /// Appending the same event any number of times adds one record
    #[test]
    fn append_is_idempotent(text in text_strategy(), repeats in 1usize..5) {
        let f = Fixture::new();
        let mut log = f.empty_log();
        let event = NewEvent::text("u1", &text, 1);
        for _ in 0..repeats {
            log.append(&event, &f.key, None, &f.signer).unwrap();
        }
        prop_assert_eq!(log.len(), 1);
        log.validate_chain().unwrap();
    }

    /// Merge yields exactly the union of both sides
    #[test]
    fn merge_is_union(messages in prop::collection::vec((text_strategy(), side_strategy()), 0..12)) {
        let f = Fixture::new();
        let (local, remote) = f.build(&messages);
        let merged = merge(&local, &remote).unwrap();

        let expected: BTreeSet<String> = live_ids(&local).union(&live_ids(&remote)).cloned().collect();
        prop_assert_eq!(live_ids(&merged), expected);
        prop_assert_eq!(merged.len(), live_ids(&merged).len());
        merged.validate().unwrap();
        merged.validate_chain().unwrap();
    }

    /// Merging is commutative as a set and idempotent exactly
    #[test]
    fn merge_commutative_and_idempotent(messages in prop::collection::vec((text_strategy(), side_strategy()), 0..12)) {
        let f = Fixture::new();
        let (local, remote) = f.build(&messages);

        let ab = merge(&local, &remote).unwrap();
        let ba = merge(&remote, &local).unwrap();
        prop_assert_eq!(live_ids(&ab), live_ids(&ba));
        prop_assert_eq!(ab.seen_ids(), ba.seen_ids());

        let again = merge(&ab, &remote).unwrap();
        prop_assert_eq!(again, ab);
    }

    /// Merging with an empty log leaves the log unchanged
    #[test]
    fn merge_with_empty_is_identity(messages in prop::collection::vec((text_strategy(), side_strategy()), 0..12)) {
        let f = Fixture::new();
        let (local, _) = f.build(&messages);
        prop_assert_eq!(merge(&local, &f.empty_log()).unwrap(), local.clone());
        prop_assert_eq!(live_ids(&merge(&f.empty_log(), &local).unwrap()), live_ids(&local));
    }
}
