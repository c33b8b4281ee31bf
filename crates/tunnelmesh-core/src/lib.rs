//! tunnelmesh Core Library
//!
//! Ephemeral, tunnel-scoped group messaging without a central authority.
//!
//! ## Overview
//!
//! Participants who share a secret derive the same *tunnel id* and the same
//! symmetric key. Messages are encrypted, split into three fragments, signed,
//! optionally given an expiry, and appended to a per-tunnel event log. Logs of
//! independent nodes are reconciled by exporting one and merging it into the
//! other; records are deduplicated by a content-derived id.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  TunnelStore (store)                                            │
//! │  ├── Tunnel handle per secret, one lock per tunnel              │
//! │  ├── EventLog (log): records, seen ids, local hash chain        │
//! │  ├── KeyRing (keys): evolving keys learned per sender           │
//! │  └── PresenceTracker (presence): heartbeats with TTL eviction   │
//! │                                                                 │
//! │  keys ─▶ crypto (triadic envelope) ─▶ identity (signatures)     │
//! │  reconcile (merge / diff) ◀─▶ export (JSON documents)           │
//! │  storage (redb): identity, tunnel logs, key rings               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no transport: moving export documents between nodes is up to
//! the caller.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tunnelmesh_core::{MeshConfig, NewEvent, TunnelStore, now_millis};
//!
//! # fn main() -> Result<(), tunnelmesh_core::MeshError> {
//! let store = TunnelStore::in_memory(MeshConfig::default())?;
//! let tunnel = store.open_tunnel("correct horse battery staple")?;
//!
//! tunnel.send(NewEvent::text("alice", "hello", now_millis()))?;
//!
//! for signal in tunnel.list(now_millis()) {
//!     println!("{}: {:?}", signal.record.sender, signal.text());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod export;
pub mod identity;
pub mod keys;
pub mod log;
pub mod presence;
pub mod reconcile;
pub mod storage;
pub mod store;

// Re-exports
pub use config::{KeyMode, MeshConfig, SigningMode};
pub use crypto::{EnvelopeCodec, EnvelopeFragments};
pub use error::{MeshError, MeshResult};
pub use export::{export_log, import_log, LogExport, EXPORT_VERSION};
pub use identity::{IdentityVerifier, NodeIdentity, SharedKeySigner, Signer, Verifier};
pub use keys::{
    derive_key, evolve_key, tunnel_id, KeyRing, KeySchedule, SymmetricKey, TunnelId, TunnelKeys,
};
pub use log::{
    now_millis, AppendOutcome, ChainDigest, ChainLink, EventLog, EventRecord, MediaKind, NewEvent,
    Timestamp,
};
pub use presence::{PresenceEntry, PresenceTracker};
pub use reconcile::{diff, merge, merge_with_report, MergeReport};
pub use storage::{Storage, StoredPart};
pub use store::{ChainFault, Signal, SignalContent, Tunnel, TunnelStore, VerifyReport};
