//! Signed, encrypted, hash-chained event log.
//!
//! ## Record Lifecycle
//!
//! ```text
//! NewEvent ──seal──▶ EventRecord ──append──▶ live ──expires_at <= now──▶ purged
//!                                   │                                     │
//!                                   └──────── id stays in seen_ids ◀──────┘
//! ```
//!
//! There are no edits and no retractions; a record only leaves the log by
//! expiring.

mod chain;
mod event_log;
mod record;

pub use chain::{next_digest, ChainDigest, ChainLink};
pub use event_log::{AppendOutcome, EventLog};
pub use record::{now_millis, EventRecord, MediaKind, NewEvent, Timestamp};
