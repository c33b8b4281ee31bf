//! Append-only event log of one tunnel.
//!
//! Records are kept in append order. Every id ever appended or merged stays
//! in the seen-set, including ids of records that have since expired, so a
//! purged record can never come back through a resubmit or a merge.

use crate::crypto::EnvelopeCodec;
use crate::error::{MeshError, MeshResult};
use crate::identity::{Signer, Verifier};
use crate::keys::{SymmetricKey, TunnelId};

use super::chain::{next_digest, ChainDigest, ChainLink};
use super::record::{EventRecord, NewEvent, Timestamp, UnsignedRecord};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of [`EventLog::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record is new and now part of the log
    Appended(EventRecord),
    /// A record with the same id was already seen; the log is unchanged
    Duplicate(EventRecord),
}

impl AppendOutcome {
    /// The appended or matching record.
    pub fn record(&self) -> &EventRecord {
        match self {
            AppendOutcome::Appended(record) | AppendOutcome::Duplicate(record) => record,
        }
    }

    /// Consume into the record.
    pub fn into_record(self) -> EventRecord {
        match self {
            AppendOutcome::Appended(record) | AppendOutcome::Duplicate(record) => record,
        }
    }

    /// Whether the append was a no-op.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }

    /// Turn a duplicate into [`MeshError::DuplicateRecord`].
    pub fn require_new(self) -> MeshResult<EventRecord> {
        match self {
            AppendOutcome::Appended(record) => Ok(record),
            AppendOutcome::Duplicate(record) => Err(MeshError::DuplicateRecord(record.id)),
        }
    }
}

#[derive(Serialize)]
struct NonceBinding<'a> {
    tunnel_id: &'a str,
    sender: &'a str,
    media_kind: &'a str,
    title: Option<&'a str>,
    created_at: Timestamp,
    expires_at: Option<Timestamp>,
    key_epoch: Option<u64>,
}

/// Ordered, deduplicated, optionally hash-chained records of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub(crate) tunnel_id: TunnelId,
    pub(crate) chained: bool,
    pub(crate) records: Vec<EventRecord>,
    pub(crate) seen_ids: BTreeSet<String>,
    #[serde(default)]
    pub(crate) chain_tip: ChainDigest,
    #[serde(default)]
    pub(crate) chain: Vec<ChainLink>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new(tunnel_id: TunnelId, chained: bool) -> Self {
        Self {
            tunnel_id,
            chained,
            records: Vec::new(),
            seen_ids: BTreeSet::new(),
            chain_tip: ChainDigest::GENESIS,
            chain: Vec::new(),
        }
    }

    /// Owning tunnel.
    pub fn tunnel_id(&self) -> &TunnelId {
        &self.tunnel_id
    }

    /// Whether appends extend the hash chain.
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    /// Records in append order, expired ones included until the next purge.
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Every id this log has ever held.
    pub fn seen_ids(&self) -> &BTreeSet<String> {
        &self.seen_ids
    }

    /// Digest of the last local link.
    pub fn chain_tip(&self) -> ChainDigest {
        self.chain_tip
    }

    /// Local chain links in order.
    pub fn chain(&self) -> &[ChainLink] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a live record.
    pub fn get(&self, id: &str) -> Option<&EventRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Whether a live record has this id.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Whether this id was ever appended or merged, even if since purged.
    pub fn has_seen(&self, id: &str) -> bool {
        self.seen_ids.contains(id)
    }

    /// Build the signed record for an event without touching the log.
    ///
    /// Sealing is deterministic: the same event, key, epoch and signer give
    /// the same record and id.
    pub fn seal(
        &self,
        event: &NewEvent,
        key: &SymmetricKey,
        key_epoch: Option<u64>,
        signer: &dyn Signer,
    ) -> MeshResult<EventRecord> {
        let expires_at = event.expires_at();
        let binding = NonceBinding {
            tunnel_id: self.tunnel_id.as_str(),
            sender: &event.sender,
            media_kind: event.media_kind.as_tag(),
            title: event.title.as_deref(),
            created_at: event.created_at,
            expires_at,
            key_epoch,
        };
        let binding = postcard::to_allocvec(&binding)
            .map_err(|e| MeshError::Serialization(format!("Failed to encode binding: {}", e)))?;

        let fragments = EnvelopeCodec::new(key).encrypt_bound(&event.plaintext, &binding)?;

        let unsigned = UnsignedRecord {
            tunnel_id: &self.tunnel_id,
            sender: &event.sender,
            fragments: &fragments,
            media_kind: &event.media_kind,
            title: event.title.as_deref(),
            created_at: event.created_at,
            expires_at,
            key_epoch,
        };
        let signature = signer.sign(&unsigned.signing_bytes()?);
        let id = EventRecord::compute_id(&event.sender, &fragments, event.created_at, &signature)?;

        Ok(EventRecord {
            id,
            tunnel_id: self.tunnel_id.clone(),
            sender: event.sender.clone(),
            fragments,
            media_kind: event.media_kind.clone(),
            title: event.title.clone(),
            created_at: event.created_at,
            expires_at,
            key_epoch,
            signature,
            chain_digest: None,
        })
    }

    /// Encrypt, sign and append an event.
    ///
    /// An event whose id was already seen leaves the log untouched and comes
    /// back as [`AppendOutcome::Duplicate`].
    pub fn append(
        &mut self,
        event: &NewEvent,
        key: &SymmetricKey,
        key_epoch: Option<u64>,
        signer: &dyn Signer,
    ) -> MeshResult<AppendOutcome> {
        let mut record = self.seal(event, key, key_epoch, signer)?;

        if self.seen_ids.contains(&record.id) {
            let existing = self.get(&record.id).cloned().unwrap_or(record);
            return Ok(AppendOutcome::Duplicate(existing));
        }

        if self.chained {
            let digest = next_digest(&self.chain_tip, &record.ciphertext());
            record.chain_digest = Some(digest);
            self.chain.push(ChainLink {
                record_id: record.id.clone(),
                digest,
            });
            self.chain_tip = digest;
        }

        self.seen_ids.insert(record.id.clone());
        self.records.push(record.clone());
        Ok(AppendOutcome::Appended(record))
    }

    /// Take back the record `append` just added.
    ///
    /// Only the newest record can be taken back, together with its chain
    /// link. Returns false and leaves the log alone for any other id.
    pub(crate) fn undo_append(&mut self, id: &str) -> bool {
        if self.records.last().map(|r| r.id.as_str()) != Some(id) {
            return false;
        }
        self.records.pop();
        self.seen_ids.remove(id);
        if self.chain.last().map(|l| l.record_id.as_str()) == Some(id) {
            self.chain.pop();
            self.chain_tip = self
                .chain
                .last()
                .map_or(ChainDigest::GENESIS, |link| link.digest);
        }
        true
    }

    /// Drop records with `expires_at <= now`. Returns how many went.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.is_expired(now));
        before - self.records.len()
    }

    /// Purge expired records and return the live ones in append order.
    pub fn list(&mut self, now: Timestamp) -> &[EventRecord] {
        self.purge_expired(now);
        &self.records
    }

    /// Decrypt one record's payload.
    pub fn decrypt_one(record: &EventRecord, key: &SymmetricKey) -> MeshResult<Vec<u8>> {
        EnvelopeCodec::new(key).decrypt(&record.fragments)
    }

    /// Check the structural invariants of a log received from elsewhere.
    ///
    /// Every record must belong to this tunnel, carry the id its content
    /// hashes to, appear once, and be present in the seen-set.
    pub fn validate(&self) -> MeshResult<()> {
        let mut ids = HashSet::with_capacity(self.records.len());
        for (index, record) in self.records.iter().enumerate() {
            if record.tunnel_id != self.tunnel_id {
                return Err(MeshError::MalformedImport(format!(
                    "record {} belongs to tunnel {} not {}",
                    index, record.tunnel_id, self.tunnel_id
                )));
            }
            if !record.has_consistent_id() {
                return Err(MeshError::MalformedImport(format!(
                    "record {} has an id that does not match its content",
                    index
                )));
            }
            if !ids.insert(record.id.as_str()) {
                return Err(MeshError::MalformedImport(format!(
                    "duplicate record id {}",
                    record.id
                )));
            }
            if !self.seen_ids.contains(&record.id) {
                return Err(MeshError::MalformedImport(format!(
                    "record id {} missing from seen set",
                    record.id
                )));
            }
        }

        let mut linked = HashSet::with_capacity(self.chain.len());
        for link in &self.chain {
            if !linked.insert(link.record_id.as_str()) {
                return Err(MeshError::MalformedImport(format!(
                    "record {} linked twice",
                    link.record_id
                )));
            }
        }
        Ok(())
    }

    /// Recompute the local hash chain.
    ///
    /// Links whose record has expired are trusted at their stored digest;
    /// every live linked record must hash to its link.
    pub fn validate_chain(&self) -> MeshResult<()> {
        let live: HashMap<&str, &EventRecord> =
            self.records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut prev = ChainDigest::GENESIS;
        for (index, link) in self.chain.iter().enumerate() {
            if let Some(record) = live.get(link.record_id.as_str()) {
                let expected = next_digest(&prev, &record.ciphertext());
                if expected != link.digest {
                    return Err(MeshError::ChainBroken {
                        index,
                        reason: format!("digest mismatch for record {}", link.record_id),
                    });
                }
                if record.chain_digest != Some(link.digest) {
                    return Err(MeshError::ChainBroken {
                        index,
                        reason: format!("record {} carries a stale digest", link.record_id),
                    });
                }
            }
            prev = link.digest;
        }

        if prev != self.chain_tip {
            return Err(MeshError::ChainBroken {
                index: self.chain.len(),
                reason: "chain tip does not match last link".to_string(),
            });
        }
        Ok(())
    }

    /// Ids of live records whose signature does not verify.
    pub fn verify_signatures(&self, verifier: &dyn Verifier) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.verify_signature(verifier))
            .map(|r| r.id.clone())
            .collect()
    }
}
