//! Node façade: tunnels by secret, each behind its own lock.
//!
//! ## Locking
//!
//! ```text
//! TunnelStore
//! ├── tunnels: RwLock<HashMap<TunnelId, Arc<Mutex<TunnelState>>>>
//! │     held only to find or insert a slot
//! └── Tunnel (handle, cheap to clone)
//!       └── Mutex<TunnelState> held for a whole send / list / import
//! ```
//!
//! Key derivation runs before any lock is taken. A mutation is persisted
//! while the tunnel lock is still held; if the write keeps failing the
//! in-memory state is restored and the error is returned. A stored row that
//! could not be read is quarantined before the first write replaces it.

use crate::config::{KeyMode, MeshConfig, SigningMode};
use crate::error::{MeshError, MeshResult};
use crate::export::{export_log, import_log};
use crate::identity::{IdentityVerifier, NodeIdentity, SharedKeySigner, Signer, Verifier};
use crate::keys::{tunnel_id, KeyRing, KeySchedule, SymmetricKey, TunnelId, TunnelKeys};
use crate::log::{AppendOutcome, EventLog, EventRecord, NewEvent, Timestamp};
use crate::presence::PresenceTracker;
use crate::reconcile::{self, MergeReport};
use crate::storage::{Storage, StoredPart};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decrypted payload of a record, or why it could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalContent {
    /// Plaintext bytes
    Decrypted(Vec<u8>),
    /// Decryption failed; the rest of the listing is unaffected
    Corrupted(String),
}

/// A listed record with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub record: EventRecord,
    pub content: SignalContent,
}

impl Signal {
    /// Payload as text, for decrypted text records.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            SignalContent::Decrypted(bytes) if self.record.media_kind.is_text() => {
                std::str::from_utf8(bytes).ok()
            }
            _ => None,
        }
    }

    /// Whether the payload could not be decrypted.
    pub fn is_corrupted(&self) -> bool {
        matches!(self.content, SignalContent::Corrupted(_))
    }
}

/// Outcome of checking a tunnel's signatures and local chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Live records checked
    pub records: usize,
    /// Ids of records whose signature does not verify
    pub invalid_signatures: Vec<String>,
    /// First chain problem, if any
    pub chain_error: Option<ChainFault>,
}

/// Where the local hash chain stops matching its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFault {
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broken at link {}: {}", self.index, self.reason)
    }
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.invalid_signatures.is_empty() && self.chain_error.is_none()
    }

    /// Turn the report into an error: bad signatures first, then the chain.
    pub fn ensure_ok(&self) -> MeshResult<()> {
        if !self.invalid_signatures.is_empty() {
            return Err(MeshError::SignatureInvalid(format!(
                "{} record(s): {}",
                self.invalid_signatures.len(),
                self.invalid_signatures.join(", ")
            )));
        }
        if let Some(fault) = &self.chain_error {
            return Err(MeshError::ChainBroken {
                index: fault.index,
                reason: fault.reason.clone(),
            });
        }
        Ok(())
    }
}

struct TunnelState {
    keys: TunnelKeys,
    log: EventLog,
    ring: KeyRing,
    presence: PresenceTracker,
    /// Stored rows that failed to load and must be quarantined before the
    /// next write
    unreadable: Vec<StoredPart>,
}

/// All tunnels of one node.
pub struct TunnelStore {
    config: MeshConfig,
    storage: Option<Storage>,
    identity: NodeIdentity,
    tunnels: RwLock<HashMap<TunnelId, Arc<Mutex<TunnelState>>>>,
}

impl TunnelStore {
    /// A store that keeps everything in memory, with a throwaway identity.
    pub fn in_memory(config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage: None,
            identity: NodeIdentity::generate()?,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// A store backed by the database in `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        let storage = Storage::open_dir(data_dir.as_ref())?;
        let identity = storage.load_or_create_identity()?;
        info!(
            node = %identity.short_id(),
            path = %data_dir.as_ref().display(),
            "Opened tunnel store"
        );
        Ok(Self {
            config,
            storage: Some(storage),
            identity,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// Open `data_dir` with the `config.json` found there (or defaults).
    pub fn open_dir(data_dir: impl AsRef<Path>) -> MeshResult<Self> {
        let config = MeshConfig::load_or_default(data_dir.as_ref())?;
        Self::open(data_dir, config)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Tunnels with persisted state (empty for in-memory stores).
    pub fn stored_tunnels(&self) -> MeshResult<Vec<TunnelId>> {
        match &self.storage {
            Some(storage) => storage.list_tunnels(),
            None => Ok(Vec::new()),
        }
    }

    /// Tunnels opened since the store was created.
    pub fn open_tunnels(&self) -> Vec<TunnelId> {
        let mut ids: Vec<TunnelId> = self.tunnels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Enter the tunnel of a shared secret.
    ///
    /// The first open of a tunnel derives its key and loads its persisted
    /// state; later opens reuse both.
    pub fn open_tunnel(&self, secret: &str) -> MeshResult<Tunnel> {
        let id = tunnel_id(secret, self.config.tunnel_id_len)?;

        let existing = self.tunnels.read().get(&id).cloned();
        let state = match existing {
            Some(state) => state,
            None => {
                let keys = TunnelKeys::derive(secret, &self.config)?;
                let fresh = Arc::new(Mutex::new(self.load_state(keys)));
                self.tunnels.write().entry(id.clone()).or_insert(fresh).clone()
            }
        };

        let keys = state.lock().keys.clone();
        let signer: Arc<dyn Signer> = match self.config.signing {
            SigningMode::SharedKey => Arc::new(SharedKeySigner::new(&keys.key)),
            SigningMode::NodeIdentity => Arc::new(self.identity.clone()),
        };
        let required_sender = (self.config.signing == SigningMode::NodeIdentity)
            .then(|| self.identity.public_id());

        Ok(Tunnel {
            keys,
            config: self.config.clone(),
            storage: self.storage.clone(),
            signer,
            required_sender,
            state,
        })
    }

    /// Forget a tunnel: drop its persisted log and key ring and close it.
    ///
    /// Handles already open keep their in-memory state; a later write through
    /// one of them stores the tunnel again. Returns whether anything was
    /// stored.
    pub fn forget_tunnel(&self, secret: &str) -> MeshResult<bool> {
        let id = tunnel_id(secret, self.config.tunnel_id_len)?;
        self.tunnels.write().remove(&id);
        let removed = match &self.storage {
            Some(storage) => storage.delete_tunnel(&id)?,
            None => false,
        };
        info!(tunnel = %id, removed, "Forgot tunnel");
        Ok(removed)
    }

    /// Keys of stored rows that were quarantined because they could not be
    /// read.
    pub fn quarantined(&self) -> MeshResult<Vec<String>> {
        match &self.storage {
            Some(storage) => storage.quarantined(),
            None => Ok(Vec::new()),
        }
    }

    fn load_state(&self, keys: TunnelKeys) -> TunnelState {
        let id = keys.tunnel_id.clone();
        let mut unreadable = Vec::new();
        let (log, ring) = match &self.storage {
            Some(storage) => {
                let log = match storage.load_log(&id) {
                    Ok(log) => log,
                    Err(e) => {
                        warn!(tunnel = %id, error = %e, "Failed to load tunnel log, starting empty");
                        unreadable.push(StoredPart::Log);
                        None
                    }
                };
                let ring = storage.load_ring(&id).unwrap_or_else(|e| {
                    warn!(tunnel = %id, error = %e, "Failed to load key ring, starting empty");
                    unreadable.push(StoredPart::Ring);
                    KeyRing::new()
                });
                (log, ring)
            }
            None => (None, KeyRing::new()),
        };

        let log = log.unwrap_or_else(|| EventLog::new(id.clone(), self.config.chain_digests));
        info!(tunnel = %id, records = log.len(), key = %keys.key.fingerprint(), "Opened tunnel");

        TunnelState {
            keys,
            log,
            ring,
            presence: PresenceTracker::new(),
            unreadable,
        }
    }
}

/// Handle to one open tunnel.
#[derive(Clone)]
pub struct Tunnel {
    keys: TunnelKeys,
    config: MeshConfig,
    storage: Option<Storage>,
    signer: Arc<dyn Signer>,
    required_sender: Option<String>,
    state: Arc<Mutex<TunnelState>>,
}

impl Tunnel {
    pub fn id(&self) -> &TunnelId {
        &self.keys.tunnel_id
    }

    /// Sender id this node must use, when signing with the node identity.
    pub fn required_sender(&self) -> Option<&str> {
        self.required_sender.as_deref()
    }

    /// Encrypt, sign and append a message.
    ///
    /// Resending an identical event is a no-op that returns
    /// [`AppendOutcome::Duplicate`]. Events without a TTL get the configured
    /// default one.
    pub fn send(&self, mut event: NewEvent) -> MeshResult<AppendOutcome> {
        if let Some(required) = &self.required_sender {
            if &event.sender != required {
                return Err(MeshError::Identity(format!(
                    "sender must be the node id {} when signing with the node identity",
                    required
                )));
            }
        }
        if event.ttl.is_none() {
            event.ttl = self.config.default_message_ttl();
        }

        let base = &self.keys.key;
        let signer = self.signer.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let known_epochs = state.ring.known_epochs(&event.sender);

        let outcome = match self.config.key_mode {
            KeyMode::Static => state.log.append(&event, base, None, signer)?,
            KeyMode::Evolving => {
                let schedule = state.ring.schedule(KeyMode::Evolving, base, &event.sender);
                if let Some(existing) =
                    find_resubmit(&state.log, &state.ring, &schedule, &event, base, signer)?
                {
                    debug!(
                        tunnel = %self.id(),
                        id = %existing.id,
                        epoch = ?existing.key_epoch,
                        "Resubmit under an earlier key"
                    );
                    return Ok(AppendOutcome::Duplicate(existing));
                }
                let outcome =
                    state
                        .log
                        .append(&event, schedule.current_key(), schedule.epoch(), signer)?;
                if let (AppendOutcome::Appended(_), Some(epoch)) = (&outcome, schedule.epoch()) {
                    state.ring.accept(base, &event.sender, epoch, &event.plaintext);
                }
                outcome
            }
        };

        match &outcome {
            AppendOutcome::Duplicate(record) => {
                debug!(tunnel = %self.id(), id = %record.id, "Duplicate send ignored");
            }
            AppendOutcome::Appended(record) => {
                if let Err(e) = self.persist(state) {
                    state.log.undo_append(&record.id);
                    state.ring.truncate(&event.sender, known_epochs);
                    warn!(tunnel = %self.id(), error = %e, "Send rolled back");
                    return Err(e);
                }
                debug!(
                    tunnel = %self.id(),
                    id = %record.id,
                    sender = %record.sender,
                    epoch = ?record.key_epoch,
                    "Appended record"
                );
            }
        }
        Ok(outcome)
    }

    /// Purge expired records and decrypt the rest, in log order.
    ///
    /// A record that cannot be decrypted is returned as
    /// [`SignalContent::Corrupted`] and does not affect the others.
    pub fn list(&self, now: Timestamp) -> Vec<Signal> {
        let mut state = self.state.lock();
        let purged = state.log.purge_expired(now);

        let state = &mut *state;
        let (contents, learned) = decrypt_all(state.log.records(), &self.keys.key, &mut state.ring);

        if purged > 0 || learned {
            debug!(tunnel = %self.id(), purged, learned, "Listing changed tunnel state");
            if let Err(e) = self.persist(state) {
                warn!(tunnel = %self.id(), error = %e, "Failed to persist after listing");
            }
        }

        state
            .log
            .records()
            .iter()
            .cloned()
            .zip(contents)
            .map(|(record, content)| Signal { record, content })
            .collect()
    }

    /// Live records without decrypting or purging.
    pub fn records(&self) -> Vec<EventRecord> {
        self.state.lock().log.records().to_vec()
    }

    /// Snapshot of the whole log.
    pub fn log(&self) -> EventLog {
        self.state.lock().log.clone()
    }

    /// Export the live log as a JSON document.
    pub fn export(&self, now: Timestamp) -> MeshResult<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.log.purge_expired(now) > 0 {
            if let Err(e) = self.persist(state) {
                warn!(tunnel = %self.id(), error = %e, "Failed to persist purge before export");
            }
        }
        export_log(&state.log, now)
    }

    /// Merge an exported log into this tunnel.
    ///
    /// Nothing changes if the document is malformed, belongs to another
    /// tunnel, or cannot be persisted.
    pub fn import(&self, text: &str) -> MeshResult<MergeReport> {
        let remote = import_log(text)?;
        if let Err(e) = remote.validate_chain() {
            warn!(tunnel = %self.id(), error = %e, "Imported log has a broken chain");
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (merged, report) = reconcile::merge_with_report(&state.log, &remote)?;
        if merged == state.log {
            return Ok(report);
        }

        let previous = std::mem::replace(&mut state.log, merged);
        if let Err(e) = self.persist(state) {
            state.log = previous;
            warn!(tunnel = %self.id(), error = %e, "Import rolled back");
            return Err(e);
        }
        info!(
            tunnel = %self.id(),
            added = report.added.len(),
            duplicates = report.duplicates,
            "Merged remote log"
        );
        Ok(report)
    }

    /// Records of an exported log this tunnel has never seen.
    pub fn diff(&self, text: &str) -> MeshResult<Vec<EventRecord>> {
        let remote = import_log(text)?;
        let state = self.state.lock();
        Ok(reconcile::diff(&state.log, &remote)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Check record signatures and the local hash chain.
    pub fn verify(&self) -> VerifyReport {
        let verifier: Box<dyn Verifier> = match self.config.signing {
            SigningMode::SharedKey => Box::new(SharedKeySigner::new(&self.keys.key)),
            SigningMode::NodeIdentity => Box::new(IdentityVerifier),
        };
        let state = self.state.lock();
        VerifyReport {
            records: state.log.len(),
            invalid_signatures: state.log.verify_signatures(verifier.as_ref()),
            chain_error: match state.log.validate_chain() {
                Ok(()) => None,
                Err(MeshError::ChainBroken { index, reason }) => Some(ChainFault { index, reason }),
                Err(e) => Some(ChainFault {
                    index: state.log.chain().len(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    /// Record that `user_id` is present.
    pub fn heartbeat(&self, user_id: &str, now: Timestamp) {
        self.state.lock().presence.heartbeat(user_id, now);
    }

    /// Users active within the configured presence TTL. Evicts stale ones.
    pub fn active_count(&self, now: Timestamp) -> usize {
        self.state
            .lock()
            .presence
            .active_count(now, self.config.presence_ttl())
    }

    /// Sorted ids of active users. Evicts stale ones.
    pub fn active_users(&self, now: Timestamp) -> Vec<String> {
        self.state
            .lock()
            .presence
            .active_users(now, self.config.presence_ttl())
    }

    fn persist(&self, state: &mut TunnelState) -> MeshResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut attempt = 0;
        loop {
            match Self::write(storage, state) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.storage_write_retries => {
                    attempt += 1;
                    warn!(tunnel = %self.id(), attempt, error = %e, "Storage write failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Quarantine rows that failed to load, then save. Nothing is saved
    /// while an unreadable row is still in place.
    fn write(storage: &Storage, state: &mut TunnelState) -> MeshResult<()> {
        while let Some(&part) = state.unreadable.last() {
            storage.quarantine(&state.keys.tunnel_id, part)?;
            state.unreadable.pop();
        }
        storage.save_tunnel(&state.log, &state.ring)
    }
}

/// Look for a copy of `event` already sealed under one of its sender's
/// earlier keys.
///
/// Candidate epochs are those of live records with the same sender and
/// creation time, plus the step before the newest key, whose record may
/// already be purged.
fn find_resubmit(
    log: &EventLog,
    ring: &KeyRing,
    schedule: &KeySchedule,
    event: &NewEvent,
    base: &SymmetricKey,
    signer: &dyn Signer,
) -> MeshResult<Option<EventRecord>> {
    let mut epochs: BTreeSet<u64> = log
        .records()
        .iter()
        .filter(|r| r.sender == event.sender && r.created_at == event.created_at)
        .filter_map(|r| r.key_epoch)
        .collect();
    if let Some((epoch, _)) = schedule.previous() {
        epochs.insert(epoch);
    }

    for epoch in epochs {
        let Some(key) = ring.key_for(base, &event.sender, epoch) else {
            continue;
        };
        let sealed = log.seal(event, &key, Some(epoch), signer)?;
        if log.has_seen(&sealed.id) {
            return Ok(Some(log.get(&sealed.id).cloned().unwrap_or(sealed)));
        }
    }
    Ok(None)
}

/// Decrypt every record, replaying evolving key chains sender by sender in
/// epoch order. Returns the contents in record order and whether the ring
/// learned new keys.
fn decrypt_all(
    records: &[EventRecord],
    base: &SymmetricKey,
    ring: &mut KeyRing,
) -> (Vec<SignalContent>, bool) {
    let mut contents: Vec<Option<SignalContent>> = vec![None; records.len()];

    for (slot, record) in contents.iter_mut().zip(records) {
        if record.key_epoch.is_none() {
            *slot = Some(decrypt_with(record, base));
        }
    }

    let mut evolving: Vec<usize> = (0..records.len())
        .filter(|&i| records[i].key_epoch.is_some())
        .collect();
    evolving.sort_by(|&a, &b| {
        (&records[a].sender, records[a].key_epoch).cmp(&(&records[b].sender, records[b].key_epoch))
    });

    let mut learned = false;
    for index in evolving {
        let record = &records[index];
        let epoch = record.key_epoch.unwrap_or_default();
        let content = match ring.key_for(base, &record.sender, epoch) {
            Some(key) => {
                let content = decrypt_with(record, &key);
                if let SignalContent::Decrypted(plaintext) = &content {
                    learned |= ring.accept(base, &record.sender, epoch, plaintext);
                }
                content
            }
            None => SignalContent::Corrupted(format!(
                "no key for epoch {} of sender {}",
                epoch, record.sender
            )),
        };
        contents[index] = Some(content);
    }

    let contents = contents
        .into_iter()
        .map(|c| c.unwrap_or_else(|| SignalContent::Corrupted("not decrypted".to_string())))
        .collect();
    (contents, learned)
}

fn decrypt_with(record: &EventRecord, key: &SymmetricKey) -> SignalContent {
    match EventLog::decrypt_one(record, key) {
        Ok(plaintext) => SignalContent::Decrypted(plaintext),
        Err(e) => {
            debug!(id = %record.id, error = %e, "Record could not be decrypted");
            SignalContent::Corrupted(e.to_string())
        }
    }
}
