//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The node identity (Ed25519 seed)
//! - Tunnel logs (JSON snapshots, one row per tunnel)
//! - Per-sender key rings of evolving tunnels
//! - Quarantined rows that could not be read back
//!
//! A tunnel's log and its key ring are written in the same transaction, so
//! they never disagree after a crash. A row that fails to load is moved to
//! the quarantine table before anything is written in its place.

use crate::error::{MeshError, MeshResult};
use crate::identity::NodeIdentity;
use crate::keys::{KeyRing, TunnelId};
use crate::log::{now_millis, EventLog};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const TUNNEL_LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnel_logs");
const KEY_RINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("key_rings");
const QUARANTINE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("quarantine");

/// Which per-tunnel row a quarantine applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredPart {
    Log,
    Ring,
}

impl StoredPart {
    fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            StoredPart::Log => TUNNEL_LOGS_TABLE,
            StoredPart::Ring => KEY_RINGS_TABLE,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StoredPart::Log => "log",
            StoredPart::Ring => "ring",
        }
    }
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    #[cfg(test)]
    fail_writes: Arc<std::sync::atomic::AtomicUsize>,
}

impl Storage {
    /// File name of the database inside a data directory
    pub const FILE_NAME: &'static str = "tunnelmesh.redb";

    /// Identity storage key (there's only one identity per node)
    const IDENTITY_KEY: &'static str = "node_identity";

    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(TUNNEL_LOGS_TABLE)?;
            let _ = write_txn.open_table(KEY_RINGS_TABLE)?;
            let _ = write_txn.open_table(QUARANTINE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            #[cfg(test)]
            fail_writes: Arc::default(),
        })
    }

    /// Open the database inside a data directory.
    pub fn open_dir(data_dir: impl AsRef<Path>) -> MeshResult<Self> {
        Self::new(data_dir.as_ref().join(Self::FILE_NAME))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the node identity, creating and saving one on first use.
    ///
    /// The check and the insert share one write transaction. redb serializes
    /// write transactions, so concurrent first calls all end up with the
    /// identity of whichever committed first.
    pub fn load_or_create_identity(&self) -> MeshResult<NodeIdentity> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let identity = {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            let existing = table
                .get(Self::IDENTITY_KEY)?
                .map(|v| NodeIdentity::from_bytes(v.value()))
                .transpose()?;
            match existing {
                Some(identity) => identity,
                None => {
                    let identity = NodeIdentity::generate()?;
                    table.insert(Self::IDENTITY_KEY, &identity.to_bytes()[..])?;
                    tracing::info!(node = %identity.short_id(), "Created node identity");
                    identity
                }
            }
        };
        write_txn.commit()?;
        Ok(identity)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tunnel Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a tunnel's log together with its key ring.
    ///
    /// Overwrites whatever was stored for the tunnel before.
    pub fn save_tunnel(&self, log: &EventLog, ring: &KeyRing) -> MeshResult<()> {
        #[cfg(test)]
        self.maybe_fail()?;

        let key = log.tunnel_id().as_str();
        let log_data =
            serde_json::to_vec(log).map_err(|e| MeshError::Serialization(e.to_string()))?;
        let ring_data =
            serde_json::to_vec(ring).map_err(|e| MeshError::Serialization(e.to_string()))?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut logs = write_txn.open_table(TUNNEL_LOGS_TABLE)?;
            let mut keys = write_txn.open_table(KEY_RINGS_TABLE)?;
            logs.insert(key, log_data.as_slice())?;
            keys.insert(key, ring_data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a tunnel's log.
    ///
    /// Returns `None` if nothing was stored for the tunnel yet.
    pub fn load_log(&self, tunnel_id: &TunnelId) -> MeshResult<Option<EventLog>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TUNNEL_LOGS_TABLE)?;

        match table.get(tunnel_id.as_str())? {
            Some(v) => {
                let log: EventLog = serde_json::from_slice(v.value())
                    .map_err(|e| MeshError::Serialization(e.to_string()))?;
                if log.tunnel_id() != tunnel_id {
                    return Err(MeshError::Storage(format!(
                        "Stored log for {} belongs to {}",
                        tunnel_id,
                        log.tunnel_id()
                    )));
                }
                Ok(Some(log))
            }
            None => Ok(None),
        }
    }

    /// Load a tunnel's key ring (empty if none was stored).
    pub fn load_ring(&self, tunnel_id: &TunnelId) -> MeshResult<KeyRing> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEY_RINGS_TABLE)?;

        match table.get(tunnel_id.as_str())? {
            Some(v) => serde_json::from_slice(v.value())
                .map_err(|e| MeshError::Serialization(e.to_string())),
            None => Ok(KeyRing::new()),
        }
    }

    /// Ids of all stored tunnels.
    pub fn list_tunnels(&self) -> MeshResult<Vec<TunnelId>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TUNNEL_LOGS_TABLE)?;

        let mut tunnels = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            match TunnelId::parse(key.value()) {
                Ok(id) => tunnels.push(id),
                Err(_) => tracing::warn!(key = key.value(), "Skipping malformed tunnel key"),
            }
        }
        Ok(tunnels)
    }

    /// Delete a tunnel's log and key ring. Returns whether a log was stored.
    pub fn delete_tunnel(&self, tunnel_id: &TunnelId) -> MeshResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut logs = write_txn.open_table(TUNNEL_LOGS_TABLE)?;
            let mut keys = write_txn.open_table(KEY_RINGS_TABLE)?;
            let existed = logs.remove(tunnel_id.as_str())?.is_some();
            keys.remove(tunnel_id.as_str())?;
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quarantine
    // ═══════════════════════════════════════════════════════════════════════

    /// Move a tunnel's stored row into the quarantine table, untouched.
    ///
    /// Returns the quarantine key, or `None` if there was no row. Move and
    /// delete share one transaction.
    pub fn quarantine(&self, tunnel_id: &TunnelId, part: StoredPart) -> MeshResult<Option<String>> {
        #[cfg(test)]
        self.maybe_fail()?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let moved = {
            let mut rows = write_txn.open_table(part.table())?;
            let bytes = rows
                .remove(tunnel_id.as_str())?
                .map(|v| v.value().to_vec());
            match bytes {
                Some(bytes) => {
                    let key = format!("{}/{}/{}", part.as_str(), tunnel_id, now_millis());
                    let mut quarantine = write_txn.open_table(QUARANTINE_TABLE)?;
                    quarantine.insert(key.as_str(), bytes.as_slice())?;
                    Some(key)
                }
                None => None,
            }
        };
        write_txn.commit()?;

        if let Some(key) = &moved {
            tracing::warn!(tunnel = %tunnel_id, key = %key, "Quarantined unreadable row");
        }
        Ok(moved)
    }

    /// Keys of all quarantined rows.
    pub fn quarantined(&self) -> MeshResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(QUARANTINE_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Raw bytes of a quarantined row, for manual recovery.
    pub fn quarantined_row(&self, key: &str) -> MeshResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(QUARANTINE_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Overwrite a stored row with arbitrary bytes.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, tunnel_id: &TunnelId, part: StoredPart, bytes: &[u8]) {
        let db = self.db.read();
        let write_txn = db.begin_write().unwrap();
        {
            let mut rows = write_txn.open_table(part.table()).unwrap();
            rows.insert(tunnel_id.as_str(), bytes).unwrap();
        }
        write_txn.commit().unwrap();
    }

    /// Raw bytes of a stored row.
    #[cfg(test)]
    pub(crate) fn get_raw(&self, tunnel_id: &TunnelId, part: StoredPart) -> Option<Vec<u8>> {
        let db = self.db.read();
        let read_txn = db.begin_read().unwrap();
        let rows = read_txn.open_table(part.table()).unwrap();
        rows.get(tunnel_id.as_str()).unwrap().map(|v| v.value().to_vec())
    }

    /// Make the next `n` tunnel writes fail.
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&self, n: usize) {
        self.fail_writes
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn maybe_fail(&self) -> MeshResult<()> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(MeshError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}
