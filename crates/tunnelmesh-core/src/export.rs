//! Text export of a whole log for manual peer sync.
//!
//! The document is JSON: `{ "version": 1, "exported_at": <unix ms>, "log": {..} }`.
//! Fragments travel as standard base64, digests as hex. A document is checked
//! completely before anything is handed back, so a bad paste never reaches
//! a live log.

use crate::error::{MeshError, MeshResult};
use crate::log::{EventLog, Timestamp};
use serde::{Deserialize, Serialize};

/// Export format version
pub const EXPORT_VERSION: u8 = 1;

/// Serialized form of an exported log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogExport {
    /// Format version (for future compatibility)
    pub version: u8,
    /// When the export was made (unix ms)
    pub exported_at: Timestamp,
    /// The exported log
    pub log: EventLog,
}

impl LogExport {
    /// Wrap a log for export.
    pub fn new(log: EventLog, exported_at: Timestamp) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at,
            log,
        }
    }

    /// Encode as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Serialization` if encoding fails.
    pub fn encode(&self) -> MeshResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MeshError::Serialization(format!("Failed to encode export: {}", e)))
    }

    /// Decode and validate an export document.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::MalformedImport` if:
    /// - The text is not valid JSON or misses fields
    /// - A fragment is not base64 or a record has other than three fragments
    /// - The version is not supported
    /// - The log breaks its structural invariants (see [`EventLog::validate`])
    pub fn decode(s: &str) -> MeshResult<Self> {
        let export: LogExport = serde_json::from_str(s.trim())
            .map_err(|e| MeshError::MalformedImport(format!("Invalid export data: {}", e)))?;

        if export.version != EXPORT_VERSION {
            return Err(MeshError::MalformedImport(format!(
                "Unsupported export version {} (expected {})",
                export.version, EXPORT_VERSION
            )));
        }

        export.log.validate()?;
        Ok(export)
    }
}

/// Export a log as a JSON document.
pub fn export_log(log: &EventLog, exported_at: Timestamp) -> MeshResult<String> {
    LogExport::new(log.clone(), exported_at).encode()
}

/// Parse and validate an exported log.
pub fn import_log(s: &str) -> MeshResult<EventLog> {
    LogExport::decode(s).map(|export| export.log)
}
