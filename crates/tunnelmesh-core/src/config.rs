//! Node configuration.
//!
//! Loaded from `config.json` in the data directory when present; every field
//! has a default so a partial file is valid.

use crate::error::{MeshError, MeshResult};
use crate::keys::{
    DEFAULT_KDF_ITERATIONS, DEFAULT_TUNNEL_ID_LEN, MAX_TUNNEL_ID_LEN, MIN_KDF_ITERATIONS,
    MIN_TUNNEL_ID_LEN,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the symmetric key of a tunnel behaves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// One key per secret for the lifetime of the tunnel
    #[default]
    Static,
    /// Each sender's key is re-derived after every message they send
    Evolving,
}

/// Which key signs event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// HMAC keyed from the tunnel secret; anyone in the tunnel can verify
    #[default]
    SharedKey,
    /// Ed25519 signature with the node's persisted identity; the sender is
    /// the node's public id
    NodeIdentity,
}

/// Configuration for a tunnelmesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Number of hex characters in a tunnel id (12..=20)
    pub tunnel_id_len: usize,
    /// PBKDF2 iterations for the tunnel key (>= 100 000)
    pub kdf_iterations: u32,
    /// Static or evolving keys
    pub key_mode: KeyMode,
    /// Record signing scheme
    pub signing: SigningMode,
    /// Whether appended records are linked into the local hash chain
    pub chain_digests: bool,
    /// Presence entries older than this are considered gone
    pub presence_ttl_secs: u64,
    /// TTL applied to messages sent without an explicit one
    pub default_message_ttl_secs: Option<u64>,
    /// Extra attempts for a failed storage write before surfacing the error
    pub storage_write_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tunnel_id_len: DEFAULT_TUNNEL_ID_LEN,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            key_mode: KeyMode::Static,
            signing: SigningMode::SharedKey,
            chain_digests: true,
            presence_ttl_secs: 30,
            default_message_ttl_secs: None,
            storage_write_retries: 2,
        }
    }
}

impl MeshConfig {
    /// File name looked up inside a node's data directory.
    pub const FILE_NAME: &'static str = "config.json";

    /// Check that every value is inside its supported range.
    pub fn validate(&self) -> MeshResult<()> {
        if !(MIN_TUNNEL_ID_LEN..=MAX_TUNNEL_ID_LEN).contains(&self.tunnel_id_len) {
            return Err(MeshError::InvalidConfig(format!(
                "tunnel_id_len must be between {} and {} (got {})",
                MIN_TUNNEL_ID_LEN, MAX_TUNNEL_ID_LEN, self.tunnel_id_len
            )));
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(MeshError::InvalidConfig(format!(
                "kdf_iterations must be at least {} (got {})",
                MIN_KDF_ITERATIONS, self.kdf_iterations
            )));
        }
        if self.presence_ttl_secs == 0 {
            return Err(MeshError::InvalidConfig(
                "presence_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: MeshConfig = serde_json::from_slice(&bytes)
            .map_err(|e| MeshError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.json` from a data directory, falling back to defaults
    /// when the file does not exist.
    pub fn load_or_default(data_dir: impl AsRef<Path>) -> MeshResult<Self> {
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> MeshResult<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }

    /// Presence TTL as a duration.
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    /// Default message TTL as a duration.
    pub fn default_message_ttl(&self) -> Option<Duration> {
        self.default_message_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_short_tunnel_id() {
        let config = MeshConfig {
            tunnel_id_len: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_weak_kdf() {
        let config = MeshConfig {
            kdf_iterations: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MeshConfig::FILE_NAME),
            r#"{ "key_mode": "evolving", "tunnel_id_len": 20 }"#,
        )
        .unwrap();

        let config = MeshConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.key_mode, KeyMode::Evolving);
        assert_eq!(config.tunnel_id_len, 20);
        assert_eq!(config.kdf_iterations, DEFAULT_KDF_ITERATIONS);
        assert_eq!(config.signing, SigningMode::SharedKey);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = MeshConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MeshConfig::FILE_NAME);
        let config = MeshConfig {
            signing: SigningMode::NodeIdentity,
            default_message_ttl_secs: Some(60),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(MeshConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MeshConfig::FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            MeshConfig::load(&path),
            Err(MeshError::InvalidConfig(_))
        ));
    }
}
