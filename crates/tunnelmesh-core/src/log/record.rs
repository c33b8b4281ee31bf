//! Event records and their canonical encodings.
//!
//! ```text
//! EventRecord:
//! ┌──────────────────────────────────────────────────────────────┐
//! │  tunnel_id, sender, media_kind, title     cleartext metadata │
//! │  created_at, expires_at, key_epoch        unix ms / epoch    │
//! │  fragments: [b64; 3]                      sealed payload     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  signature = Sign(postcard(all of the above))                │
//! │  id        = BLAKE3(sender, fragments, created_at, signature)│
//! ├──────────────────────────────────────────────────────────────┤
//! │  chain_digest (node-local, neither signed nor hashed)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::crypto::EnvelopeFragments;
use crate::error::{MeshError, MeshResult};
use crate::identity::Verifier;
use crate::keys::TunnelId;

use super::chain::ChainDigest;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Domain tag mixed into the signed bytes
const SIGNING_DOMAIN: &str = "tunnelmesh.v1.record";

/// Domain tag mixed into record ids
const ID_DOMAIN: &[u8] = b"tunnelmesh.v1.record-id";

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Caller-declared media type of a payload.
///
/// The original tag is kept verbatim; the variant only tells a renderer what
/// kind of content to expect. `"text"` must match exactly, the other kinds
/// match on substring (`"image/png"` is an image).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MediaKind {
    /// Plain UTF-8 text (tag `"text"`)
    Text,
    /// Tag contains `image`
    Image(String),
    /// Tag contains `video`
    Video(String),
    /// Tag contains `audio`
    Audio(String),
    /// Anything else
    Other(String),
}

impl MediaKind {
    /// Classify a tag.
    pub fn from_tag(tag: &str) -> Self {
        if tag == "text" {
            MediaKind::Text
        } else if tag.contains("image") {
            MediaKind::Image(tag.to_string())
        } else if tag.contains("video") {
            MediaKind::Video(tag.to_string())
        } else if tag.contains("audio") {
            MediaKind::Audio(tag.to_string())
        } else {
            MediaKind::Other(tag.to_string())
        }
    }

    /// The tag exactly as the caller declared it.
    pub fn as_tag(&self) -> &str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Image(tag)
            | MediaKind::Video(tag)
            | MediaKind::Audio(tag)
            | MediaKind::Other(tag) => tag,
        }
    }

    /// Whether the payload is text.
    pub fn is_text(&self) -> bool {
        matches!(self, MediaKind::Text)
    }
}

impl From<String> for MediaKind {
    fn from(tag: String) -> Self {
        MediaKind::from_tag(&tag)
    }
}

impl From<MediaKind> for String {
    fn from(kind: MediaKind) -> Self {
        kind.as_tag().to_string()
    }
}

/// A message about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Sender identifier
    pub sender: String,
    /// Declared media type
    pub media_kind: MediaKind,
    /// Optional caption
    pub title: Option<String>,
    /// Raw payload bytes
    pub plaintext: Vec<u8>,
    /// Creation time (unix ms)
    pub created_at: Timestamp,
    /// Lifetime after `created_at`
    pub ttl: Option<Duration>,
}

impl NewEvent {
    /// A text message.
    pub fn text(sender: impl Into<String>, text: &str, created_at: Timestamp) -> Self {
        Self::media(sender, MediaKind::Text, text.as_bytes().to_vec(), created_at)
    }

    /// A payload of any media kind.
    pub fn media(
        sender: impl Into<String>,
        media_kind: MediaKind,
        plaintext: Vec<u8>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            sender: sender.into(),
            media_kind,
            title: None,
            plaintext,
            created_at,
            ttl: None,
        }
    }

    /// Attach a caption.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Expire the message `ttl` after creation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Absolute expiry time, if any.
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.ttl.map(|ttl| {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            self.created_at.saturating_add(millis)
        })
    }
}

/// One signed, encrypted entry of a tunnel log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Content hash (hex BLAKE3)
    pub id: String,
    /// Owning tunnel
    pub tunnel_id: TunnelId,
    /// Sender identifier (node public id in identity signing mode)
    pub sender: String,
    /// Encrypted payload, split in three
    pub fragments: EnvelopeFragments,
    /// Declared media type
    pub media_kind: MediaKind,
    /// Optional caption (cleartext)
    pub title: Option<String>,
    /// Creation time (unix ms)
    pub created_at: Timestamp,
    /// Expiry time (unix ms); expired records are purged on listing
    pub expires_at: Option<Timestamp>,
    /// Position in the sender's evolving key chain
    #[serde(default)]
    pub key_epoch: Option<u64>,
    /// Signature over the canonical record bytes (hex)
    pub signature: String,
    /// Running digest of the local hash chain
    #[serde(default)]
    pub chain_digest: Option<ChainDigest>,
}

#[derive(Serialize)]
struct SigningView<'a> {
    domain: &'a str,
    tunnel_id: &'a str,
    sender: &'a str,
    fragments: [&'a [u8]; 3],
    media_kind: &'a str,
    title: Option<&'a str>,
    created_at: Timestamp,
    expires_at: Option<Timestamp>,
    key_epoch: Option<u64>,
}

#[derive(Serialize)]
struct IdView<'a> {
    sender: &'a str,
    fragments: [&'a [u8]; 3],
    created_at: Timestamp,
    signature: &'a str,
}

/// Record fields before signing.
pub(crate) struct UnsignedRecord<'a> {
    pub tunnel_id: &'a TunnelId,
    pub sender: &'a str,
    pub fragments: &'a EnvelopeFragments,
    pub media_kind: &'a MediaKind,
    pub title: Option<&'a str>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub key_epoch: Option<u64>,
}

impl UnsignedRecord<'_> {
    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        let [a, b, c] = self.fragments.parts();
        let view = SigningView {
            domain: SIGNING_DOMAIN,
            tunnel_id: self.tunnel_id.as_str(),
            sender: self.sender,
            fragments: [a.as_slice(), b.as_slice(), c.as_slice()],
            media_kind: self.media_kind.as_tag(),
            title: self.title,
            created_at: self.created_at,
            expires_at: self.expires_at,
            key_epoch: self.key_epoch,
        };
        postcard::to_allocvec(&view)
            .map_err(|e| MeshError::Serialization(format!("Failed to encode record: {}", e)))
    }
}

impl EventRecord {
    fn unsigned(&self) -> UnsignedRecord<'_> {
        UnsignedRecord {
            tunnel_id: &self.tunnel_id,
            sender: &self.sender,
            fragments: &self.fragments,
            media_kind: &self.media_kind,
            title: self.title.as_deref(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            key_epoch: self.key_epoch,
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        self.unsigned().signing_bytes()
    }

    /// Compute a record id from its identifying fields.
    pub fn compute_id(
        sender: &str,
        fragments: &EnvelopeFragments,
        created_at: Timestamp,
        signature: &str,
    ) -> MeshResult<String> {
        let [a, b, c] = fragments.parts();
        let view = IdView {
            sender,
            fragments: [a.as_slice(), b.as_slice(), c.as_slice()],
            created_at,
            signature,
        };
        let bytes = postcard::to_allocvec(&view)
            .map_err(|e| MeshError::Serialization(format!("Failed to encode record id: {}", e)))?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(ID_DOMAIN);
        hasher.update(&bytes);
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Whether the stored id matches the record's content.
    pub fn has_consistent_id(&self) -> bool {
        Self::compute_id(&self.sender, &self.fragments, self.created_at, &self.signature)
            .map(|id| id == self.id)
            .unwrap_or(false)
    }

    /// Check the signature with the given scheme.
    pub fn verify_signature(&self, verifier: &dyn Verifier) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => verifier.verify(&self.sender, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// The reassembled ciphertext blob.
    pub fn ciphertext(&self) -> Vec<u8> {
        self.fragments.join()
    }
}
