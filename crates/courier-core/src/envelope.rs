//! Courier wire envelope and the codec that produces and consumes it.
//!
//! Every publish carries exactly one `Envelope` serialized as a JSON object.
//! The envelope wraps one fragment of a logical message plus the metadata
//! needed to order, decrypt, and correlate it:
//!
//! ```text
//! { data, seq, sequenceIndex, totalFragments, isLastFragment,
//!   payloadKind, isEncrypted, isBase64, contentHash, originId, isError }
//! ```
//!
//! File transfers are the one exception to "one publish per fragment": the
//! metadata travels in an envelope on `{topic}` while the raw bytes travel
//! unwrapped on `{topic}/file`, correlated by `contentHash`.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::FragmentationConfig;
use crate::crypto::{self, CryptoError, SecretKey};
use crate::fragment::{self, FragmentError};

/// Sequence numbers wrap back to zero after this value.
/// Kept under `i32::MAX` so non-Rust peers can hold it in a signed 32-bit int.
pub const MAX_SEQ: u64 = 2_147_483_640;

// ── Wire types ────────────────────────────────────────────────────────────────

/// Payload type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// UTF-8 text, optionally base64-encoded and split into fixed-width chunks.
    Text,
    /// A batch of JSON objects. Each fragment is a self-contained batch.
    Json,
    /// File metadata. The bytes travel separately on the sibling topic.
    File,
}

/// One fragment on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Fragment payload. A base64 string when `is_encrypted`.
    pub data: Value,

    /// Message sequence number shared by every fragment of one send.
    pub seq: u64,

    /// Zero-based position of this fragment.
    pub sequence_index: u32,

    pub total_fragments: u32,

    pub is_last_fragment: bool,

    pub payload_kind: PayloadKind,

    pub is_encrypted: bool,

    /// Text data is base64 of the UTF-8 message (decoded after reassembly).
    #[serde(default)]
    pub is_base64: bool,

    /// Hex BLAKE3 of the raw file bytes. Present iff `payload_kind == File`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Identifier of the sending codec instance.
    pub origin_id: String,

    #[serde(default)]
    pub is_error: bool,
}

impl Envelope {
    /// Check the structural invariants every envelope must satisfy.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.total_fragments == 0 {
            return Err(CodecError::Protocol("totalFragments must be at least 1".into()));
        }
        if self.sequence_index >= self.total_fragments {
            return Err(CodecError::Protocol(format!(
                "sequenceIndex {} out of range for {} fragments",
                self.sequence_index, self.total_fragments
            )));
        }
        if self.is_last_fragment != (self.sequence_index + 1 == self.total_fragments) {
            return Err(CodecError::Protocol(format!(
                "isLastFragment={} inconsistent with fragment {}/{}",
                self.is_last_fragment, self.sequence_index, self.total_fragments
            )));
        }
        let has_hash = self.content_hash.as_deref().is_some_and(|h| !h.is_empty());
        if has_hash != (self.payload_kind == PayloadKind::File) {
            return Err(CodecError::Protocol(format!(
                "contentHash must be present iff payloadKind is file (kind={:?})",
                self.payload_kind
            )));
        }
        Ok(())
    }

    /// Serialize for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate one envelope.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_slice(raw)
            .map_err(|e| CodecError::Protocol(format!("malformed envelope: {e}")))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Metadata half of a file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    /// Origin id of the sender.
    pub sender: String,
    /// Plaintext byte count.
    pub size: u64,
    /// Caller-supplied fields carried through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Vec<Value>),
    File(FileMetadata),
}

/// What to serialize.
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    Text(&'a str),
    Json(&'a [Value]),
    File {
        bytes: &'a [u8],
        filename: &'a str,
        extra: &'a Map<String, Value>,
    },
}

impl Outbound<'_> {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Outbound::Text(_) => PayloadKind::Text,
            Outbound::Json(_) => PayloadKind::Json,
            Outbound::File { .. } => PayloadKind::File,
        }
    }
}

/// Per-send flags that do not depend on the payload kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Base64-encode text before fragmenting it.
    pub encode_base64: bool,
    /// Mark the message as an error report.
    pub is_error: bool,
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Turns payloads into envelopes and back.
///
/// Stateless apart from the message sequence counter, which is atomic so a
/// single codec can be shared by concurrent senders.
#[derive(Debug)]
pub struct Codec {
    origin_id: String,
    limits: FragmentationConfig,
    seq: AtomicU64,
}

impl Codec {
    pub fn new(origin_id: impl Into<String>, limits: FragmentationConfig) -> Self {
        Self {
            origin_id: origin_id.into(),
            limits,
            seq: AtomicU64::new(0),
        }
    }

    /// A codec with a fresh random (UUIDv4) origin id.
    pub fn with_random_origin(limits: FragmentationConfig) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), limits)
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn limits(&self) -> &FragmentationConfig {
        &self.limits
    }

    /// Take the next message sequence number, wrapping after [`MAX_SEQ`].
    pub fn next_seq(&self) -> u64 {
        self.seq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current >= MAX_SEQ { 0 } else { current + 1 })
            })
            .unwrap_or_else(|current| current)
    }

    /// Split `payload` into envelopes, encrypting each fragment when `key` is set.
    ///
    /// Files always produce exactly one metadata envelope; the raw bytes are
    /// the caller's to publish (see [`seal_file_bytes`]).
    pub fn serialize(
        &self,
        payload: Outbound<'_>,
        options: EncodeOptions,
        key: Option<&SecretKey>,
    ) -> Result<Vec<Envelope>, CodecError> {
        let budget = self.limits.max_message_length;
        let kind = payload.kind();
        let mut content_hash = None;
        let mut is_base64 = false;

        let fragments: Vec<Value> = match payload {
            Outbound::Text(text) => {
                let encoded;
                let text = if options.encode_base64 {
                    is_base64 = true;
                    encoded = STANDARD.encode(text.as_bytes());
                    encoded.as_str()
                } else {
                    text
                };
                let chunks = if text.len() > budget {
                    fragment::chunk_str(text, budget)?
                } else {
                    vec![text.to_string()]
                };
                let limit = self.limits.max_fragments();
                if chunks.len() > limit as usize {
                    return Err(CodecError::TooManyFragments {
                        count: chunks.len(),
                        limit,
                    });
                }
                chunks
                    .into_iter()
                    .map(|chunk| seal_value(Value::String(chunk), key))
                    .collect::<Result<_, _>>()?
            }
            Outbound::Json(objects) => {
                let mut batches = fragment::pack_objects(objects, budget)?;
                if batches.is_empty() {
                    batches.push(Vec::new());
                }
                batches
                    .into_iter()
                    .map(|batch| seal_value(Value::Array(batch), key))
                    .collect::<Result<_, _>>()?
            }
            Outbound::File {
                bytes,
                filename,
                extra,
            } => {
                if bytes.len() > self.limits.max_file_bytes {
                    return Err(CodecError::FileTooLarge {
                        size: bytes.len(),
                        limit: self.limits.max_file_bytes,
                    });
                }
                let metadata = FileMetadata {
                    filename: filename.to_string(),
                    sender: self.origin_id.clone(),
                    size: bytes.len() as u64,
                    extra: extra.clone(),
                };
                content_hash = Some(crypto::content_hash(bytes));
                vec![seal_value(serde_json::to_value(metadata)?, key)?]
            }
        };

        let total = u32::try_from(fragments.len())
            .map_err(|_| CodecError::Protocol("fragment count exceeds u32".into()))?;
        let seq = self.next_seq();

        Ok(fragments
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                let index = index as u32;
                Envelope {
                    data,
                    seq,
                    sequence_index: index,
                    total_fragments: total,
                    is_last_fragment: index + 1 == total,
                    payload_kind: kind,
                    is_encrypted: key.is_some(),
                    is_base64,
                    content_hash: content_hash.clone(),
                    origin_id: self.origin_id.clone(),
                    is_error: options.is_error,
                }
            })
            .collect())
    }

    /// Single-shot decode of a plaintext envelope.
    ///
    /// Only single-fragment, non-file envelopes are supported here.
    /// Multi-fragment text and file transfers need the stateful receive path.
    pub fn deserialize(&self, raw: &[u8]) -> Result<Payload, CodecError> {
        self.deserialize_with_key(raw, None)
    }

    /// Like [`Codec::deserialize`], decrypting with `key` when needed.
    pub fn deserialize_with_key(
        &self,
        raw: &[u8],
        key: Option<&SecretKey>,
    ) -> Result<Payload, CodecError> {
        let envelope = Envelope::from_bytes(raw)?;
        if envelope.total_fragments > 1 {
            return Err(CodecError::Protocol(format!(
                "multi-part messages are not supported by single-shot decode ({} fragments)",
                envelope.total_fragments
            )));
        }
        if envelope.payload_kind == PayloadKind::File {
            return Err(CodecError::Protocol(
                "file metadata must go through the file transfer coordinator".into(),
            ));
        }
        let data = open_fragment(&envelope, key)?;
        into_payload(envelope.payload_kind, data, envelope.is_base64)
    }
}

// ── Fragment helpers ──────────────────────────────────────────────────────────

/// Parse and validate one inbound envelope without interpreting its data.
pub fn decode_envelope(raw: &[u8]) -> Result<Envelope, CodecError> {
    Envelope::from_bytes(raw)
}

// ── Sealing ───────────────────────────────────────────────────────────────────

fn seal_value(value: Value, key: Option<&SecretKey>) -> Result<Value, CodecError> {
    let Some(key) = key else {
        return Ok(value);
    };
    let sealed = match &value {
        Value::String(text) => crypto::seal_str(key, text)?,
        other => crypto::seal_json(key, other)?,
    };
    Ok(Value::String(sealed))
}

/// Return the plaintext `data` of one fragment.
///
/// Encrypted fragments need `key`; text decrypts back to a string, JSON and
/// file metadata are re-parsed.
pub fn open_fragment(envelope: &Envelope, key: Option<&SecretKey>) -> Result<Value, CodecError> {
    if !envelope.is_encrypted {
        return Ok(envelope.data.clone());
    }
    let key = key.ok_or(CodecError::MissingKey)?;
    let Value::String(sealed) = &envelope.data else {
        return Err(CodecError::Protocol(
            "encrypted data must be a base64 string".into(),
        ));
    };
    match envelope.payload_kind {
        PayloadKind::Text => Ok(Value::String(crypto::open_str(key, sealed)?)),
        PayloadKind::Json | PayloadKind::File => Ok(crypto::open_json(key, sealed)?),
    }
}

/// Interpret complete plaintext `data` as a payload of `kind`.
///
/// For text, `data` is the full message (all fragments joined).
pub fn into_payload(kind: PayloadKind, data: Value, is_base64: bool) -> Result<Payload, CodecError> {
    match kind {
        PayloadKind::Text => {
            let Value::String(text) = data else {
                return Err(CodecError::Protocol("text data must be a string".into()));
            };
            Ok(Payload::Text(decode_text(text, is_base64)?))
        }
        PayloadKind::Json => match data {
            Value::Array(objects) => Ok(Payload::Json(objects)),
            _ => Err(CodecError::Protocol("json data must be an array".into())),
        },
        PayloadKind::File => Ok(Payload::File(
            serde_json::from_value(data)
                .map_err(|e| CodecError::Protocol(format!("invalid file metadata: {e}")))?,
        )),
    }
}

/// Undo the optional base64 layer of a reassembled text message.
pub fn decode_text(text: String, is_base64: bool) -> Result<String, CodecError> {
    if !is_base64 {
        return Ok(text);
    }
    let bytes = STANDARD
        .decode(text.as_bytes())
        .map_err(|e| CodecError::Protocol(format!("invalid base64 text: {e}")))?;
    String::from_utf8(bytes).map_err(|_| CodecError::Protocol("base64 text is not UTF-8".into()))
}

/// Encrypt raw file bytes for the sibling topic.
pub fn seal_file_bytes(key: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    Ok(crypto::encrypt(key, bytes)?)
}

/// Decrypt raw file bytes received on the sibling topic.
pub fn open_file_bytes(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
    Ok(crypto::decrypt(key, sealed)?)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error("file payload is {size} bytes, limit is {limit}")]
    FileTooLarge { size: usize, limit: usize },

    #[error("text needs {count} fragments, limit is {limit}")]
    TooManyFragments { count: usize, limit: u32 },

    #[error("envelope is encrypted but no key is available")]
    MissingKey,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// True for the "payload does not fit the configured budget" family.
    pub fn is_oversize(&self) -> bool {
        matches!(
            self,
            CodecError::Fragment(FragmentError::OversizeObject { .. })
                | CodecError::FileTooLarge { .. }
                | CodecError::TooManyFragments { .. }
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
