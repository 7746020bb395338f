//! File transfer: correlating metadata envelopes with raw-byte payloads.
//!
//! A file send publishes two independent messages: a metadata envelope on
//! `{topic}` and the raw bytes on `{topic}/file`. The transport orders each
//! topic on its own, so either half may arrive first. The coordinator keys
//! both halves by content hash (BLAKE3 of the plaintext bytes):
//!
//! ```text
//! Unseen ──metadata──▶ MetadataOnly ──bytes────▶ Complete (entry deleted)
//! Unseen ──bytes─────▶ PayloadOnly  ──metadata─▶ Complete (entry deleted)
//! ```
//!
//! Entries whose partner never shows up are evicted after the TTL, both
//! lazily on every insert and by `reap_expired` which the client's dispatch
//! loop calls periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::crypto;
use courier_core::envelope::FileMetadata;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

/// Default age after which a half-complete transfer is dropped.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// A fully correlated file, handed to the route handler exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub filename: String,
    pub sender: String,
    pub extra: Map<String, Value>,
    pub content_hash: String,
    pub bytes: Bytes,
}

/// Non-fatal timing or consistency problems. Logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationWarning {
    #[error("payload before metadata for {content_hash}")]
    PayloadBeforeMetadata { content_hash: String },

    #[error("duplicate metadata for {content_hash}, keeping the latest")]
    DuplicateMetadata { content_hash: String },

    #[error("duplicate payload for {content_hash}, keeping the latest")]
    DuplicatePayload { content_hash: String },

    #[error("metadata for {content_hash} declares {declared} bytes, received {received}")]
    SizeMismatch {
        content_hash: String,
        declared: u64,
        received: u64,
    },
}

/// Result of feeding one half of a transfer to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Waiting for the other half.
    Pending { warning: Option<CorrelationWarning> },
    /// Both halves present; the entry has been removed.
    Complete {
        file: ReceivedFile,
        warning: Option<CorrelationWarning>,
    },
}

struct PendingFileTransfer {
    metadata: Option<FileMetadata>,
    bytes: Option<Bytes>,
    started_at: Instant,
}

/// Correlates file metadata and raw bytes by content hash.
///
/// Clones share the same correlation map.
#[derive(Clone)]
pub struct FileTransferCoordinator {
    pending: Arc<Mutex<HashMap<String, PendingFileTransfer>>>,
    ttl: Duration,
}

impl Default for FileTransferCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl FileTransferCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Feed a metadata envelope's content.
    pub async fn on_metadata(&self, content_hash: &str, metadata: FileMetadata) -> Correlation {
        self.on_metadata_at(content_hash, metadata, Instant::now()).await
    }

    /// Feed raw (already decrypted) bytes. The content hash is computed here.
    pub async fn on_payload(&self, bytes: Bytes) -> Correlation {
        self.on_payload_at(bytes, Instant::now()).await
    }

    async fn on_metadata_at(
        &self,
        content_hash: &str,
        metadata: FileMetadata,
        now: Instant,
    ) -> Correlation {
        let mut pending = self.pending.lock().await;
        Self::cleanup_stale(&mut pending, self.ttl, now);

        let entry = pending
            .entry(content_hash.to_string())
            .or_insert_with(|| PendingFileTransfer {
                metadata: None,
                bytes: None,
                started_at: now,
            });

        let mut warning = None;
        if entry.metadata.is_some() {
            warning = Some(CorrelationWarning::DuplicateMetadata {
                content_hash: content_hash.to_string(),
            });
        }
        tracing::debug!(
            content_hash = short(content_hash),
            filename = %metadata.filename,
            "file metadata received"
        );
        entry.metadata = Some(metadata);

        Self::complete_if_ready(&mut pending, content_hash, warning)
    }

    async fn on_payload_at(&self, bytes: Bytes, now: Instant) -> Correlation {
        let content_hash = crypto::content_hash(&bytes);
        let mut pending = self.pending.lock().await;
        Self::cleanup_stale(&mut pending, self.ttl, now);

        let mut warning = None;
        let entry = pending.entry(content_hash.clone()).or_insert_with(|| {
            warning = Some(CorrelationWarning::PayloadBeforeMetadata {
                content_hash: content_hash.clone(),
            });
            PendingFileTransfer {
                metadata: None,
                bytes: None,
                started_at: now,
            }
        });

        if entry.bytes.is_some() {
            warning = Some(CorrelationWarning::DuplicatePayload {
                content_hash: content_hash.clone(),
            });
        }
        tracing::debug!(
            content_hash = short(&content_hash),
            bytes = bytes.len(),
            "file payload received"
        );
        entry.bytes = Some(bytes);

        Self::complete_if_ready(&mut pending, &content_hash, warning)
    }

    /// If both halves are present, remove the entry and build the file.
    fn complete_if_ready(
        pending: &mut HashMap<String, PendingFileTransfer>,
        content_hash: &str,
        warning: Option<CorrelationWarning>,
    ) -> Correlation {
        let ready = pending
            .get(content_hash)
            .is_some_and(|p| p.metadata.is_some() && p.bytes.is_some());
        if !ready {
            if let Some(w) = &warning {
                tracing::warn!(warning = %w, "file correlation");
            }
            return Correlation::Pending { warning };
        }

        let Some(PendingFileTransfer {
            metadata: Some(metadata),
            bytes: Some(bytes),
            ..
        }) = pending.remove(content_hash)
        else {
            return Correlation::Pending { warning };
        };

        let received = bytes.len() as u64;
        let warning = if metadata.size != received {
            Some(CorrelationWarning::SizeMismatch {
                content_hash: content_hash.to_string(),
                declared: metadata.size,
                received,
            })
        } else {
            warning
        };
        if let Some(w) = &warning {
            tracing::warn!(warning = %w, "file correlation");
        }

        tracing::info!(
            filename = %metadata.filename,
            sender = %metadata.sender,
            bytes = received,
            "file received and correlated"
        );

        Correlation::Complete {
            file: ReceivedFile {
                filename: metadata.filename,
                sender: metadata.sender,
                extra: metadata.extra,
                content_hash: content_hash.to_string(),
                bytes,
            },
            warning,
        }
    }

    /// Remove entries older than `ttl`.
    fn cleanup_stale(
        pending: &mut HashMap<String, PendingFileTransfer>,
        ttl: Duration,
        now: Instant,
    ) -> usize {
        let before = pending.len();
        pending.retain(|content_hash, transfer| {
            let stale = now.saturating_duration_since(transfer.started_at) > ttl;
            if stale {
                tracing::warn!(
                    content_hash = short(content_hash),
                    has_metadata = transfer.metadata.is_some(),
                    has_payload = transfer.bytes.is_some(),
                    "evicting stale file transfer (timed out)"
                );
            }
            !stale
        });
        before - pending.len()
    }

    /// Evict transfers older than the TTL. Returns how many were removed.
    pub async fn reap_expired(&self) -> usize {
        self.reap_expired_at(Instant::now()).await
    }

    async fn reap_expired_at(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock().await;
        Self::cleanup_stale(&mut pending, self.ttl, now)
    }

    /// Content hashes currently awaiting their other half.
    pub async fn in_progress(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }

    /// Drop a pending transfer. Returns true if one existed.
    pub async fn abandon(&self, content_hash: &str) -> bool {
        let removed = self.pending.lock().await.remove(content_hash).is_some();
        if removed {
            tracing::warn!(content_hash, "file transfer abandoned");
        }
        removed
    }
}

/// Log-friendly hash prefix.
pub(crate) fn short(content_hash: &str) -> &str {
    content_hash.get(..16).unwrap_or(content_hash)
}
