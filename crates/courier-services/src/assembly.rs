//! Text reassembly for multi-fragment text messages.
//!
//! Text is the only payload kind whose fragments are not independently
//! meaningful: a long string is cut into fixed-width chunks (possibly of a
//! base64 encoding), so the receiver has to collect every chunk before it can
//! decode anything. Fragments are keyed by `(origin_id, seq)`; they may arrive
//! in any order. Incomplete messages are evicted after the TTL.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use courier_core::envelope::{self, CodecError, Envelope, PayloadKind};
use tokio::sync::Mutex;

/// A complete text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledText {
    pub origin_id: String,
    pub seq: u64,
    pub text: String,
    pub is_error: bool,
}

struct PartialText {
    total: u32,
    chunks: BTreeMap<u32, String>,
    is_base64: bool,
    is_error: bool,
    started_at: Instant,
}

/// Collects text fragments until a message is complete.
pub struct TextAssembler {
    partial: Mutex<HashMap<(String, u64), PartialText>>,
    ttl: Duration,
    max_fragments: u32,
}

impl TextAssembler {
    /// Messages claiming more than `max_fragments` pieces are refused.
    pub fn new(ttl: Duration, max_fragments: u32) -> Self {
        Self {
            partial: Mutex::new(HashMap::new()),
            ttl,
            max_fragments,
        }
    }

    /// Add one opened fragment. `chunk` is the plaintext `data` of `envelope`.
    ///
    /// Returns the decoded message once every fragment has been seen.
    pub async fn push(
        &self,
        envelope: &Envelope,
        chunk: String,
    ) -> Result<Option<AssembledText>, CodecError> {
        self.push_at(envelope, chunk, Instant::now()).await
    }

    async fn push_at(
        &self,
        envelope: &Envelope,
        chunk: String,
        now: Instant,
    ) -> Result<Option<AssembledText>, CodecError> {
        if envelope.payload_kind != PayloadKind::Text {
            return Err(CodecError::Protocol(format!(
                "text assembler got a {:?} fragment",
                envelope.payload_kind
            )));
        }

        if envelope.total_fragments == 1 {
            return Ok(Some(AssembledText {
                origin_id: envelope.origin_id.clone(),
                seq: envelope.seq,
                text: envelope::decode_text(chunk, envelope.is_base64)?,
                is_error: envelope.is_error,
            }));
        }

        let total = envelope.total_fragments;
        if total > self.max_fragments {
            return Err(CodecError::Protocol(format!(
                "text message claims {total} fragments, limit is {}",
                self.max_fragments
            )));
        }

        let key = (envelope.origin_id.clone(), envelope.seq);
        let index = envelope.sequence_index;

        let mut partial = self.partial.lock().await;
        Self::cleanup_stale(&mut partial, self.ttl, now);

        let entry = partial.entry(key.clone()).or_insert_with(|| PartialText {
            total,
            chunks: BTreeMap::new(),
            is_base64: envelope.is_base64,
            is_error: envelope.is_error,
            started_at: now,
        });

        if entry.total != total {
            let expected = entry.total;
            partial.remove(&key);
            return Err(CodecError::Protocol(format!(
                "fragment count changed mid-message: {expected} then {total}"
            )));
        }

        if entry.chunks.insert(index, chunk).is_some() {
            tracing::debug!(
                origin_id = %key.0,
                seq = key.1,
                index,
                "duplicate text fragment, replacing"
            );
        }

        if entry.chunks.len() < total as usize {
            return Ok(None);
        }

        let Some(done) = partial.remove(&key) else {
            return Ok(None);
        };
        let joined: String = done.chunks.into_values().collect();
        tracing::debug!(origin_id = %key.0, seq = key.1, fragments = total, "text reassembled");

        Ok(Some(AssembledText {
            origin_id: key.0,
            seq: key.1,
            text: envelope::decode_text(joined, done.is_base64)?,
            is_error: done.is_error,
        }))
    }

    fn cleanup_stale(
        partial: &mut HashMap<(String, u64), PartialText>,
        ttl: Duration,
        now: Instant,
    ) -> usize {
        let before = partial.len();
        partial.retain(|(origin_id, seq), p| {
            let stale = now.saturating_duration_since(p.started_at) > ttl;
            if stale {
                tracing::warn!(
                    origin_id = %origin_id,
                    seq,
                    received = p.chunks.len(),
                    total = p.total,
                    "evicting stale text message (timed out)"
                );
            }
            !stale
        });
        before - partial.len()
    }

    /// Evict incomplete messages older than the TTL.
    pub async fn reap_expired(&self) -> usize {
        self.reap_expired_at(Instant::now()).await
    }

    async fn reap_expired_at(&self, now: Instant) -> usize {
        let mut partial = self.partial.lock().await;
        Self::cleanup_stale(&mut partial, self.ttl, now)
    }

    /// Number of messages still waiting for fragments.
    pub async fn in_progress(&self) -> usize {
        self.partial.lock().await.len()
    }
}
