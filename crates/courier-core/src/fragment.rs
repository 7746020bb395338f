//! Fragmentation: splitting payloads into pieces under a byte budget.
//!
//! Two modes:
//!   - `pack_objects`: greedy bin-packing of JSON objects. Objects are never
//!     split; every batch, serialized as a compact JSON array, is strictly
//!     smaller than the budget.
//!   - `chunk_str`: fixed-width splitting of an already-encoded string
//!     (typically base64), where the receiver concatenates the pieces.

use serde_json::Value;
use thiserror::Error;

/// Compact serialized length of a single JSON value.
fn serialized_len(value: &Value) -> Result<usize, FragmentError> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .map_err(FragmentError::Serialize)
}

/// Serialized length of a compact JSON array holding values whose individual
/// lengths sum to `items_len`: brackets plus one comma between each pair.
fn array_len(items_len: usize, count: usize) -> usize {
    2 + items_len + count.saturating_sub(1)
}

/// Group `objects` into ordered batches whose serialized size is below `budget`.
///
/// Greedy and order-preserving: an object joins the current batch if the
/// batch would still serialize to fewer than `budget` bytes, otherwise it
/// opens a new batch. Deterministic for a given input and budget.
///
/// Fails with [`FragmentError::OversizeObject`] when an object cannot fit
/// even in a batch of its own.
pub fn pack_objects(objects: &[Value], budget: usize) -> Result<Vec<Vec<Value>>, FragmentError> {
    let mut batches = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    let mut current_len = 0usize;

    for (index, obj) in objects.iter().enumerate() {
        let len = serialized_len(obj)?;

        let alone = array_len(len, 1);
        if alone >= budget {
            return Err(FragmentError::OversizeObject {
                index,
                size: alone,
                budget,
            });
        }

        if !current.is_empty() && array_len(current_len + len, current.len() + 1) >= budget {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }

        current.push(obj.clone());
        current_len += len;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Split `s` into pieces of at most `width` bytes.
///
/// Each cut moves back to the previous char boundary, so every piece is valid
/// UTF-8 and ASCII input (base64) is cut into exactly `width`-byte pieces.
/// Fails with [`FragmentError::WidthBelowChar`] when a single character is
/// wider than `width`.
pub fn chunk_str(s: &str, width: usize) -> Result<Vec<String>, FragmentError> {
    if width == 0 {
        return Err(FragmentError::ZeroWidth);
    }
    if s.is_empty() {
        return Ok(vec![String::new()]);
    }

    let mut chunks = Vec::with_capacity(s.len().div_ceil(width));
    let mut rest = s;
    while !rest.is_empty() {
        let mut cut = rest.len().min(width);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            return Err(FragmentError::WidthBelowChar { width });
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    Ok(chunks)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error(
        "object {index} serializes to {size} bytes, budget is {budget}; \
         pre-split it or send it as base64 text"
    )]
    OversizeObject {
        index: usize,
        size: usize,
        budget: usize,
    },

    #[error("chunk width must be non-zero")]
    ZeroWidth,

    #[error("a character is wider than the {width}-byte chunk width")]
    WidthBelowChar { width: usize },

    #[error("failed to serialize object: {0}")]
    Serialize(serde_json::Error),
}
