//! Payload fragmentation and digest-checked reassembly.
//!
//! A payload larger than the transport's maximum message size is split into
//! an ordered run of fragment envelopes followed by a terminator carrying
//! the total count and an MD5 digest of the concatenation. Fragments may
//! arrive in any order and fragment sets for distinct response ids
//! interleave freely; a set commits only when every index is present and
//! the digest matches.

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment set {response_id} incomplete: {present}/{total} fragments")]
    Incomplete {
        response_id: String,
        present: usize,
        total: usize,
    },

    #[error("fragment set {response_id} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        response_id: String,
        expected: String,
        actual: String,
    },

    #[error("unknown fragment set {0}")]
    UnknownResponse(String),

    #[error("invalid fragment: {0}")]
    Invalid(String),
}

/// Hex MD5 over a byte slice, as carried in the checksum property.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Split `data` into contiguous slices of at most `max_fragment_size` bytes.
///
/// Always yields at least one slice; all slices are non-empty for non-empty
/// input and only the last may be shorter.
pub fn split(data: &Bytes, max_fragment_size: usize) -> Vec<Bytes> {
    if data.len() <= max_fragment_size {
        return vec![data.clone()];
    }
    let mut slices = Vec::with_capacity(data.len().div_ceil(max_fragment_size));
    let mut offset = 0;
    while offset < data.len() {
        let end = usize::min(offset + max_fragment_size, data.len());
        slices.push(data.slice(offset..end));
        offset = end;
    }
    slices
}

/// Buffers fragments per response id until each set's terminator commits it.
///
/// One assembler belongs to one call; dropping the assembler garbage
/// collects every uncommitted set with it.
#[derive(Default)]
pub struct FragmentAssembler {
    sets: HashMap<String, BTreeMap<u32, Bytes>>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Buffer one fragment. Duplicate (response id, index) pairs are no-ops.
    pub fn add(&mut self, response_id: &str, index: i32, data: Bytes) -> Result<(), FragmentError> {
        let index = u32::try_from(index)
            .map_err(|_| FragmentError::Invalid(format!("negative fragment index {index}")))?;
        self.sets
            .entry(response_id.to_string())
            .or_default()
            .entry(index)
            .or_insert(data);
        Ok(())
    }

    /// Commit a fragment set: succeeds only when all indices [0, total) are
    /// present and the digest over the concatenation matches. The set is
    /// consumed either way; a failed set is dropped whole.
    pub fn reassemble(
        &mut self,
        response_id: &str,
        total: i32,
        expected_md5: &str,
    ) -> Result<Bytes, FragmentError> {
        let set = self
            .sets
            .remove(response_id)
            .ok_or_else(|| FragmentError::UnknownResponse(response_id.to_string()))?;
        let total = usize::try_from(total)
            .map_err(|_| FragmentError::Invalid(format!("negative fragment total {total}")))?;

        if set.len() != total || set.keys().last().map(|k| *k as usize) != total.checked_sub(1) {
            return Err(FragmentError::Incomplete {
                response_id: response_id.to_string(),
                present: set.len(),
                total,
            });
        }

        let mut assembled = BytesMut::with_capacity(set.values().map(Bytes::len).sum());
        for fragment in set.values() {
            assembled.extend_from_slice(fragment);
        }
        let assembled = assembled.freeze();

        let actual = md5_hex(&assembled);
        if !actual.eq_ignore_ascii_case(expected_md5) {
            return Err(FragmentError::DigestMismatch {
                response_id: response_id.to_string(),
                expected: expected_md5.to_string(),
                actual,
            });
        }
        Ok(assembled)
    }
}
