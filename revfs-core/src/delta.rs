//! Binary delta codec
//!
//! A delta rebuilds a target text from a source text with two instructions:
//! copy a range of the source, or insert literal bytes. Deltas are computed by
//! indexing the source in fixed-size blocks and extending every block match in
//! both directions.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Size of the blocks the source is indexed by
const BLOCK_SIZE: usize = 16;

/// One delta instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

/// Instructions turning a source text into a target text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub source_len: u64,
    pub target_len: u64,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Compute the delta from `source` to `target`
    pub fn compute(source: &[u8], target: &[u8]) -> Self {
        let mut ops = Vec::new();
        let mut pending: Vec<u8> = Vec::new();

        if source.len() >= BLOCK_SIZE && target.len() >= BLOCK_SIZE {
            let mut index: HashMap<&[u8], usize> = HashMap::new();
            for offset in (0..=source.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
                index.entry(&source[offset..offset + BLOCK_SIZE]).or_insert(offset);
            }

            let mut i = 0;
            while i + BLOCK_SIZE <= target.len() {
                let Some(&offset) = index.get(&target[i..i + BLOCK_SIZE]) else {
                    pending.push(target[i]);
                    i += 1;
                    continue;
                };

                let mut start = offset;
                while start > 0 && pending.last() == Some(&source[start - 1]) {
                    pending.pop();
                    start -= 1;
                }

                let mut src_end = offset + BLOCK_SIZE;
                let mut tgt_end = i + BLOCK_SIZE;
                while src_end < source.len() && tgt_end < target.len() && source[src_end] == target[tgt_end] {
                    src_end += 1;
                    tgt_end += 1;
                }

                if !pending.is_empty() {
                    ops.push(DeltaOp::Insert(std::mem::take(&mut pending)));
                }
                ops.push(DeltaOp::Copy {
                    offset: start as u64,
                    len: (src_end - start) as u64,
                });
                i = tgt_end;
            }
            pending.extend_from_slice(&target[i..]);
        } else {
            pending.extend_from_slice(target);
        }

        if !pending.is_empty() {
            ops.push(DeltaOp::Insert(pending));
        }

        Self {
            source_len: source.len() as u64,
            target_len: target.len() as u64,
            ops,
        }
    }

    /// Rebuild the target text from `source`.
    ///
    /// Fails with `CorruptData` when `source` is not the text the delta was
    /// computed against or an instruction reaches outside it.
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>> {
        if source.len() as u64 != self.source_len {
            return Err(FsError::corrupt(format!(
                "delta expects a {}-byte source, got {} bytes",
                self.source_len,
                source.len()
            )));
        }

        // Check every instruction against the declared lengths before
        // allocating anything
        let mut produced: u64 = 0;
        for op in &self.ops {
            let len = match op {
                DeltaOp::Copy { offset, len } => {
                    if offset.checked_add(*len).is_none_or(|end| end > self.source_len) {
                        return Err(FsError::corrupt(format!(
                            "delta copy {}+{} outside {}-byte source",
                            offset, len, self.source_len
                        )));
                    }
                    *len
                }
                DeltaOp::Insert(data) => data.len() as u64,
            };
            produced = produced.saturating_add(len);
        }
        if produced != self.target_len {
            return Err(FsError::corrupt(format!(
                "delta produces {} bytes, expected {}",
                produced, self.target_len
            )));
        }

        let mut out = Vec::with_capacity(self.target_len as usize);
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    out.extend_from_slice(&source[*offset as usize..(*offset + *len) as usize]);
                }
                DeltaOp::Insert(data) => out.extend_from_slice(data),
            }
        }
        Ok(out)
    }

    /// Bytes of literal data carried by the delta
    pub fn inserted_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Insert(data) => data.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| FsError::corrupt(format!("undecodable delta: {}", e)))
    }
}
