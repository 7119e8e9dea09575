//! Locating the defect block by signature anchoring and delimiter balancing.
//!
//! The signature is a literal unique to the bug. From its first byte the
//! locator walks back (bounded by `lookback`) to the nearest block opener and
//! then forward (bounded by `lookahead`) counting `{`/`}` until the nesting
//! depth returns to zero. Both windows are bounded so corrupted input cannot
//! cause runaway scans.

use crate::artifact::{find_from, rfind_in};
use crate::config::TargetProfile;
use thiserror::Error;
use tracing::debug;

/// A located span `[start, end)` and a copy of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefectBlock {
    pub start: usize,
    pub end: usize,
    pub bytes: Vec<u8>,
}

impl DefectBlock {
    fn from_span(content: &[u8], start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            bytes: content[start..end].to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Lossy text view, for reports and diffs.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("defect signature not found")]
    NotFound,

    #[error("no block opener within {window} bytes before signature at byte {signature_at}")]
    NoOpener { signature_at: usize, window: usize },

    #[error("block opened at byte {start} does not balance within {window} bytes")]
    Unbalanced { start: usize, window: usize },

    #[error("block [{start}, {end}) overlaps the block at byte {other}")]
    Overlapping { start: usize, end: usize, other: usize },

    #[error("block opened at byte {start} closes at byte {end}, before signature at byte {signature_at}")]
    NotEnclosing {
        start: usize,
        end: usize,
        signature_at: usize,
    },
}

impl LocateError {
    /// True for every variant that means "found, but not the expected shape".
    pub fn is_malformed(&self) -> bool {
        !matches!(self, LocateError::NotFound)
    }
}

/// Finds defect blocks according to one [`TargetProfile`].
#[derive(Debug, Clone, Copy)]
pub struct PatternLocator<'a> {
    profile: &'a TargetProfile,
}

impl<'a> PatternLocator<'a> {
    pub fn new(profile: &'a TargetProfile) -> Self {
        Self { profile }
    }

    /// The block around the first signature occurrence.
    pub fn locate_first(&self, content: &[u8]) -> Result<DefectBlock, LocateError> {
        let at = self.next_signature(content, 0).ok_or(LocateError::NotFound)?;
        let block = self.enclosing_block(content, at, 0)?;
        debug!(start = block.start, end = block.end, "located defect block");
        Ok(block)
    }

    /// Every non-overlapping defect block, in content order.
    ///
    /// Exact occurrences of the profile's canonical block are taken first.
    /// Every signature outside them is then balanced on its own, so a binary
    /// that mixes canonical and renamed routines yields all of them.
    pub fn locate_all(&self, content: &[u8]) -> Result<Vec<DefectBlock>, LocateError> {
        let mut blocks = self.canonical_blocks(content);
        let canonical = blocks.len();

        let mut from = 0;
        while let Some(at) = self.next_signature(content, from) {
            if let Some(known) = blocks.iter().find(|b| b.start <= at && at < b.end) {
                from = known.end;
                continue;
            }
            let floor = blocks
                .iter()
                .map(|b| b.end)
                .filter(|&end| end <= at)
                .max()
                .unwrap_or(0);
            let block = self.enclosing_block(content, at, floor)?;
            if let Some(other) = blocks
                .iter()
                .find(|b| b.start < block.end && block.start < b.end)
            {
                return Err(LocateError::Overlapping {
                    start: block.start,
                    end: block.end,
                    other: other.start,
                });
            }
            from = block.end;
            blocks.push(block);
        }

        if blocks.is_empty() {
            return Err(LocateError::NotFound);
        }
        blocks.sort_by_key(|b| b.start);
        debug!(
            canonical,
            scanned = blocks.len() - canonical,
            "located defect blocks"
        );
        Ok(blocks)
    }

    fn canonical_blocks(&self, content: &[u8]) -> Vec<DefectBlock> {
        let Some(canonical) = &self.profile.canonical_block else {
            return Vec::new();
        };
        let canonical = canonical.as_bytes();
        let mut blocks = Vec::new();
        let mut from = 0;
        while let Some(at) = find_from(content, canonical, from) {
            blocks.push(DefectBlock::from_span(content, at, at + canonical.len()));
            from = at + canonical.len();
        }
        blocks
    }

    /// Number of signature occurrences, counting every spelling.
    pub fn count_signatures(&self, content: &[u8]) -> usize {
        let mut count = 0;
        let mut from = 0;
        while let Some(at) = self.next_signature(content, from) {
            count += 1;
            from = at + 1;
        }
        count
    }

    /// Earliest occurrence of any signature spelling at or after `from`.
    fn next_signature(&self, content: &[u8], from: usize) -> Option<usize> {
        self.profile
            .signatures
            .iter()
            .filter_map(|signature| find_from(content, signature.as_bytes(), from))
            .min()
    }

    /// Balance the block around the signature at `signature_at`. The opener
    /// is never searched for before `floor`.
    fn enclosing_block(
        &self,
        content: &[u8],
        signature_at: usize,
        floor: usize,
    ) -> Result<DefectBlock, LocateError> {
        let opener = self.profile.block_opener.as_bytes();
        let window_start = signature_at.saturating_sub(self.profile.lookback).max(floor);
        let start = rfind_in(content, opener, window_start, signature_at).ok_or(
            LocateError::NoOpener {
                signature_at,
                window: self.profile.lookback,
            },
        )?;

        let limit = start.saturating_add(self.profile.lookahead).min(content.len());
        let mut depth = 0usize;
        for (offset, byte) in content[start..limit].iter().enumerate() {
            match byte {
                b'{' => depth += 1,
                b'}' => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + 1;
                        if end <= signature_at {
                            return Err(LocateError::NotEnclosing {
                                start,
                                end,
                                signature_at,
                            });
                        }
                        return Ok(DefectBlock::from_span(content, start, end));
                    }
                }
                _ => {}
            }
        }

        Err(LocateError::Unbalanced {
            start,
            window: self.profile.lookahead,
        })
    }
}
