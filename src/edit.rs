use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Byte-span replacement with a check on what the span held.
///
/// Every substitution the patcher makes goes through this primitive. Spans
/// always refer to the content as originally read, never to a partially
/// rewritten buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Splice does nothing until applied"]
pub struct Splice {
    /// Starting byte offset (inclusive)
    pub start: usize,
    /// Ending byte offset (exclusive)
    pub end: usize,
    pub replacement: Vec<u8>,
    pub expected: SpanCheck,
}

/// What the span must contain before it may be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanCheck {
    Exact(Vec<u8>),
    /// xxh3 of the expected bytes, for large spans
    Hash(u64),
}

impl SpanCheck {
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            SpanCheck::Exact(expected) => bytes == expected.as_slice(),
            SpanCheck::Hash(expected) => xxh3_64(bytes) == *expected,
        }
    }

    /// Exact for spans up to 1KB, hashed above that.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() > 1024 {
            SpanCheck::Hash(xxh3_64(bytes))
        } else {
            SpanCheck::Exact(bytes.to_vec())
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("span [{start}, {end}) no longer holds the expected bytes")]
    SpanMismatch { start: usize, end: usize },

    #[error("invalid byte range [{start}, {end}) in content of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("splices overlap at byte {at}")]
    Overlap { at: usize },

    #[error("{path} has no parent directory")]
    NoParent { path: PathBuf },

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Splice {
    /// Replace `expected` at `start` with `replacement`.
    pub fn new(start: usize, expected: &[u8], replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            start,
            end: start + expected.len(),
            replacement: replacement.into(),
            expected: SpanCheck::from_bytes(expected),
        }
    }

    pub fn is_length_preserving(&self) -> bool {
        self.replacement.len() == self.end - self.start
    }

    fn validate(&self, content: &[u8]) -> Result<(), EditError> {
        if self.start > self.end || self.end > content.len() {
            return Err(EditError::InvalidRange {
                start: self.start,
                end: self.end,
                len: content.len(),
            });
        }
        if !self.expected.matches(&content[self.start..self.end]) {
            return Err(EditError::SpanMismatch {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Apply every splice to `content` and return the new buffer.
///
/// All spans are validated against the original content before anything is
/// built; overlapping spans are rejected.
pub fn apply_splices(content: &[u8], splices: &[Splice]) -> Result<Vec<u8>, EditError> {
    let mut ordered: Vec<&Splice> = splices.iter().collect();
    ordered.sort_by_key(|s| s.start);

    for splice in &ordered {
        splice.validate(content)?;
    }
    for pair in ordered.windows(2) {
        if pair[0].end > pair[1].start {
            return Err(EditError::Overlap { at: pair[1].start });
        }
    }

    let grown: usize = ordered.iter().map(|s| s.replacement.len()).sum();
    let mut out = Vec::with_capacity(content.len() + grown);
    let mut cursor = 0;
    for splice in ordered {
        out.extend_from_slice(&content[cursor..splice.start]);
        out.extend_from_slice(&splice.replacement);
        cursor = splice.end;
    }
    out.extend_from_slice(&content[cursor..]);
    Ok(out)
}

/// Atomic file write: tempfile + fsync + rename.
///
/// The tempfile is created next to `path` so the rename stays on one
/// filesystem, and receives `permissions` before it replaces the target.
pub fn atomic_write(
    path: &Path,
    content: &[u8],
    permissions: &fs::Permissions,
) -> Result<(), EditError> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => {
            return Err(EditError::NoParent {
                path: path.to_path_buf(),
            })
        }
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), permissions.clone())?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
