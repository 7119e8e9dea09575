//! The file under repair and its format tag.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Executable headers that mark an artifact as a compiled binary.
const BINARY_MAGICS: &[&[u8]] = &[
    b"\xcf\xfa\xed\xfe", // Mach-O 64-bit
    b"\xce\xfa\xed\xfe", // Mach-O 32-bit
    b"\xca\xfe\xba\xbe", // Mach-O universal
    b"\x7fELF",
    b"MZ",
];

/// How an artifact's bytes are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// A source bundle; substitutions may change the file length.
    Text,
    /// A fixed-layout executable; substitutions must preserve every offset.
    Binary,
}

impl ArtifactFormat {
    /// Guess the format from the leading bytes of a file.
    pub fn sniff(content: &[u8]) -> Self {
        if BINARY_MAGICS.iter().any(|magic| content.starts_with(magic)) {
            ArtifactFormat::Binary
        } else {
            ArtifactFormat::Text
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactFormat::Text => f.write_str("text"),
            ArtifactFormat::Binary => f.write_str("binary"),
        }
    }
}

/// An artifact read into memory for the duration of one operation.
#[derive(Debug, Clone)]
pub struct CodeArtifact {
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub format: ArtifactFormat,
    pub permissions: fs::Permissions,
}

impl CodeArtifact {
    /// Read an artifact, detecting its format from the content.
    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = fs::read(path)?;
        let format = ArtifactFormat::sniff(&content);
        let permissions = fs::metadata(path)?.permissions();
        Ok(Self {
            path: path.to_path_buf(),
            content,
            format,
            permissions,
        })
    }

    /// Read an artifact with an explicit format, bypassing detection.
    pub fn read_as(path: impl AsRef<Path>, format: ArtifactFormat) -> std::io::Result<Self> {
        let mut artifact = Self::read(path)?;
        artifact.format = format;
        Ok(artifact)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// True if `needle` occurs anywhere in the artifact.
    pub fn contains(&self, needle: &[u8]) -> bool {
        contains(&self.content, needle)
    }
}

/// Byte-level substring test.
pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find_from(haystack, needle, 0).is_some()
}

/// Position of the first occurrence of `needle` at or after `from`.
pub(crate) fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Position of the last occurrence of `needle` that ends at or before `end`
/// and starts at or after `start`.
pub(crate) fn rfind_in(haystack: &[u8], needle: &[u8], start: usize, end: usize) -> Option<usize> {
    let end = end.min(haystack.len());
    if needle.is_empty() || start >= end || end - start < needle.len() {
        return None;
    }
    haystack[start..end]
        .windows(needle.len())
        .rposition(|window| window == needle)
        .map(|pos| pos + start)
}
