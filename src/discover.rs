//! Locating installed artifacts when no explicit path is given.

use crate::artifact::ArtifactFormat;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Deepest a bundle sits below a search root, e.g.
/// `.nvm/versions/node/<v>/lib/node_modules/@anthropic-ai/claude-code/cli.js`.
const MAX_BUNDLE_DEPTH: usize = 8;

const BUNDLE_SCOPE: &str = "@anthropic-ai";
const BUNDLE_PACKAGE: &str = "claude-code";
const BUNDLE_FILE: &str = "cli.js";

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("no {format} artifact found (searched: {})", display_paths(.searched))]
    NotFound {
        format: ArtifactFormat,
        searched: Vec<PathBuf>,
    },

    #[error("could not determine the home directory")]
    NoHome,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where to look for each artifact form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPaths {
    /// Directories walked for `@anthropic-ai/claude-code/cli.js`.
    pub bundle_roots: Vec<PathBuf>,
    /// Exact executable paths, checked in order.
    pub binary_candidates: Vec<PathBuf>,
}

impl SearchPaths {
    /// Usual install locations for the current platform.
    pub fn platform_default() -> Result<Self, DiscoverError> {
        let home = home::home_dir().ok_or(DiscoverError::NoHome)?;

        if cfg!(windows) {
            let env_dir = |var: &str| std::env::var_os(var).map(PathBuf::from);
            let bundle_roots = [
                env_dir("LOCALAPPDATA").map(|d| d.join("npm-cache").join("_npx")),
                env_dir("APPDATA").map(|d| d.join("npm").join("node_modules")),
            ]
            .into_iter()
            .flatten()
            .collect();
            return Ok(Self {
                bundle_roots,
                binary_candidates: vec![
                    home.join(".local").join("bin").join("claude.exe"),
                    home.join("AppData")
                        .join("Local")
                        .join("Programs")
                        .join("claude")
                        .join("claude.exe"),
                ],
            });
        }

        Ok(Self {
            bundle_roots: vec![
                home.join(".npm").join("_npx"),
                home.join(".nvm").join("versions").join("node"),
                PathBuf::from("/usr/local/lib/node_modules"),
                PathBuf::from("/opt/homebrew/lib/node_modules"),
            ],
            binary_candidates: vec![
                home.join(".local").join("bin").join("claude"),
                PathBuf::from("/usr/local/bin/claude"),
                PathBuf::from("/opt/homebrew/bin/claude"),
            ],
        })
    }

    /// The first installed artifact of `format`; with no format, a binary is
    /// preferred over a bundle.
    pub fn find(&self, format: Option<ArtifactFormat>) -> Result<PathBuf, DiscoverError> {
        match format {
            Some(ArtifactFormat::Text) => self.find_bundle(),
            Some(ArtifactFormat::Binary) => self.find_binary(),
            None => self.find_binary().or_else(|_| self.find_bundle()),
        }
    }

    pub fn find_bundle(&self) -> Result<PathBuf, DiscoverError> {
        for root in self.bundle_roots.iter().filter(|r| r.is_dir()) {
            let found = WalkDir::new(root)
                .max_depth(MAX_BUNDLE_DEPTH)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!(error = %e, "skipping unreadable entry");
                        None
                    }
                })
                .find(|entry| entry.file_type().is_file() && is_bundle_path(entry.path()));
            if let Some(entry) = found {
                debug!(path = %entry.path().display(), "found bundle");
                return Ok(entry.into_path());
            }
        }

        Err(DiscoverError::NotFound {
            format: ArtifactFormat::Text,
            searched: self.bundle_roots.clone(),
        })
    }

    pub fn find_binary(&self) -> Result<PathBuf, DiscoverError> {
        for candidate in &self.binary_candidates {
            if candidate.is_file() && has_binary_header(candidate) {
                debug!(path = %candidate.display(), "found binary");
                return Ok(candidate.clone());
            }
        }

        Err(DiscoverError::NotFound {
            format: ArtifactFormat::Binary,
            searched: self.binary_candidates.clone(),
        })
    }
}

/// `.../@anthropic-ai/claude-code/cli.js`
fn is_bundle_path(path: &Path) -> bool {
    let mut names = path.iter().rev().map(|c| c.to_string_lossy());
    matches!(
        (names.next(), names.next(), names.next()),
        (Some(file), Some(package), Some(scope))
            if file == BUNDLE_FILE && package == BUNDLE_PACKAGE && scope == BUNDLE_SCOPE
    )
}

/// Shell-script launchers and npm symlinks are skipped.
fn has_binary_header(path: &Path) -> bool {
    let mut header = [0u8; 4];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map(|()| ArtifactFormat::sniff(&header) == ArtifactFormat::Binary)
        .unwrap_or(false)
}
