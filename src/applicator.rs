//! Patch applicator - locates, backs up, rewrites and verifies one artifact
//!
//! A run moves through `Unpatched -> Backed-up -> Substituted -> Verified`:
//! - A fix marker already present short-circuits to [`PatchOutcome::AlreadyFixed`]
//! - Location failures surface before any backup is taken
//! - Every block is extracted and synthesized before the single write
//! - Any failure after the backup restores it and deletes it

use crate::artifact::{ArtifactFormat, CodeArtifact};
use crate::backup::{BackupError, BackupManager, BackupRecord};
use crate::config::{ProfileSet, TargetProfile};
use crate::edit::{apply_splices, atomic_write, EditError, SpanCheck, Splice};
use crate::extract::{ExtractError, Extraction, IdentifierExtractor};
use crate::locate::{DefectBlock, LocateError, PatternLocator};
use crate::resign::{self, IntegrityStamper, RestampError};
use crate::synth::{FixFragment, FixSynthesizer, SynthError};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// One defect block together with the code that replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFix {
    pub block: DefectBlock,
    pub extraction: Extraction,
    pub fragment: FixFragment,
}

/// Result of patching one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchOutcome should be checked for patched/already-fixed"]
pub enum PatchOutcome {
    /// Every defect block was replaced and the write verified
    Patched {
        path: PathBuf,
        format: ArtifactFormat,
        backup: PathBuf,
        fixes: Vec<PlannedFix>,
    },
    /// The fix marker was already present; nothing was written
    AlreadyFixed { path: PathBuf },
}

impl PatchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            PatchOutcome::Patched { path, .. } | PatchOutcome::AlreadyFixed { path } => path,
        }
    }

    /// Number of blocks replaced by this run.
    pub fn occurrences(&self) -> usize {
        match self {
            PatchOutcome::Patched { fixes, .. } => fixes.len(),
            PatchOutcome::AlreadyFixed { .. } => 0,
        }
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOutcome::Patched {
                path,
                format,
                fixes,
                ..
            } => write!(
                f,
                "Patched {} block(s) in {} ({})",
                fixes.len(),
                path.display(),
                format
            ),
            PatchOutcome::AlreadyFixed { path } => {
                write!(f, "Already fixed: {}", path.display())
            }
        }
    }
}

/// Errors during patch application
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("defect signature not found in {path}")]
    NotFound { path: PathBuf },

    #[error("malformed defect block in {path}: {source}")]
    MalformedBlock {
        path: PathBuf,
        #[source]
        source: LocateError,
    },

    #[error("identifier extraction failed for block at byte {start} in {path}: {source}")]
    ExtractionFailed {
        path: PathBuf,
        start: usize,
        #[source]
        source: ExtractError,
    },

    #[error("fix for block at byte {start} in {path} needs {needed} bytes, block has {available}")]
    LengthOverflow {
        path: PathBuf,
        start: usize,
        needed: usize,
        available: usize,
    },

    #[error("could not synthesize fix for block at byte {start} in {path}: {source}")]
    Synthesis {
        path: PathBuf,
        start: usize,
        #[source]
        source: SynthError,
    },

    #[error("verification failed for {path}: {reason}")]
    VerificationFailed { path: PathBuf, reason: String },

    #[error(transparent)]
    BackupIo(#[from] BackupError),

    #[error("no backup found for {path}")]
    NoBackup { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("re-stamping {path} failed: {source}")]
    Restamp {
        path: PathBuf,
        #[source]
        source: RestampError,
    },

    #[error("{path} is not valid UTF-8 and cannot be patched as text")]
    InvalidUtf8 { path: PathBuf },

    #[error("{cause}; rolling back also failed: {source}")]
    RollbackFailed {
        cause: Box<PatchError>,
        #[source]
        source: BackupError,
    },
}

impl PatchError {
    fn from_edit(path: &Path, err: EditError) -> Self {
        match err {
            EditError::Io(source) => PatchError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => PatchError::VerificationFailed {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

/// Condition of an artifact as seen by a read-only inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ArtifactStatus {
    Fixed,
    Unpatched { occurrences: usize },
    NotFound,
    Broken { reason: String },
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::Fixed => f.write_str("fixed"),
            ArtifactStatus::Unpatched { occurrences } => {
                write!(f, "unpatched ({occurrences} occurrence(s))")
            }
            ArtifactStatus::NotFound => f.write_str("defect not found"),
            ArtifactStatus::Broken { reason } => write!(f, "cannot patch: {reason}"),
        }
    }
}

/// What a patch run would do, without doing it.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size: usize,
    /// Signature occurrences in the file, patched or not.
    pub signatures: usize,
    pub status: ArtifactStatus,
    pub fixes: Vec<PlannedFix>,
    pub latest_backup: Option<BackupRecord>,
}

/// Orchestrates locate, extract, synthesize and the guarded write.
pub struct PatchApplier {
    profiles: ProfileSet,
    backups: BackupManager,
    extractor: IdentifierExtractor,
    stamper: Box<dyn IntegrityStamper>,
}

impl PatchApplier {
    pub fn new(profiles: ProfileSet) -> Self {
        let backups = BackupManager::new(profiles.backup.clone());
        Self {
            profiles,
            backups,
            extractor: IdentifierExtractor::new(),
            stamper: resign::platform_default(),
        }
    }

    pub fn with_stamper(mut self, stamper: Box<dyn IntegrityStamper>) -> Self {
        self.stamper = stamper;
        self
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Patch the artifact at `path`. `format` overrides detection.
    pub fn patch(
        &self,
        path: &Path,
        format: Option<ArtifactFormat>,
    ) -> Result<PatchOutcome, PatchError> {
        let artifact = self.read(path, format)?;
        let profile = self.profiles.profile(artifact.format);

        if artifact.contains(profile.fix_marker.as_bytes()) {
            info!(path = %path.display(), "fix marker present, nothing to do");
            return Ok(PatchOutcome::AlreadyFixed {
                path: artifact.path,
            });
        }

        let blocks = self.locate(&artifact, profile)?;
        let backup = self.backups.snapshot(&artifact)?;

        match self.substitute(&artifact, profile, &blocks) {
            Ok(fixes) => {
                info!(
                    path = %path.display(),
                    occurrences = fixes.len(),
                    backup = %backup.path.display(),
                    "patched artifact"
                );
                Ok(PatchOutcome::Patched {
                    path: artifact.path,
                    format: artifact.format,
                    backup: backup.path,
                    fixes,
                })
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "patch failed, rolling back");
                match self.backups.rollback(&artifact, &backup) {
                    Ok(()) => Err(err),
                    Err(source) => Err(PatchError::RollbackFailed {
                        cause: Box::new(err),
                        source,
                    }),
                }
            }
        }
    }

    /// Locate, extract and synthesize without writing anything.
    pub fn inspect(
        &self,
        path: &Path,
        format: Option<ArtifactFormat>,
    ) -> Result<Inspection, PatchError> {
        let artifact = self.read(path, format)?;
        let profile = self.profiles.profile(artifact.format);
        let latest_backup = self.backups.latest(path)?;
        let signatures = PatternLocator::new(profile).count_signatures(&artifact.content);

        let (status, fixes) = if artifact.contains(profile.fix_marker.as_bytes()) {
            (ArtifactStatus::Fixed, Vec::new())
        } else {
            match self
                .locate(&artifact, profile)
                .and_then(|blocks| self.plan(&artifact, profile, &blocks))
            {
                Ok(fixes) => (
                    ArtifactStatus::Unpatched {
                        occurrences: fixes.len(),
                    },
                    fixes,
                ),
                Err(PatchError::NotFound { .. }) => (ArtifactStatus::NotFound, Vec::new()),
                Err(err) => (
                    ArtifactStatus::Broken {
                        reason: err.to_string(),
                    },
                    Vec::new(),
                ),
            }
        };

        Ok(Inspection {
            path: artifact.path,
            format: artifact.format,
            size: artifact.content.len(),
            signatures,
            status,
            fixes,
            latest_backup,
        })
    }

    /// Copy the latest backup over `path`, keeping the backup.
    pub fn restore(&self, path: &Path) -> Result<BackupRecord, PatchError> {
        self.backups.restore(path).map_err(|err| match err {
            BackupError::NoBackup(path) => PatchError::NoBackup { path },
            other => PatchError::BackupIo(other),
        })
    }

    fn read(&self, path: &Path, format: Option<ArtifactFormat>) -> Result<CodeArtifact, PatchError> {
        let read = match format {
            Some(format) => CodeArtifact::read_as(path, format),
            None => CodeArtifact::read(path),
        };
        read.map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Text targets yield the first block only; binaries yield every block.
    fn locate(
        &self,
        artifact: &CodeArtifact,
        profile: &TargetProfile,
    ) -> Result<Vec<DefectBlock>, PatchError> {
        let locator = PatternLocator::new(profile);
        let located = match artifact.format {
            ArtifactFormat::Text => {
                if std::str::from_utf8(&artifact.content).is_err() {
                    return Err(PatchError::InvalidUtf8 {
                        path: artifact.path.clone(),
                    });
                }
                locator.locate_first(&artifact.content).map(|block| vec![block])
            }
            ArtifactFormat::Binary => locator.locate_all(&artifact.content),
        };

        located.map_err(|err| match err {
            LocateError::NotFound => PatchError::NotFound {
                path: artifact.path.clone(),
            },
            source => PatchError::MalformedBlock {
                path: artifact.path.clone(),
                source,
            },
        })
    }

    /// Extract and synthesize every block; the first failure aborts all.
    fn plan(
        &self,
        artifact: &CodeArtifact,
        profile: &TargetProfile,
        blocks: &[DefectBlock],
    ) -> Result<Vec<PlannedFix>, PatchError> {
        let synthesizer = FixSynthesizer::for_profile(profile);
        blocks
            .iter()
            .map(|block| {
                let extraction =
                    self.extractor
                        .extract(block)
                        .map_err(|source| PatchError::ExtractionFailed {
                            path: artifact.path.clone(),
                            start: block.start,
                            source,
                        })?;
                let fragment = synthesizer
                    .synthesize(&extraction, block.len())
                    .map_err(|err| match err {
                        SynthError::LengthOverflow { needed, available } => {
                            PatchError::LengthOverflow {
                                path: artifact.path.clone(),
                                start: block.start,
                                needed,
                                available,
                            }
                        }
                        source => PatchError::Synthesis {
                            path: artifact.path.clone(),
                            start: block.start,
                            source,
                        },
                    })?;
                Ok(PlannedFix {
                    block: block.clone(),
                    extraction,
                    fragment,
                })
            })
            .collect()
    }

    fn substitute(
        &self,
        artifact: &CodeArtifact,
        profile: &TargetProfile,
        blocks: &[DefectBlock],
    ) -> Result<Vec<PlannedFix>, PatchError> {
        let path = &artifact.path;
        let fixes = self.plan(artifact, profile, blocks)?;

        let splices: Vec<Splice> = fixes
            .iter()
            .map(|fix| Splice::new(fix.block.start, &fix.block.bytes, fix.fragment.bytes.clone()))
            .collect();
        if profile.fixed_length() && !splices.iter().all(Splice::is_length_preserving) {
            return Err(PatchError::VerificationFailed {
                path: path.clone(),
                reason: "fragment length differs from its block".to_string(),
            });
        }
        let patched = apply_splices(&artifact.content, &splices)
            .map_err(|err| PatchError::from_edit(path, err))?;

        let permissions = match artifact.format {
            ArtifactFormat::Binary => resign::executable(&artifact.permissions),
            ArtifactFormat::Text => artifact.permissions.clone(),
        };
        atomic_write(path, &patched, &permissions).map_err(|err| PatchError::from_edit(path, err))?;

        if artifact.format == ArtifactFormat::Binary {
            self.stamper
                .restamp(path)
                .map_err(|source| PatchError::Restamp {
                    path: path.clone(),
                    source,
                })?;
        }

        self.verify(artifact, profile, &fixes)?;
        Ok(fixes)
    }

    /// Re-read the written file: marker present, every fragment at its
    /// shifted offset. File length is not checked here since a re-stamp may
    /// resize the signature area; length preservation is enforced on the
    /// buffer before it is written.
    fn verify(
        &self,
        artifact: &CodeArtifact,
        profile: &TargetProfile,
        fixes: &[PlannedFix],
    ) -> Result<(), PatchError> {
        let path = &artifact.path;
        let written = fs::read(path).map_err(|source| PatchError::Io {
            path: path.clone(),
            source,
        })?;
        let failed = |reason: String| PatchError::VerificationFailed {
            path: path.clone(),
            reason,
        };

        if !crate::artifact::contains(&written, profile.fix_marker.as_bytes()) {
            return Err(failed("fix marker missing after write".to_string()));
        }

        let mut shift: isize = 0;
        for fix in fixes {
            let start = fix.block.start as isize + shift;
            let check = SpanCheck::from_bytes(&fix.fragment.bytes);
            let span = usize::try_from(start)
                .ok()
                .and_then(|start| written.get(start..start + fix.fragment.len()));
            if !span.is_some_and(|bytes| check.matches(bytes)) {
                return Err(failed(format!(
                    "fragment for block at byte {} not found after write",
                    fix.block.start
                )));
            }
            shift += fix.fragment.len() as isize - fix.block.len() as isize;
        }
        Ok(())
    }
}

impl Default for PatchApplier {
    fn default() -> Self {
        Self::new(ProfileSet::default())
    }
}
