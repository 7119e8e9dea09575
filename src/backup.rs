//! Timestamped full copies of an artifact, kept beside it.
//!
//! A backup of `/dir/cli.js` is `/dir/cli.js.backup-20250101-120000`, with a
//! `-N` suffix when a copy with that name already exists. Backups are never
//! overwritten. "Latest" means most recently modified.

use crate::artifact::CodeArtifact;
use crate::config::BackupSettings;
use crate::edit::{atomic_write, EditError};
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path} from backup: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: EditError,
    },

    #[error("no backup found for {0}")]
    NoBackup(PathBuf),

    #[error("{0} has no file name")]
    NoFileName(PathBuf),
}

impl BackupError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupManager {
    settings: BackupSettings,
}

impl BackupManager {
    pub fn new(settings: BackupSettings) -> Self {
        Self { settings }
    }

    /// `<file name>.<tag>-`, the prefix every backup of `artifact` starts with.
    fn prefix(&self, artifact: &Path) -> Result<String, BackupError> {
        let name = artifact
            .file_name()
            .ok_or_else(|| BackupError::NoFileName(artifact.to_path_buf()))?;
        Ok(format!("{}.{}-", name.to_string_lossy(), self.settings.tag))
    }

    /// Write a full copy of the artifact as read into memory.
    pub fn snapshot(&self, artifact: &CodeArtifact) -> Result<BackupRecord, BackupError> {
        let stamp = chrono::Local::now()
            .format(&self.settings.timestamp_format)
            .to_string();
        let base = artifact
            .path
            .with_file_name(format!("{}{stamp}", self.prefix(&artifact.path)?));

        let (path, mut file) = create_unique(&base)?;
        file.write_all(&artifact.content)
            .and_then(|()| file.sync_all())
            .map_err(|e| BackupError::io(&path, e))?;
        drop(file);

        fs::set_permissions(&path, artifact.permissions.clone())
            .map_err(|e| BackupError::io(&path, e))?;
        filetime::set_file_mtime(&path, FileTime::now()).map_err(|e| BackupError::io(&path, e))?;
        let modified = modified_time(&path)?;

        info!(backup = %path.display(), bytes = artifact.len(), "created backup");
        Ok(BackupRecord { path, modified })
    }

    /// Put the backed-up bytes back and delete the backup.
    pub fn rollback(
        &self,
        artifact: &CodeArtifact,
        record: &BackupRecord,
    ) -> Result<(), BackupError> {
        self.copy_back(&record.path, &artifact.path, &artifact.permissions)?;
        fs::remove_file(&record.path).map_err(|e| BackupError::io(&record.path, e))?;
        info!(artifact = %artifact.path.display(), "rolled back from backup");
        Ok(())
    }

    /// The most recently modified backup of `artifact`, if any.
    pub fn latest(&self, artifact: &Path) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self.list(artifact)?.pop())
    }

    /// Every backup of `artifact`, oldest first.
    pub fn list(&self, artifact: &Path) -> Result<Vec<BackupRecord>, BackupError> {
        let prefix = self.prefix(artifact)?;
        let dir = match artifact.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io(dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(dir, e))?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = modified_time(&path)?;
            records.push(BackupRecord { path, modified });
        }

        // Names sort in creation order for equal mtimes.
        records.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)));
        Ok(records)
    }

    /// Copy the latest backup over `artifact`, keeping the backup.
    pub fn restore(&self, artifact: &Path) -> Result<BackupRecord, BackupError> {
        let record = self
            .latest(artifact)?
            .ok_or_else(|| BackupError::NoBackup(artifact.to_path_buf()))?;

        let permissions = match fs::metadata(artifact) {
            Ok(meta) => meta.permissions(),
            Err(_) => fs::metadata(&record.path)
                .map_err(|e| BackupError::io(&record.path, e))?
                .permissions(),
        };
        self.copy_back(&record.path, artifact, &permissions)?;
        info!(
            artifact = %artifact.display(),
            backup = %record.path.display(),
            "restored from backup"
        );
        Ok(record)
    }

    fn copy_back(
        &self,
        backup: &Path,
        artifact: &Path,
        permissions: &fs::Permissions,
    ) -> Result<(), BackupError> {
        let bytes = fs::read(backup).map_err(|e| BackupError::io(backup, e))?;
        atomic_write(artifact, &bytes, permissions).map_err(|source| BackupError::Write {
            path: artifact.to_path_buf(),
            source,
        })
    }
}

/// Create `base`, or `base-1`, `base-2`, ... whichever does not exist yet.
fn create_unique(base: &Path) -> Result<(PathBuf, fs::File), BackupError> {
    let mut candidate = base.to_path_buf();
    let mut n = 0u32;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(taken = %candidate.display(), "backup name taken");
                n += 1;
                let mut name = base.as_os_str().to_owned();
                name.push(format!("-{n}"));
                candidate = PathBuf::from(name);
            }
            Err(e) => return Err(BackupError::io(&candidate, e)),
        }
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, BackupError> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| BackupError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactFormat;

    fn artifact_in(dir: &Path, content: &[u8]) -> CodeArtifact {
        let path = dir.join("cli.js");
        fs::write(&path, content).unwrap();
        CodeArtifact::read_as(&path, ArtifactFormat::Text).unwrap()
    }

    #[test]
    fn test_snapshot_names_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"original");
        let manager = BackupManager::default();

        let record = manager.snapshot(&artifact).unwrap();
        let name = record.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cli.js.backup-"));
        assert_eq!(name.len(), "cli.js.backup-YYYYMMDD-HHMMSS".len());
        assert_eq!(fs::read(&record.path).unwrap(), b"original");
    }

    #[test]
    fn test_snapshot_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"v1");
        let manager = BackupManager::new(BackupSettings {
            tag: "backup".into(),
            timestamp_format: "fixed".into(),
        });

        let first = manager.snapshot(&artifact).unwrap();
        let second = manager.snapshot(&artifact).unwrap();
        let third = manager.snapshot(&artifact).unwrap();
        assert_eq!(first.path, dir.path().join("cli.js.backup-fixed"));
        assert_eq!(second.path, dir.path().join("cli.js.backup-fixed-1"));
        assert_eq!(third.path, dir.path().join("cli.js.backup-fixed-2"));
    }

    #[test]
    fn test_latest_by_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"x");
        let older = dir.path().join("cli.js.backup-20990101-000000");
        let newer = dir.path().join("cli.js.backup-20000101-000000");
        fs::write(&older, b"older").unwrap();
        fs::write(&newer, b"newer").unwrap();
        fs::write(dir.path().join("other.js.backup-20990101-000000"), b"no").unwrap();
        filetime::set_file_mtime(&older, FileTime::from_unix_time(1_000, 0)).unwrap();
        filetime::set_file_mtime(&newer, FileTime::from_unix_time(2_000, 0)).unwrap();

        let manager = BackupManager::default();
        let latest = manager.latest(&artifact.path).unwrap().unwrap();
        assert_eq!(latest.path, newer);
        assert_eq!(manager.list(&artifact.path).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_none() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"x");
        assert!(BackupManager::default().latest(&artifact.path).unwrap().is_none());
    }

    #[test]
    fn test_rollback_restores_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"original");
        let manager = BackupManager::default();
        let record = manager.snapshot(&artifact).unwrap();

        fs::write(&artifact.path, b"mangled").unwrap();
        manager.rollback(&artifact, &record).unwrap();

        assert_eq!(fs::read(&artifact.path).unwrap(), b"original");
        assert!(!record.path.exists());
    }

    #[test]
    fn test_restore_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"original");
        let manager = BackupManager::default();
        let record = manager.snapshot(&artifact).unwrap();

        fs::write(&artifact.path, b"patched").unwrap();
        let used = manager.restore(&artifact.path).unwrap();

        assert_eq!(used.path, record.path);
        assert_eq!(fs::read(&artifact.path).unwrap(), b"original");
        assert!(record.path.exists());
    }

    #[test]
    fn test_restore_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(dir.path(), b"x");
        let err = BackupManager::default().restore(&artifact.path).unwrap_err();
        assert!(matches!(err, BackupError::NoBackup(_)));
    }
}
