//! Post-write integrity re-stamping for binaries.
//!
//! macOS refuses to run a Mach-O whose embedded signature no longer matches
//! its contents, so a patched binary gets an ad-hoc signature. Other
//! platforms need nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RestampError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed on {path} ({status}): {stderr}")]
    Failed {
        tool: &'static str,
        path: PathBuf,
        status: String,
        stderr: String,
    },
}

/// Refreshes whatever integrity metadata the platform checks at load time.
pub trait IntegrityStamper {
    fn name(&self) -> &'static str;

    fn restamp(&self, path: &Path) -> Result<(), RestampError>;
}

/// `codesign --force --sign -`
#[derive(Debug, Clone, Copy, Default)]
pub struct CodesignStamper;

impl IntegrityStamper for CodesignStamper {
    fn name(&self) -> &'static str {
        "codesign"
    }

    fn restamp(&self, path: &Path) -> Result<(), RestampError> {
        let output = Command::new("codesign")
            .args(["--force", "--sign", "-"])
            .arg(path)
            .output()
            .map_err(|source| RestampError::Spawn {
                tool: "codesign",
                source,
            })?;

        if !output.status.success() {
            return Err(RestampError::Failed {
                tool: "codesign",
                path: path.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(path = %path.display(), "re-signed binary");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStamper;

impl IntegrityStamper for NoopStamper {
    fn name(&self) -> &'static str {
        "none"
    }

    fn restamp(&self, path: &Path) -> Result<(), RestampError> {
        debug!(path = %path.display(), "no integrity stamp needed");
        Ok(())
    }
}

/// The stamper for the platform this was built for.
pub fn platform_default() -> Box<dyn IntegrityStamper> {
    if cfg!(target_os = "macos") {
        Box::new(CodesignStamper)
    } else {
        Box::new(NoopStamper)
    }
}

/// `permissions` with execute bits added wherever read bits are set.
pub fn executable(permissions: &fs::Permissions) -> fs::Permissions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        let exec = (mode & 0o444) >> 2;
        fs::Permissions::from_mode(mode | exec | 0o100)
    }
    #[cfg(not(unix))]
    {
        permissions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_always_succeeds() {
        assert!(NoopStamper.restamp(Path::new("/does/not/exist")).is_ok());
        assert_eq!(NoopStamper.name(), "none");
    }

    #[test]
    fn test_platform_default_name() {
        let expected = if cfg!(target_os = "macos") {
            "codesign"
        } else {
            "none"
        };
        assert_eq!(platform_default().name(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bits() {
        use std::os::unix::fs::PermissionsExt;
        let exec = executable(&fs::Permissions::from_mode(0o644));
        assert_eq!(exec.mode() & 0o777, 0o755);
        let exec = executable(&fs::Permissions::from_mode(0o600));
        assert_eq!(exec.mode() & 0o777, 0o700);
        let exec = executable(&fs::Permissions::from_mode(0o755));
        assert_eq!(exec.mode() & 0o777, 0o755);
    }
}
