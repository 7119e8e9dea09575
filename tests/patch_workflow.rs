//! End-to-end patch, idempotence, restore and rollback behavior.

use ime_patcher::config::{BINARY_FIX_MARKER, CANONICAL_BINARY_BLOCK, TEXT_FIX_MARKER};
use ime_patcher::resign::{IntegrityStamper, NoopStamper, RestampError};
use ime_patcher::{ArtifactFormat, PatchApplier, PatchError, PatchOutcome, ProfileSet};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const SCENARIO: &str = "if(x.includes(\"\u{7f}\")){let c=(x.match(/\\x7f/g)||[]).length,s=cur;for(i=0;i<c;i++)s=s.backspace();if(!cur.equals(s)){if(cur.text!==s.text)setText(s.text);setOffset(s.offset)}}";

fn applier() -> PatchApplier {
    PatchApplier::new(ProfileSet::default()).with_stamper(Box::new(NoopStamper))
}

fn backup_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".backup-")
        })
        .count()
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// A fake ELF image with `blocks` embedded between filler bytes.
fn binary_image(blocks: &[&str]) -> Vec<u8> {
    let mut content = b"\x7fELF\x02\x01\x01\0".to_vec();
    for block in blocks {
        content.extend_from_slice(&[0u8; 32]);
        content.extend_from_slice(b"function(){");
        content.extend_from_slice(block.as_bytes());
        content.extend_from_slice(b"}");
    }
    content.extend_from_slice(&[0u8; 32]);
    content
}

struct FailingStamper;

impl IntegrityStamper for FailingStamper {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn restamp(&self, path: &Path) -> Result<(), RestampError> {
        Err(RestampError::Failed {
            tool: "failing",
            path: path.to_path_buf(),
            status: "exit status: 1".to_string(),
            stderr: "refused".to_string(),
        })
    }
}

/// Appends a trailer the way an ad-hoc re-signature can grow a binary.
struct GrowingStamper;

impl IntegrityStamper for GrowingStamper {
    fn name(&self) -> &'static str {
        "growing"
    }

    fn restamp(&self, path: &Path) -> Result<(), RestampError> {
        let mut content = fs::read(path).map_err(|source| RestampError::Spawn {
            tool: "growing",
            source,
        })?;
        content.extend_from_slice(&[0xfa; 16]);
        fs::write(path, content).map_err(|source| RestampError::Spawn {
            tool: "growing",
            source,
        })
    }
}

#[test]
fn test_scenario_text_bundle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cli.js");
    let prefix = "#!/usr/bin/env node\nfunction onInput(x){";
    fs::write(&path, format!("{prefix}{SCENARIO}return 1}}")).unwrap();

    let outcome = applier().patch(&path, None).unwrap();
    assert_eq!(outcome.occurrences(), 1);

    let patched = fs::read_to_string(&path).unwrap();
    assert!(patched.starts_with(prefix));
    assert!(patched.ends_with("return 1}"));
    assert_eq!(patched.matches(TEXT_FIX_MARKER).count(), 1);
    assert!(patched.contains("s=s.backspace()"));
    assert!(patched.contains("s=s.insert(_c)"));
    assert!(patched.contains("setText(s.text);setOffset(s.offset)"));
    assert!(!patched.contains("for(i=0;i<c;i++)"));
}

#[test]
fn test_second_run_is_noop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cli.js");
    fs::write(&path, SCENARIO).unwrap();

    let first = applier().patch(&path, None).unwrap();
    assert!(matches!(first, PatchOutcome::Patched { .. }));
    let after_first = fs::read(&path).unwrap();

    let second = applier().patch(&path, None).unwrap();
    assert!(matches!(second, PatchOutcome::AlreadyFixed { .. }));
    assert_eq!(fs::read(&path).unwrap(), after_first);
    assert_eq!(backup_count(dir.path()), 1);
}

#[test]
fn test_patch_then_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let original = binary_image(&[CANONICAL_BINARY_BLOCK]);
    fs::write(&path, &original).unwrap();

    let applier = applier();
    let outcome = applier.patch(&path, None).unwrap();
    let PatchOutcome::Patched { backup, .. } = outcome else {
        panic!("expected a patch");
    };
    assert_ne!(fs::read(&path).unwrap(), original);

    let record = applier.restore(&path).unwrap();
    assert_eq!(record.path, backup);
    assert_eq!(fs::read(&path).unwrap(), original);
    assert!(backup.exists());
}

#[test]
fn test_binary_every_occurrence_same_length() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let original = binary_image(&[CANONICAL_BINARY_BLOCK, CANONICAL_BINARY_BLOCK, CANONICAL_BINARY_BLOCK]);
    fs::write(&path, &original).unwrap();

    let outcome = applier().patch(&path, None).unwrap();
    assert_eq!(outcome.occurrences(), 3);

    let patched = fs::read(&path).unwrap();
    assert_eq!(patched.len(), original.len());
    assert_eq!(count(&patched, BINARY_FIX_MARKER.as_bytes()), 3);
    assert_eq!(count(&patched, CANONICAL_BINARY_BLOCK.as_bytes()), 0);
    // Bytes outside the blocks are untouched.
    assert_eq!(&patched[..40], &original[..40]);
    assert_eq!(&patched[patched.len() - 33..], &original[original.len() - 33..]);
}

#[test]
fn test_binary_renamed_identifiers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let renamed = CANONICAL_BINARY_BLOCK
        .replace("DT", "Ab")
        .replace("RT", "Cd")
        .replace("IT", "Ef")
        .replace("WyT", "Gh");
    let original = binary_image(&[&renamed, &renamed]);
    fs::write(&path, &original).unwrap();

    let outcome = applier().patch(&path, None).unwrap();
    let PatchOutcome::Patched { fixes, .. } = outcome else {
        panic!("expected a patch");
    };
    assert_eq!(fixes.len(), 2);
    assert_eq!(fixes[0].extraction.bindings.input_var, "Cd");
    assert_eq!(fixes[0].extraction.guard.as_deref(), Some("Ab"));

    let patched = fs::read(&path).unwrap();
    assert_eq!(patched.len(), original.len());
    let text = String::from_utf8_lossy(&patched);
    assert!(text.contains(r#"if(!Ab.backspace&&!Ab.delete&&Cd.includes("\x7f")){"#));
}

#[test]
fn test_binary_one_overflow_aborts_all() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let fits = CANONICAL_BINARY_BLOCK.replace("RT", "Rq");
    let overflows = CANONICAL_BINARY_BLOCK
        .replace("RT", "composedInputBufferWithAnUnusuallyLongName")
        .replace("IT", "s")
        .replace("XT", "n")
        .replace("zT", "k");
    let original = binary_image(&[&fits, &overflows, &fits]);
    fs::write(&path, &original).unwrap();

    let err = applier().patch(&path, None).unwrap_err();
    assert!(matches!(
        err,
        PatchError::LengthOverflow { needed, available, .. } if needed > available
    ));
    assert_eq!(fs::read(&path).unwrap(), original);
    assert_eq!(backup_count(dir.path()), 0);
}

#[test]
fn test_restamp_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let original = binary_image(&[CANONICAL_BINARY_BLOCK]);
    fs::write(&path, &original).unwrap();

    let applier = PatchApplier::new(ProfileSet::default()).with_stamper(Box::new(FailingStamper));
    let err = applier.patch(&path, None).unwrap_err();

    assert!(matches!(err, PatchError::Restamp { .. }));
    assert_eq!(fs::read(&path).unwrap(), original);
    assert_eq!(backup_count(dir.path()), 0);
}

#[test]
fn test_forced_format_overrides_detection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bundle.bin");
    // No executable header, but patched with length preservation on request.
    fs::write(&path, format!("var a;{CANONICAL_BINARY_BLOCK}")).unwrap();

    let outcome = applier()
        .patch(&path, Some(ArtifactFormat::Binary))
        .unwrap();
    assert!(matches!(
        outcome,
        PatchOutcome::Patched { format: ArtifactFormat::Binary, .. }
    ));
    assert_eq!(
        fs::read(&path).unwrap().len(),
        "var a;".len() + CANONICAL_BINARY_BLOCK.len()
    );
}

#[test]
fn test_restamp_may_resize_binary() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let original = binary_image(&[CANONICAL_BINARY_BLOCK]);
    fs::write(&path, &original).unwrap();

    let applier = PatchApplier::new(ProfileSet::default()).with_stamper(Box::new(GrowingStamper));
    let outcome = applier.patch(&path, None).unwrap();
    assert_eq!(outcome.occurrences(), 1);

    let patched = fs::read(&path).unwrap();
    assert_eq!(patched.len(), original.len() + 16);
    assert_eq!(count(&patched, BINARY_FIX_MARKER.as_bytes()), 1);
    assert_eq!(backup_count(dir.path()), 1);
}

#[test]
fn test_binary_mixed_canonical_and_renamed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("claude");
    let renamed = CANONICAL_BINARY_BLOCK
        .replace("DT", "Ab")
        .replace("RT", "Cd");
    let original = binary_image(&[CANONICAL_BINARY_BLOCK, &renamed]);
    fs::write(&path, &original).unwrap();

    let applier = applier();
    let outcome = applier.patch(&path, None).unwrap();
    assert_eq!(outcome.occurrences(), 2);

    let patched = fs::read(&path).unwrap();
    assert_eq!(patched.len(), original.len());
    assert_eq!(count(&patched, BINARY_FIX_MARKER.as_bytes()), 2);
    assert_eq!(count(&patched, CANONICAL_BINARY_BLOCK.as_bytes()), 0);
    assert_eq!(count(&patched, renamed.as_bytes()), 0);

    let again = applier.patch(&path, None).unwrap();
    assert!(matches!(again, PatchOutcome::AlreadyFixed { .. }));
}
