//! IME Patcher: repairs the delete-marker correction defect in a shipped
//! JavaScript bundle and in single-file binaries embedding the same code.
//!
//! Input methods such as Vietnamese Telex send N `0x7F` delete-markers
//! followed by the replacement characters. The shipped code performs the
//! deletions and drops the replacement. This crate finds that block, recovers
//! the build-specific identifiers around it, and splices in code that deletes
//! and then re-inserts.
//!
//! # Architecture
//!
//! - [`locate`]: signature anchoring plus bounded brace balancing
//! - [`extract`]: ordered literal-skeleton shapes binding identifier roles
//! - [`synth`]: fix emission, growable for text, length-preserving for binaries
//! - [`applicator`]: idempotence gate, backup, single atomic write, re-stamp,
//!   verification, rollback
//!
//! All substitutions go through [`edit::Splice`], a verified byte-span
//! replacement.
//!
//! # Example
//!
//! ```no_run
//! use ime_patcher::{PatchApplier, PatchOutcome, ProfileSet};
//! use std::path::Path;
//!
//! let applier = PatchApplier::new(ProfileSet::default());
//! match applier.patch(Path::new("cli.js"), None) {
//!     Ok(PatchOutcome::Patched { fixes, .. }) => println!("fixed {} block(s)", fixes.len()),
//!     Ok(PatchOutcome::AlreadyFixed { .. }) => println!("already fixed"),
//!     Err(e) => eprintln!("patch failed: {e}"),
//! }
//! ```

pub mod applicator;
pub mod artifact;
pub mod backup;
pub mod cache;
pub mod config;
pub mod discover;
pub mod edit;
pub mod extract;
pub mod locate;
pub mod model;
pub mod resign;
pub mod synth;

// Re-exports
pub use applicator::{ArtifactStatus, Inspection, PatchApplier, PatchError, PatchOutcome, PlannedFix};
pub use artifact::{ArtifactFormat, CodeArtifact};
pub use backup::{BackupError, BackupManager, BackupRecord};
pub use config::{load_from_path, load_from_str, load_or_default, ConfigError, ProfileSet, TargetProfile};
pub use discover::{DiscoverError, SearchPaths};
pub use edit::{EditError, SpanCheck, Splice};
pub use extract::{BlockShape, ExtractError, Extraction, IdentifierExtractor, Role, RoleBindings};
pub use locate::{DefectBlock, LocateError, PatternLocator};
pub use resign::{IntegrityStamper, RestampError};
pub use synth::{FixFragment, FixSynthesizer, SynthError, SynthMode};
