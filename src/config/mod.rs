pub mod loader;
pub mod schema;

pub use loader::{load_from_path, load_from_str, load_or_default, ConfigError};
pub use schema::{
    BackupSettings, ConfigFile, ProfileOverride, ProfileSet, TargetProfile, ValidationError,
    ValidationIssue, BINARY_FIX_MARKER, CANONICAL_BINARY_BLOCK, DELETE_MARKER, TEXT_FIX_MARKER,
};
