use crate::artifact::ArtifactFormat;
use serde::Deserialize;
use std::fmt;

/// Raw `0x7F` delete-marker as emitted by the input method.
pub const DELETE_MARKER: char = '\u{7f}';

/// Marker prefixed to every fragment written into a text bundle.
pub const TEXT_FIX_MARKER: &str = "/* IME composition fix */";

/// Marker prefixed to every fragment written into a binary; kept short so the
/// fragment fits inside the block it replaces.
pub const BINARY_FIX_MARKER: &str = "/*IMEFIX*/";

/// The buggy statement as shipped in known single-file binary builds.
pub const CANONICAL_BINARY_BLOCK: &str = concat!(
    r#"if(!DT.backspace&&!DT.delete&&RT.includes("\x7F")){"#,
    r#"let XT=(RT.match(/\x7f/g)||[]).length,IT=b;"#,
    r#"for(let zT=0;zT<XT;zT++)IT=IT.deleteTokenBefore()??IT.backspace();"#,
    r#"if(!b.equals(IT)){if(b.text!==IT.text)R(IT.text);w(IT.offset)}"#,
    r#"WyT(),QyT();return}"#,
);

/// Everything the locate/extract/synthesize pipeline needs to know about one
/// artifact form. Values are immutable once resolved and passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub format: ArtifactFormat,
    /// Equivalent spellings of the defect signature; earliest occurrence wins.
    pub signatures: Vec<String>,
    /// Token that opens the conditional block around the signature.
    pub block_opener: String,
    /// Maximum distance scanned backward from the signature for the opener.
    pub lookback: usize,
    /// Maximum distance scanned forward from the opener for the block end.
    pub lookahead: usize,
    pub fix_marker: String,
    /// Exact bytes of the known buggy block, tried before the signature scan.
    pub canonical_block: Option<String>,
}

impl TargetProfile {
    pub fn text() -> Self {
        Self {
            format: ArtifactFormat::Text,
            signatures: vec![
                format!(".includes(\"{DELETE_MARKER}\")"),
                r#".includes("\x7f")"#.to_string(),
                r#".includes("\x7F")"#.to_string(),
            ],
            block_opener: "if(".to_string(),
            lookback: 150,
            lookahead: 800,
            fix_marker: TEXT_FIX_MARKER.to_string(),
            canonical_block: None,
        }
    }

    pub fn binary() -> Self {
        Self {
            format: ArtifactFormat::Binary,
            signatures: vec![
                r#".includes("\x7F")"#.to_string(),
                r#".includes("\x7f")"#.to_string(),
            ],
            block_opener: "if(".to_string(),
            lookback: 150,
            lookahead: 800,
            fix_marker: BINARY_FIX_MARKER.to_string(),
            canonical_block: Some(CANONICAL_BINARY_BLOCK.to_string()),
        }
    }

    pub fn for_format(format: ArtifactFormat) -> Self {
        match format {
            ArtifactFormat::Text => Self::text(),
            ArtifactFormat::Binary => Self::binary(),
        }
    }

    /// Binary targets must keep every offset intact.
    pub fn fixed_length(&self) -> bool {
        self.format == ArtifactFormat::Binary
    }

    fn apply(&mut self, overrides: &ProfileOverride) {
        if let Some(signatures) = &overrides.signatures {
            self.signatures = signatures.clone();
        }
        if let Some(opener) = &overrides.block_opener {
            self.block_opener = opener.clone();
        }
        if let Some(lookback) = overrides.lookback {
            self.lookback = lookback;
        }
        if let Some(lookahead) = overrides.lookahead {
            self.lookahead = lookahead;
        }
        if let Some(marker) = &overrides.fix_marker {
            self.fix_marker = marker.clone();
        }
        if let Some(block) = &overrides.canonical_block {
            self.canonical_block = if block.is_empty() {
                None
            } else {
                Some(block.clone())
            };
        }
    }

    fn collect_issues(&self, issues: &mut Vec<ValidationIssue>) {
        let profile = self.format;
        if self.signatures.is_empty() {
            issues.push(ValidationIssue::MissingField {
                profile,
                field: "signatures",
            });
        }
        if self.signatures.iter().any(|s| s.trim().is_empty()) {
            issues.push(ValidationIssue::InvalidCombo {
                profile,
                message: "signatures must not contain empty entries".to_string(),
            });
        }
        if self.block_opener.is_empty() {
            issues.push(ValidationIssue::MissingField {
                profile,
                field: "block_opener",
            });
        }
        if self.fix_marker.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                profile,
                field: "fix_marker",
            });
        }
        if self.lookback == 0 {
            issues.push(ValidationIssue::ZeroWindow {
                profile,
                field: "lookback",
            });
        }
        if self.lookahead == 0 {
            issues.push(ValidationIssue::ZeroWindow {
                profile,
                field: "lookahead",
            });
        }
        if self.signatures.iter().any(|s| s == &self.fix_marker) {
            issues.push(ValidationIssue::InvalidCombo {
                profile,
                message: "fix_marker must differ from every signature".to_string(),
            });
        }
        if let Some(block) = &self.canonical_block {
            if !self.signatures.iter().any(|s| block.contains(s.as_str())) {
                issues.push(ValidationIssue::InvalidCombo {
                    profile,
                    message: "canonical_block does not contain any signature".to_string(),
                });
            }
        }
    }
}

/// Naming of backup siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    /// Literal tag between the artifact name and the timestamp.
    pub tag: String,
    /// `chrono` format string; must sort lexicographically in time order.
    pub timestamp_format: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            tag: "backup".to_string(),
            timestamp_format: "%Y%m%d-%H%M%S".to_string(),
        }
    }
}

/// Resolved configuration for both artifact forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSet {
    pub text: TargetProfile,
    pub binary: TargetProfile,
    pub backup: BackupSettings,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            text: TargetProfile::text(),
            binary: TargetProfile::binary(),
            backup: BackupSettings::default(),
        }
    }
}

impl ProfileSet {
    pub fn profile(&self, format: ArtifactFormat) -> &TargetProfile {
        match format {
            ArtifactFormat::Text => &self.text,
            ArtifactFormat::Binary => &self.binary,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        self.text.collect_issues(&mut issues);
        self.binary.collect_issues(&mut issues);

        if self.backup.tag.trim().is_empty() {
            issues.push(ValidationIssue::InvalidBackup {
                message: "tag must not be empty".to_string(),
            });
        }
        if self.backup.tag.contains(['/', '\\']) {
            issues.push(ValidationIssue::InvalidBackup {
                message: "tag must not contain path separators".to_string(),
            });
        }
        if self.backup.timestamp_format.trim().is_empty() {
            issues.push(ValidationIssue::InvalidBackup {
                message: "timestamp_format must not be empty".to_string(),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

/// On-disk configuration: every field is optional and overlays the defaults.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub text: ProfileOverride,
    #[serde(default)]
    pub binary: ProfileOverride,
    #[serde(default)]
    pub backup: BackupOverride,
}

impl ConfigFile {
    pub fn resolve(&self) -> ProfileSet {
        let mut set = ProfileSet::default();
        set.text.apply(&self.text);
        set.binary.apply(&self.binary);
        if let Some(tag) = &self.backup.tag {
            set.backup.tag = tag.clone();
        }
        if let Some(format) = &self.backup.timestamp_format {
            set.backup.timestamp_format = format.clone();
        }
        set
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverride {
    #[serde(default)]
    pub signatures: Option<Vec<String>>,
    #[serde(default)]
    pub block_opener: Option<String>,
    #[serde(default)]
    pub lookback: Option<usize>,
    #[serde(default)]
    pub lookahead: Option<usize>,
    #[serde(default)]
    pub fix_marker: Option<String>,
    /// An empty string disables the exact-match fast path.
    #[serde(default)]
    pub canonical_block: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct BackupOverride {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    MissingField {
        profile: ArtifactFormat,
        field: &'static str,
    },
    ZeroWindow {
        profile: ArtifactFormat,
        field: &'static str,
    },
    InvalidCombo {
        profile: ArtifactFormat,
        message: String,
    },
    InvalidBackup {
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { profile, field } => {
                write!(f, "{profile} profile missing required field '{field}'")
            }
            ValidationIssue::ZeroWindow { profile, field } => {
                write!(f, "{profile} profile '{field}' must be greater than zero")
            }
            ValidationIssue::InvalidCombo { profile, message } => {
                write!(f, "{profile} profile has invalid configuration: {message}")
            }
            ValidationIssue::InvalidBackup { message } => {
                write!(f, "invalid backup configuration: {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ProfileSet::default().validate().unwrap();
    }

    #[test]
    fn test_canonical_block_length() {
        assert_eq!(CANONICAL_BINARY_BLOCK.len(), 241);
    }

    #[test]
    fn test_text_signature_uses_raw_marker() {
        let text = TargetProfile::text();
        assert!(text.signatures[0].as_bytes().contains(&0x7f));
        assert!(!text.fixed_length());
        assert!(TargetProfile::binary().fixed_length());
    }

    #[test]
    fn test_override_keeps_unset_fields() {
        let file = ConfigFile {
            binary: ProfileOverride {
                lookahead: Some(1200),
                canonical_block: Some(String::new()),
                ..Default::default()
            },
            ..Default::default()
        };
        let set = file.resolve();
        assert_eq!(set.binary.lookahead, 1200);
        assert_eq!(set.binary.canonical_block, None);
        assert_eq!(set.binary.fix_marker, BINARY_FIX_MARKER);
        assert_eq!(set.text, TargetProfile::text());
    }

    #[test]
    fn test_validation_collects_every_issue() {
        let mut set = ProfileSet::default();
        set.text.signatures.clear();
        set.binary.lookback = 0;
        set.backup.tag = "a/b".to_string();
        let err = set.validate().unwrap_err();
        assert_eq!(err.issues.len(), 3);
        let rendered = err.to_string();
        assert!(rendered.contains("signatures"));
        assert!(rendered.contains("lookback"));
        assert!(rendered.contains("path separators"));
    }
}
