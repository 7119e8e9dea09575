//! Recovering build-specific identifiers from a located defect block.
//!
//! Each known historical layout of the block is a [`BlockShape`]: a
//! literal-token skeleton interleaved with identifier slots. Shapes are tried
//! in priority order and the first whose skeleton matches the start of the
//! block wins; results are never merged across shapes. Once the edit-state
//! identifier is known, the two publish callbacks are recovered from the
//! literal subsequence `T(S.text);O(S.offset)}` and the input identifier from
//! the signature occurrence. Any ambiguity is a hard failure.

use crate::cache;
use crate::locate::DefectBlock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

const IDENT: &str = r"([A-Za-z0-9_$]+)";

/// Semantic roles every supported block layout binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    InputVar,
    MarkerCountVar,
    EditStateVar,
    BaselineStateVar,
    TextPublishFn,
    OffsetPublishFn,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::InputVar,
        Role::MarkerCountVar,
        Role::EditStateVar,
        Role::BaselineStateVar,
        Role::TextPublishFn,
        Role::OffsetPublishFn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::InputVar => "inputVar",
            Role::MarkerCountVar => "markerCountVar",
            Role::EditStateVar => "editStateVar",
            Role::BaselineStateVar => "baselineStateVar",
            Role::TextPublishFn => "textPublishFn",
            Role::OffsetPublishFn => "offsetPublishFn",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One identifier token per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindings {
    pub input_var: String,
    pub marker_count_var: String,
    pub edit_state_var: String,
    pub baseline_state_var: String,
    pub text_publish_fn: String,
    pub offset_publish_fn: String,
}

impl RoleBindings {
    pub fn get(&self, role: Role) -> &str {
        match role {
            Role::InputVar => &self.input_var,
            Role::MarkerCountVar => &self.marker_count_var,
            Role::EditStateVar => &self.edit_state_var,
            Role::BaselineStateVar => &self.baseline_state_var,
            Role::TextPublishFn => &self.text_publish_fn,
            Role::OffsetPublishFn => &self.offset_publish_fn,
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> + '_ {
        Role::ALL.into_iter().map(move |role| self.get(role))
    }
}

/// What follows the publish callbacks inside the block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Epilogue {
    /// Zero-argument calls, in order.
    pub calls: Vec<String>,
    /// Whether the block ends by returning.
    pub returns: bool,
}

/// Bindings plus the shape-specific context the synthesizer must preserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extraction {
    pub shape: BlockShape,
    pub bindings: RoleBindings,
    /// Receiver of the `!G.backspace&&!G.delete&&` key guard, when present.
    pub guard: Option<String>,
    pub epilogue: Epilogue,
}

impl Extraction {
    /// Every identifier the emitted fragment will reference.
    pub fn referenced_identifiers(&self) -> Vec<&str> {
        let mut idents: Vec<&str> = self.bindings.tokens().collect();
        idents.extend(self.guard.as_deref());
        idents.extend(self.epilogue.calls.iter().map(String::as_str));
        idents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Role(Role),
    Guard,
    LoopIndex,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Role(role) => write!(f, "{role}"),
            Slot::Guard => f.write_str("guard"),
            Slot::LoopIndex => f.write_str("loopIndex"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Piece {
    Lit(&'static str),
    Ident(Slot),
    /// Declaration separator: `,` or `;`.
    Sep,
}

use Piece::{Ident, Lit, Sep};

const I: Piece = Ident(Slot::Role(Role::InputVar));
const C: Piece = Ident(Slot::Role(Role::MarkerCountVar));
const S: Piece = Ident(Slot::Role(Role::EditStateVar));
const B: Piece = Ident(Slot::Role(Role::BaselineStateVar));
const G: Piece = Ident(Slot::Guard);
const K: Piece = Ident(Slot::LoopIndex);

#[rustfmt::skip]
const GUARDED_TOKEN_LOOP: &[Piece] = &[
    Lit("if(!"), G, Lit(".backspace&&!"), G, Lit(".delete&&"), I,
    Lit(r#".includes("\x7f")){let "#), C, Lit("=("), I,
    Lit(r".match(/\x7f/g)||[]).length,"), S, Lit("="), B,
    Lit(";for(let "), K, Lit("=0;"), K, Lit("<"), C, Lit(";"), K, Lit("++)"),
    S, Lit("="), S, Lit(".deleteTokenBefore()??"), S, Lit(".backspace();if(!"),
    B, Lit(".equals("), S, Lit(")){"),
];

#[rustfmt::skip]
const GUARDED_BACKSPACE_LOOP: &[Piece] = &[
    Lit("if(!"), G, Lit(".backspace&&!"), G, Lit(".delete&&"), I,
    Lit(r#".includes("\x7f")){let "#), C, Lit("=("), I,
    Lit(r".match(/\x7f/g)||[]).length"), Sep, S, Lit("="), B, Sep,
];

#[rustfmt::skip]
const PLAIN_BACKSPACE_LOOP: &[Piece] = &[
    Lit("if("), I, Lit(r#".includes("\x7f")){let "#), C, Lit("=("), I,
    Lit(r".match(/\x7f/g)||[]).length"), Sep, S, Lit("="), B, Sep,
];

/// Known layouts of the defect block, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockShape {
    /// Key-guarded block whose loop prefers `deleteTokenBefore()`.
    GuardedTokenLoop,
    /// Key-guarded block with any deletion loop.
    GuardedBackspaceLoop,
    /// Unguarded block with any deletion loop.
    PlainBackspaceLoop,
}

impl BlockShape {
    pub const PRIORITY: [BlockShape; 3] = [
        BlockShape::GuardedTokenLoop,
        BlockShape::GuardedBackspaceLoop,
        BlockShape::PlainBackspaceLoop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BlockShape::GuardedTokenLoop => "guarded-token-loop",
            BlockShape::GuardedBackspaceLoop => "guarded-backspace-loop",
            BlockShape::PlainBackspaceLoop => "plain-backspace-loop",
        }
    }

    fn skeleton(self) -> &'static [Piece] {
        match self {
            BlockShape::GuardedTokenLoop => GUARDED_TOKEN_LOOP,
            BlockShape::GuardedBackspaceLoop => GUARDED_BACKSPACE_LOOP,
            BlockShape::PlainBackspaceLoop => PLAIN_BACKSPACE_LOOP,
        }
    }

    /// Anchored regex for the skeleton, with one group per identifier slot.
    fn pattern(self) -> (String, Vec<Slot>) {
        let mut pattern = String::from("^");
        let mut slots = Vec::new();
        for piece in self.skeleton() {
            match piece {
                Lit(text) => pattern.push_str(&regex::escape(text)),
                Ident(slot) => {
                    pattern.push_str(IDENT);
                    slots.push(*slot);
                }
                Sep => pattern.push_str("[,;]"),
            }
        }
        (pattern, slots)
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no known block shape matches the defect block")]
    NoTemplate,

    #[error("{shape} matched but {what} could not be found")]
    MissingSubpattern { shape: BlockShape, what: &'static str },

    #[error("{shape} matched but {what} occurs {count} times")]
    AmbiguousSubpattern {
        shape: BlockShape,
        what: &'static str,
        count: usize,
    },

    #[error("{shape} bound {slot} to both `{first}` and `{second}`")]
    ConflictingBinding {
        shape: BlockShape,
        slot: String,
        first: String,
        second: String,
    },

    #[error("{shape} matched but the block ends with unrecognized code `{text}`")]
    UnrecognizedEpilogue { shape: BlockShape, text: String },

    #[error("invalid matcher pattern: {0}")]
    Pattern(String),
}

impl From<regex::Error> for ExtractError {
    fn from(e: regex::Error) -> Self {
        ExtractError::Pattern(e.to_string())
    }
}

/// Evaluates block shapes in priority order.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierExtractor {
    shapes: &'static [BlockShape],
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierExtractor {
    pub fn new() -> Self {
        Self {
            shapes: &BlockShape::PRIORITY,
        }
    }

    #[cfg(test)]
    fn with_shapes(shapes: &'static [BlockShape]) -> Self {
        Self { shapes }
    }

    pub fn extract(&self, block: &DefectBlock) -> Result<Extraction, ExtractError> {
        let normalized = normalize(&block.bytes);

        for &shape in self.shapes {
            let (pattern, slots) = shape.pattern();
            let re = cache::get_or_compile(&pattern)?;
            let Some(caps) = re.captures(&normalized) else {
                continue;
            };

            debug!(shape = shape.name(), "block shape matched");
            let mut binder = Binder::new(shape);
            for (idx, slot) in slots.iter().enumerate() {
                if let Some(m) = caps.get(idx + 1) {
                    binder.bind(*slot, ident(m.as_bytes()))?;
                }
            }
            return binder.finish(&normalized);
        }

        Err(ExtractError::NoTemplate)
    }
}

/// Collects slot values, rejecting a second different token for any slot.
struct Binder {
    shape: BlockShape,
    values: HashMap<Slot, String>,
}

impl Binder {
    fn new(shape: BlockShape) -> Self {
        Self {
            shape,
            values: HashMap::new(),
        }
    }

    fn bind(&mut self, slot: Slot, value: String) -> Result<(), ExtractError> {
        match self.values.get(&slot) {
            Some(existing) if *existing != value => Err(ExtractError::ConflictingBinding {
                shape: self.shape,
                slot: slot.to_string(),
                first: existing.clone(),
                second: value,
            }),
            Some(_) => Ok(()),
            None => {
                self.values.insert(slot, value);
                Ok(())
            }
        }
    }

    fn required(&self, role: Role) -> Result<String, ExtractError> {
        self.values
            .get(&Slot::Role(role))
            .cloned()
            .ok_or(ExtractError::MissingSubpattern {
                shape: self.shape,
                what: role.name(),
            })
    }

    fn finish(mut self, block: &[u8]) -> Result<Extraction, ExtractError> {
        let shape = self.shape;
        let state = self.required(Role::EditStateVar)?;

        // The input identifier as written at the signature itself.
        let signature_re = cache::get_or_compile(&format!(r#"{IDENT}\.includes\(""#))?;
        let input = signature_re
            .captures(block)
            .and_then(|caps| caps.get(1))
            .ok_or(ExtractError::MissingSubpattern {
                shape,
                what: "input identifier",
            })?;
        self.bind(Slot::Role(Role::InputVar), ident(input.as_bytes()))?;

        let escaped = regex::escape(&state);
        let publish_re = cache::get_or_compile(&format!(
            r"{IDENT}\({escaped}\.text\);{IDENT}\({escaped}\.offset\)\}}"
        ))?;
        let publishes: Vec<_> = publish_re.captures_iter(block).collect();
        let publish = match publishes.as_slice() {
            [] => {
                return Err(ExtractError::MissingSubpattern {
                    shape,
                    what: "publish callbacks",
                })
            }
            [one] => one,
            many => {
                return Err(ExtractError::AmbiguousSubpattern {
                    shape,
                    what: "publish callbacks",
                    count: many.len(),
                })
            }
        };
        let (Some(whole), Some(text_fn), Some(offset_fn)) =
            (publish.get(0), publish.get(1), publish.get(2))
        else {
            return Err(ExtractError::MissingSubpattern {
                shape,
                what: "publish callbacks",
            });
        };
        self.bind(Slot::Role(Role::TextPublishFn), ident(text_fn.as_bytes()))?;
        self.bind(Slot::Role(Role::OffsetPublishFn), ident(offset_fn.as_bytes()))?;

        // Everything between the callbacks and the block's own closing brace.
        let tail_end = block.len().saturating_sub(1);
        let tail = if whole.end() <= tail_end {
            &block[whole.end()..tail_end]
        } else {
            &[][..]
        };
        let epilogue = parse_epilogue(tail).ok_or_else(|| ExtractError::UnrecognizedEpilogue {
            shape,
            text: String::from_utf8_lossy(tail).into_owned(),
        })?;

        let bindings = RoleBindings {
            input_var: self.required(Role::InputVar)?,
            marker_count_var: self.required(Role::MarkerCountVar)?,
            edit_state_var: state,
            baseline_state_var: self.required(Role::BaselineStateVar)?,
            text_publish_fn: self.required(Role::TextPublishFn)?,
            offset_publish_fn: self.required(Role::OffsetPublishFn)?,
        };
        if bindings.edit_state_var == bindings.baseline_state_var {
            return Err(ExtractError::ConflictingBinding {
                shape,
                slot: format!("{} and {}", Role::EditStateVar, Role::BaselineStateVar),
                first: bindings.edit_state_var.clone(),
                second: bindings.baseline_state_var.clone(),
            });
        }

        debug!(
            input = %bindings.input_var,
            state = %bindings.edit_state_var,
            baseline = %bindings.baseline_state_var,
            "extracted role bindings"
        );

        Ok(Extraction {
            shape,
            bindings,
            guard: self.values.remove(&Slot::Guard),
            epilogue,
        })
    }
}

/// Parse `(name()[,;])* (return;?)?`.
fn parse_epilogue(mut tail: &[u8]) -> Option<Epilogue> {
    let mut epilogue = Epilogue::default();
    loop {
        if tail.is_empty() {
            return Some(epilogue);
        }
        if let Some(rest) = tail.strip_prefix(b"return") {
            if rest.is_empty() || rest == b";" {
                epilogue.returns = true;
                return Some(epilogue);
            }
            return None;
        }

        let name_len = tail.iter().take_while(|b| is_ident_byte(**b)).count();
        if name_len == 0 {
            return None;
        }
        let (name, rest) = tail.split_at(name_len);
        let rest = rest.strip_prefix(b"()")?;
        epilogue.calls.push(ident(name));
        tail = match rest.first() {
            Some(b',') | Some(b';') => &rest[1..],
            None => rest,
            Some(_) => return None,
        };
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn ident(bytes: &[u8]) -> String {
    // Identifier groups only ever match ASCII.
    String::from_utf8_lossy(bytes).into_owned()
}

/// Rewrite every spelling of the delete-marker to the `\x7f` escape.
fn normalize(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 8);
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == 0x7f {
            out.extend_from_slice(br"\x7f");
            idx += 1;
        } else if bytes[idx..].starts_with(br"\x7F") {
            out.extend_from_slice(br"\x7f");
            idx += 4;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CANONICAL_BINARY_BLOCK;

    fn block(text: &str) -> DefectBlock {
        DefectBlock {
            start: 0,
            end: text.len(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    const SCENARIO: &str = "if(x.includes(\"\u{7f}\")){let c=(x.match(/\\x7f/g)||[]).length,s=cur;for(i=0;i<c;i++)s=s.backspace();if(!cur.equals(s)){if(cur.text!==s.text)setText(s.text);setOffset(s.offset)}}";

    #[test]
    fn test_scenario_bindings() {
        let extraction = IdentifierExtractor::new().extract(&block(SCENARIO)).unwrap();
        assert_eq!(extraction.shape, BlockShape::PlainBackspaceLoop);
        let b = &extraction.bindings;
        assert_eq!(b.input_var, "x");
        assert_eq!(b.marker_count_var, "c");
        assert_eq!(b.edit_state_var, "s");
        assert_eq!(b.baseline_state_var, "cur");
        assert_eq!(b.text_publish_fn, "setText");
        assert_eq!(b.offset_publish_fn, "setOffset");
        assert_eq!(extraction.guard, None);
        assert_eq!(extraction.epilogue, Epilogue::default());
    }

    #[test]
    fn test_canonical_binary_block() {
        let extraction = IdentifierExtractor::new()
            .extract(&block(CANONICAL_BINARY_BLOCK))
            .unwrap();
        assert_eq!(extraction.shape, BlockShape::GuardedTokenLoop);
        let b = &extraction.bindings;
        assert_eq!(b.input_var, "RT");
        assert_eq!(b.marker_count_var, "XT");
        assert_eq!(b.edit_state_var, "IT");
        assert_eq!(b.baseline_state_var, "b");
        assert_eq!(b.text_publish_fn, "R");
        assert_eq!(b.offset_publish_fn, "w");
        assert_eq!(extraction.guard.as_deref(), Some("DT"));
        assert_eq!(extraction.epilogue.calls, vec!["WyT", "QyT"]);
        assert!(extraction.epilogue.returns);
    }

    #[test]
    fn test_dollar_identifiers() {
        let text = CANONICAL_BINARY_BLOCK
            .replace("RT", "$r")
            .replace("IT", "I$");
        let extraction = IdentifierExtractor::new().extract(&block(&text)).unwrap();
        assert_eq!(extraction.bindings.input_var, "$r");
        assert_eq!(extraction.bindings.edit_state_var, "I$");
    }

    #[test]
    fn test_guarded_block_with_other_loop_falls_to_second_shape() {
        let text = r#"if(!k.backspace&&!k.delete&&v.includes("\x7F")){let n=(v.match(/\x7f/g)||[]).length;st=base;while(n--)st=st.backspace();if(!base.equals(st)){if(base.text!==st.text)pt(st.text);po(st.offset)}return;}"#;
        let extraction = IdentifierExtractor::new().extract(&block(text)).unwrap();
        assert_eq!(extraction.shape, BlockShape::GuardedBackspaceLoop);
        assert_eq!(extraction.guard.as_deref(), Some("k"));
        assert_eq!(extraction.bindings.edit_state_var, "st");
        assert_eq!(extraction.bindings.baseline_state_var, "base");
        assert!(extraction.epilogue.returns);
        assert!(extraction.epilogue.calls.is_empty());
    }

    #[test]
    fn test_first_matching_shape_wins() {
        let only_plain: &'static [BlockShape] = &[BlockShape::PlainBackspaceLoop];
        let err = IdentifierExtractor::with_shapes(only_plain)
            .extract(&block(CANONICAL_BINARY_BLOCK))
            .unwrap_err();
        assert_eq!(err, ExtractError::NoTemplate);
    }

    #[test]
    fn test_conflicting_guard_rejected() {
        let text = CANONICAL_BINARY_BLOCK.replacen("!DT.delete", "!ET.delete", 1);
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ConflictingBinding { ref slot, .. } if slot == "guard"
        ));
    }

    #[test]
    fn test_conflicting_input_rejected() {
        let text = CANONICAL_BINARY_BLOCK.replacen("(RT.match", "(QT.match", 1);
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(err, ExtractError::ConflictingBinding { .. }));
    }

    #[test]
    fn test_missing_callbacks() {
        let text = SCENARIO.replace("setOffset(s.offset)", "setOffset(s.pos)");
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::MissingSubpattern { what: "publish callbacks", .. }
        ));
    }

    #[test]
    fn test_ambiguous_callbacks() {
        let text = SCENARIO.replace(
            "setOffset(s.offset)}}",
            "setOffset(s.offset)}a(s.text);o(s.offset)}}",
        );
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::AmbiguousSubpattern { count: 2, .. }
        ));
    }

    #[test]
    fn test_unrecognized_epilogue() {
        let text = CANONICAL_BINARY_BLOCK.replace("WyT(),QyT();", "WyT(1);");
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(err, ExtractError::UnrecognizedEpilogue { .. }));
    }

    #[test]
    fn test_same_state_and_baseline_rejected() {
        let text = SCENARIO.replace("s=cur;", "s=s;").replace("cur.", "s.");
        let err = IdentifierExtractor::new().extract(&block(&text)).unwrap_err();
        assert!(matches!(err, ExtractError::ConflictingBinding { .. }));
    }

    #[test]
    fn test_unknown_layout() {
        let err = IdentifierExtractor::new()
            .extract(&block(r#"if(x.includes("\x7f")){x=x.slice(1)}"#))
            .unwrap_err();
        assert_eq!(err, ExtractError::NoTemplate);
    }

    #[test]
    fn test_parse_epilogue() {
        assert_eq!(parse_epilogue(b""), Some(Epilogue::default()));
        assert_eq!(
            parse_epilogue(b"a(),b();return"),
            Some(Epilogue {
                calls: vec!["a".into(), "b".into()],
                returns: true
            })
        );
        assert_eq!(
            parse_epilogue(b"done()"),
            Some(Epilogue {
                calls: vec!["done".into()],
                returns: false
            })
        );
        assert_eq!(parse_epilogue(b"return x"), None);
        assert_eq!(parse_epilogue(b"x=1"), None);
    }

    #[test]
    fn test_normalize_spellings() {
        assert_eq!(normalize(b"\x7f"), br"\x7f".to_vec());
        assert_eq!(normalize(br#""\x7F""#), br#""\x7f""#.to_vec());
        assert_eq!(normalize(b"plain"), b"plain".to_vec());
    }
}
