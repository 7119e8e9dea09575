//! Emitting corrected code bound to the extracted identifiers.
//!
//! The fragment implements delete-then-reinsert: count the delete-markers in
//! the input, strip them, apply that many `backspace()` reductions to the
//! baseline state and one `insert(c)` per remaining character, then publish.
//! [`crate::model`] mirrors these semantics in Rust.
//!
//! Binary artifacts are offset-sensitive, so in [`SynthMode::FixedLength`] the
//! fragment must be exactly as long as the block it replaces. A shorter
//! fragment is padded with spaces immediately before its final `}`; a longer
//! one is rejected.

use crate::config::TargetProfile;
use crate::extract::Extraction;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// How the fragment may relate to the block it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthMode {
    /// No length constraint.
    Growable,
    /// Same byte length as the replaced block.
    FixedLength,
}

/// Replacement bytes for one defect block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixFragment {
    pub bytes: Vec<u8>,
    /// Length before padding.
    pub natural_len: usize,
    /// Spaces inserted before the final `}`.
    pub padding: usize,
}

impl FixFragment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthError {
    #[error("fix fragment needs {needed} bytes but the block only has {available}")]
    LengthOverflow { needed: usize, available: usize },

    #[error("no free local identifier left for the fragment")]
    NoFreeLocal,
}

/// Block-local names the fragment declares.
struct Locals {
    count: String,
    stripped: String,
    state: String,
    index: String,
    ch: String,
}

/// Hands out identifiers that collide with nothing the fragment references.
struct LocalAllocator<'a> {
    taken: HashSet<&'a str>,
    issued: HashSet<String>,
}

impl<'a> LocalAllocator<'a> {
    fn new(taken: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            taken: taken.into_iter().collect(),
            issued: HashSet::new(),
        }
    }

    fn is_free(&self, name: &str) -> bool {
        !self.taken.contains(name) && !self.issued.contains(name)
    }

    fn claim(&mut self, name: String) -> String {
        self.issued.insert(name.clone());
        name
    }

    /// `preferred`, else `preferred1`, `preferred2`, ...
    fn suffixed(&mut self, preferred: &str) -> String {
        if self.is_free(preferred) {
            return self.claim(preferred.to_string());
        }
        let name = (1..)
            .map(|n| format!("{preferred}{n}"))
            .find(|candidate| self.is_free(candidate))
            .unwrap_or_default();
        self.claim(name)
    }

    /// A single letter, `preferred` first.
    fn letter(&mut self, preferred: char) -> Result<String, SynthError> {
        let name = std::iter::once(preferred)
            .chain('a'..='z')
            .chain('A'..='Z')
            .map(String::from)
            .find(|candidate| self.is_free(candidate))
            .ok_or(SynthError::NoFreeLocal)?;
        Ok(self.claim(name))
    }
}

/// Builds [`FixFragment`]s for one marker and mode.
#[derive(Debug, Clone)]
pub struct FixSynthesizer {
    marker: String,
    mode: SynthMode,
}

impl FixSynthesizer {
    pub fn new(marker: impl Into<String>, mode: SynthMode) -> Self {
        Self {
            marker: marker.into(),
            mode,
        }
    }

    pub fn for_profile(profile: &TargetProfile) -> Self {
        let mode = if profile.fixed_length() {
            SynthMode::FixedLength
        } else {
            SynthMode::Growable
        };
        Self::new(profile.fix_marker.clone(), mode)
    }

    pub fn mode(&self) -> SynthMode {
        self.mode
    }

    /// Emit the corrected block for `extraction`, replacing a block of
    /// `block_len` bytes.
    pub fn synthesize(
        &self,
        extraction: &Extraction,
        block_len: usize,
    ) -> Result<FixFragment, SynthError> {
        match self.mode {
            SynthMode::Growable => {
                let source = self.growable(extraction);
                let natural_len = source.len();
                Ok(FixFragment {
                    bytes: source.into_bytes(),
                    natural_len,
                    padding: 0,
                })
            }
            SynthMode::FixedLength => {
                let source = self.fixed_length(extraction)?;
                let fragment = pad_to(source, block_len)?;
                debug!(
                    natural = fragment.natural_len,
                    padding = fragment.padding,
                    "synthesized fixed-length fragment"
                );
                Ok(fragment)
            }
        }
    }

    fn condition(extraction: &Extraction) -> String {
        let input = &extraction.bindings.input_var;
        match &extraction.guard {
            Some(guard) => format!(
                r#"!{guard}.backspace&&!{guard}.delete&&{input}.includes("\x7f")"#
            ),
            None => format!(r#"{input}.includes("\x7f")"#),
        }
    }

    /// Readable form for text bundles; keeps the bound state identifier and
    /// the whole epilogue.
    fn growable(&self, extraction: &Extraction) -> String {
        let b = &extraction.bindings;
        let mut alloc = LocalAllocator::new(extraction.referenced_identifiers());
        let locals = Locals {
            count: alloc.suffixed("_n"),
            stripped: alloc.suffixed("_vn"),
            state: b.edit_state_var.clone(),
            index: alloc.suffixed("_i"),
            ch: alloc.suffixed("_c"),
        };
        let Locals {
            count: n,
            stripped: v,
            state: s,
            index: i,
            ch: c,
        } = &locals;
        let (input, base) = (&b.input_var, &b.baseline_state_var);
        let (text_fn, offset_fn) = (&b.text_publish_fn, &b.offset_publish_fn);

        let mut out = String::new();
        out.push_str(&self.marker);
        out.push_str(&format!("if({}){{", Self::condition(extraction)));
        out.push_str(&format!(
            r#"let {n}=({input}.match(/\x7f/g)||[]).length,{v}={input}.replace(/\x7f/g,""),{s}={base};"#
        ));
        out.push_str(&format!("for(let {i}=0;{i}<{n};{i}++){s}={s}.backspace();"));
        out.push_str(&format!("for(const {c} of {v}){s}={s}.insert({c});"));
        out.push_str(&format!(
            "if(!{base}.equals({s})){{if({base}.text!=={s}.text){text_fn}({s}.text);{offset_fn}({s}.offset)}}"
        ));
        for call in &extraction.epilogue.calls {
            out.push_str(&format!("{call}();"));
        }
        if extraction.epilogue.returns {
            out.push_str("return;");
        }
        out.push('}');
        out
    }

    /// Compact form for binaries: single-letter locals, marker count derived
    /// from the stripped length, trailing epilogue calls omitted.
    fn fixed_length(&self, extraction: &Extraction) -> Result<String, SynthError> {
        let b = &extraction.bindings;
        let mut alloc = LocalAllocator::new(extraction.referenced_identifiers());
        let v = alloc.letter('v')?;
        let n = alloc.letter('n')?;
        let s = alloc.letter('s')?;
        let c = alloc.letter('c')?;
        let (input, base) = (&b.input_var, &b.baseline_state_var);
        let (text_fn, offset_fn) = (&b.text_publish_fn, &b.offset_publish_fn);

        let mut out = String::new();
        out.push_str(&self.marker);
        out.push_str(&format!("if({}){{", Self::condition(extraction)));
        out.push_str(&format!(
            r#"let {v}={input}.replace(/\x7f/g,""),{n}={input}.length-{v}.length,{s}={base};"#
        ));
        out.push_str(&format!("for(;{n}--;){s}={s}.backspace();"));
        out.push_str(&format!("for(let {c} of {v}){s}={s}.insert({c});"));
        out.push_str(&format!(
            "if(!{base}.equals({s})){{if({base}.text!=={s}.text){text_fn}({s}.text);{offset_fn}({s}.offset)}}"
        ));
        if extraction.epilogue.returns {
            out.push_str("return");
        }
        out.push('}');
        Ok(out)
    }
}

/// Pad `source` with spaces before its final `}` up to exactly `target` bytes.
fn pad_to(source: String, target: usize) -> Result<FixFragment, SynthError> {
    let natural_len = source.len();
    if natural_len > target {
        return Err(SynthError::LengthOverflow {
            needed: natural_len,
            available: target,
        });
    }

    let padding = target - natural_len;
    let mut bytes = source.into_bytes();
    // Every emitted fragment ends with the block's closing brace.
    let close = bytes.len() - 1;
    bytes.splice(close..close, std::iter::repeat(b' ').take(padding));

    Ok(FixFragment {
        bytes,
        natural_len,
        padding,
    })
}
