//! Source rewriting before each attempt.
//!
//! The document is never parsed. Edits are line-level insertions keyed on a
//! few literal markers (`\begin{document}`, `\usepackage{...}`).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::engine::EngineKind;

const BEGIN_DOCUMENT: &str = "\\begin{document}";

/// Workaround for `microtype` font expansion, which XeTeX does not support.
const MICROTYPE_WORKAROUND: &str = "\\PassOptionsToPackage{expansion=false}{microtype}";

static MICROTYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:usepackage|RequirePackage)\s*(?:\[[^\]]*\])?\s*\{[^}]*\bmicrotype\b[^}]*\}")
        .expect("microtype pattern")
});

/// Rewrites a document source for one attempt.
///
/// Applies, in order:
/// - the `microtype` option workaround for XeTeX
/// - `\providecommand` stubs for macros seen undefined in earlier attempts
/// - preamble stripping when a cached preamble format is used
pub struct SourceTransformer<'a> {
    engine: EngineKind,
    shims: &'a BTreeMap<String, usize>,
    strip_preamble: bool,
}

impl<'a> SourceTransformer<'a> {
    /// Create a transformer.
    pub fn new(engine: EngineKind, shims: &'a BTreeMap<String, usize>) -> Self {
        Self {
            engine,
            shims,
            strip_preamble: false,
        }
    }

    /// Drop everything before `\begin{document}`.
    pub fn strip_preamble(mut self, strip: bool) -> Self {
        self.strip_preamble = strip;
        self
    }

    /// Produce the source to write into the sandbox.
    pub fn apply(&self, source: &str) -> String {
        let needs_workaround =
            self.engine == EngineKind::XeLatex && MICROTYPE.is_match(source) && !self.strip_preamble;

        let body = match source.find(BEGIN_DOCUMENT) {
            Some(idx) if self.strip_preamble => &source[idx..],
            _ => source,
        };

        let shims = self.shim_block();
        let mut out = String::with_capacity(body.len() + shims.len() + MICROTYPE_WORKAROUND.len() + 2);
        if needs_workaround {
            out.push_str(MICROTYPE_WORKAROUND);
            out.push('\n');
        }

        match body.find(BEGIN_DOCUMENT) {
            Some(idx) if !shims.is_empty() => {
                out.push_str(&body[..idx]);
                out.push_str(&shims);
                out.push_str(&body[idx..]);
            }
            _ => {
                out.push_str(&shims);
                out.push_str(body);
            }
        }
        out
    }

    fn shim_block(&self) -> String {
        self.shims
            .iter()
            .map(|(name, &arity)| shim_line(name, arity))
            .collect()
    }
}

/// One `\providecommand` stub.
///
/// Names that are not plain letters (expl3 names with `_` or `:`) are
/// defined through `\csname` so the current catcodes do not matter.
pub fn shim_line(name: &str, arity: usize) -> String {
    let target = if name.chars().all(|c| c.is_ascii_alphabetic() || c == '@') {
        format!("{{\\{name}}}")
    } else {
        format!("\\csname {name}\\endcsname")
    };
    let prefix = if target.starts_with('{') {
        "\\providecommand"
    } else {
        "\\expandafter\\providecommand"
    };
    if arity == 0 {
        format!("{prefix}{target}{{}}\n")
    } else {
        format!("{prefix}{target}[{arity}]{{}}\n")
    }
}

/// Preamble of a document, followed by `\dump`, for format generation.
pub fn format_source(preamble: &str) -> String {
    let preamble = match preamble.find(BEGIN_DOCUMENT) {
        Some(idx) => &preamble[..idx],
        None => preamble,
    };
    format!("{}\n\\dump\n", preamble.trim_end())
}
