//! Static bound on the number of compile passes.

use std::sync::LazyLock;

use regex::Regex;

static THREE_PASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\\(?:tableofcontents|listoffigures|listoftables|makeindex|printindex|makeglossaries|printglossar(?:y|ies))\b",
    )
    .expect("three-pass pattern")
});

static TWO_PASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\\(?:[cC]ite[a-zA-Z]*|(?:eq|page|auto|name|c|C|v)?ref|label|bibliography|printbibliography|addbibresource)\b",
    )
    .expect("two-pass pattern")
});

/// Predict how many passes a source needs: 3, 2 or 1.
///
/// Tables of contents, lists and indexes need three; citations, references
/// and labels need two; everything else one.
pub fn predict_passes(source: &str) -> u32 {
    if THREE_PASS.is_match(source) {
        3
    } else if TWO_PASS.is_match(source) {
        2
    } else {
        1
    }
}
