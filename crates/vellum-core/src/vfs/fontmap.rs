//! Font-map post-processing.
//!
//! Package map files (`pdftex.map` syntax) name Type 1 fonts and encodings by
//! bare file name (`<ptmr8a.pfb`, `<<cm-super-t1.enc`, `<[8r.enc`). The
//! sandboxed compiler has no working path search for these, so every
//! reference is rewritten to the absolute virtual path of the mounted file,
//! and all package maps are merged into the one map the engine loads.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use rustc_hash::FxHashMap;

/// Merged map consulted by the engine.
pub const MERGED_MAP_PATH: &str = "/texlive/texmf-dist/fonts/map/pdftex/updmap/pdftex.map";

const TYPE1_ROOT: &str = "/texlive/texmf-dist/fonts/type1";
const ENC_ROOT: &str = "/texlive/texmf-dist/fonts/enc/dvips";

/// `<name.pfb`, `<<name.enc`, `<[name.enc`; names already holding a `/`
/// are absolute and skipped.
static FONT_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(<<|<\[|<)([^\s"<\[/]+\.(?:pfb|pfa|enc))"#).expect("font reference pattern")
});

/// Whether a path is a font file whose location the map rewriter records.
pub fn is_font_file(path: &str) -> bool {
    path.ends_with(".pfb") || path.ends_with(".enc")
}

/// Whether a path is a font map.
pub fn is_font_map(path: &str) -> bool {
    path.ends_with(".map") && path != MERGED_MAP_PATH
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Candidate directories for a referenced file, most specific first.
///
/// The package name is the directory holding the map file, e.g.
/// `/texlive/texmf-dist/fonts/map/dvips/tex-gyre/qtm.map` → `tex-gyre`.
fn candidate_dirs(map_path: &str, file_name: &str) -> Vec<String> {
    let map_dir = parent_dir(map_path);
    let package = map_dir.rsplit('/').next().unwrap_or_default();

    let mut dirs = if file_name.ends_with(".enc") {
        vec![format!("{ENC_ROOT}/{package}"), format!("{ENC_ROOT}/base")]
    } else {
        vec![
            format!("{TYPE1_ROOT}/public/{package}"),
            format!("{TYPE1_ROOT}/public/amsfonts/cm"),
        ]
    };
    dirs.push(map_dir.to_string());
    dirs
}

/// Rewrite references by probing candidate directories.
///
/// `exists` answers whether a virtual path is mounted. Unmatched references
/// are left untouched.
pub fn rewrite_with_candidates(map_path: &str, content: &str, exists: impl Fn(&str) -> bool) -> String {
    FONT_REF
        .replace_all(content, |caps: &Captures<'_>| {
            let (prefix, name) = (&caps[1], &caps[2]);
            candidate_dirs(map_path, name)
                .into_iter()
                .map(|dir| format!("{dir}/{name}"))
                .find(|candidate| exists(candidate))
                .map_or_else(|| caps[0].to_string(), |path| format!("{prefix}{path}"))
        })
        .into_owned()
}

/// Rewrite references from the exact basename → path table recorded at
/// mount time.
pub fn rewrite_with_table(content: &str, table: &FxHashMap<String, String>) -> String {
    FONT_REF
        .replace_all(content, |caps: &Captures<'_>| match table.get(&caps[2]) {
            Some(path) => format!("{}{path}", &caps[1]),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Merge map contents into one table.
///
/// The first definition of a TeX font name wins; comments and blank lines
/// are dropped.
pub fn merge_maps<'a>(maps: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen = BTreeSet::new();
    let mut merged = String::new();

    for content in maps {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('%') {
                continue;
            }
            let Some(font) = trimmed.split_whitespace().next() else {
                continue;
            };
            if seen.insert(font.to_string()) {
                merged.push_str(trimmed);
                merged.push('\n');
            }
        }
    }

    merged
}
