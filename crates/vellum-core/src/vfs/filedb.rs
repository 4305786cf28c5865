//! kpathsea filename database (`ls-R`) generation.

use std::collections::BTreeMap;

/// Root of the TeX tree inside the virtual filesystem.
pub const TEXMF_ROOT: &str = "/texlive/texmf-dist";

/// Location of the generated database.
pub const FILE_DATABASE_PATH: &str = "/texlive/texmf-dist/ls-R";

const HEADER: &str = "% ls-R -- filename database for kpathsea; do not change this line.\n";

/// Render `ls-R` for every path under [`TEXMF_ROOT`].
pub fn render<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut dirs: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for path in paths {
        let Some(rest) = path.strip_prefix(TEXMF_ROOT) else {
            continue;
        };
        let Some((dir, name)) = rest.rsplit_once('/') else {
            continue;
        };
        if name == "ls-R" {
            continue;
        }
        dirs.entry(dir).or_default().push(name);
    }

    let mut out = String::from(HEADER);
    for (dir, mut names) in dirs {
        names.sort_unstable();
        out.push_str(&format!("\n.{dir}:\n"));
        for name in names {
            out.push_str(name);
            out.push('\n');
        }
    }
    out
}
