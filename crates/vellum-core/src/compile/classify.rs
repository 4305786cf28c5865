//! Log scanning for retryable failure signals.
//!
//! TeX logs are semi-structured at best. Everything heuristic about reading
//! them lives here, behind [`classify`], so the patterns can change without
//! touching the retry loop.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::rerun;
use crate::manifest::basename;

/// Upper bound on the arity recorded for an undefined macro.
pub const MAX_ARITY: usize = 9;

/// Something in a log the driver can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A file, font or metric the engine could not find.
    MissingFile {
        /// File name as printed, with an implied extension added.
        name: String,
        /// Package name derived from the file name.
        package: String,
    },
    /// An undefined control sequence.
    UndefinedMacro {
        /// Macro name without the backslash.
        name: String,
        /// Number of brace groups following it in the log context.
        arity: usize,
        /// Package file open at the point of the error.
        owner: Option<String>,
        /// Whether the name looks like a newer kernel feature (tagging,
        /// sockets, document metadata) that an older package release
        /// would not use.
        kernel_feature: bool,
    },
    /// The log asks for another pass.
    RerunSuggested,
}

struct MissingPattern {
    regex: Regex,
    implied_extension: Option<&'static str>,
}

static MISSING_PATTERNS: LazyLock<Vec<MissingPattern>> = LazyLock::new(|| {
    [
        (r"! LaTeX Error: File `([^']+)' not found", None),
        (r"! I can't find file `([^']+)'", None),
        (
            r"! Font [^=\n]*=([^\s:]+)\S* (?:at \S+ )?not loadable: Metric \(TFM\) file (?:or installed font )?not found",
            Some("tfm"),
        ),
        (r"kpathsea: Running mktextfm (\S+)", Some("tfm")),
        (r#"! Package fontspec Error: The font "([^"]+)" cannot be\s+found"#, None),
    ]
    .into_iter()
    .map(|(pattern, implied_extension)| MissingPattern {
        regex: Regex::new(pattern).expect("missing-file pattern"),
        implied_extension,
    })
    .collect()
});

static UNDEFINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:! |\S+:\d+: )Undefined control sequence").expect("undefined pattern")
});

static MACRO_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\([A-Za-z@]+(?:[_:][A-Za-z@_:]*)?)").expect("macro name pattern")
});

static KERNEL_FEATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:tag_|tagpdf|tagstruct|tagmc|socket_)|Tagging|DocumentMetadata")
        .expect("kernel feature pattern")
});

static PACKAGE_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Package ([A-Za-z0-9@_-]+) (?:Error|Warning)").expect("package mention pattern")
});

/// Extensions stripped when deriving a package name from a file name.
const PACKAGE_EXTENSIONS: &[&str] = &["sty", "cls", "tfm", "fd", "def", "cfg", "clo", "ldf"];

/// Scan a log for retryable signals.
///
/// Missing files come first in order of appearance, deduplicated by derived
/// package name; then undefined macros, deduplicated by name keeping the
/// largest arity; then a rerun suggestion if any.
pub fn classify(log: &str) -> Vec<Signal> {
    let mut signals = missing_files(log);
    signals.extend(undefined_macros(log));
    if rerun::suggests_rerun(log) {
        signals.push(Signal::RerunSuggested);
    }
    signals
}

/// Package name a missing file most likely belongs to.
pub fn package_name(file: &str) -> String {
    let name = basename(file.trim_start_matches("./"));
    match name.rsplit_once('.') {
        Some((stem, ext)) if PACKAGE_EXTENSIONS.contains(&ext) => stem.to_string(),
        _ => name.to_string(),
    }
}

fn missing_files(log: &str) -> Vec<Signal> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for pattern in MISSING_PATTERNS.iter() {
        for caps in pattern.regex.captures_iter(log) {
            let (Some(whole), Some(raw)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let raw = raw.as_str().trim_start_matches("./");
            let name = match pattern.implied_extension {
                Some(ext) if !raw.contains('.') => format!("{raw}.{ext}"),
                _ => raw.to_string(),
            };
            found.push((whole.start(), name));
        }
    }
    found.sort_by_key(|(offset, _)| *offset);

    let mut seen = std::collections::BTreeSet::new();
    found
        .into_iter()
        .filter_map(|(_, name)| {
            let package = package_name(&name);
            seen.insert(package.clone())
                .then_some(Signal::MissingFile { name, package })
        })
        .collect()
}

fn undefined_macros(log: &str) -> Vec<Signal> {
    let mut macros: BTreeMap<String, (usize, usize, Option<String>, bool)> = BTreeMap::new();
    let mut order = 0;

    for found in UNDEFINED.find_iter(log) {
        let mut context = log[found.end()..]
            .lines()
            .skip(1)
            .skip_while(|line| line.trim().is_empty());
        let Some(line) = context.next() else {
            continue;
        };
        let Some(name) = MACRO_NAME
            .captures_iter(line)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };

        let arity = count_groups(context.next().unwrap_or_default());
        let kernel_feature = KERNEL_FEATURE.is_match(&name);
        let owner = if kernel_feature {
            owning_package(&log[..found.start()], &log[found.end()..])
        } else {
            None
        };

        let entry = macros.entry(name).or_insert_with(|| {
            order += 1;
            (order, arity, owner.clone(), kernel_feature)
        });
        entry.1 = entry.1.max(arity);
        if entry.2.is_none() {
            entry.2 = owner;
        }
    }

    let mut ordered: Vec<_> = macros.into_iter().collect();
    ordered.sort_by_key(|(_, (order, ..))| *order);
    ordered
        .into_iter()
        .map(|(name, (_, arity, owner, kernel_feature))| Signal::UndefinedMacro {
            name,
            arity,
            owner,
            kernel_feature,
        })
        .collect()
}

/// Count the brace groups at the start of a log continuation line.
///
/// An unterminated group (the line was cut) still counts.
fn count_groups(line: &str) -> usize {
    let mut count = 0;
    let mut chars = line.trim_start().chars().peekable();

    while count < MAX_ARITY && chars.peek() == Some(&'{') {
        chars.next();
        count += 1;
        let mut depth = 1;
        for c in chars.by_ref() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth == 0 {
                break;
            }
        }
        while chars.peek().is_some_and(|c| *c == ' ') {
            chars.next();
        }
    }
    count
}

/// Package file still open at the end of `before`.
///
/// Walks backwards over the `(file ... )` nesting TeX prints as it opens and
/// closes files. Falls back to the nearest `Package X Error/Warning` mention.
fn owning_package(before: &str, after: &str) -> Option<String> {
    let bytes = before.as_bytes();
    let mut depth = 0usize;

    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b')' => depth += 1,
            b'(' => {
                let token = file_token(&before[i + 1..]);
                if depth > 0 {
                    depth -= 1;
                } else if let Some(token) = token.filter(|t| t.ends_with(".sty")) {
                    return Some(package_name(token));
                }
            }
            _ => {}
        }
    }

    PACKAGE_MENTION
        .captures_iter(before)
        .last()
        .or_else(|| PACKAGE_MENTION.captures(after))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// The file path right after an opening parenthesis, if it looks like one.
fn file_token(text: &str) -> Option<&str> {
    let end = text
        .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .unwrap_or(text.len());
    let token = &text[..end];
    let (_, ext) = token.rsplit_once('.')?;
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_patterns() {
        let log = "\
! LaTeX Error: File `foo.sty' not found.
! I can't find file `./chapter.tex'.
! Font \\T1/cmr/m/n/10=ecrm1000 at 10.0pt not loadable: Metric (TFM) file not found.
! LaTeX Error: File `foo.sty' not found.
";
        let signals = classify(log);
        assert_eq!(
            signals,
            vec![
                Signal::MissingFile {
                    name: "foo.sty".into(),
                    package: "foo".into()
                },
                Signal::MissingFile {
                    name: "chapter.tex".into(),
                    package: "chapter.tex".into()
                },
                Signal::MissingFile {
                    name: "ecrm1000.tfm".into(),
                    package: "ecrm1000".into()
                },
            ]
        );
    }

    #[test]
    fn test_undefined_macro_arity() {
        let log = "! Undefined control sequence.\nl.3 \\foo\n        {a}{b} text\n";
        assert_eq!(
            classify(log),
            vec![Signal::UndefinedMacro {
                name: "foo".into(),
                arity: 2,
                owner: None,
                kernel_feature: false,
            }]
        );
    }

    #[test]
    fn test_last_macro_on_context_line_wins() {
        let log = "! Undefined control sequence.\nl.7 \\textbf{x} \\bar\n\n";
        let signals = classify(log);
        assert!(matches!(
            &signals[0],
            Signal::UndefinedMacro { name, arity: 0, .. } if name == "bar"
        ));
    }

    #[test]
    fn test_max_arity_kept() {
        let log = "\
! Undefined control sequence.
l.3 \\foo
        {a}
! Undefined control sequence.
l.4 \\foo
        {a}{b}{c}
";
        let signals = classify(log);
        assert_eq!(signals.len(), 1);
        assert!(matches!(&signals[0], Signal::UndefinedMacro { arity: 3, .. }));
    }

    #[test]
    fn test_kernel_feature_owner_from_open_files() {
        let log = "\
(/work/main.tex (/texlive/texmf-dist/tex/latex/foo/foo.sty
(/texlive/texmf-dist/tex/latex/foo/foo.cfg)
! Undefined control sequence.
\\foo@start ->\\tag_mc_begin:n
                             {tag=P}
l.12 \\foo@start
";
        let signals = classify(log);
        assert_eq!(
            signals,
            vec![Signal::UndefinedMacro {
                name: "tag_mc_begin:n".into(),
                arity: 1,
                owner: Some("foo".into()),
                kernel_feature: true,
            }]
        );
    }

    #[test]
    fn test_owner_fallback_to_package_mention() {
        let log = "Package mypkg Warning: old kernel\n! Undefined control sequence.\nl.3 \\SuspendTagging\n";
        let signals = classify(log);
        assert!(matches!(
            &signals[0],
            Signal::UndefinedMacro { owner: Some(owner), kernel_feature: true, .. } if owner == "mypkg"
        ));
    }

    #[test]
    fn test_closed_package_not_owner() {
        let before = "(/texlive/texmf-dist/tex/latex/a/a.sty) (/work/main.tex ";
        assert_eq!(owning_package(before, ""), None);
    }

    #[test]
    fn test_deterministic() {
        let log = "! LaTeX Error: File `x.sty' not found.\n! Undefined control sequence.\nl.1 \\y\n";
        assert_eq!(classify(log), classify(log));
    }

    #[test]
    fn test_rerun_signal() {
        let log = "LaTeX Warning: There were undefined references.\n";
        assert_eq!(classify(log), vec![Signal::RerunSuggested]);
    }
}
