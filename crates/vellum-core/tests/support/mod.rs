//! Shared fixtures: a scripted engine, a fake host and a bundle builder.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use vellum_core::compile::{OUTPUT_PATH, PREAMBLE_SOURCE_PATH, SOURCE_PATH, XDV_PATH};
use vellum_core::{
    Blob, DriverConfig, Error, FetchGateway, FetchResponse, HostEndpoint, Manifest,
    ManifestEntry, RequestBody, ResponseBody, Result, RunOutcome, Sandbox, SandboxFactory,
    SessionDriver, VirtualFs,
};

pub const ARTICLE_CLS: &str = "/texlive/texmf-dist/tex/latex/base/article.cls";
pub const EXTRA_STY: &str = "/texlive/texmf-dist/tex/latex/extrapkg/extrapkg.sty";

// =============================================================================
// Bundles
// =============================================================================

/// Builds bundles and the matching manifest from file contents.
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    entries: Vec<ManifestEntry>,
    bundles: BTreeMap<String, Vec<u8>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual set: `core` with the article class, `extra-misc` with one
    /// package and `fonts` with three small packages.
    pub fn standard() -> Self {
        Self::new()
            .file(ARTICLE_CLS, "core", "\\def\\section{}\\def\\maketitle{}")
            .file(EXTRA_STY, "extra-misc", "\\newcommand{\\extra}{}")
            .file("/texlive/texmf-dist/tex/latex/defer/deferone.sty", "fonts", "\\newcommand{\\one}{}")
            .file("/texlive/texmf-dist/tex/latex/defer/defertwo.sty", "fonts", "\\newcommand{\\two}{}")
            .file("/texlive/texmf-dist/tex/latex/defer/deferthree.sty", "fonts", "\\newcommand{\\three}{}")
    }

    pub fn file(mut self, path: &str, bundle: &str, content: &str) -> Self {
        let data = self.bundles.entry(bundle.to_string()).or_default();
        let start = data.len() as u64;
        data.extend_from_slice(content.as_bytes());
        let end = data.len() as u64;
        self.entries.push(ManifestEntry::new(path, bundle, start, end));
        self
    }

    pub fn manifest(&self) -> Manifest {
        Manifest::from_entries(self.entries.clone())
    }

    pub fn bundle(&self, id: &str) -> Blob {
        Blob::from(self.bundles[id].clone())
    }

    pub fn host(&self) -> FakeHost {
        FakeHost {
            bundles: self.bundles.clone(),
            ..FakeHost::default()
        }
    }
}

/// Driver with short fetch timeouts and its host endpoint.
pub fn driver(fixture: &Fixture, factory: &ScriptedFactory) -> (SessionDriver, HostEndpoint) {
    let config = DriverConfig {
        bundle_timeout: Duration::from_secs(5),
        range_timeout: Duration::from_secs(5),
        package_timeout: Duration::from_secs(5),
        ..DriverConfig::default()
    };
    let (gateway, endpoint) = FetchGateway::channel(config.fetch_timeouts());
    let driver = SessionDriver::new(
        Arc::new(fixture.manifest()),
        gateway,
        Arc::new(factory.clone()),
        config,
    );
    (driver, endpoint)
}

// =============================================================================
// Host
// =============================================================================

/// Answers gateway requests from memory.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub bundles: BTreeMap<String, Vec<u8>>,
    /// `name` or `name@version` → virtual path → bytes.
    pub packages: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Bundles whose whole fetch fails; their ranges are still served.
    pub refused_bundles: BTreeSet<String>,
}

/// Requests the fake host has seen.
#[derive(Debug, Clone, Default)]
pub struct HostLog {
    bundles: Arc<Mutex<Vec<String>>>,
    ranges: Arc<Mutex<Vec<(String, u64, u64)>>>,
    packages: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl HostLog {
    pub fn bundles(&self) -> Vec<String> {
        self.bundles.lock().clone()
    }

    pub fn ranges(&self) -> Vec<(String, u64, u64)> {
        self.ranges.lock().clone()
    }

    pub fn packages(&self) -> Vec<(String, Option<String>)> {
        self.packages.lock().clone()
    }
}

impl FakeHost {
    pub fn with_package(mut self, key: &str, path: &str, content: &str) -> Self {
        self.packages
            .entry(key.to_string())
            .or_default()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn refuse_bundle(mut self, bundle: &str) -> Self {
        self.refused_bundles.insert(bundle.to_string());
        self
    }

    /// Serve requests on a background task until the gateway is dropped.
    pub fn serve(self, endpoint: HostEndpoint) -> HostLog {
        let log = HostLog::default();
        let seen = log.clone();
        let HostEndpoint {
            mut requests,
            responder,
        } = endpoint;

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let body = match &request.body {
                    RequestBody::Bundle { bundle } => {
                        seen.bundles.lock().push(bundle.clone());
                        let refused = self.refused_bundles.contains(bundle);
                        self.bundles.get(bundle).filter(|_| !refused).map(|bytes| ResponseBody::Bundle {
                            success: true,
                            bytes: bytes.clone(),
                            meta: None,
                        })
                    }
                    RequestBody::FileRange { bundle, start, end } => {
                        seen.ranges.lock().push((bundle.clone(), *start, *end));
                        self.bundles
                            .get(bundle)
                            .and_then(|bytes| bytes.get(*start as usize..*end as usize))
                            .map(|slice| ResponseBody::FileRange {
                                success: true,
                                bytes: slice.to_vec(),
                            })
                    }
                    RequestBody::CtanPackage {
                        name, alt_version, ..
                    } => {
                        seen.packages.lock().push((name.clone(), alt_version.clone()));
                        let key = match alt_version {
                            Some(version) => format!("{name}@{version}"),
                            None => name.clone(),
                        };
                        self.packages.get(&key).map(|files| ResponseBody::CtanPackage {
                            success: true,
                            files: files.clone(),
                        })
                    }
                };
                let response = match body {
                    Some(body) => FetchResponse { id: request.id, body },
                    None => FetchResponse::failure(&request),
                };
                responder.respond(response);
            }
        });
        log
    }
}

// =============================================================================
// Scripted engine
// =============================================================================

static LOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(documentclass|usepackage|RequirePackage)(?:\[[^\]]*\])?\{([^}]+)\}").unwrap()
});
static DEFINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:newcommand|providecommand|renewcommand|def)\{?\\([A-Za-z@]+)").unwrap()
});
static CSNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\csname ([^\\]+)\\endcsname").unwrap());
static USE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\([A-Za-z@]+)").unwrap());
/// Package code may use `_` and `:` in names.
static PACKAGE_USE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([A-Za-z@]+(?:[_:][A-Za-z@_:]*)?)").unwrap());
static LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\label\{([^}]+)\}").unwrap());

const BUILTINS: &[&str] = &[
    "documentclass", "usepackage", "begin", "end", "newcommand", "providecommand",
    "renewcommand", "def", "expandafter", "csname", "endcsname", "section", "label", "ref",
    "pageref", "cite", "tableofcontents", "textbf", "emph", "title", "author", "item", "relax",
    "par", "bibliography", "PassOptionsToPackage", "RequirePackage", "dump",
];

/// Creates [`ScriptedSandbox`] instances and counts them.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    instances: Arc<AtomicUsize>,
    stubborn: BTreeSet<String>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Macros that stay undefined whatever the source defines.
    pub fn stubborn(names: &[&str]) -> Self {
        Self {
            instances: Arc::default(),
            stubborn: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

impl SandboxFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn Sandbox>> {
        self.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSandbox {
            stubborn: self.stubborn.clone(),
            used: false,
        }))
    }
}

/// A tiny LaTeX stand-in that reads everything through the VFS.
///
/// Loads `\documentclass`, `\usepackage` and nested `\RequirePackage` files
/// via `lookup` + `read`, reports unknown macros the way TeX does (inside the
/// open file when a package uses one), and writes a PDF, an aux file and a
/// plain position log on success.
pub struct ScriptedSandbox {
    stubborn: BTreeSet<String>,
    used: bool,
}

struct Run<'a> {
    fs: &'a mut VirtualFs,
    stubborn: &'a BTreeSet<String>,
    defined: BTreeSet<String>,
    log: String,
    failed: bool,
    labels: Vec<String>,
}

impl Run<'_> {
    fn define_from(&mut self, text: &str) {
        let names: Vec<String> = DEFINE
            .captures_iter(text)
            .chain(CSNAME.captures_iter(text))
            .map(|caps| caps[1].to_string())
            .collect();
        for name in names {
            if !self.stubborn.contains(&name) {
                self.defined.insert(name);
            }
        }
    }

    fn load(&mut self, name: &str) {
        let bytes = self
            .fs
            .lookup(name)
            .and_then(|path| self.fs.read(&path).map(|bytes| (path, bytes)));
        match bytes {
            Some((path, bytes)) if !bytes.is_empty() => {
                self.log.push_str(&format!("({path}"));
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.define_from(&text);
                for (index, line) in text.lines().enumerate() {
                    self.load_all(line);
                    if !DEFINE.is_match(line) && !CSNAME.is_match(line) {
                        self.report_undefined(index + 1, line, &PACKAGE_USE);
                    }
                }
                self.log.push_str(")\n");
            }
            _ => {
                self.start_line();
                self.log
                    .push_str(&format!("! LaTeX Error: File `{name}' not found.\n\n"));
                self.failed = true;
            }
        }
    }

    fn load_all(&mut self, line: &str) {
        for caps in LOAD.captures_iter(line) {
            let ext = if &caps[1] == "documentclass" { "cls" } else { "sty" };
            for name in caps[2].split(',') {
                self.load(&format!("{}.{ext}", name.trim()));
            }
        }
    }

    fn start_line(&mut self) {
        if !self.log.is_empty() && !self.log.ends_with('\n') {
            self.log.push('\n');
        }
    }

    fn report_undefined(&mut self, number: usize, line: &str, pattern: &Regex) {
        for found in pattern.captures_iter(line) {
            let (Some(whole), Some(name)) = (found.get(0), found.get(1)) else {
                continue;
            };
            let name = name.as_str();
            if BUILTINS.contains(&name) || self.defined.contains(name) {
                continue;
            }
            self.start_line();
            self.log.push_str(&format!(
                "! Undefined control sequence.\nl.{number} {}\n{}\n\n",
                &line[..whole.end()],
                &line[whole.end()..]
            ));
            self.failed = true;
        }
    }

    fn line(&mut self, number: usize, line: &str) {
        self.load_all(line);

        if DEFINE.is_match(line) || CSNAME.is_match(line) {
            self.define_from(line);
            return;
        }
        self.report_undefined(number, line, &USE);

        for caps in LABEL.captures_iter(line) {
            self.labels.push(caps[1].to_string());
        }
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(&mut self, args: &[String], fs: &mut VirtualFs) -> Result<RunOutcome> {
        if std::mem::replace(&mut self.used, true) {
            return Err(Error::Sandbox("scripted sandbox reused".into()));
        }
        let program = args.first().map(String::as_str).unwrap_or_default();

        if program == "xdvipdfmx" {
            return Ok(match fs.read(XDV_PATH) {
                Some(xdv) if !xdv.is_empty() => {
                    fs.write(OUTPUT_PATH, b"%PDF-1.5 scripted".to_vec());
                    RunOutcome::default()
                }
                _ => RunOutcome {
                    exit_code: 1,
                    transcript: "xdvipdfmx: no input".into(),
                },
            });
        }

        let format_mode = args.iter().any(|arg| arg == "-ini");
        let no_pdf = args.iter().any(|arg| arg == "-no-pdf");
        let source_path = if format_mode { PREAMBLE_SOURCE_PATH } else { SOURCE_PATH };
        let Some(source) = fs.read(source_path) else {
            return Ok(RunOutcome {
                exit_code: 1,
                transcript: format!("! I can't find file `{source_path}'."),
            });
        };
        let source = String::from_utf8_lossy(&source).into_owned();

        let mut run = Run {
            fs,
            stubborn: &self.stubborn,
            defined: BTreeSet::new(),
            log: format!("This is {program}, scripted\n"),
            failed: false,
            labels: Vec::new(),
        };
        for (index, line) in source.lines().enumerate() {
            run.line(index + 1, line);
        }

        let Run {
            fs,
            mut log,
            failed,
            labels,
            ..
        } = run;
        let job = if format_mode { "preamble" } else { "main" };

        if !failed && format_mode {
            fs.write("/work/preamble.fmt", format!("FMT\n{source}").into_bytes());
        } else if !failed {
            if !labels.is_empty() || source.contains("\\tableofcontents") {
                let mut aux = String::from("\\relax\n");
                for (number, label) in labels.iter().enumerate() {
                    aux.push_str(&format!("\\newlabel{{{label}}}{{{{{}}}{{1}}}}\n", number + 1));
                }
                fs.write("/work/main.aux", aux.into_bytes());
                log.push_str(
                    "LaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.\n",
                );
            }
            let output = if no_pdf { XDV_PATH } else { OUTPUT_PATH };
            fs.write(output, b"%PDF-1.5 scripted".to_vec());
            fs.write("/work/main.synctex", synctex_for(&source).into_bytes());
        }

        fs.write(&format!("/work/{job}.log"), log.clone().into_bytes());
        Ok(RunOutcome {
            exit_code: i32::from(failed),
            transcript: log,
        })
    }
}

/// One horizontal box per non-empty source line, 12pt apart, all on page 1.
fn synctex_for(source: &str) -> String {
    let mut out = String::from(
        "SyncTeX Version:1\nInput:1:/work/main.tex\nOutput:pdf\nMagnification:1000\nUnit:1\nX Offset:0\nY Offset:0\nContent:\n{1\n",
    );
    for (index, line) in source.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let v = (index as i64 + 1) * 12 * 65536;
        out.push_str(&format!("(1,{}:4736286,{v}:30785863,655360,0\n)\n", index + 1));
    }
    out.push_str("}1\nPostamble:\n");
    out
}
