//! TeX engines and their command lines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Directory the engine runs in.
pub const WORK_DIR: &str = "/work";
/// Job name of every document compile.
pub const JOB_NAME: &str = "main";
/// Where the (transformed) document source is written.
pub const SOURCE_PATH: &str = "/work/main.tex";
/// Document output.
pub const OUTPUT_PATH: &str = "/work/main.pdf";
/// Engine log.
pub const LOG_PATH: &str = "/work/main.log";
/// Compressed position log.
pub const SYNCTEX_GZ_PATH: &str = "/work/main.synctex.gz";
/// Uncompressed position log.
pub const SYNCTEX_PATH: &str = "/work/main.synctex";
/// Intermediate output of the first XeTeX stage.
pub const XDV_PATH: &str = "/work/main.xdv";
/// Mount point of a cached preamble format.
pub const FORMAT_PATH: &str = "/work/preamble.fmt";
/// Preamble source used for format generation.
pub const PREAMBLE_SOURCE_PATH: &str = "/work/preamble.tex";
/// Log of format generation.
pub const PREAMBLE_LOG_PATH: &str = "/work/preamble.log";

/// Supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// pdfTeX, PDF output in one stage.
    #[default]
    PdfLatex,
    /// XeTeX, `.xdv` then `xdvipdfmx`.
    XeLatex,
    /// LuaHBTeX, PDF output in one stage.
    LuaLatex,
}

impl EngineKind {
    /// Executable of the first stage.
    pub fn program(self) -> &'static str {
        match self {
            Self::PdfLatex => "pdflatex",
            Self::XeLatex => "xelatex",
            Self::LuaLatex => "lualatex",
        }
    }

    /// Whether a second stage turns the first stage's output into PDF.
    pub fn is_two_stage(self) -> bool {
        matches!(self, Self::XeLatex)
    }

    /// Command lines of one document pass, in stage order.
    pub fn compile_stages(self, cached_format: bool) -> Vec<Vec<String>> {
        let mut first = vec![
            self.program().to_string(),
            "-interaction=nonstopmode".to_string(),
            "-synctex=1".to_string(),
            format!("-jobname={JOB_NAME}"),
            format!("-output-directory={WORK_DIR}"),
        ];
        if self.is_two_stage() {
            first.push("-no-pdf".to_string());
        }
        if cached_format {
            first.push(format!("-fmt={FORMAT_PATH}"));
        }
        first.push(SOURCE_PATH.to_string());

        let mut stages = vec![first];
        if self.is_two_stage() {
            stages.push(vec![
                "xdvipdfmx".to_string(),
                "-o".to_string(),
                OUTPUT_PATH.to_string(),
                XDV_PATH.to_string(),
            ]);
        }
        stages
    }

    /// Command line that dumps the preamble into `/work/preamble.fmt`.
    pub fn format_args(self) -> Vec<String> {
        vec![
            self.program().to_string(),
            "-ini".to_string(),
            "-interaction=nonstopmode".to_string(),
            "-jobname=preamble".to_string(),
            format!("-output-directory={WORK_DIR}"),
            format!("&{}", self.program()),
            PREAMBLE_SOURCE_PATH.to_string(),
        ]
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdflatex" | "pdftex" => Ok(Self::PdfLatex),
            "xelatex" | "xetex" => Ok(Self::XeLatex),
            "lualatex" | "luatex" => Ok(Self::LuaLatex),
            other => Err(Error::InvalidRequest(format!("unknown engine '{other}'"))),
        }
    }
}
