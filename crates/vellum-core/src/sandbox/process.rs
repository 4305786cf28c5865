//! Sandbox backed by a scratch directory and a TeX Live process.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;
use tracing::{debug, warn};

use super::{RunOutcome, Sandbox, SandboxFactory};
use crate::error::{Error, Result};
use crate::vfs::{Materialization, TEXMF_ROOT, VirtualFs};

/// Environment variable naming the directory with the TeX binaries.
pub const TEXLIVE_BIN_ENV: &str = "VELLUM_TEXLIVE_BIN";

/// Directory the engine runs in and writes its outputs to.
const WORK_DIR: &str = "/work";

/// Creates [`ProcessSandbox`] instances.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandboxFactory {
    bin_dir: Option<PathBuf>,
}

impl ProcessSandboxFactory {
    /// Factory that locates binaries via `VELLUM_TEXLIVE_BIN`, then `PATH`.
    pub fn new() -> Self {
        Self {
            bin_dir: std::env::var_os(TEXLIVE_BIN_ENV).map(PathBuf::from),
        }
    }

    /// Factory with an explicit binary directory.
    pub fn with_bin_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: Some(dir.into()),
        }
    }
}

impl SandboxFactory for ProcessSandboxFactory {
    fn create(&self) -> Result<Box<dyn Sandbox>> {
        let scratch = tempfile::Builder::new().prefix("vellum-").tempdir()?;
        Ok(Box::new(ProcessSandbox {
            bin_dir: self.bin_dir.clone(),
            scratch,
        }))
    }
}

/// Runs one TeX invocation in a throwaway directory tree.
///
/// `Eager` and `Lazy` nodes are written out before the run; `Deferred`
/// nodes are left out, so the engine reports them as missing and the driver
/// fetches the owning bundle.
pub struct ProcessSandbox {
    bin_dir: Option<PathBuf>,
    scratch: TempDir,
}

impl ProcessSandbox {
    fn root(&self) -> &Path {
        self.scratch.path()
    }

    fn host_path(&self, virtual_path: &str) -> PathBuf {
        self.root().join(virtual_path.trim_start_matches('/'))
    }

    fn find_binary(&self, program: &str) -> Result<PathBuf> {
        if let Some(dir) = &self.bin_dir {
            let path = dir.join(program);
            if path.exists() {
                return Ok(path);
            }
        }
        which::which(program).map_err(|e| {
            Error::Sandbox(format!(
                "could not find {program}: {e}. Set {TEXLIVE_BIN_ENV} or add it to PATH"
            ))
        })
    }

    /// Map absolute virtual paths, bare or after `=`, into the scratch tree.
    fn map_arg(&self, arg: &str) -> String {
        if arg.starts_with('/') {
            return self.host_path(arg).to_string_lossy().into_owned();
        }
        match arg.split_once("=/") {
            Some((flag, rest)) => {
                format!("{flag}={}", self.host_path(rest).to_string_lossy())
            }
            None => arg.to_string(),
        }
    }

    fn materialize(&self, vfs: &mut VirtualFs) -> Result<usize> {
        let paths: Vec<String> = vfs
            .iter()
            .filter(|(_, node)| !matches!(node.state, Materialization::Deferred(_)))
            .map(|(path, _)| path.to_string())
            .collect();

        fs::create_dir_all(self.host_path(WORK_DIR))?;
        let mut written = 0;
        for path in paths {
            let Some(bytes) = vfs.read(&path) else {
                continue;
            };
            let target = self.host_path(&path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &bytes)?;
            written += 1;
        }
        Ok(written)
    }

    /// Store new or changed files from the work directory back into the VFS.
    fn collect_outputs(&self, vfs: &mut VirtualFs) -> Result<usize> {
        let mut collected = 0;
        for entry in fs::read_dir(self.host_path(WORK_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let virtual_path = format!("{WORK_DIR}/{name}");
            let bytes = fs::read(entry.path())?;

            let unchanged = matches!(
                vfs.node(&virtual_path).map(|node| &node.state),
                Some(Materialization::Eager(existing)) if **existing == *bytes
            );
            if !unchanged {
                vfs.write(&virtual_path, bytes);
                collected += 1;
            }
        }
        Ok(collected)
    }
}

impl Sandbox for ProcessSandbox {
    fn run(&mut self, args: &[String], vfs: &mut VirtualFs) -> Result<RunOutcome> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::InvalidRequest("empty command line".to_string()))?;
        let binary = self.find_binary(program)?;

        let written = self.materialize(vfs)?;
        debug!(program, files = written, root = %self.root().display(), "sandbox materialized");

        let texmf = self.host_path(TEXMF_ROOT);
        let output = Command::new(&binary)
            .args(rest.iter().map(|arg| self.map_arg(arg)))
            .current_dir(self.host_path(WORK_DIR))
            .env("TEXMFDIST", &texmf)
            .env("TEXMFCNF", texmf.join("web2c"))
            .env("TEXMFHOME", &texmf)
            .env("TEXMFVAR", self.root().join("texmf-var"))
            .env("SOURCE_DATE_EPOCH", "0")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Sandbox(format!("failed to run '{}': {e}", binary.display())))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == -1 {
            warn!(program, "engine terminated by signal");
        }

        let collected = self.collect_outputs(vfs)?;
        debug!(program, exit_code, outputs = collected, "sandbox finished");

        let mut transcript = String::from_utf8_lossy(&output.stdout).into_owned();
        transcript.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(RunOutcome {
            exit_code,
            transcript,
        })
    }
}
