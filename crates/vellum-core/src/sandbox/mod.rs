//! Isolated execution of the TeX binaries.
//!
//! The engine keeps process-global state that cannot be cleared between
//! runs, so an instance is good for exactly one invocation. Drivers ask the
//! [`SandboxFactory`] for a fresh [`Sandbox`] before every compile pass,
//! rerun pass, second stage and format dump.

mod process;

pub use process::{ProcessSandbox, ProcessSandboxFactory};

use crate::error::Result;
use crate::vfs::VirtualFs;

/// Exit status and console transcript of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Process exit code; `-1` when killed by a signal.
    pub exit_code: i32,
    /// Captured stdout and stderr.
    pub transcript: String,
}

impl RunOutcome {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One single-use engine instance.
pub trait Sandbox: Send {
    /// Run `args[0]` with the remaining arguments against `fs`.
    ///
    /// Files the engine writes are stored back into `fs`.
    fn run(&mut self, args: &[String], fs: &mut VirtualFs) -> Result<RunOutcome>;
}

/// Creates sandboxes.
pub trait SandboxFactory: Send + Sync {
    /// Create a fresh instance.
    fn create(&self) -> Result<Box<dyn Sandbox>>;
}
