//! Request and result types of the drivers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::abort::AbortHandle;
use super::engine::EngineKind;
use crate::manifest::Manifest;
use crate::vfs::Blob;

/// Per-request switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileOptions {
    /// Forward engine log lines to tracing.
    pub verbose: bool,
    /// Retry ceiling; the driver default when unset.
    pub max_retries: Option<u32>,
    /// Mount lazily and honor deferred bundles.
    #[serde(rename = "enableLazyFS", alias = "enableLazyFs")]
    pub enable_lazy_fs: bool,
    /// Fall back to the external package source.
    pub enable_ctan: bool,
}

/// One document compile.
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Document source.
    pub source: String,
    /// Engine to run.
    pub engine: EngineKind,
    /// Switches.
    pub options: CompileOptions,
    /// Bundles the host already holds, id → raw bytes.
    pub bundle_data: BTreeMap<String, Blob>,
    /// Bundles the document is known to need; fetched up front when absent.
    pub bundle_names: Vec<String>,
    /// Package files from the external source, virtual path → bytes.
    pub ctan_files: BTreeMap<String, Blob>,
    /// Precompiled preamble format.
    pub cached_format: Option<Blob>,
    /// Auxiliary files of the previous revision, file name → bytes.
    pub cached_aux_files: BTreeMap<String, Blob>,
    /// Bundles to mount as deferred markers only.
    pub deferred_bundle_names: Vec<String>,
    /// Cancellation flag checked between retries.
    pub abort: Option<AbortHandle>,
}

impl CompileRequest {
    /// Request with default options and no resources.
    pub fn new(source: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            source: source.into(),
            engine,
            ..Self::default()
        }
    }

    /// Set the options.
    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a bundle the host already holds.
    pub fn with_bundle(mut self, bundle: impl Into<String>, bytes: Blob) -> Self {
        self.bundle_data.insert(bundle.into(), bytes);
        self
    }

    /// Add a bundle to mount deferred.
    pub fn with_deferred_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.deferred_bundle_names.push(bundle.into());
        self
    }

    /// Attach auxiliary files from an earlier revision.
    pub fn with_aux_files(mut self, files: BTreeMap<String, Blob>) -> Self {
        self.cached_aux_files = files;
        self
    }

    /// Use a precompiled preamble format.
    pub fn with_format(mut self, format: Blob) -> Self {
        self.cached_format = Some(format);
        self
    }

    /// Attach a cancellation handle.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }
}

/// Counters of one compile request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileStats {
    /// Document attempts (initial plus retries).
    pub attempts: u32,
    /// Retries taken.
    pub retries: u32,
    /// Extra passes for cross references.
    pub reruns: u32,
    /// Passes predicted from the source.
    pub predicted_passes: u32,
    /// Sandboxes created.
    pub sandbox_instances: u32,
    /// Whole bundles fetched.
    pub bundles_fetched: u32,
    /// Byte ranges fetched.
    pub ranges_fetched: u32,
    /// Packages fetched from the external source.
    pub packages_fetched: u32,
    /// Wall-clock time.
    pub elapsed: Duration,
}

/// Result of a compile request.
///
/// A document that does not build is reported here, not as an error.
#[derive(Debug, Clone, Default)]
pub struct CompileOutcome {
    /// Whether a PDF was produced.
    pub success: bool,
    /// The PDF.
    pub output: Option<Blob>,
    /// The position log (`.synctex` or `.synctex.gz`).
    pub position_log: Option<Blob>,
    /// Exit code of the last invocation.
    pub exit_code: i32,
    /// Log text of the last invocation.
    pub log: String,
    /// Auxiliary files to hand back on the next revision.
    pub aux_files_to_cache: BTreeMap<String, Blob>,
    /// Shims in effect at the end, macro → arity.
    pub shims: BTreeMap<String, usize>,
    /// Package releases pinned by version fallback.
    pub version_overrides: BTreeMap<String, String>,
    /// Counters.
    pub stats: CompileStats,
}

/// One preamble format generation.
#[derive(Debug, Clone, Default)]
pub struct FormatRequest {
    /// Document preamble; anything from `\begin{document}` on is ignored.
    pub preamble: String,
    /// Engine to dump with.
    pub engine: EngineKind,
    /// Manifest to resolve against instead of the driver's.
    pub manifest: Option<Arc<Manifest>>,
    /// Bundles the host already holds.
    pub bundle_data: BTreeMap<String, Blob>,
    /// Package files from the external source.
    pub ctan_files: BTreeMap<String, Blob>,
    /// Retry ceiling; the driver default when unset.
    pub max_retries: Option<u32>,
}

impl FormatRequest {
    /// Request with no resources.
    pub fn new(preamble: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            preamble: preamble.into(),
            engine,
            ..Self::default()
        }
    }
}

/// Result of format generation.
#[derive(Debug, Clone, Default)]
pub struct FormatOutcome {
    /// Whether a format was dumped.
    pub success: bool,
    /// The format image.
    pub format_bytes: Option<Blob>,
    /// Why generation failed.
    pub error: Option<String>,
    /// Log text of the last invocation.
    pub log: String,
    /// Counters.
    pub stats: CompileStats,
}
