//! Compile and format-generation drivers.
//!
//! This module provides:
//! - The retrying session loop ([`SessionDriver::compile`])
//! - Preamble format generation ([`SessionDriver::generate_format`])
//! - Log classification into retryable signals ([`classify`])
//! - Pass prediction and cross-reference convergence checks
//! - Source rewriting (shims, workarounds, preamble stripping)
//!
//! # Attempt loop
//!
//! ```text
//! reset ─► mount ─► transform ─► invoke ──success──► rerun while aux changes ─► done
//!   ▲                              │
//!   │                           failure
//!   │                              ▼
//!   └──── new resources ◄── pending files │ pending bundles │ missing files │ macros
//!                                  │
//!                             nothing new / retries exhausted ─► failed
//! ```

mod abort;
mod attempt;
mod classify;
mod engine;
mod format;
mod passes;
mod rerun;
mod resolve;
mod session;
mod transform;
mod types;

pub use abort::AbortHandle;
pub use attempt::AttemptState;
pub use classify::{MAX_ARITY, Signal, classify, package_name};
pub use engine::{
    EngineKind, FORMAT_PATH, JOB_NAME, LOG_PATH, OUTPUT_PATH, PREAMBLE_LOG_PATH,
    PREAMBLE_SOURCE_PATH, SOURCE_PATH, SYNCTEX_GZ_PATH, SYNCTEX_PATH, WORK_DIR, XDV_PATH,
};
pub use passes::predict_passes;
pub use rerun::{AUX_EXTENSIONS, aux_hash, suggests_rerun};
pub use session::SessionDriver;
pub use transform::{SourceTransformer, format_source, shim_line};
pub use types::{
    CompileOptions, CompileOutcome, CompileRequest, CompileStats, FormatOutcome, FormatRequest,
};
