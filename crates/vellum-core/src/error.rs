//! Error types for vellum-core.
//!
//! Compile failures are not errors: a document that does not build yields a
//! [`CompileOutcome`](crate::compile::CompileOutcome) with `success == false`.
//! [`Error`] covers infrastructure faults only.

use thiserror::Error;

use crate::fetch::{FetchKind, RequestId};

/// Result type for vellum-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vellum-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The archive manifest could not be loaded or is inconsistent.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The sandboxed compiler could not be created or crashed outright.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// A gateway request received no response in time.
    #[error("{kind} request {id} timed out")]
    FetchTimeout { kind: FetchKind, id: RequestId },

    /// The host answered a request with a failure.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The host side of the gateway went away.
    #[error("fetch gateway closed")]
    GatewayClosed,

    /// The host answered with a payload of the wrong kind.
    #[error("protocol mismatch: expected {expected} response, got {found}")]
    ProtocolMismatch { expected: FetchKind, found: FetchKind },

    /// The operation queue worker has shut down.
    #[error("operation queue closed")]
    QueueClosed,

    /// The request was aborted between retries.
    #[error("compile aborted")]
    Aborted,

    /// The position log could not be parsed.
    #[error("position log error: {0}")]
    PositionLog(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Render the error with a short recovery hint for terminal output.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::Manifest(_) => Some("check that the manifest JSON matches the bundle set"),
            Self::Sandbox(_) => {
                Some("set VELLUM_TEXLIVE_BIN to the directory holding the TeX binaries")
            }
            Self::FetchTimeout { .. } | Self::GatewayClosed => {
                Some("is the bundle source reachable?")
            }
            Self::PositionLog(_) => Some("recompile with SyncTeX enabled"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}
