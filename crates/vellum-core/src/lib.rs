//! Core engine for vellum, a TeX compile driver that fetches its TeX
//! distribution on demand.
//!
//! This crate provides:
//! - The bundle manifest and the virtual filesystem the engine reads from
//! - The fetch gateway that asks the host for bundles, byte ranges and packages
//! - The retrying session driver and the preamble format driver
//! - SyncTeX parsing and source ⇄ output lookup
//! - The operation queue that serializes engine invocations

pub mod compile;
pub mod config;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod queue;
pub mod sandbox;
pub mod synctex;
pub mod vfs;

pub use compile::{
    AbortHandle, CompileOptions, CompileOutcome, CompileRequest, CompileStats, EngineKind,
    FormatOutcome, FormatRequest, SessionDriver, Signal, classify, predict_passes,
};
pub use config::DriverConfig;
pub use error::{Error, Result};
pub use fetch::{
    FetchGateway, FetchKind, FetchRequest, FetchResponder, FetchResponse, FetchTimeouts,
    HostEndpoint, RequestBody, RequestId, ResponseBody,
};
pub use manifest::{BundleMeta, Manifest, ManifestEntry};
pub use queue::OperationQueue;
pub use sandbox::{ProcessSandboxFactory, RunOutcome, Sandbox, SandboxFactory};
pub use synctex::{OutputLocation, PositionIndex, SourceLocation};
pub use vfs::{Blob, Materialization, SharedCaches, VirtualFs};
