//! Messages exchanged between the driver and the host that owns the network.
//!
//! Every request carries a fresh [`RequestId`]; the host echoes it in the
//! response so the gateway can wake the right waiter.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::BundleMeta;

/// Correlation id of one gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three resource kinds the gateway can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// A whole bundle archive.
    Bundle,
    /// One byte range inside a bundle.
    FileRange,
    /// An ad-hoc package from the external package source.
    CtanPackage,
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bundle => "bundle",
            Self::FileRange => "file range",
            Self::CtanPackage => "package",
        })
    }
}

/// Request sent to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Correlation id.
    pub id: RequestId,
    /// What to fetch.
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Payload of a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    /// Fetch a whole bundle.
    Bundle {
        /// Bundle id.
        bundle: String,
    },

    /// Fetch `[start, end)` of a bundle.
    FileRange {
        /// Bundle id.
        bundle: String,
        /// First byte (inclusive).
        start: u64,
        /// Last byte (exclusive).
        end: u64,
    },

    /// Fetch a package from the external source.
    CtanPackage {
        /// Package name.
        name: String,
        /// File name that triggered the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint_filename: Option<String>,
        /// Historical release to fetch instead of the current one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt_version: Option<String>,
    },
}

impl RequestBody {
    /// Kind of this request.
    pub fn kind(&self) -> FetchKind {
        match self {
            Self::Bundle { .. } => FetchKind::Bundle,
            Self::FileRange { .. } => FetchKind::FileRange,
            Self::CtanPackage { .. } => FetchKind::CtanPackage,
        }
    }
}

/// Response sent back by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result.
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl FetchResponse {
    /// A failure answer of the right kind for `request`.
    pub fn failure(request: &FetchRequest) -> Self {
        let body = match request.body.kind() {
            FetchKind::Bundle => ResponseBody::Bundle {
                success: false,
                bytes: Vec::new(),
                meta: None,
            },
            FetchKind::FileRange => ResponseBody::FileRange {
                success: false,
                bytes: Vec::new(),
            },
            FetchKind::CtanPackage => ResponseBody::CtanPackage {
                success: false,
                files: BTreeMap::new(),
            },
        };
        Self { id: request.id, body }
    }
}

/// Payload of a [`FetchResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Whole-bundle result.
    Bundle {
        /// Whether the bundle was found.
        success: bool,
        /// Raw archive bytes.
        #[serde(default)]
        bytes: Vec<u8>,
        /// Optional file listing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<BundleMeta>,
    },

    /// Byte-range result.
    FileRange {
        /// Whether the range was served.
        success: bool,
        /// The bytes of the range.
        #[serde(default)]
        bytes: Vec<u8>,
    },

    /// Package result.
    CtanPackage {
        /// Whether the package was found.
        success: bool,
        /// Virtual path → file bytes.
        #[serde(default)]
        files: BTreeMap<String, Vec<u8>>,
    },
}

impl ResponseBody {
    /// Kind of this response.
    pub fn kind(&self) -> FetchKind {
        match self {
            Self::Bundle { .. } => FetchKind::Bundle,
            Self::FileRange { .. } => FetchKind::FileRange,
            Self::CtanPackage { .. } => FetchKind::CtanPackage,
        }
    }
}
