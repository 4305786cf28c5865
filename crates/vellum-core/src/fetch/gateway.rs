//! Request/response bridge with correlation ids and per-kind timeouts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::{FetchKind, FetchRequest, FetchResponse, RequestBody, RequestId, ResponseBody};
use crate::error::{Error, Result};
use crate::manifest::BundleMeta;
use crate::vfs::Blob;

type PendingTable = Arc<Mutex<FxHashMap<RequestId, oneshot::Sender<ResponseBody>>>>;

/// Per-kind response deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTimeouts {
    /// Whole-bundle requests.
    pub bundle: Duration,
    /// Byte-range requests.
    pub range: Duration,
    /// Package requests.
    pub package: Duration,
}

impl FetchTimeouts {
    /// Deadline for a request kind.
    pub fn for_kind(&self, kind: FetchKind) -> Duration {
        match kind {
            FetchKind::Bundle => self.bundle,
            FetchKind::FileRange => self.range,
            FetchKind::CtanPackage => self.package,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            bundle: Duration::from_secs(60),
            range: Duration::from_secs(30),
            package: Duration::from_secs(60),
        }
    }
}

/// A fetched bundle.
#[derive(Debug, Clone)]
pub struct FetchedBundle {
    /// Raw archive bytes.
    pub bytes: Blob,
    /// File listing shipped with the bundle.
    pub meta: Option<BundleMeta>,
}

/// Driver side of the gateway.
#[derive(Debug, Clone)]
pub struct FetchGateway {
    outbound: mpsc::UnboundedSender<FetchRequest>,
    pending: PendingTable,
    timeouts: FetchTimeouts,
}

/// Host side of the gateway: the request stream and a way to answer.
#[derive(Debug)]
pub struct HostEndpoint {
    /// Requests in send order.
    pub requests: mpsc::UnboundedReceiver<FetchRequest>,
    /// Handle that routes responses to waiters.
    pub responder: FetchResponder,
}

/// Routes host responses to the waiting request.
#[derive(Debug, Clone)]
pub struct FetchResponder {
    pending: PendingTable,
}

impl FetchResponder {
    /// Deliver a response.
    ///
    /// Responses for unknown, timed-out or already answered ids are dropped
    /// and `false` is returned.
    pub fn respond(&self, response: FetchResponse) -> bool {
        let Some(waiter) = self.pending.lock().remove(&response.id) else {
            debug!(id = %response.id, "ignoring response for unknown request");
            return false;
        };
        waiter.send(response.body).is_ok()
    }
}

impl FetchGateway {
    /// Create a connected gateway and host endpoint.
    pub fn channel(timeouts: FetchTimeouts) -> (Self, HostEndpoint) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let pending = PendingTable::default();
        let gateway = Self {
            outbound,
            pending: pending.clone(),
            timeouts,
        };
        (
            gateway,
            HostEndpoint {
                requests,
                responder: FetchResponder { pending },
            },
        )
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// The configured deadlines.
    pub fn timeouts(&self) -> FetchTimeouts {
        self.timeouts
    }

    async fn request(&self, body: RequestBody) -> Result<ResponseBody> {
        let kind = body.kind();
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outbound.send(FetchRequest { id, body }).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::GatewayClosed);
        }

        match tokio::time::timeout(self.timeouts.for_kind(kind), rx).await {
            Ok(Ok(body)) if body.kind() == kind => Ok(body),
            Ok(Ok(body)) => Err(Error::ProtocolMismatch {
                expected: kind,
                found: body.kind(),
            }),
            Ok(Err(_)) => Err(Error::GatewayClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(%id, %kind, "fetch timed out");
                Err(Error::FetchTimeout { kind, id })
            }
        }
    }

    /// Fetch a whole bundle.
    pub async fn fetch_bundle(&self, bundle: &str) -> Result<FetchedBundle> {
        let body = self
            .request(RequestBody::Bundle {
                bundle: bundle.to_string(),
            })
            .await?;
        match body {
            ResponseBody::Bundle {
                success: true,
                bytes,
                meta,
            } => Ok(FetchedBundle {
                bytes: Blob::from(bytes),
                meta,
            }),
            _ => Err(Error::FetchFailed(format!("bundle {bundle}"))),
        }
    }

    /// Fetch `[start, end)` of a bundle.
    pub async fn fetch_file_range(&self, bundle: &str, start: u64, end: u64) -> Result<Blob> {
        let body = self
            .request(RequestBody::FileRange {
                bundle: bundle.to_string(),
                start,
                end,
            })
            .await?;
        match body {
            ResponseBody::FileRange {
                success: true,
                bytes,
            } => Ok(Blob::from(bytes)),
            _ => Err(Error::FetchFailed(format!("{bundle}[{start}..{end})"))),
        }
    }

    /// Fetch a package from the external source, optionally an older release.
    pub async fn fetch_ctan_package(
        &self,
        name: &str,
        hint_filename: Option<&str>,
        alt_version: Option<&str>,
    ) -> Result<BTreeMap<String, Blob>> {
        let body = self
            .request(RequestBody::CtanPackage {
                name: name.to_string(),
                hint_filename: hint_filename.map(str::to_string),
                alt_version: alt_version.map(str::to_string),
            })
            .await?;
        match body {
            ResponseBody::CtanPackage {
                success: true,
                files,
            } if !files.is_empty() => Ok(files
                .into_iter()
                .map(|(path, bytes)| (path, Blob::from(bytes)))
                .collect()),
            _ => Err(Error::FetchFailed(match alt_version {
                Some(version) => format!("package {name} ({version})"),
                None => format!("package {name}"),
            })),
        }
    }
}
