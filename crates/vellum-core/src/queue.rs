//! Serialized access to the compile drivers.
//!
//! Only one engine invocation may run at a time. Every compile and format
//! request goes through a single worker task that owns the
//! [`SessionDriver`] and processes operations strictly in arrival order.
//! The worker also keeps the position index of the last successful compile
//! so source sync queries can be answered at any time.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compile::{CompileOutcome, CompileRequest, FormatOutcome, FormatRequest, SessionDriver};
use crate::error::{Error, Result};
use crate::synctex::{OutputLocation, PositionIndex, SourceLocation};

type SharedIndex = Arc<RwLock<Option<Arc<PositionIndex>>>>;

enum Operation {
    Compile {
        request: Box<CompileRequest>,
        reply: oneshot::Sender<Result<CompileOutcome>>,
    },
    Format {
        request: Box<FormatRequest>,
        reply: oneshot::Sender<Result<FormatOutcome>>,
    },
}

/// Handle to the worker. Cheap to clone.
#[derive(Clone)]
pub struct OperationQueue {
    sender: mpsc::UnboundedSender<Operation>,
    index: SharedIndex,
}

impl OperationQueue {
    /// Spawn the worker on the current runtime.
    ///
    /// The worker stops once every handle is dropped.
    pub fn spawn(driver: SessionDriver) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let index = SharedIndex::default();
        let worker = tokio::spawn(run_worker(driver, receiver, Arc::clone(&index)));
        (Self { sender, index }, worker)
    }

    /// Queue a compile and wait for its outcome.
    pub async fn compile(&self, request: CompileRequest) -> Result<CompileOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Operation::Compile {
                request: Box::new(request),
                reply,
            })
            .map_err(|_| Error::QueueClosed)?;
        response.await.map_err(|_| Error::QueueClosed)?
    }

    /// Queue a format generation and wait for its outcome.
    pub async fn generate_format(&self, request: FormatRequest) -> Result<FormatOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Operation::Format {
                request: Box::new(request),
                reply,
            })
            .map_err(|_| Error::QueueClosed)?;
        response.await.map_err(|_| Error::QueueClosed)?
    }

    /// Position index of the last successful compile, if it had one.
    pub fn position_index(&self) -> Option<Arc<PositionIndex>> {
        self.index.read().clone()
    }

    /// Output position of a source line in the last successful compile.
    pub fn source_to_output(&self, file: &str, line: u32) -> Option<OutputLocation> {
        self.position_index()?.source_to_output(file, line)
    }

    /// Source location of an output point in the last successful compile.
    pub fn output_to_source(&self, page: u32, x: f64, y: f64) -> Option<SourceLocation> {
        self.position_index()?.output_to_source(page, x, y)
    }
}

async fn run_worker(
    driver: SessionDriver,
    mut receiver: mpsc::UnboundedReceiver<Operation>,
    index: SharedIndex,
) {
    debug!("operation queue started");
    while let Some(operation) = receiver.recv().await {
        match operation {
            Operation::Compile { request, reply } => {
                let result = driver.compile(*request).await;
                if let Ok(outcome @ CompileOutcome { success: true, .. }) = &result {
                    update_index(&index, outcome);
                }
                if reply.send(result).is_err() {
                    debug!("compile caller went away");
                }
            }
            Operation::Format { request, reply } => {
                let result = driver.generate_format(*request).await;
                if reply.send(result).is_err() {
                    debug!("format caller went away");
                }
            }
        }
    }
    info!("operation queue stopped");
}

fn update_index(index: &SharedIndex, outcome: &CompileOutcome) {
    let parsed = match &outcome.position_log {
        Some(bytes) => match PositionIndex::parse(bytes) {
            Ok(parsed) => Some(Arc::new(parsed)),
            Err(e) => {
                warn!(error = %e, "position log unusable, source sync unavailable");
                None
            }
        },
        None => None,
    };
    *index.write() = parsed;
}
