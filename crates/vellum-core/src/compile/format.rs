//! Preamble format generation.
//!
//! Same attempt loop as a document compile, minus the macro handling: a
//! format that needs shims or older package releases is not worth caching.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::attempt::AttemptState;
use super::classify::classify;
use super::engine::{FORMAT_PATH, PREAMBLE_LOG_PATH, PREAMBLE_SOURCE_PATH};
use super::resolve::Resolver;
use super::session::{SessionDriver, read_text, remount};
use super::transform::format_source;
use super::types::{CompileStats, FormatOutcome, FormatRequest};
use crate::error::Result;
use crate::vfs::VirtualFs;

impl SessionDriver {
    /// Dump the preamble into a reusable format image.
    ///
    /// Missing bundles and packages are fetched and the dump retried, up to
    /// the retry ceiling. Bundles are always mounted eagerly.
    pub async fn generate_format(&self, request: FormatRequest) -> Result<FormatOutcome> {
        let started = Instant::now();
        let manifest = request
            .manifest
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.manifest));
        let resolver = Resolver::new(&self.gateway, &self.caches, &manifest, &self.config);
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);

        let mut stats = CompileStats {
            predicted_passes: 1,
            ..CompileStats::default()
        };
        let mut state = AttemptState::new();
        for (bundle, bytes) in &request.bundle_data {
            self.caches.bundles.insert(bundle, bytes.clone());
            state.bundles.insert(bundle.clone(), None);
        }
        state.ctan_files = request.ctan_files.clone();

        let source = format_source(&request.preamble);
        info!(engine = %request.engine, bundles = state.bundles.len(), "format generation started");

        let mut fs = VirtualFs::new(Arc::clone(&manifest), self.caches.clone());
        loop {
            stats.attempts += 1;
            remount(&mut fs, &state, &self.caches);
            fs.finalize();
            fs.write(PREAMBLE_SOURCE_PATH, source.clone().into_bytes());

            let (next, run) = self
                .run_sandbox(fs, request.engine.format_args(), &mut stats)
                .await?;
            fs = next;

            let log = read_text(&mut fs, PREAMBLE_LOG_PATH)
                .filter(|log| !log.is_empty())
                .unwrap_or_else(|| run.transcript.clone());
            let format = fs.read(FORMAT_PATH).filter(|bytes| !bytes.is_empty());

            if let (true, Some(format)) = (run.success(), format) {
                stats.elapsed = started.elapsed();
                info!(bytes = format.len(), attempts = stats.attempts, "format generated");
                return Ok(FormatOutcome {
                    success: true,
                    format_bytes: Some(format),
                    error: None,
                    log,
                    stats,
                });
            }

            let error = if state.retries >= max_retries {
                Some(format!("retry limit of {max_retries} reached"))
            } else {
                let pending = fs.take_pending_bundles();
                let signals = classify(&log);
                let progressed = resolver
                    .fetch_pending_bundles(pending, &mut state, &mut stats)
                    .await
                    || resolver
                        .resolve_missing(&signals, &mut state, &mut stats, true)
                        .await;
                (!progressed).then(|| format!("format dump failed with exit code {}", run.exit_code))
            };

            if let Some(error) = error {
                warn!(%error, "format generation failed");
                stats.elapsed = started.elapsed();
                return Ok(FormatOutcome {
                    success: false,
                    format_bytes: None,
                    error: Some(error),
                    log,
                    stats,
                });
            }

            state.retries += 1;
            stats.retries = state.retries;
            debug!(retries = state.retries, "retrying format generation");
        }
    }
}
