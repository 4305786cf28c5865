//! The retrying compile loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::attempt::AttemptState;
use super::classify::classify;
use super::engine::{
    FORMAT_PATH, JOB_NAME, LOG_PATH, OUTPUT_PATH, SOURCE_PATH, SYNCTEX_GZ_PATH, SYNCTEX_PATH, WORK_DIR,
};
use super::passes::predict_passes;
use super::rerun::{AUX_EXTENSIONS, aux_hash, suggests_rerun};
use super::resolve::Resolver;
use super::transform::SourceTransformer;
use super::types::{CompileOutcome, CompileRequest, CompileStats};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::fetch::FetchGateway;
use crate::manifest::Manifest;
use crate::sandbox::{RunOutcome, SandboxFactory};
use crate::vfs::{Blob, SharedCaches, VirtualFs};

/// Result of one document pass (all stages).
#[derive(Debug)]
struct Pass {
    success: bool,
    exit_code: i32,
    log: String,
}

/// Files read back after a successful pass.
struct Artifacts {
    output: Blob,
    position_log: Option<Blob>,
    aux: BTreeMap<String, Blob>,
}

/// Drives compile and format requests end to end.
///
/// Holds the process-lifetime state: the manifest, the shared caches, the
/// gateway to the host and the sandbox factory. Everything request-scoped
/// lives in an [`AttemptState`] that is dropped when the request ends.
pub struct SessionDriver {
    pub(super) manifest: Arc<Manifest>,
    pub(super) caches: SharedCaches,
    pub(super) gateway: FetchGateway,
    pub(super) sandboxes: Arc<dyn SandboxFactory>,
    pub(super) config: DriverConfig,
}

impl SessionDriver {
    /// Create a driver with fresh caches sized from `config`.
    pub fn new(
        manifest: Arc<Manifest>,
        gateway: FetchGateway,
        sandboxes: Arc<dyn SandboxFactory>,
        config: DriverConfig,
    ) -> Self {
        let caches = SharedCaches::new(config.fetched_file_capacity);
        Self {
            manifest,
            caches,
            gateway,
            sandboxes,
            config,
        }
    }

    /// Share caches with another driver.
    pub fn with_caches(mut self, caches: SharedCaches) -> Self {
        self.caches = caches;
        self
    }

    /// The manifest requests resolve against.
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// The process caches.
    pub fn caches(&self) -> &SharedCaches {
        &self.caches
    }

    /// The driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Compile a document, fetching what it turns out to need.
    ///
    /// A document that fails to build is an `Ok` outcome with
    /// `success == false`. `Err` means the sandbox could not run or the
    /// request was aborted.
    pub async fn compile(&self, request: CompileRequest) -> Result<CompileOutcome> {
        let started = Instant::now();
        let max_retries = request.options.max_retries.unwrap_or(self.config.max_retries);
        let lazy = request.options.enable_lazy_fs;
        let resolver = Resolver::new(&self.gateway, &self.caches, &self.manifest, &self.config);

        let mut stats = CompileStats {
            predicted_passes: predict_passes(&request.source),
            ..CompileStats::default()
        };
        let mut state = self.seed_state(&request);

        let (cached, missing): (Vec<String>, Vec<String>) = request
            .bundle_names
            .iter()
            .filter(|bundle| {
                !state.bundles.contains_key(*bundle) && !state.deferred.contains(*bundle)
            })
            .cloned()
            .partition(|bundle| self.caches.bundles.contains(bundle));
        for bundle in cached {
            state.bundles.insert(bundle, None);
        }
        if !missing.is_empty() {
            resolver.fetch_bundles(missing, &mut state, &mut stats).await;
        }

        info!(
            engine = %request.engine,
            lazy,
            bundles = state.bundles.len(),
            deferred = state.deferred.len(),
            predicted_passes = stats.predicted_passes,
            "compile started"
        );

        let mut fs = VirtualFs::new(Arc::clone(&self.manifest), self.caches.clone()).with_lazy(lazy);
        loop {
            stats.attempts += 1;
            debug!(attempt = stats.attempts, retries = state.retries, "mounting");
            self.prepare(&mut fs, &state, &request, &request.cached_aux_files);

            let (next, pass) = self.invoke(fs, &request, &mut stats).await?;
            fs = next;

            if pass.success {
                let mut outcome = self.converge(fs, pass, &request, &state, &mut stats).await?;
                stats.elapsed = started.elapsed();
                outcome.stats = stats;
                info!(
                    attempts = outcome.stats.attempts,
                    reruns = outcome.stats.reruns,
                    "compile succeeded"
                );
                return Ok(outcome);
            }

            if state.retries >= max_retries {
                warn!(retries = state.retries, "retry limit reached");
                return Ok(failure(pass, &state, stats, started));
            }

            if !self
                .classify_failure(&resolver, &mut fs, &pass.log, &mut state, &mut stats, &request)
                .await
            {
                info!(exit_code = pass.exit_code, "nothing left to try");
                return Ok(failure(pass, &state, stats, started));
            }

            if request.abort.as_ref().is_some_and(|abort| abort.is_aborted()) {
                info!(retries = state.retries, "compile aborted");
                return Err(Error::Aborted);
            }
            if self
                .config
                .compile_deadline
                .is_some_and(|deadline| started.elapsed() >= deadline)
            {
                warn!(elapsed = ?started.elapsed(), "compile deadline exceeded");
                return Ok(failure(pass, &state, stats, started));
            }

            state.retries += 1;
            stats.retries = state.retries;
        }
    }

    fn seed_state(&self, request: &CompileRequest) -> AttemptState {
        let mut state = AttemptState::new();
        for (bundle, bytes) in &request.bundle_data {
            self.caches.bundles.insert(bundle, bytes.clone());
            state.bundles.insert(bundle.clone(), None);
        }
        state.ctan_files = request.ctan_files.clone();

        if request.options.enable_lazy_fs {
            for bundle in &request.deferred_bundle_names {
                if !state.bundles.contains_key(bundle) {
                    state.deferred.insert(bundle.clone());
                }
            }
        } else if !request.deferred_bundle_names.is_empty() {
            debug!(
                count = request.deferred_bundle_names.len(),
                "lazy mode off, ignoring deferred bundles"
            );
        }
        state
    }

    /// Steps 1 to 3 of an attempt: reset, mount, transform.
    fn prepare(
        &self,
        fs: &mut VirtualFs,
        state: &AttemptState,
        request: &CompileRequest,
        aux: &BTreeMap<String, Blob>,
    ) {
        remount(fs, state, &self.caches);
        for (name, bytes) in aux {
            fs.mount(&format!("{WORK_DIR}/{name}"), bytes.clone());
        }
        if let Some(format) = &request.cached_format {
            fs.mount(FORMAT_PATH, format.clone());
        }
        fs.finalize();

        let source = SourceTransformer::new(request.engine, &state.shims)
            .strip_preamble(request.cached_format.is_some())
            .apply(&request.source);
        fs.write(SOURCE_PATH, source.into_bytes());
    }

    /// Run every stage of one pass, each in a fresh sandbox.
    async fn invoke(
        &self,
        fs: VirtualFs,
        request: &CompileRequest,
        stats: &mut CompileStats,
    ) -> Result<(VirtualFs, Pass)> {
        let mut fs = fs;
        let mut failed_stage = None;
        let mut exit_code = 0;

        let stages = request.engine.compile_stages(request.cached_format.is_some());
        for (index, args) in stages.into_iter().enumerate() {
            let (next, outcome) = self.run_sandbox(fs, args, stats).await?;
            fs = next;
            exit_code = outcome.exit_code;
            if !outcome.success() {
                debug!(stage = index + 1, exit_code, "stage failed");
                failed_stage = Some((index, outcome));
                break;
            }
        }

        let mut log = read_text(&mut fs, LOG_PATH).unwrap_or_default();
        match &failed_stage {
            Some((0, outcome)) if log.is_empty() => log = outcome.transcript.clone(),
            Some((index, outcome)) if *index > 0 => {
                log.push('\n');
                log.push_str(&outcome.transcript);
            }
            _ => {}
        }

        if request.options.verbose {
            for line in log.lines().filter(|line| !line.is_empty()) {
                info!(target: "vellum::tex", "{line}");
            }
        }

        let produced = fs.read(OUTPUT_PATH).is_some_and(|bytes| !bytes.is_empty());
        let pass = Pass {
            success: failed_stage.is_none() && produced,
            exit_code,
            log,
        };
        Ok((fs, pass))
    }

    /// Move the filesystem into a blocking task, run one invocation there
    /// and hand the filesystem back.
    pub(super) async fn run_sandbox(
        &self,
        fs: VirtualFs,
        args: Vec<String>,
        stats: &mut CompileStats,
    ) -> Result<(VirtualFs, RunOutcome)> {
        let factory = Arc::clone(&self.sandboxes);
        stats.sandbox_instances += 1;
        debug!(program = %args.first().map(String::as_str).unwrap_or_default(), "invoking sandbox");

        let (fs, outcome) = tokio::task::spawn_blocking(move || {
            let mut fs = fs;
            let outcome = factory
                .create()
                .and_then(|mut sandbox| sandbox.run(&args, &mut fs));
            (fs, outcome)
        })
        .await
        .map_err(|e| Error::Sandbox(format!("sandbox task failed: {e}")))?;

        Ok((fs, outcome?))
    }

    /// Classes 1 to 4, in priority order; stops at the first class that
    /// produced something new.
    async fn classify_failure(
        &self,
        resolver: &Resolver<'_>,
        fs: &mut VirtualFs,
        log: &str,
        state: &mut AttemptState,
        stats: &mut CompileStats,
        request: &CompileRequest,
    ) -> bool {
        let enable_ctan = request.options.enable_ctan;

        let pending_files = fs.take_pending_files();
        if !pending_files.is_empty() {
            debug!(count = pending_files.len(), "pending file reads");
            if resolver.fetch_pending_files(pending_files, state, stats).await {
                return true;
            }
        }

        let pending_bundles = fs.take_pending_bundles();
        if !pending_bundles.is_empty() {
            debug!(bundles = ?pending_bundles, "pending bundles");
            if resolver.fetch_pending_bundles(pending_bundles, state, stats).await {
                return true;
            }
        }

        let signals = classify(log);
        debug!(count = signals.len(), "log signals");
        if resolver.resolve_missing(&signals, state, stats, enable_ctan).await {
            return true;
        }
        resolver.handle_macros(&signals, state, stats, enable_ctan).await
    }

    /// Auto-rerun after a successful pass until cross references settle.
    async fn converge(
        &self,
        fs: VirtualFs,
        pass: Pass,
        request: &CompileRequest,
        state: &AttemptState,
        stats: &mut CompileStats,
    ) -> Result<CompileOutcome> {
        let mut fs = fs;
        let mut pass = pass;
        let mut artifacts = collect_artifacts(&mut fs);
        let mut previous = aux_hash(&request.cached_aux_files, JOB_NAME);

        while stats.reruns + 1 < stats.predicted_passes && suggests_rerun(&pass.log) {
            let Some(current) = &artifacts else {
                break;
            };
            let hash = aux_hash(&current.aux, JOB_NAME);
            if hash == previous {
                debug!(hash, "auxiliary files unchanged, rerun skipped");
                break;
            }
            previous = hash;
            stats.reruns += 1;
            debug!(rerun = stats.reruns, "rerunning for cross references");

            let aux = current.aux.clone();
            self.prepare(&mut fs, state, request, &aux);
            let (next, rerun) = self.invoke(fs, request, stats).await?;
            fs = next;
            if !rerun.success {
                warn!(exit_code = rerun.exit_code, "rerun pass failed, keeping previous output");
                break;
            }
            match collect_artifacts(&mut fs) {
                Some(fresh) => artifacts = Some(fresh),
                None => break,
            }
            pass = rerun;
        }

        let Some(artifacts) = artifacts else {
            return Err(Error::Sandbox("output vanished after a successful pass".into()));
        };
        Ok(CompileOutcome {
            success: true,
            output: Some(artifacts.output),
            position_log: artifacts.position_log,
            exit_code: pass.exit_code,
            log: pass.log,
            aux_files_to_cache: artifacts.aux,
            shims: state.shims.clone(),
            version_overrides: state.version_overrides.clone(),
            stats: CompileStats::default(),
        })
    }
}

/// Step 1 and the mounting half of step 2: reset, then mount every bundle,
/// deferred marker and package file the state has accumulated.
pub(super) fn remount(fs: &mut VirtualFs, state: &AttemptState, caches: &SharedCaches) {
    fs.reset();

    for (bundle, meta) in &state.bundles {
        match caches.bundles.get(bundle) {
            Some(raw) => {
                fs.mount_bundle(bundle, raw, meta.as_ref());
            }
            None => warn!(bundle = %bundle, "bundle missing from cache, not mounted"),
        }
    }

    if fs.is_lazy() {
        for bundle in &state.deferred {
            if state.bundles.contains_key(bundle) {
                continue;
            }
            fs.mount_deferred_bundle(bundle, None);
            if caches.bundles.contains(bundle) {
                fs.activate_deferred_bundle(bundle);
            }
        }
    }

    let force = state.force_overrides();
    let mounted = fs.mount_overrides(&state.ctan_files, force);
    if mounted > 0 {
        debug!(files = mounted, force, "mounted package files");
    }
}

pub(super) fn read_text(fs: &mut VirtualFs, path: &str) -> Option<String> {
    fs.read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn collect_artifacts(fs: &mut VirtualFs) -> Option<Artifacts> {
    let output = fs.read(OUTPUT_PATH).filter(|bytes| !bytes.is_empty())?;

    let position_log = fs
        .read(SYNCTEX_GZ_PATH)
        .filter(|bytes| !bytes.is_empty())
        .or_else(|| fs.read(SYNCTEX_PATH).filter(|bytes| !bytes.is_empty()));
    if position_log.is_none() {
        warn!("no position log produced, source sync unavailable for this revision");
    }

    Some(Artifacts {
        output,
        position_log,
        aux: collect_aux(fs),
    })
}

/// Auxiliary files in the work directory, keyed by file name.
fn collect_aux(fs: &mut VirtualFs) -> BTreeMap<String, Blob> {
    let mut aux = BTreeMap::new();
    for path in fs.list_dir(WORK_DIR) {
        let Some(name) = path.strip_prefix(WORK_DIR).map(|name| name.trim_start_matches('/'))
        else {
            continue;
        };
        let wanted = match name.rsplit_once('.') {
            Some((stem, ext)) => ext == "aux" || (stem == JOB_NAME && AUX_EXTENSIONS.contains(&ext)),
            None => false,
        };
        if !wanted {
            continue;
        }
        let name = name.to_string();
        if let Some(bytes) = fs.read(&path) {
            aux.insert(name, bytes);
        }
    }
    aux
}

fn failure(pass: Pass, state: &AttemptState, stats: CompileStats, started: Instant) -> CompileOutcome {
    let mut stats = stats;
    stats.elapsed = started.elapsed();
    CompileOutcome {
        success: false,
        output: None,
        position_log: None,
        exit_code: pass.exit_code,
        log: pass.log,
        aux_files_to_cache: BTreeMap::new(),
        shims: state.shims.clone(),
        version_overrides: state.version_overrides.clone(),
        stats,
    }
}
