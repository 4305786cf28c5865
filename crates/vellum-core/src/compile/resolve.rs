//! Turning failure signals into fetched resources.
//!
//! Each method handles one failure class. Network calls of a class are
//! issued together and awaited together; a failed fetch is logged and
//! skipped without affecting its siblings. Results are applied to the
//! [`AttemptState`] only after every fetch of the batch has settled.
//! Two things wait on an earlier batch: range fetches that replace a failed
//! whole-bundle fetch, and older releases of a package, which are tried
//! newest first.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::attempt::AttemptState;
use super::classify::Signal;
use super::types::CompileStats;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::fetch::{FetchGateway, FetchedBundle};
use crate::manifest::Manifest;
use crate::vfs::{Blob, PendingFile, SharedCaches};

/// Missing files with these extensions belong to the project, not to any
/// package source.
const PROJECT_EXTENSIONS: &[&str] = &[
    "tex", "bib", "bbl", "aux", "toc", "lof", "lot", "out", "png", "jpg", "jpeg", "pdf", "eps",
    "svg",
];

type PackageFetch = (String, Result<BTreeMap<String, Blob>>);

/// Fetch logic shared by the session and format drivers.
pub(crate) struct Resolver<'a> {
    gateway: &'a FetchGateway,
    caches: &'a SharedCaches,
    manifest: &'a Manifest,
    config: &'a DriverConfig,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(
        gateway: &'a FetchGateway,
        caches: &'a SharedCaches,
        manifest: &'a Manifest,
        config: &'a DriverConfig,
    ) -> Self {
        Self {
            gateway,
            caches,
            manifest,
            config,
        }
    }

    /// Fetch whole bundles concurrently; returns how many arrived.
    pub(crate) async fn fetch_bundles(
        &self,
        bundles: Vec<String>,
        state: &mut AttemptState,
        stats: &mut CompileStats,
    ) -> usize {
        let results = self.download_bundles(&bundles).await;
        self.apply_bundles(bundles.into_iter().zip(results), state, stats)
    }

    async fn download_bundles(&self, bundles: &[String]) -> Vec<Result<FetchedBundle>> {
        join_all(bundles.iter().map(|bundle| self.gateway.fetch_bundle(bundle))).await
    }

    fn apply_bundles(
        &self,
        results: impl IntoIterator<Item = (String, Result<FetchedBundle>)>,
        state: &mut AttemptState,
        stats: &mut CompileStats,
    ) -> usize {
        let mut arrived = 0;
        for (bundle, result) in results {
            match result {
                Ok(fetched) => {
                    info!(bundle = %bundle, bytes = fetched.bytes.len(), "bundle fetched");
                    self.caches.bundles.insert(&bundle, fetched.bytes);
                    stats.bundles_fetched += 1;
                    arrived += 1;
                    if !state.deferred.contains(&bundle) {
                        state.bundles.insert(bundle, fetched.meta);
                    }
                }
                Err(e) => {
                    warn!(bundle = %bundle, error = %e, "bundle fetch failed");
                    state.failed_bundles.insert(bundle);
                }
            }
        }
        arrived
    }

    /// Class 1: deferred reads that missed every cache.
    ///
    /// Bundles with many pending files are fetched whole; the rest, and the
    /// files of bundles whose whole fetch failed, are fetched as ranges.
    pub(crate) async fn fetch_pending_files(
        &self,
        pending: Vec<PendingFile>,
        state: &mut AttemptState,
        stats: &mut CompileStats,
    ) -> bool {
        let mut by_bundle: BTreeMap<String, Vec<PendingFile>> = BTreeMap::new();
        for file in pending {
            by_bundle.entry(file.range.bundle.clone()).or_default().push(file);
        }

        let mut whole = Vec::new();
        let mut ranges = Vec::new();
        for (bundle, files) in by_bundle {
            if files.len() >= self.config.whole_bundle_threshold
                && !state.failed_bundles.contains(&bundle)
            {
                whole.push((bundle, files));
            } else {
                ranges.extend(files);
            }
        }

        let names: Vec<String> = whole.iter().map(|(bundle, _)| bundle.clone()).collect();
        let (bundle_results, range_results) =
            futures::join!(self.download_bundles(&names), self.download_ranges(&ranges));
        let arrived = self.apply_bundles(names.into_iter().zip(bundle_results), state, stats);
        let mut progressed = arrived + self.apply_ranges(ranges, range_results, stats) > 0;

        let fallback: Vec<PendingFile> = whole
            .into_iter()
            .filter(|(bundle, _)| !self.caches.bundles.contains(bundle))
            .flat_map(|(bundle, files)| {
                debug!(bundle = %bundle, files = files.len(), "falling back to range fetches");
                files
            })
            .collect();
        if !fallback.is_empty() {
            let results = self.download_ranges(&fallback).await;
            progressed |= self.apply_ranges(fallback, results, stats) > 0;
        }
        progressed
    }

    async fn download_ranges(&self, files: &[PendingFile]) -> Vec<Result<Blob>> {
        join_all(files.iter().map(|file| {
            self.gateway
                .fetch_file_range(&file.range.bundle, file.range.start, file.range.end)
        }))
        .await
    }

    fn apply_ranges(
        &self,
        files: Vec<PendingFile>,
        results: Vec<Result<Blob>>,
        stats: &mut CompileStats,
    ) -> usize {
        let mut fetched = 0;
        for (file, result) in files.into_iter().zip(results) {
            match result {
                Ok(bytes) => {
                    debug!(path = %file.path, "range fetched");
                    self.caches.files.insert(file.range, bytes);
                    stats.ranges_fetched += 1;
                    fetched += 1;
                }
                Err(e) => warn!(path = %file.path, error = %e, "range fetch failed"),
            }
        }
        fetched
    }

    /// Class 2: bundles whose files were looked up but never mounted.
    pub(crate) async fn fetch_pending_bundles(
        &self,
        pending: Vec<String>,
        state: &mut AttemptState,
        stats: &mut CompileStats,
    ) -> bool {
        let fresh: Vec<String> = pending
            .into_iter()
            .filter(|bundle| {
                !state.has_bundle(bundle, self.caches)
                    && !state.failed_bundles.contains(bundle)
                    && self.manifest.is_known_bundle(bundle)
            })
            .collect();
        if fresh.is_empty() {
            return false;
        }
        self.fetch_bundles(fresh, state, stats).await > 0
    }

    /// Class 3: missing files named in the log.
    ///
    /// Names the manifest knows pull in their bundle and its dependencies;
    /// the rest go to the external package source when allowed. Both groups
    /// are fetched concurrently.
    pub(crate) async fn resolve_missing(
        &self,
        signals: &[Signal],
        state: &mut AttemptState,
        stats: &mut CompileStats,
        enable_ctan: bool,
    ) -> bool {
        let mut bundles = BTreeSet::new();
        let mut packages: Vec<(String, String)> = Vec::new();

        for signal in signals {
            let Signal::MissingFile { name, package } = signal else {
                continue;
            };
            match self.manifest.bundle_for(name) {
                Some(bundle) => {
                    for dep in self.manifest.bundle_closure(bundle) {
                        if !state.has_bundle(&dep, self.caches) && !state.failed_bundles.contains(&dep) {
                            bundles.insert(dep);
                        }
                    }
                }
                None if enable_ctan
                    && is_package_file(name)
                    && !state.fetched_packages.contains(package)
                    && !state.failed_packages.contains(package) =>
                {
                    packages.push((package.clone(), name.clone()));
                }
                None => debug!(name = %name, "missing file has no known source"),
            }
        }

        if bundles.is_empty() && packages.is_empty() {
            return false;
        }

        let bundles: Vec<String> = bundles.into_iter().collect();
        let package_fetches = join_all(packages.iter().map(|(package, name)| async move {
            let result = self.gateway.fetch_ctan_package(package, Some(name), None).await;
            (package.clone(), result)
        }));
        let (bundle_results, package_results) =
            futures::join!(self.download_bundles(&bundles), package_fetches);

        let arrived = self.apply_bundles(bundles.into_iter().zip(bundle_results), state, stats);
        let fetched = self.apply_packages(package_results, state, stats);
        arrived + fetched > 0
    }

    fn apply_packages(
        &self,
        results: Vec<PackageFetch>,
        state: &mut AttemptState,
        stats: &mut CompileStats,
    ) -> usize {
        let mut fetched = 0;
        for (package, result) in results {
            match result {
                Ok(files) => {
                    info!(package = %package, files = files.len(), "package fetched");
                    state.ctan_files.extend(files);
                    state.fetched_packages.insert(package);
                    stats.packages_fetched += 1;
                    fetched += 1;
                }
                Err(e) => {
                    warn!(package = %package, error = %e, "package fetch failed");
                    state.failed_packages.insert(package);
                }
            }
        }
        fetched
    }

    /// Class 4: undefined macros.
    ///
    /// Macros that look like newer kernel features first try older releases
    /// of the package that was loading when the error hit; everything else,
    /// and those once the releases run out, get a shim. Returns whether
    /// anything changed since the previous attempt.
    pub(crate) async fn handle_macros(
        &self,
        signals: &[Signal],
        state: &mut AttemptState,
        stats: &mut CompileStats,
        enable_ctan: bool,
    ) -> bool {
        let versions = &self.config.historical_versions;
        let mut owners = BTreeSet::new();
        if enable_ctan {
            for signal in signals {
                if let Signal::UndefinedMacro {
                    owner: Some(owner),
                    kernel_feature: true,
                    ..
                } = signal
                {
                    if state.versions_exhausted(owner, versions) {
                        debug!(package = %owner, "historical releases exhausted");
                    } else {
                        owners.insert(owner.as_str());
                    }
                }
            }
        }

        let plans: Vec<(&str, &[String])> = owners
            .into_iter()
            .map(|owner| (owner, state.untried_versions(owner, versions)))
            .collect();
        let results = join_all(
            plans
                .iter()
                .map(|(owner, untried)| self.fallback_version(owner, untried)),
        )
        .await;

        let mut changed = false;
        let mut pinned = BTreeSet::new();
        for ((owner, _), (tried, release)) in plans.into_iter().zip(results) {
            state.mark_versions_tried(owner, tried);
            match release {
                Some((version, files)) => {
                    info!(package = owner, version = %version, "pinned older package release");
                    state.ctan_files.extend(files);
                    state.version_overrides.insert(owner.to_string(), version);
                    stats.packages_fetched += 1;
                    pinned.insert(owner);
                    changed = true;
                }
                None => debug!(package = owner, "historical releases exhausted"),
            }
        }

        for signal in signals {
            let Signal::UndefinedMacro {
                name,
                arity,
                owner,
                kernel_feature,
            } = signal
            else {
                continue;
            };
            if *kernel_feature && owner.as_deref().is_some_and(|owner| pinned.contains(owner)) {
                continue;
            }

            let arity = (*arity).min(self.config.max_shim_args);
            if state.add_shim(name, arity) {
                debug!(name = %name, arity, "shim added");
                changed = true;
            }
        }
        changed
    }

    /// Try `versions` of `package` in order until one is available.
    ///
    /// Returns how many were requested and the release that arrived.
    async fn fallback_version(
        &self,
        package: &str,
        versions: &[String],
    ) -> (usize, Option<(String, BTreeMap<String, Blob>)>) {
        for (tried, version) in versions.iter().enumerate() {
            match self
                .gateway
                .fetch_ctan_package(package, None, Some(version.as_str()))
                .await
            {
                Ok(files) => return (tried + 1, Some((version.clone(), files))),
                Err(e) => warn!(package, version = %version, error = %e, "release unavailable"),
            }
        }
        (versions.len(), None)
    }
}

fn is_package_file(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => !PROJECT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => true,
    }
}
