//! State accumulated across the attempts of one request.

use std::collections::{BTreeMap, BTreeSet};

use crate::manifest::BundleMeta;
use crate::vfs::{Blob, SharedCaches};

/// Everything a request has learned so far; discarded when it ends.
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    /// Bundles to mount, with the listing shipped by the host if any.
    pub bundles: BTreeMap<String, Option<BundleMeta>>,
    /// Bundles mounted as deferred markers.
    pub deferred: BTreeSet<String>,
    /// Package files from the external source, virtual path → bytes.
    pub ctan_files: BTreeMap<String, Blob>,
    /// Shimmed macros, name → arity.
    pub shims: BTreeMap<String, usize>,
    /// Package → historical release in use.
    pub version_overrides: BTreeMap<String, String>,
    /// Package → index of the next historical release to try.
    version_cursor: BTreeMap<String, usize>,
    /// Packages fetched from the external source.
    pub fetched_packages: BTreeSet<String>,
    /// Packages the external source could not provide.
    pub failed_packages: BTreeSet<String>,
    /// Bundles whose whole-bundle fetch failed.
    pub failed_bundles: BTreeSet<String>,
    /// Retries taken.
    pub retries: u32,
}

impl AttemptState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the bundle's bytes will be available on the next mount.
    pub fn has_bundle(&self, bundle: &str, caches: &SharedCaches) -> bool {
        self.bundles.contains_key(bundle)
            || (self.deferred.contains(bundle) && caches.bundles.contains(bundle))
    }

    /// Package files must shadow bundle files once a release is pinned.
    pub fn force_overrides(&self) -> bool {
        !self.version_overrides.is_empty()
    }

    /// Record a shim; returns whether it is new or its arity grew.
    pub fn add_shim(&mut self, name: &str, arity: usize) -> bool {
        match self.shims.get_mut(name) {
            Some(existing) if *existing >= arity => false,
            Some(existing) => {
                *existing = arity;
                true
            }
            None => {
                self.shims.insert(name.to_string(), arity);
                true
            }
        }
    }

    /// Historical releases of `package` not tried yet, newest first.
    pub fn untried_versions<'v>(&self, package: &str, versions: &'v [String]) -> &'v [String] {
        let cursor = self.version_cursor.get(package).copied().unwrap_or(0);
        versions.get(cursor..).unwrap_or_default()
    }

    /// Advance past `count` releases of `package`.
    pub fn mark_versions_tried(&mut self, package: &str, count: usize) {
        *self.version_cursor.entry(package.to_string()).or_insert(0) += count;
    }

    /// Whether every historical release of `package` has been tried.
    pub fn versions_exhausted(&self, package: &str, versions: &[String]) -> bool {
        self.untried_versions(package, versions).is_empty()
    }
}
