//! Pre-built index of the bundle archives.
//!
//! A bundle is one archive holding many small TeX files back to back. The
//! manifest records, for each virtual path, which bundle owns it and the
//! `[start, end)` byte range inside that bundle. It is loaded once per
//! process and shared behind an `Arc`.
//!
//! # JSON format
//!
//! ```text
//! {
//!   "files":       { "/texlive/texmf-dist/tex/latex/xcolor/xcolor.sty":
//!                      { "bundle": "core", "start": 0, "end": 51234 } },
//!   "packages":    { "xcolor": "core" },          // optional
//!   "bundle_deps": { "fonts-extra": ["core"] },   // optional
//!   "bundles":     ["core", "fonts-extra"]        // optional registry
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Extensions tried when a missing-file name arrives without one.
const IMPLIED_EXTENSIONS: &[&str] = &["sty", "cls", "tfm"];

/// One file inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute virtual path the compiler sees.
    pub virtual_path: String,
    /// Owning bundle id.
    pub bundle: String,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
}

impl ManifestEntry {
    /// Create a new entry.
    pub fn new(virtual_path: impl Into<String>, bundle: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            bundle: bundle.into(),
            start,
            end,
        }
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final path component.
    pub fn basename(&self) -> &str {
        basename(&self.virtual_path)
    }
}

/// Final component of a `/`-separated virtual path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// File listing delivered with a fetched bundle.
///
/// When present it takes precedence over the manifest for that bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Files in the bundle with their byte ranges.
    pub files: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct RawManifest {
    files: BTreeMap<String, RawEntry>,
    #[serde(default)]
    packages: BTreeMap<String, String>,
    #[serde(default)]
    bundle_deps: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    bundles: Vec<String>,
}

#[derive(Deserialize)]
struct RawEntry {
    bundle: String,
    start: u64,
    end: u64,
}

/// Immutable bundle index with lookups by path, bundle and basename.
#[derive(Debug, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    by_path: FxHashMap<String, usize>,
    by_bundle: FxHashMap<String, Vec<usize>>,
    by_basename: FxHashMap<String, Vec<usize>>,
    packages: FxHashMap<String, String>,
    bundle_deps: FxHashMap<String, Vec<String>>,
    registry: FxHashSet<String>,
}

impl Manifest {
    /// Parse the manifest JSON document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;

        let entries = raw
            .files
            .into_iter()
            .map(|(path, entry)| {
                if entry.end < entry.start {
                    return Err(Error::Manifest(format!(
                        "{path}: end {} precedes start {}",
                        entry.end, entry.start
                    )));
                }
                Ok(ManifestEntry::new(path, entry.bundle, entry.start, entry.end))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_entries(entries)
            .with_packages(raw.packages)
            .with_bundle_deps(raw.bundle_deps)
            .with_registry(raw.bundles))
    }

    /// Build the index from a list of entries.
    ///
    /// Later duplicates of the same virtual path are ignored.
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        let mut manifest = Self::default();

        for entry in entries {
            if manifest.by_path.contains_key(&entry.virtual_path) {
                continue;
            }
            let idx = manifest.entries.len();
            manifest.by_path.insert(entry.virtual_path.clone(), idx);
            manifest
                .by_bundle
                .entry(entry.bundle.clone())
                .or_default()
                .push(idx);
            manifest
                .by_basename
                .entry(entry.basename().to_string())
                .or_default()
                .push(idx);
            manifest.entries.push(entry);
        }

        manifest
    }

    /// Attach the package-name → bundle map.
    pub fn with_packages(mut self, packages: impl IntoIterator<Item = (String, String)>) -> Self {
        self.packages.extend(packages);
        self
    }

    /// Attach bundle dependency lists.
    pub fn with_bundle_deps(mut self, deps: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        self.bundle_deps.extend(deps);
        self
    }

    /// Attach the registry of fetchable bundles.
    pub fn with_registry(mut self, bundles: impl IntoIterator<Item = String>) -> Self {
        self.registry.extend(bundles);
        self
    }

    /// Number of files indexed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a file by its exact virtual path.
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.by_path.get(path).map(|&idx| &self.entries[idx])
    }

    /// All files of a bundle, in manifest order.
    pub fn bundle_files<'a>(&'a self, bundle: &str) -> impl Iterator<Item = &'a ManifestEntry> + use<'a> {
        self.by_bundle
            .get(bundle)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&idx| &self.entries[idx])
    }

    /// Files whose final path component is `name`.
    pub fn find_by_basename<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a ManifestEntry> + use<'a> {
        self.by_basename
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&idx| &self.entries[idx])
    }

    /// Whether the bundle can be requested from the host.
    ///
    /// With an empty registry every bundle that owns at least one file counts.
    pub fn is_known_bundle(&self, bundle: &str) -> bool {
        if self.registry.is_empty() {
            self.by_bundle.contains_key(bundle)
        } else {
            self.registry.contains(bundle)
        }
    }

    /// Resolve a bare file name (as printed in a TeX log) to a manifest entry.
    ///
    /// Names without an extension are tried with `.sty`, `.cls` and `.tfm`.
    pub fn resolve_file(&self, name: &str) -> Option<&ManifestEntry> {
        let name = basename(name);
        if let Some(entry) = self.find_by_basename(name).next() {
            return Some(entry);
        }
        if name.contains('.') {
            return None;
        }
        IMPLIED_EXTENSIONS
            .iter()
            .find_map(|ext| self.find_by_basename(&format!("{name}.{ext}")).next())
    }

    /// Bundle that provides a package or file name.
    ///
    /// The explicit package map wins over the basename index.
    pub fn bundle_for(&self, name: &str) -> Option<&str> {
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        self.packages
            .get(name)
            .or_else(|| self.packages.get(stem))
            .map(String::as_str)
            .or_else(|| self.resolve_file(name).map(|entry| entry.bundle.as_str()))
    }

    /// The bundle followed by its transitive dependencies, without repeats.
    pub fn bundle_closure(&self, bundle: &str) -> Vec<String> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([bundle.to_string()]);

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(deps) = self.bundle_deps.get(&next) {
                queue.extend(deps.iter().cloned());
            }
            order.push(next);
        }

        order
    }
}
