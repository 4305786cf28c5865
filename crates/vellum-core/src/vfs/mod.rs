//! Virtual filesystem exposed to the sandboxed compiler.
//!
//! Nodes live by value in a path-keyed arena. A node's bytes may be present
//! ([`Materialization::Eager`]), sliceable from a cached bundle
//! ([`Materialization::Lazy`]), or not fetched at all
//! ([`Materialization::Deferred`]). Reads never fail for a known node: an
//! unresolvable deferred read returns empty bytes and records a pending
//! fetch, which the session driver drains after the compiler exits.
//!
//! ```text
//! mount_bundle ─────────────► Eager | Lazy
//! mount_deferred_bundle ────► Deferred ──activate_deferred_bundle──► Lazy
//! read ─► resolve_lazy / resolve_deferred ─► Eager (promotion)
//! finalize ─► font-map rewrite + merged pdftex.map + ls-R
//! ```

mod cache;
mod filedb;
mod fontmap;
mod node;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, warn};

pub use cache::{
    BundleCache, Blob, DEFAULT_FETCHED_FILE_CAPACITY, FetchedFileCache, RangeKey, SharedCaches,
};
pub use filedb::{FILE_DATABASE_PATH, TEXMF_ROOT};
pub use fontmap::MERGED_MAP_PATH;
pub use node::{Materialization, Node, NodeOrigin};

use crate::manifest::{BundleMeta, Manifest, ManifestEntry, basename};

/// Suffixes mounted eagerly regardless of lazy mode; the engine's path
/// search stats these directly.
const EAGER_SUFFIXES: &[&str] = &[".fmt", ".cnf", ".map", ".pfb", ".enc", "ls-R"];

/// Whether a path is always mounted eagerly.
pub fn is_eager_path(path: &str) -> bool {
    EAGER_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// A deferred read that could not be served locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Virtual path that was read.
    pub path: String,
    /// Byte range to fetch.
    pub range: RangeKey,
}

/// The filesystem one compile session sees.
pub struct VirtualFs {
    nodes: BTreeMap<String, Node>,
    dirs: BTreeSet<String>,
    by_name: FxHashMap<String, BTreeSet<String>>,
    manifest: Arc<Manifest>,
    caches: SharedCaches,
    lazy: bool,
    mounted_bundles: FxHashSet<String>,
    deferred_bundles: BTreeSet<String>,
    font_files: FxHashMap<String, String>,
    touched_maps: BTreeSet<String>,
    pending_files: BTreeMap<RangeKey, String>,
    pending_bundles: BTreeSet<String>,
}

impl VirtualFs {
    /// Create an empty filesystem over a manifest and the process caches.
    pub fn new(manifest: Arc<Manifest>, caches: SharedCaches) -> Self {
        let mut fs = Self {
            nodes: BTreeMap::new(),
            dirs: BTreeSet::new(),
            by_name: FxHashMap::default(),
            manifest,
            caches,
            lazy: false,
            mounted_bundles: FxHashSet::default(),
            deferred_bundles: BTreeSet::new(),
            font_files: FxHashMap::default(),
            touched_maps: BTreeSet::new(),
            pending_files: BTreeMap::new(),
            pending_bundles: BTreeSet::new(),
        };
        fs.reset();
        fs
    }

    /// Enable or disable lazy mounting.
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Whether lazy mounting is enabled.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// The manifest this filesystem resolves against.
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// The shared caches.
    pub fn caches(&self) -> &SharedCaches {
        &self.caches
    }

    /// Drop every node and request record, returning to the baseline tree.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.dirs.clear();
        self.by_name.clear();
        self.mounted_bundles.clear();
        self.deferred_bundles.clear();
        self.font_files.clear();
        self.touched_maps.clear();
        self.pending_files.clear();
        self.pending_bundles.clear();

        for dir in ["/", "/work", "/tmp", TEXMF_ROOT] {
            self.add_dirs(dir);
        }
    }

    // =========================================================================
    // Mounting
    // =========================================================================

    /// Mount bytes at `path`, replacing whatever was there.
    pub fn mount(&mut self, path: &str, bytes: impl Into<Blob>) -> bool {
        self.insert(path, Node::eager(bytes.into(), NodeOrigin::Session), true)
    }

    /// Mount a marker for a slice of a cached bundle.
    pub fn mount_lazy(&mut self, path: &str, bundle: &str, start: u64, end: u64) -> bool {
        self.insert(path, Node::lazy(RangeKey::new(bundle, start, end)), false)
    }

    /// Mount every file of an unfetched bundle as a deferred marker.
    ///
    /// Returns the number of files registered.
    pub fn mount_deferred_bundle(&mut self, bundle: &str, meta: Option<&BundleMeta>) -> usize {
        let entries = self.bundle_entries(bundle, meta);
        let mut count = 0;

        for entry in &entries {
            let key = RangeKey::new(bundle, entry.start, entry.end);
            if self.insert(&entry.virtual_path, Node::deferred(key), false) {
                count += 1;
            }
        }

        self.deferred_bundles.insert(bundle.to_string());
        debug!(bundle, files = count, "mounted deferred bundle");
        count
    }

    /// Mount a fetched bundle.
    ///
    /// The raw bytes go into the bundle cache. Each file is mounted lazily
    /// when lazy mode is on and its suffix allows it, eagerly otherwise.
    /// Returns the number of files mounted.
    pub fn mount_bundle(&mut self, bundle: &str, raw: Blob, meta: Option<&BundleMeta>) -> usize {
        self.caches.bundles.insert(bundle, raw);
        let entries = self.bundle_entries(bundle, meta);
        let mut count = 0;

        for entry in &entries {
            let key = RangeKey::new(bundle, entry.start, entry.end);
            let node = if self.lazy && !is_eager_path(&entry.virtual_path) {
                Node::lazy(key)
            } else {
                match self.caches.bundles.slice(bundle, entry.start, entry.end) {
                    Some(bytes) => Node::eager(bytes.into(), NodeOrigin::Bundle),
                    None => {
                        warn!(bundle, path = %entry.virtual_path, "range outside bundle, skipped");
                        continue;
                    }
                }
            };
            if self.insert(&entry.virtual_path, node, false) {
                count += 1;
            }
        }

        self.deferred_bundles.remove(bundle);
        self.mounted_bundles.insert(bundle.to_string());
        debug!(bundle, files = count, lazy = self.lazy, "mounted bundle");
        count
    }

    /// Mount externally supplied files.
    ///
    /// Existing files are only replaced when `force` is set, which lets a
    /// fetched older package version shadow the bundle's copy. Returns the
    /// number of files mounted.
    pub fn mount_overrides<'a>(
        &mut self,
        files: impl IntoIterator<Item = (&'a String, &'a Blob)>,
        force: bool,
    ) -> usize {
        let mut count = 0;
        for (path, bytes) in files {
            if !force && self.nodes.contains_key(path.as_str()) {
                continue;
            }
            if self.insert(path, Node::eager(bytes.clone(), NodeOrigin::Override), true) {
                count += 1;
            }
        }
        count
    }

    /// Turn every deferred marker of `bundle` into a lazy one.
    ///
    /// The bundle bytes must already be in the bundle cache. Returns the
    /// number of nodes activated.
    pub fn activate_deferred_bundle(&mut self, bundle: &str) -> usize {
        if !self.caches.bundles.contains(bundle) {
            warn!(bundle, "cannot activate deferred bundle that is not cached");
            return 0;
        }

        let mut count = 0;
        let mut maps = Vec::new();
        for (path, node) in &mut self.nodes {
            let Materialization::Deferred(key) = &node.state else {
                continue;
            };
            if key.bundle != bundle {
                continue;
            }
            let next = if is_eager_path(path) {
                match self.caches.bundles.slice(bundle, key.start, key.end) {
                    Some(bytes) => Materialization::Eager(bytes.into()),
                    None => continue,
                }
            } else {
                Materialization::Lazy(key.clone())
            };
            if node.advance(next) {
                count += 1;
                if fontmap::is_font_map(path) && node.state.is_eager() {
                    maps.push(path.clone());
                }
            }
        }

        self.touched_maps.extend(maps);
        self.deferred_bundles.remove(bundle);
        self.mounted_bundles.insert(bundle.to_string());
        debug!(bundle, nodes = count, "activated deferred bundle");
        count
    }

    fn bundle_entries(&self, bundle: &str, meta: Option<&BundleMeta>) -> Vec<ManifestEntry> {
        match meta {
            Some(meta) if !meta.files.is_empty() => meta.files.clone(),
            _ => self.manifest.bundle_files(bundle).cloned().collect(),
        }
    }

    /// Insert a node, creating parent directories.
    ///
    /// Without `replace`, an existing node is only advanced, never
    /// regressed. Collisions with directories are logged and skipped.
    fn insert(&mut self, path: &str, node: Node, replace: bool) -> bool {
        if self.dirs.contains(path) {
            warn!(path, "file collides with directory, skipped");
            return false;
        }
        let parent = path.rsplit_once('/').map(|(parent, _)| parent);
        if parent.is_some_and(|parent| self.ancestor_is_file(parent)) {
            warn!(path, "parent path is a file, skipped");
            return false;
        }

        let is_eager = node.state.is_eager();
        let inserted = match self.nodes.get_mut(path) {
            Some(existing) if replace => {
                *existing = node;
                true
            }
            Some(existing) if existing.state.is_eager() => false,
            Some(existing) => {
                let origin = node.origin;
                let changed = existing.advance(node.state);
                if changed && origin != NodeOrigin::Bundle {
                    existing.origin = origin;
                }
                changed
            }
            None => {
                if let Some(parent) = parent {
                    self.add_dirs(parent);
                }
                self.by_name
                    .entry(basename(path).to_string())
                    .or_default()
                    .insert(path.to_string());
                self.nodes.insert(path.to_string(), node);
                true
            }
        };

        if inserted {
            if fontmap::is_font_file(path) {
                self.font_files
                    .insert(basename(path).to_string(), path.to_string());
            }
            if is_eager && fontmap::is_font_map(path) {
                self.touched_maps.insert(path.to_string());
            }
        }
        inserted
    }

    fn ancestor_is_file(&self, dir: &str) -> bool {
        let mut current = dir;
        while !current.is_empty() {
            if self.nodes.contains_key(current) {
                return true;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => break,
            }
        }
        false
    }

    fn add_dirs(&mut self, dir: &str) {
        let mut current = dir;
        loop {
            let key = if current.is_empty() { "/" } else { current };
            if !self.dirs.insert(key.to_string()) {
                break;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => break,
            }
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Bytes of a lazy marker, sliced from the bundle cache.
    ///
    /// A missing bundle is logged and yields empty bytes.
    pub fn resolve_lazy(&self, key: &RangeKey) -> Vec<u8> {
        match self.caches.bundles.slice(&key.bundle, key.start, key.end) {
            Some(bytes) => bytes,
            None => {
                error!(bundle = %key.bundle, "lazy node without cached bundle");
                Vec::new()
            }
        }
    }

    /// Bytes of a deferred marker.
    ///
    /// Served from the bundle cache or the fetched-file cache when possible;
    /// otherwise a pending fetch is recorded for `path` and `None` returned.
    pub fn resolve_deferred(&mut self, path: &str, key: &RangeKey) -> Option<Blob> {
        if let Some(bytes) = self.caches.bundles.slice(&key.bundle, key.start, key.end) {
            return Some(bytes.into());
        }
        if let Some(bytes) = self.caches.files.get(key) {
            return Some(bytes);
        }
        self.record_pending_file(path, key);
        None
    }

    fn record_pending_file(&mut self, path: &str, key: &RangeKey) {
        if !self.pending_files.contains_key(key) {
            debug!(path, bundle = %key.bundle, "deferred read recorded for fetch");
            self.pending_files.insert(key.clone(), path.to_string());
        }
    }

    /// Read a file, promoting marker nodes to eager on success.
    ///
    /// `None` means no such node; a manifest-known path whose bundle is
    /// neither mounted nor deferred is recorded as a pending bundle.
    pub fn read(&mut self, path: &str) -> Option<Blob> {
        let Some(node) = self.nodes.get(path) else {
            self.note_miss(path);
            return None;
        };

        let resolved = match &node.state {
            Materialization::Eager(bytes) => return Some(bytes.clone()),
            Materialization::Lazy(key) => {
                let bytes = self.resolve_lazy(key);
                if bytes.len() as u64 == key.end.saturating_sub(key.start) {
                    Ok(Blob::from(bytes))
                } else {
                    Err(Blob::from(bytes))
                }
            }
            Materialization::Deferred(key) => {
                let key = key.clone();
                self.resolve_deferred(path, &key).ok_or_else(|| Blob::from(Vec::new()))
            }
        };

        match resolved {
            Ok(bytes) => {
                if let Some(node) = self.nodes.get_mut(path) {
                    node.advance(Materialization::Eager(bytes.clone()));
                }
                Some(bytes)
            }
            Err(empty) => Some(empty),
        }
    }

    /// Whether a file node exists.
    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Whether a directory exists.
    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    /// The node at `path`.
    pub fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    /// Path search by name.
    ///
    /// Names containing `/` are taken as paths. Bare names are searched in
    /// the basename index, first match in path order. A miss on a name the
    /// manifest knows records its bundle as pending.
    pub fn lookup(&mut self, name: &str) -> Option<String> {
        if name.contains('/') {
            if self.nodes.contains_key(name) {
                return Some(name.to_string());
            }
            self.note_miss(name);
            return None;
        }

        if let Some(path) = self.by_name.get(name).and_then(|paths| paths.iter().next()) {
            return Some(path.clone());
        }

        let known = self
            .manifest
            .find_by_basename(name)
            .next()
            .map(|entry| entry.virtual_path.clone());
        if let Some(path) = known {
            self.note_miss(&path);
        }
        None
    }

    fn note_miss(&mut self, path: &str) {
        let Some(entry) = self.manifest.entry(path) else {
            return;
        };
        let bundle = &entry.bundle;
        if self.mounted_bundles.contains(bundle) || self.deferred_bundles.contains(bundle) {
            return;
        }
        if self.pending_bundles.insert(bundle.clone()) {
            debug!(path, bundle = %bundle, "unmounted bundle requested");
        }
    }

    /// Write a file produced during the session.
    pub fn write(&mut self, path: &str, bytes: impl Into<Blob>) -> bool {
        self.insert(path, Node::eager(bytes.into(), NodeOrigin::Session), true)
    }

    /// Paths of the files directly inside `dir`.
    pub fn list_dir(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// All nodes in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(path, node)| (path.as_str(), node))
    }

    /// Number of file nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no file is mounted.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a bundle's files are mounted (eagerly or lazily).
    pub fn is_bundle_mounted(&self, bundle: &str) -> bool {
        self.mounted_bundles.contains(bundle)
    }

    /// Whether a bundle is mounted as deferred markers only.
    pub fn is_bundle_deferred(&self, bundle: &str) -> bool {
        self.deferred_bundles.contains(bundle)
    }

    /// Drain the recorded deferred reads, in key order.
    pub fn take_pending_files(&mut self) -> Vec<PendingFile> {
        std::mem::take(&mut self.pending_files)
            .into_iter()
            .map(|(range, path)| PendingFile { path, range })
            .collect()
    }

    /// Drain the recorded whole-bundle requests.
    pub fn take_pending_bundles(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_bundles).into_iter().collect()
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Rewrite font maps, write the merged map and regenerate `ls-R`.
    pub fn finalize(&mut self) {
        let mut rewritten = Vec::new();

        for map_path in std::mem::take(&mut self.touched_maps) {
            let Some(Node {
                state: Materialization::Eager(bytes),
                ..
            }) = self.nodes.get(&map_path)
            else {
                continue;
            };
            let content = String::from_utf8_lossy(bytes).into_owned();
            let updated =
                fontmap::rewrite_with_candidates(&map_path, &content, |p| self.nodes.contains_key(p));
            if updated != content {
                self.write_preserving_origin(&map_path, updated.as_bytes());
            }
            rewritten.push(updated);
        }

        if !rewritten.is_empty() {
            let base = match self.nodes.get(MERGED_MAP_PATH) {
                Some(Node {
                    state: Materialization::Eager(bytes),
                    ..
                }) => String::from_utf8_lossy(bytes).into_owned(),
                _ => String::new(),
            };
            let merged = fontmap::merge_maps(
                std::iter::once(base.as_str()).chain(rewritten.iter().map(String::as_str)),
            );
            let merged = fontmap::rewrite_with_table(&merged, &self.font_files);
            self.write_preserving_origin(MERGED_MAP_PATH, merged.as_bytes());
            debug!(maps = rewritten.len(), "font maps merged");
        }

        let database = filedb::render(self.nodes.keys().map(String::as_str));
        self.write_preserving_origin(FILE_DATABASE_PATH, database.as_bytes());
    }

    fn write_preserving_origin(&mut self, path: &str, bytes: &[u8]) {
        let origin = self
            .nodes
            .get(path)
            .map_or(NodeOrigin::Session, |node| node.origin);
        self.insert(path, Node::eager(Arc::from(bytes), origin), true);
    }
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs")
            .field("nodes", &self.nodes.len())
            .field("lazy", &self.lazy)
            .field("mounted_bundles", &self.mounted_bundles.len())
            .field("deferred_bundles", &self.deferred_bundles)
            .finish()
    }
}
