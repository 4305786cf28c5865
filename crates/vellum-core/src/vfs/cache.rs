//! Process-lifetime caches shared by every compile request.
//!
//! ```text
//! SharedCaches (cloned into each session, Arc inside)
//! ├── BundleCache        bundle id → whole archive bytes
//! │                      all-or-nothing, never evicted
//! └── FetchedFileCache   (bundle, start, end) → file bytes
//!                        bounded, oldest-inserted evicted first
//! ```
//!
//! Writes are whole-entry inserts, so concurrent fetch completions only race
//! on independent keys.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

/// Immutable shared byte buffer.
pub type Blob = Arc<[u8]>;

/// Default capacity of the fetched-file cache.
pub const DEFAULT_FETCHED_FILE_CAPACITY: usize = 200;

/// Key of a byte range inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeKey {
    /// Owning bundle id.
    pub bundle: String,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
}

impl RangeKey {
    /// Create a new range key.
    pub fn new(bundle: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            bundle: bundle.into(),
            start,
            end,
        }
    }
}

/// Whole-bundle byte cache.
#[derive(Debug, Default)]
pub struct BundleCache {
    bundles: RwLock<FxHashMap<String, Blob>>,
}

impl BundleCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a bundle's bytes.
    pub fn get(&self, bundle: &str) -> Option<Blob> {
        self.bundles.read().get(bundle).cloned()
    }

    /// Whether the bundle is cached.
    pub fn contains(&self, bundle: &str) -> bool {
        self.bundles.read().contains_key(bundle)
    }

    /// Store a bundle, replacing any previous copy.
    pub fn insert(&self, bundle: impl Into<String>, bytes: Blob) {
        self.bundles.write().insert(bundle.into(), bytes);
    }

    /// Slice `[start, end)` out of a cached bundle.
    ///
    /// Returns `None` when the bundle is absent or the range is out of bounds.
    pub fn slice(&self, bundle: &str, start: u64, end: u64) -> Option<Vec<u8>> {
        let guard = self.bundles.read();
        let bytes = guard.get(bundle)?;
        let (start, end) = (usize::try_from(start).ok()?, usize::try_from(end).ok()?);
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    /// Number of cached bundles.
    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.bundles.read().is_empty()
    }
}

struct FetchedFiles {
    entries: FxHashMap<RangeKey, Blob>,
    order: VecDeque<RangeKey>,
}

/// Bounded cache of individually fetched byte ranges.
///
/// Eviction is by insertion order and happens before the insert once the
/// cache is full, so `len() <= capacity()` always holds.
pub struct FetchedFileCache {
    capacity: usize,
    inner: Mutex<FetchedFiles>,
}

impl FetchedFileCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(FetchedFiles {
                entries: FxHashMap::default(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a range.
    pub fn get(&self, key: &RangeKey) -> Option<Blob> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Insert a range.
    ///
    /// Replacing an existing key keeps its position and evicts nothing.
    /// Returns the evicted key, if any.
    pub fn insert(&self, key: RangeKey, bytes: Blob) -> Option<RangeKey> {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.entries.get_mut(&key) {
            *slot = bytes;
            return None;
        }

        let evicted = if inner.entries.len() >= self.capacity {
            let oldest = inner.order.pop_front();
            if let Some(oldest) = &oldest {
                inner.entries.remove(oldest);
            }
            oldest
        } else {
            None
        };

        inner.order.push_back(key.clone());
        inner.entries.insert(key, bytes);
        evicted
    }
}

impl Default for FetchedFileCache {
    fn default() -> Self {
        Self::new(DEFAULT_FETCHED_FILE_CAPACITY)
    }
}

impl std::fmt::Debug for FetchedFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedFileCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Caches handed to every session, VFS and driver in one process.
#[derive(Debug, Clone)]
pub struct SharedCaches {
    /// Whole bundles.
    pub bundles: Arc<BundleCache>,
    /// Individually fetched ranges.
    pub files: Arc<FetchedFileCache>,
}

impl SharedCaches {
    /// Create caches with the given fetched-file capacity.
    pub fn new(fetched_file_capacity: usize) -> Self {
        Self {
            bundles: Arc::new(BundleCache::new()),
            files: Arc::new(FetchedFileCache::new(fetched_file_capacity)),
        }
    }
}

impl Default for SharedCaches {
    fn default() -> Self {
        Self::new(DEFAULT_FETCHED_FILE_CAPACITY)
    }
}
