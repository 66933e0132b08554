//! Directory list cache.
//!
//! Listings from the store are eventually consistent: an object written a
//! moment ago may be missing from the next listing. The cache remembers
//! locally-witnessed writes so the supplemented client can union them back
//! into listings. Two backends share one contract: a process-local map and a
//! shared-filesystem mirror for cross-process agreement.

pub mod fs_backed;
pub mod in_memory;
pub mod supplemented;

use std::time::{SystemTime, UNIX_EPOCH};

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::info::ItemInfo;
use crate::resource_id::ResourceId;

/// Millisecond clock, injectable so entry ages are testable.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64)
    }
}

/// Failures raised by cache backends. The in-memory backend never fails;
/// the filesystem-backed one surfaces mirror IO problems.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache mirror io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource name '{0}' cannot be mirrored on the local filesystem")]
    UnmirrorableName(String),
}

/// Entry-lifetime tuning.
///
/// Entry TTL controls when a row is dropped outright; info TTL controls when
/// an attached snapshot is too stale to trust for negative-existence
/// decisions and must be refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub max_entry_age_ms: i64,
    pub max_info_age_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entry_age_ms: 4 * 60 * 60 * 1000,
            max_info_age_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn entry_expired(&self, entry: &CacheEntry, now_millis: i64) -> bool {
        now_millis - entry.creation_time_millis() > self.max_entry_age_ms
    }

    pub fn info_stale(&self, entry: &CacheEntry, now_millis: i64) -> bool {
        entry.item_info().is_none()
            || now_millis - entry.info_update_time_millis() > self.max_info_age_ms
    }
}

/// One cached resource. An entry without an [`ItemInfo`] means "known to
/// exist at some point" with details not yet fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    id: ResourceId,
    item_info: Option<ItemInfo>,
    creation_time_millis: i64,
    info_update_time_millis: i64,
}

impl CacheEntry {
    pub fn new(id: ResourceId, now_millis: i64) -> Self {
        Self {
            id,
            item_info: None,
            creation_time_millis: now_millis,
            info_update_time_millis: 0,
        }
    }

    pub fn with_info(info: ItemInfo, now_millis: i64) -> Self {
        Self {
            id: info.id().clone(),
            item_info: Some(info),
            creation_time_millis: now_millis,
            info_update_time_millis: now_millis,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn item_info(&self) -> Option<&ItemInfo> {
        self.item_info.as_ref()
    }

    pub fn creation_time_millis(&self) -> i64 {
        self.creation_time_millis
    }

    pub fn info_update_time_millis(&self) -> i64 {
        self.info_update_time_millis
    }

    pub fn set_item_info(&mut self, info: ItemInfo, now_millis: i64) {
        debug_assert_eq!(
            info.id(),
            &self.id,
            "info id must match the entry it is attached to"
        );
        self.item_info = Some(info);
        self.info_update_time_millis = now_millis;
    }
}

/// A bucket's own entry plus an insertion-ordered map of its object entries.
#[derive(Debug)]
pub struct CachedBucket {
    name: String,
    entry: CacheEntry,
    objects: LinkedHashMap<String, CacheEntry>,
}

impl CachedBucket {
    pub fn new(name: &str, now_millis: i64) -> Self {
        assert!(!name.is_empty(), "cached bucket requires a non-empty name");
        Self {
            name: name.to_owned(),
            entry: CacheEntry::new(ResourceId::Bucket(name.to_owned()), now_millis),
            objects: LinkedHashMap::new(),
        }
    }

    pub fn from_info(info: ItemInfo, now_millis: i64) -> Self {
        assert!(
            info.is_bucket() && info.exists(),
            "cached bucket requires an existing bucket info, got '{}'",
            info.id()
        );
        let name = info.bucket_name().unwrap_or_default().to_owned();
        Self {
            name,
            entry: CacheEntry::with_info(info, now_millis),
            objects: LinkedHashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn set_item_info(&mut self, info: ItemInfo, now_millis: i64) {
        self.entry.set_item_info(info, now_millis);
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    /// Validate that `id` names an object inside this bucket; panics
    /// otherwise, since handing a foreign id to a bucket is a programming
    /// error.
    fn object_name_of<'a>(&self, id: &'a ResourceId) -> &'a str {
        let ResourceId::Object { bucket, object } = id else {
            panic!("cached bucket '{}' takes only object ids, got '{id}'", self.name);
        };
        assert!(
            bucket == &self.name,
            "resource '{id}' does not belong to cached bucket '{}'",
            self.name
        );
        object
    }

    pub fn get(&self, id: &ResourceId) -> Option<&CacheEntry> {
        let name = self.object_name_of(id);
        self.objects.get(name)
    }

    /// Insert an entry for `id` if absent; an existing entry is returned
    /// untouched, keeping whatever info it already holds.
    pub fn put(&mut self, id: &ResourceId, now_millis: i64) -> &mut CacheEntry {
        let name = self.object_name_of(id).to_owned();
        self.objects
            .entry(name)
            .or_insert_with(|| CacheEntry::new(id.clone(), now_millis))
    }

    pub fn remove(&mut self, id: &ResourceId) {
        let name = self.object_name_of(id);
        self.objects.remove(name);
    }

    /// Object entries in insertion order.
    pub fn object_list(&self) -> Vec<CacheEntry> {
        self.objects.values().cloned().collect()
    }

    /// Drop object entries older than the config allows. Returns how many
    /// were removed.
    pub fn evict_expired_objects(&mut self, config: &CacheConfig, now_millis: i64) -> usize {
        let before = self.objects.len();
        self.objects
            .retain(|_, entry| !config.entry_expired(entry, now_millis));
        before - self.objects.len()
    }
}

/// The backend contract: existence bookkeeping keyed by resource id.
pub trait DirectoryListCache: Send + Sync {
    /// Record that `id` exists, without details.
    fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError>;

    /// Record that `id` exists with a fresh snapshot.
    fn put_resource_info(&self, info: &ItemInfo) -> Result<(), CacheError>;

    /// Fetch the entry for `id`; hard-expired entries are dropped and read
    /// as absent.
    fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError>;

    fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError>;

    /// All unexpired bucket entries.
    fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError>;

    /// All unexpired object entries of one bucket.
    fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError>;

    /// Garbage-collect expired entries in one pass. An expired bucket goes
    /// together with all its object entries.
    fn sweep(&self) -> Result<(), CacheError>;

    fn config(&self) -> &CacheConfig;
}
