//! Process-local cache backend: one mutex around a map of cached buckets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::cache::{
    CacheConfig, CacheEntry, CachedBucket, CacheError, Clock, DirectoryListCache, SystemClock,
};
use crate::resource_id::ResourceId;

/// In-memory [`DirectoryListCache`].
pub struct InMemoryDirectoryListCache {
    buckets: Mutex<HashMap<String, CachedBucket>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl InMemoryDirectoryListCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedBucket>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bucket row for `id`'s bucket, created on demand.
    fn bucket_entry<'a>(
        buckets: &'a mut HashMap<String, CachedBucket>,
        name: &str,
        now_millis: i64,
    ) -> &'a mut CachedBucket {
        buckets
            .entry(name.to_owned())
            .or_insert_with(|| CachedBucket::new(name, now_millis))
    }
}

impl DirectoryListCache for InMemoryDirectoryListCache {
    fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        match id {
            ResourceId::Root => {}
            ResourceId::Bucket(name) => {
                Self::bucket_entry(&mut buckets, name, now);
            }
            ResourceId::Object { bucket, .. } => {
                Self::bucket_entry(&mut buckets, bucket, now).put(id, now);
            }
        }
        Ok(())
    }

    fn put_resource_info(&self, info: &crate::info::ItemInfo) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        match info.id() {
            ResourceId::Root => {}
            ResourceId::Bucket(name) => {
                Self::bucket_entry(&mut buckets, name, now).set_item_info(info.clone(), now);
            }
            id @ ResourceId::Object { bucket, .. } => {
                Self::bucket_entry(&mut buckets, bucket, now)
                    .put(id, now)
                    .set_item_info(info.clone(), now);
            }
        }
        Ok(())
    }

    fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        let entry = match id {
            ResourceId::Root => None,
            ResourceId::Bucket(name) => match buckets.get(name) {
                Some(bucket) if self.config.entry_expired(bucket.entry(), now) => {
                    trace!(%id, "bucket entry hard-expired on lookup");
                    // Fresh object entries keep the row alive for listings;
                    // only an empty expired bucket is dropped here.
                    if bucket.num_objects() == 0 {
                        buckets.remove(name);
                    }
                    None
                }
                Some(bucket) => Some(bucket.entry().clone()),
                None => None,
            },
            ResourceId::Object { bucket, .. } => match buckets.get_mut(bucket) {
                Some(cached) => match cached.get(id) {
                    Some(entry) if self.config.entry_expired(entry, now) => {
                        trace!(%id, "object entry hard-expired on lookup");
                        cached.remove(id);
                        None
                    }
                    Some(entry) => Some(entry.clone()),
                    None => None,
                },
                None => None,
            },
        };
        Ok(entry)
    }

    fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let mut buckets = self.lock();
        match id {
            ResourceId::Root => {}
            ResourceId::Bucket(name) => {
                buckets.remove(name);
            }
            ResourceId::Object { bucket, .. } => {
                if let Some(cached) = buckets.get_mut(bucket) {
                    cached.remove(id);
                }
            }
        }
        Ok(())
    }

    fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let now = self.clock.now_millis();
        let buckets = self.lock();
        Ok(buckets
            .values()
            .map(CachedBucket::entry)
            .filter(|entry| !self.config.entry_expired(entry, now))
            .cloned()
            .collect())
    }

    fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let now = self.clock.now_millis();
        let buckets = self.lock();
        Ok(buckets.get(bucket).map_or_else(Vec::new, |cached| {
            cached
                .object_list()
                .into_iter()
                .filter(|entry| !self.config.entry_expired(entry, now))
                .collect()
        }))
    }

    fn sweep(&self) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        let before = buckets.len();
        let mut evicted = 0;
        for cached in buckets.values_mut() {
            evicted += cached.evict_expired_objects(&self.config, now);
        }
        // An expired bucket goes together with its (already expired) object
        // entries; a row still holding fresh entries stays.
        buckets.retain(|_, cached| {
            cached.num_objects() > 0 || !self.config.entry_expired(cached.entry(), now)
        });
        trace!(
            buckets_evicted = before - buckets.len(),
            objects_evicted = evicted,
            "cache sweep complete"
        );
        Ok(())
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }
}
