//! Cache-supplemented store client.
//!
//! Wraps any [`ObjectStore`] so that every successful mutation is recorded
//! in the directory list cache before the call returns, and every listing is
//! unioned with fresh cached entries the store has not started reporting
//! yet. This masks read-your-writes violations of an eventually-consistent
//! listing API. Cache failures degrade to unsupplemented results; the cache
//! is an optimization, never a source of truth.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, Clock, DirectoryListCache, SystemClock};
use crate::info::{ItemInfo, UpdatableItemInfo};
use crate::resource_id::ResourceId;
use crate::storage::{
    BoxReadChannel, BoxWriteChannel, CreateObjectOptions, ObjectStore, StorageError, WriteChannel,
};

/// [`ObjectStore`] layer that records writes in, and supplements listings
/// from, a [`DirectoryListCache`].
pub struct CacheSupplementedStore {
    inner: Arc<dyn ObjectStore>,
    cache: Arc<dyn DirectoryListCache>,
    clock: Arc<dyn Clock>,
}

impl CacheSupplementedStore {
    pub fn new(inner: Arc<dyn ObjectStore>, cache: Arc<dyn DirectoryListCache>) -> Self {
        Self::with_clock(inner, cache, Arc::new(SystemClock))
    }

    pub fn with_clock(
        inner: Arc<dyn ObjectStore>,
        cache: Arc<dyn DirectoryListCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { inner, cache, clock }
    }

    fn record(&self, id: &ResourceId) {
        if let Err(err) = self.cache.put_resource(id) {
            warn!(%id, %err, "could not record write in list cache");
        }
    }

    fn record_removal(&self, id: &ResourceId) {
        if let Err(err) = self.cache.remove_resource(id) {
            warn!(%id, %err, "could not remove entry from list cache");
        }
    }

    /// Apply per-item cache updates for a batch result. On partial failure
    /// only the successful indices are reflected, so a retry re-does the
    /// remainder.
    fn record_batch(
        &self,
        ids: &[ResourceId],
        result: &Result<(), StorageError>,
        update: impl Fn(&Self, &ResourceId),
    ) {
        match result {
            Ok(()) => {
                for id in ids {
                    update(self, id);
                }
            }
            Err(StorageError::Partial { failed_indices, .. }) => {
                let failed: HashSet<usize> = failed_indices.iter().copied().collect();
                for (index, id) in ids.iter().enumerate() {
                    if !failed.contains(&index) {
                        update(self, id);
                    }
                }
            }
            Err(_) => {}
        }
    }

    /// Resolve a cached entry into a trustworthy info: fresh attached infos
    /// are used as-is, anything stale is refetched. Entries whose refetch
    /// reports not-found are dropped from the cache and from the result.
    async fn resolve_entry(&self, entry: &CacheEntry) -> Option<ItemInfo> {
        let now = self.clock.now_millis();
        if let Some(info) = entry.item_info()
            && !self.cache.config().info_stale(entry, now)
        {
            return Some(info.clone());
        }

        match self.inner.get_info(entry.id()).await {
            Ok(info) if info.exists() => {
                if let Err(err) = self.cache.put_resource_info(&info) {
                    warn!(id = %entry.id(), %err, "could not refresh cached info");
                }
                Some(info)
            }
            Ok(_) => {
                debug!(id = %entry.id(), "cached entry no longer exists, dropping");
                self.record_removal(entry.id());
                None
            }
            Err(err) => {
                warn!(id = %entry.id(), %err, "could not verify cached entry, skipping");
                None
            }
        }
    }

    /// Cached object entries of `bucket` that belong in a listing with the
    /// given prefix and delimiter but are missing from `seen`.
    fn supplemental_entries(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        seen: &HashSet<String>,
    ) -> Vec<CacheEntry> {
        let entries = match self.cache.object_list(bucket) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(bucket, %err, "list cache unavailable, returning raw listing");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .filter(|entry| {
                entry
                    .id()
                    .object_name()
                    .is_some_and(|name| {
                        !seen.contains(name) && name_matches_listing(name, prefix, delimiter)
                    })
            })
            .collect()
    }
}

/// True when `name` belongs in a listing for `prefix` at the depth the
/// delimiter implies. Directory-form children keep their single trailing
/// delimiter.
fn name_matches_listing(name: &str, prefix: &str, delimiter: Option<&str>) -> bool {
    let Some(relative) = name.strip_prefix(prefix) else {
        return false;
    };
    if relative.is_empty() {
        return false;
    }
    match delimiter {
        None => true,
        Some(delimiter) => match relative.find(delimiter) {
            None => true,
            Some(index) => index + delimiter.len() == relative.len(),
        },
    }
}

/// Write channel wrapper that records the object in the cache once the
/// commit succeeds.
struct CacheRecordingWriteChannel {
    inner: BoxWriteChannel,
    cache: Arc<dyn DirectoryListCache>,
    id: ResourceId,
    recorded: bool,
}

#[async_trait]
impl WriteChannel for CacheRecordingWriteChannel {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.inner.write(data).await
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.inner.close().await?;
        if !self.recorded {
            self.recorded = true;
            if let Err(err) = self.cache.put_resource(&self.id) {
                warn!(id = %self.id, %err, "could not record committed object in list cache");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for CacheSupplementedStore {
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StorageError> {
        self.inner.get_info(id).await
    }

    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StorageError> {
        self.inner.get_infos(ids).await
    }

    async fn list_bucket_names(&self) -> Result<Vec<String>, StorageError> {
        let mut names = self.inner.list_bucket_names().await?;
        let seen: HashSet<String> = names.iter().cloned().collect();
        let cached = self.cache.bucket_list().unwrap_or_else(|err| {
            warn!(%err, "list cache unavailable, returning raw bucket listing");
            Vec::new()
        });
        for entry in cached {
            if let Some(name) = entry.id().bucket_name()
                && !seen.contains(name)
                && self.resolve_entry(&entry).await.is_some()
            {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StorageError> {
        let mut infos = self.inner.list_bucket_infos().await?;
        let seen: HashSet<String> = infos
            .iter()
            .filter_map(|info| info.bucket_name().map(str::to_owned))
            .collect();
        let cached = self.cache.bucket_list().unwrap_or_else(|err| {
            warn!(%err, "list cache unavailable, returning raw bucket listing");
            Vec::new()
        });
        for entry in cached {
            if entry.id().bucket_name().is_some_and(|n| !seen.contains(n))
                && let Some(info) = self.resolve_entry(&entry).await
            {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StorageError> {
        let mut names = self
            .inner
            .list_object_names(bucket, prefix, delimiter, max_results)
            .await?;
        if max_results.is_some_and(|max| names.len() >= max) {
            return Ok(names);
        }
        let seen: HashSet<String> = names.iter().cloned().collect();
        for entry in self.supplemental_entries(bucket, prefix, delimiter, &seen) {
            if self.resolve_entry(&entry).await.is_some()
                && let Some(name) = entry.id().object_name()
            {
                names.push(name.to_owned());
                if max_results.is_some_and(|max| names.len() >= max) {
                    break;
                }
            }
        }
        Ok(names)
    }

    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ItemInfo>, StorageError> {
        let mut infos = self.inner.list_object_infos(bucket, prefix, delimiter).await?;
        let seen: HashSet<String> = infos
            .iter()
            .filter_map(|info| info.object_name().map(str::to_owned))
            .collect();
        for entry in self.supplemental_entries(bucket, prefix, delimiter, &seen) {
            if let Some(info) = self.resolve_entry(&entry).await {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StorageError> {
        self.inner.create_bucket(name).await?;
        self.record(&ResourceId::Bucket(name.to_owned()));
        Ok(())
    }

    async fn create_empty(
        &self,
        id: &ResourceId,
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError> {
        self.inner.create_empty(id, options).await?;
        self.record(id);
        Ok(())
    }

    async fn create_empty_many(
        &self,
        ids: &[ResourceId],
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError> {
        let result = self.inner.create_empty_many(ids, options).await;
        self.record_batch(ids, &result, Self::record);
        result
    }

    async fn create_writer(
        &self,
        id: &ResourceId,
        options: CreateObjectOptions,
    ) -> Result<BoxWriteChannel, StorageError> {
        let inner = self.inner.create_writer(id, options).await?;
        Ok(Box::new(CacheRecordingWriteChannel {
            inner,
            cache: Arc::clone(&self.cache),
            id: id.clone(),
            recorded: false,
        }))
    }

    async fn open_reader(&self, id: &ResourceId) -> Result<BoxReadChannel, StorageError> {
        self.inner.open_reader(id).await
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StorageError> {
        let result = self
            .inner
            .copy(src_bucket, src_names, dst_bucket, dst_names)
            .await;
        let dst_ids: Vec<ResourceId> = dst_names
            .iter()
            .map(|name| ResourceId::Object {
                bucket: dst_bucket.to_owned(),
                object: name.clone(),
            })
            .collect();
        self.record_batch(&dst_ids, &result, Self::record);
        result
    }

    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StorageError> {
        let result = self.inner.delete_objects(ids).await;
        self.record_batch(ids, &result, Self::record_removal);
        result
    }

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StorageError> {
        let ids: Vec<ResourceId> = names
            .iter()
            .map(|name| ResourceId::Bucket(name.clone()))
            .collect();
        let result = self.inner.delete_buckets(names).await;
        self.record_batch(&ids, &result, Self::record_removal);
        result
    }

    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StorageError> {
        self.inner.wait_for_bucket_empty(name).await
    }

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.inner
            .compose(bucket, sources, destination, content_type)
            .await?;
        self.record(&ResourceId::Object {
            bucket: bucket.to_owned(),
            object: destination.to_owned(),
        });
        Ok(())
    }

    async fn update_items(&self, updates: &[UpdatableItemInfo]) -> Result<(), StorageError> {
        let result = self.inner.update_items(updates).await;
        let ids: Vec<ResourceId> = updates.iter().map(|u| u.id.clone()).collect();
        self.record_batch(&ids, &result, Self::record);
        result
    }
}
