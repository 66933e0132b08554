//! The typed store client over a wire transport.
//!
//! Wraps every RPC in backoff, attaches write preconditions, fans batches
//! out with bounded concurrency, and reconciles the idempotent cases
//! (rate-limited placeholder creation, deletes of already-gone objects).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, trace};

use crate::info::{ItemInfo, UpdatableItemInfo};
use crate::resource_id::ResourceId;
use crate::storage::reader::{ObjectReader, ReaderOptions};
use crate::storage::retry::{self, RetryOptions};
use crate::storage::transport::{
    BucketResource, ObjectResource, Precondition, StoreTransport, TransportError,
};
use crate::storage::writer::{ObjectWriter, WriterOptions};
use crate::storage::{
    BoxReadChannel, BoxWriteChannel, CreateObjectOptions, ObjectStore, StorageError,
};

/// Tuning for the typed client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub retry: RetryOptions,
    pub reader: ReaderOptions,
    pub writer: WriterOptions,
    /// Synthesize directory infos for listing prefixes that have no
    /// placeholder object.
    pub infer_implicit_directories: bool,
    /// Concurrent RPCs per batched operation.
    pub batch_concurrency: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            reader: ReaderOptions::default(),
            writer: WriterOptions::default(),
            infer_implicit_directories: true,
            batch_concurrency: 16,
        }
    }
}

const BUCKET_EMPTY_MAX_POLLS: u32 = 20;
const BUCKET_EMPTY_POLL_DELAY: Duration = Duration::from_millis(500);

/// [`ObjectStore`] implementation over a [`StoreTransport`].
pub struct GcsClient<T: StoreTransport> {
    transport: Arc<T>,
    options: ClientOptions,
}

impl<T: StoreTransport> GcsClient<T> {
    pub fn new(transport: T, options: ClientOptions) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
        }
    }

    fn bucket_info(resource: BucketResource) -> ItemInfo {
        ItemInfo::bucket(
            &resource.name,
            resource.creation_time_millis,
            resource.location,
            resource.storage_class,
        )
    }

    fn object_info(resource: ObjectResource) -> ItemInfo {
        ItemInfo::object(
            ResourceId::Object {
                bucket: resource.bucket,
                object: resource.name,
            },
            resource.creation_time_millis,
            resource.size,
            resource.content_type,
            resource.metadata,
            resource.generation,
            resource.meta_generation,
        )
    }

    async fn get_info_inner(&self, id: &ResourceId) -> Result<ItemInfo, StorageError> {
        match id {
            ResourceId::Root => Ok(ItemInfo::root()),
            ResourceId::Bucket(name) => {
                let found = retry::with_backoff(&self.options.retry, "get_bucket", || {
                    self.transport.get_bucket(name)
                })
                .await
                .map_err(|e| StorageError::from_transport(id, e))?;
                Ok(found.map_or_else(|| ItemInfo::not_found(id.clone()), Self::bucket_info))
            }
            ResourceId::Object { bucket, object } => {
                let found = retry::with_backoff(&self.options.retry, "get_object", || {
                    self.transport.get_object(bucket, object)
                })
                .await
                .map_err(|e| StorageError::from_transport(id, e))?;
                Ok(found.map_or_else(|| ItemInfo::not_found(id.clone()), Self::object_info))
            }
        }
    }

    async fn raw_listing(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<crate::storage::transport::ObjectListing, StorageError> {
        retry::with_backoff(&self.options.retry, "list_objects", || {
            self.transport.list_objects(bucket, prefix, delimiter, max_results)
        })
        .await
        .map_err(|e| {
            StorageError::from_transport(&ResourceId::Bucket(bucket.to_owned()), e)
        })
    }

    /// Create one zero-byte object, reconciling races: a rate-limited or
    /// guard-failed attempt succeeds silently when the live object already
    /// is the intended zero-byte placeholder.
    async fn create_empty_inner(
        &self,
        id: &ResourceId,
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError> {
        let (bucket, object) = object_parts(id)?;
        let result = retry::with_backoff(&self.options.retry, "insert_object", || {
            self.transport.insert_object(
                bucket,
                object,
                Bytes::new(),
                options.content_type.as_deref(),
                &options.attributes,
                Precondition::if_not_exists(),
                true,
            )
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_rate_limited() || err.is_precondition_failure() => {
                let existing = self.get_info_inner(id).await?;
                if existing.exists()
                    && existing.size() == 0
                    && attributes_subsumed(&options.attributes, existing.metadata())
                {
                    debug!(%id, "empty object already in place, reconciled");
                    Ok(())
                } else {
                    Err(StorageError::from_transport(id, err))
                }
            }
            Err(err) => Err(StorageError::from_transport(id, err)),
        }
    }

    /// Run `jobs` with bounded concurrency, preserving order, and fold any
    /// failures into a single [`StorageError::Partial`].
    async fn run_batch<F>(&self, jobs: Vec<F>) -> Result<(), StorageError>
    where
        F: std::future::Future<Output = Result<(), StorageError>>,
    {
        let total = jobs.len();
        let results: Vec<Result<(), StorageError>> = stream::iter(jobs)
            .buffered(self.options.batch_concurrency)
            .collect()
            .await;

        let failed_indices: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_err().then_some(i))
            .collect();
        if failed_indices.is_empty() {
            return Ok(());
        }

        let first = results
            .into_iter()
            .find_map(Result::err)
            .unwrap_or(StorageError::Transient(TransportError::Timeout));
        Err(StorageError::Partial {
            failed: failed_indices.len(),
            total,
            failed_indices,
            first: Box::new(first),
        })
    }

    /// Delete one object guarded by the generation from a fresh info.
    /// Already-gone objects count as deleted.
    async fn delete_object_inner(&self, id: &ResourceId) -> Result<(), StorageError> {
        let (bucket, object) = object_parts(id)?;
        let info = self.get_info_inner(id).await?;
        if !info.exists() {
            trace!(%id, "object already absent, delete is a no-op");
            return Ok(());
        }
        let precondition = Precondition::generation_match(info.generation());
        let result = retry::with_backoff(&self.options.retry, "delete_object", || {
            self.transport.delete_object(bucket, object, precondition)
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(StorageError::from_transport(id, err)),
        }
    }

    async fn update_item_inner(&self, update: &UpdatableItemInfo) -> Result<(), StorageError> {
        let (bucket, object) = object_parts(&update.id)?;
        let info = self.get_info_inner(&update.id).await?;
        if !info.exists() {
            return Err(StorageError::NotFound(update.id.clone()));
        }
        let precondition = Precondition::meta_generation_match(info.meta_generation());
        retry::with_backoff(&self.options.retry, "patch_object_metadata", || {
            self.transport
                .patch_object_metadata(bucket, object, &update.attributes, precondition)
        })
        .await
        .map_err(|e| StorageError::from_transport(&update.id, e))?;
        Ok(())
    }
}

#[async_trait]
impl<T: StoreTransport> ObjectStore for GcsClient<T> {
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StorageError> {
        self.get_info_inner(id).await
    }

    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StorageError> {
        let results: Vec<Result<ItemInfo, StorageError>> = stream::iter(ids.iter().cloned())
            .map(|id| async move { self.get_info_inner(&id).await })
            .buffered(self.options.batch_concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn list_bucket_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.list_bucket_infos().await?.into_iter()
            .filter_map(|info| info.bucket_name().map(str::to_owned))
            .collect())
    }

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StorageError> {
        let buckets = retry::with_backoff(&self.options.retry, "list_buckets", || {
            self.transport.list_buckets()
        })
        .await
        .map_err(|e| StorageError::from_transport(&ResourceId::Root, e))?;
        Ok(buckets.into_iter().map(Self::bucket_info).collect())
    }

    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StorageError> {
        let listing = self.raw_listing(bucket, prefix, delimiter, max_results).await?;
        let mut names: Vec<String> = listing
            .objects
            .into_iter()
            .map(|o| o.name)
            .filter(|name| name != prefix)
            .collect();
        names.extend(listing.prefixes);
        if let Some(max) = max_results {
            names.truncate(max);
        }
        Ok(names)
    }

    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ItemInfo>, StorageError> {
        let listing = self.raw_listing(bucket, prefix, delimiter, None).await?;

        let listed_names: HashSet<String> =
            listing.objects.iter().map(|o| o.name.clone()).collect();
        let mut infos: Vec<ItemInfo> = listing
            .objects
            .into_iter()
            .filter(|o| o.name != prefix)
            .map(Self::object_info)
            .collect();

        // Directory prefixes come back as bare names. Resolve each against
        // its placeholder object; a missing placeholder becomes an inferred
        // directory when inference is on and is dropped otherwise.
        let unresolved: Vec<ResourceId> = listing
            .prefixes
            .into_iter()
            .filter(|p| !listed_names.contains(p))
            .map(|p| ResourceId::Object {
                bucket: bucket.to_owned(),
                object: p,
            })
            .collect();
        if !unresolved.is_empty() {
            let resolved = self.get_infos(&unresolved).await?;
            for info in resolved {
                if info.exists() {
                    infos.push(info);
                } else if self.options.infer_implicit_directories {
                    infos.push(ItemInfo::inferred_directory(info.id().clone()));
                }
            }
        }
        Ok(infos)
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StorageError> {
        retry::with_backoff(&self.options.retry, "insert_bucket", || {
            self.transport.insert_bucket(name)
        })
        .await
        .map_err(|e| StorageError::from_transport(&ResourceId::Bucket(name.to_owned()), e))
    }

    async fn create_empty(
        &self,
        id: &ResourceId,
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError> {
        self.create_empty_inner(id, options).await
    }

    async fn create_empty_many(
        &self,
        ids: &[ResourceId],
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError> {
        let jobs: Vec<_> = ids
            .iter()
            .map(|id| self.create_empty_inner(id, options))
            .collect();
        self.run_batch(jobs).await
    }

    async fn create_writer(
        &self,
        id: &ResourceId,
        options: CreateObjectOptions,
    ) -> Result<BoxWriteChannel, StorageError> {
        let _ = object_parts(id)?;
        Ok(Box::new(ObjectWriter::new(
            Arc::clone(&self.transport),
            id.clone(),
            options,
            self.options.writer.clone(),
            self.options.retry.clone(),
        )))
    }

    async fn open_reader(&self, id: &ResourceId) -> Result<BoxReadChannel, StorageError> {
        let (bucket, object) = object_parts(id)?;
        let found = retry::with_backoff(&self.options.retry, "get_object", || {
            self.transport.get_object(bucket, object)
        })
        .await
        .map_err(|e| StorageError::from_transport(id, e))?;
        let Some(resource) = found else {
            return Err(StorageError::NotFound(id.clone()));
        };
        let gzip_encoded = resource
            .content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"));
        Ok(Box::new(ObjectReader::new(
            Arc::clone(&self.transport),
            id.clone(),
            resource.size,
            gzip_encoded,
            self.options.retry.clone(),
            self.options.reader.clone(),
        )))
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StorageError> {
        debug_assert_eq!(
            src_names.len(),
            dst_names.len(),
            "copy is positional: source and destination counts must match"
        );
        let jobs: Vec<_> = src_names
            .iter()
            .zip(dst_names)
            .map(|(src, dst)| async move {
                let dst_id = ResourceId::Object {
                    bucket: dst_bucket.to_owned(),
                    object: dst.clone(),
                };
                retry::with_backoff(&self.options.retry, "copy_object", || {
                    self.transport.copy_object(
                        src_bucket,
                        src,
                        dst_bucket,
                        dst,
                        Precondition::if_not_exists(),
                    )
                })
                .await
                .map(|_| ())
                .map_err(|e| StorageError::from_transport(&dst_id, e))
            })
            .collect();
        self.run_batch(jobs).await
    }

    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StorageError> {
        let jobs: Vec<_> = ids.iter().map(|id| self.delete_object_inner(id)).collect();
        self.run_batch(jobs).await
    }

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StorageError> {
        let jobs: Vec<_> = names
            .iter()
            .map(|name| async move {
                let result = retry::with_backoff(&self.options.retry, "delete_bucket", || {
                    self.transport.delete_bucket(name)
                })
                .await;
                match result {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(StorageError::from_transport(
                        &ResourceId::Bucket(name.clone()),
                        err,
                    )),
                }
            })
            .collect();
        self.run_batch(jobs).await
    }

    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StorageError> {
        for poll in 0..BUCKET_EMPTY_MAX_POLLS {
            let listing = self.raw_listing(name, "", None, Some(1)).await?;
            if listing.objects.is_empty() && listing.prefixes.is_empty() {
                return Ok(());
            }
            trace!(bucket = name, poll, "bucket still lists objects, waiting");
            tokio::time::sleep(BUCKET_EMPTY_POLL_DELAY).await;
        }
        Err(StorageError::Transient(TransportError::Timeout))
    }

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let dst_id = ResourceId::Object {
            bucket: bucket.to_owned(),
            object: destination.to_owned(),
        };
        retry::with_backoff(&self.options.retry, "compose_object", || {
            self.transport
                .compose_object(bucket, sources, destination, content_type)
        })
        .await
        .map(|_| ())
        .map_err(|e| StorageError::from_transport(&dst_id, e))
    }

    async fn update_items(&self, updates: &[UpdatableItemInfo]) -> Result<(), StorageError> {
        let jobs: Vec<_> = updates
            .iter()
            .map(|update| self.update_item_inner(update))
            .collect();
        self.run_batch(jobs).await
    }
}

fn object_parts(id: &ResourceId) -> Result<(&str, &str), StorageError> {
    match id {
        ResourceId::Object { bucket, object } => Ok((bucket, object)),
        other => Err(StorageError::Fatal(TransportError::Malformed(format!(
            "operation requires an object id, got '{other}'"
        )))),
    }
}

/// True when every intended attribute is present with the same value.
fn attributes_subsumed(
    intended: &HashMap<String, Vec<u8>>,
    existing: &HashMap<String, Vec<u8>>,
) -> bool {
    intended
        .iter()
        .all(|(key, value)| existing.get(key) == Some(value))
}
