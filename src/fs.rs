//! The POSIX-like file-system facade.
//!
//! All path semantics are enforced here; the store layers below deal
//! strictly in buckets and objects. Multi-object operations (mkdirs, rename,
//! recursive delete) are non-atomic sequences ordered so that partial
//! failure and retry degrade predictably: ancestors before descendants on
//! the way down, descendants before ancestors on the way up.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::cache::fs_backed::FileSystemBackedDirectoryListCache;
use crate::cache::in_memory::InMemoryDirectoryListCache;
use crate::cache::supplemented::CacheSupplementedStore;
use crate::cache::{Clock, DirectoryListCache, SystemClock};
use crate::error::GcsFsError;
use crate::info::{FileInfo, ItemInfo};
use crate::options::{CacheType, GcsFsOptions};
use crate::paths::{self, PATH_DELIMITER};
use crate::resource_id::ResourceId;
use crate::storage::client::{ClientOptions, GcsClient};
use crate::storage::reader::ReaderOptions;
use crate::storage::transport::StoreTransport;
use crate::storage::writer::WriterOptions;
use crate::storage::{
    BoxReadChannel, BoxWriteChannel, CreateObjectOptions, ObjectStore, StorageError,
};
use crate::timestamps::TimestampUpdater;

/// Options accepted by [`GcsFileSystem::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateFileOptions {
    /// When false the commit carries an if-not-exists guard and a concurrent
    /// identical create loses with a precondition failure.
    pub overwrite_existing: bool,
    pub content_type: Option<String>,
    pub attributes: HashMap<String, Vec<u8>>,
}

impl Default for CreateFileOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: true,
            content_type: None,
            attributes: HashMap::new(),
        }
    }
}

fn object_options_from_file_options(options: &CreateFileOptions) -> CreateObjectOptions {
    CreateObjectOptions {
        overwrite_existing: options.overwrite_existing,
        content_type: options.content_type.clone(),
        attributes: options.attributes.clone(),
    }
}

/// POSIX-like file system over a flat object store.
///
/// Thread-safe: operations are `&self` and may run concurrently; the only
/// shared mutable state is the directory list cache behind its own lock and
/// the timestamp queue.
pub struct GcsFileSystem {
    store: Arc<dyn ObjectStore>,
    options: GcsFsOptions,
    timestamps: Option<TimestampUpdater>,
}

impl GcsFileSystem {
    /// Build the full stack over a wire transport: typed client, optional
    /// cache supplementation, timestamp updater.
    pub fn new<T: StoreTransport>(
        transport: T,
        options: GcsFsOptions,
    ) -> Result<Self, GcsFsError> {
        let client_options = ClientOptions {
            retry: options.retry.clone(),
            reader: ReaderOptions::default(),
            writer: WriterOptions {
                chunk_size: options.effective_write_chunk_size(),
                direct_upload: false,
            },
            infer_implicit_directories: options.infer_implicit_directories,
            ..ClientOptions::default()
        };
        let store: Arc<dyn ObjectStore> = Arc::new(GcsClient::new(transport, client_options));
        Self::with_store(store, options)
    }

    /// Layer the facade over an already-configured store.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        options: GcsFsOptions,
    ) -> Result<Self, GcsFsError> {
        Self::with_store_and_clock(store, options, Arc::new(SystemClock))
    }

    /// As [`with_store`](Self::with_store) with an injected clock, so entry
    /// ages and timestamps are controllable.
    pub fn with_store_and_clock(
        store: Arc<dyn ObjectStore>,
        options: GcsFsOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GcsFsError> {
        options
            .validate()
            .map_err(GcsFsError::InvalidConfiguration)?;

        let store = if options.metadata_cache.enabled {
            let config = options.metadata_cache.config;
            let cache: Arc<dyn DirectoryListCache> = match options.metadata_cache.cache_type {
                CacheType::InMemory => {
                    Arc::new(InMemoryDirectoryListCache::with_clock(config, Arc::clone(&clock)))
                }
                CacheType::FilesystemBacked => {
                    let base_path = options
                        .metadata_cache
                        .base_path
                        .clone()
                        .unwrap_or_default();
                    Arc::new(FileSystemBackedDirectoryListCache::with_clock(
                        base_path,
                        config,
                        Arc::clone(&clock),
                    ))
                }
            };
            Arc::new(CacheSupplementedStore::with_clock(
                store,
                cache,
                Arc::clone(&clock),
            )) as Arc<dyn ObjectStore>
        } else {
            store
        };

        let timestamps = options.timestamp_updates.enabled.then(|| {
            TimestampUpdater::new(
                Arc::clone(&store),
                options.timestamp_updates.clone(),
                Arc::clone(&clock),
            )
        });

        Ok(Self {
            store,
            options,
            timestamps,
        })
    }

    pub fn options(&self) -> &GcsFsOptions {
        &self.options
    }

    /// Advisory permission bits reported for every item.
    pub fn reported_permissions(&self) -> u32 {
        self.options.reported_permissions
    }

    /// Drain background work. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut timestamps) = self.timestamps.take() {
            timestamps.shutdown().await;
        }
    }

    // ── Create / open ───────────────────────────────────────────────────

    /// Create and open an object for writing.
    #[instrument(skip(self, options))]
    pub async fn create(
        &self,
        path: &str,
        options: CreateFileOptions,
    ) -> Result<BoxWriteChannel, GcsFsError> {
        let id = ResourceId::parse(path, false)?;
        if paths::is_directory_path(&id) {
            return Err(GcsFsError::InvalidArgument(format!(
                "cannot create a file whose name looks like a directory: {path}"
            )));
        }

        // A directory of the same name shadows the file namespace.
        let dir_id = paths::to_directory_path(&id);
        if self.get_file_info_for_id(&dir_id).await?.exists() {
            return Err(GcsFsError::AlreadyExists(format!(
                "a directory with that name exists: {path}"
            )));
        }

        self.mkdirs_id(&paths::parent(&id)).await?;

        let mut object_options = object_options_from_file_options(&options);
        if self.options.create_marker_files {
            // Fail fast on conflicts by committing a zero-byte marker under
            // the caller's guard, then let the real writer overwrite it.
            let mut marker = self.store.create_writer(&id, object_options.clone()).await?;
            marker.close().await.map_err(|err| match err {
                StorageError::PreconditionFailed { .. } => {
                    GcsFsError::AlreadyExists(format!("object already exists: {path}"))
                }
                other => GcsFsError::Storage(other),
            })?;
            object_options.overwrite_existing = true;
        }

        let channel = self.store.create_writer(&id, object_options).await?;
        self.try_update_timestamps(vec![id], Vec::new());
        Ok(channel)
    }

    /// Open an object for reading.
    #[instrument(skip(self))]
    pub async fn open(&self, path: &str) -> Result<BoxReadChannel, GcsFsError> {
        let id = ResourceId::parse(path, false)?;
        if paths::is_directory_path(&id) {
            return Err(GcsFsError::InvalidArgument(format!(
                "cannot open a directory for reading: {path}"
            )));
        }
        self.store.open_reader(&id).await.map_err(|err| match err {
            StorageError::NotFound(id) => GcsFsError::NotFound(id.to_string()),
            other => GcsFsError::Storage(other),
        })
    }

    // ── Existence and status ────────────────────────────────────────────

    /// Whether the given path resolves to an existing item.
    pub async fn exists(&self, path: &str) -> Result<bool, GcsFsError> {
        Ok(self.get_file_info(path).await?.exists())
    }

    /// Status of one path, trying the directory form and, when enabled,
    /// implicit-directory inference before reporting not-found.
    #[instrument(skip(self))]
    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, GcsFsError> {
        let id = ResourceId::parse(path, true)?;
        self.get_file_info_for_id(&id).await
    }

    async fn get_file_info_for_id(&self, id: &ResourceId) -> Result<FileInfo, GcsFsError> {
        let mut info = self.store.get_info(id).await?;

        if !info.exists() && !paths::is_directory_path(info.id()) {
            // The file form is absent; a directory of the same name may
            // exist.
            let dir_id = paths::to_directory_path(id);
            let dir_info = self.store.get_info(&dir_id).await?;
            if dir_info.exists() {
                info = dir_info;
            }
        }

        if !info.exists()
            && self.options.infer_implicit_directories
            && !info.is_root()
            && !info.is_bucket()
        {
            let inferred = self.get_inferred_item_info(info.id()).await?;
            if inferred.exists() {
                info = inferred;
            }
        }

        Ok(FileInfo::from_item_info(info))
    }

    /// Batched status lookup, preserving input order. Applies the same
    /// directory-form re-fetch and inference passes as
    /// [`get_file_info`](Self::get_file_info).
    #[instrument(skip(self, paths))]
    pub async fn get_file_infos(&self, paths: &[&str]) -> Result<Vec<FileInfo>, GcsFsError> {
        let ids = paths
            .iter()
            .map(|p| ResourceId::parse(p, true))
            .collect::<Result<Vec<_>, _>>()?;
        self.get_file_infos_for_ids(&ids).await
    }

    async fn get_file_infos_for_ids(
        &self,
        ids: &[ResourceId],
    ) -> Result<Vec<FileInfo>, GcsFsError> {
        let mut infos = self.store.get_infos(ids).await?;

        // Pass 2: absent file-form entries re-fetched in directory form.
        let mut converted: Vec<(usize, ResourceId)> = Vec::new();
        for (index, info) in infos.iter().enumerate() {
            if !info.exists() && !paths::is_directory_path(info.id()) {
                converted.push((index, paths::to_directory_path(info.id())));
            }
        }
        if !converted.is_empty() {
            let converted_ids: Vec<ResourceId> =
                converted.iter().map(|(_, id)| id.clone()).collect();
            let converted_infos = self.store.get_infos(&converted_ids).await?;
            for ((index, _), converted_info) in converted.iter().zip(converted_infos) {
                if converted_info.exists() {
                    infos[*index] = converted_info;
                }
            }
        }

        // Pass 3: whatever is still absent may be an implicit directory.
        if self.options.infer_implicit_directories {
            for index in 0..infos.len() {
                if infos[index].exists() {
                    continue;
                }
                let inferred = self.get_inferred_item_info(infos[index].id()).await?;
                if inferred.exists() {
                    infos[index] = inferred;
                }
            }
        }

        Ok(FileInfo::from_item_infos(infos))
    }

    /// Batched status lookup without directory-form conversion or inference:
    /// fetching `foo` reports absent even when `foo/` exists.
    async fn get_file_infos_raw(&self, ids: &[ResourceId]) -> Result<Vec<FileInfo>, GcsFsError> {
        Ok(FileInfo::from_item_infos(self.store.get_infos(ids).await?))
    }

    /// Infer a directory from its children: a depth-1 listing capped at one
    /// result decides existence. Buckets and the root are never inferred,
    /// and a missing bucket short-circuits without listing.
    async fn get_inferred_item_info(&self, id: &ResourceId) -> Result<ItemInfo, GcsFsError> {
        if id.is_root() || id.is_bucket() {
            return Ok(ItemInfo::not_found(id.clone()));
        }
        let Some(bucket) = id.bucket_name() else {
            return Ok(ItemInfo::not_found(id.clone()));
        };
        let bucket_id = ResourceId::Bucket(bucket.to_owned());
        if !self.store.get_info(&bucket_id).await?.exists() {
            return Ok(ItemInfo::not_found(id.clone()));
        }

        let dir_id = paths::to_directory_path(id);
        let prefix = dir_id.object_name().unwrap_or_default();
        let children = self
            .store
            .list_object_names(bucket, prefix, Some(PATH_DELIMITER), Some(1))
            .await?;
        if children.is_empty() {
            Ok(ItemInfo::not_found(id.clone()))
        } else {
            Ok(ItemInfo::inferred_directory(dir_id))
        }
    }

    // ── Listing ─────────────────────────────────────────────────────────

    /// Children of a directory (or the path itself for a file), names only.
    /// Recursive listings descend the whole subtree.
    #[instrument(skip(self, info))]
    pub async fn list_file_names(
        &self,
        info: &FileInfo,
        recursive: bool,
    ) -> Result<Vec<ResourceId>, GcsFsError> {
        if !info.is_directory() {
            return Ok(vec![info.id().clone()]);
        }
        if !info.exists() {
            return Ok(Vec::new());
        }

        if info.is_global_root() {
            let names = self.store.list_bucket_names().await?;
            return Ok(names.into_iter().map(ResourceId::Bucket).collect());
        }

        let bucket = info.id().bucket_name().unwrap_or_default().to_owned();
        let prefix = info.id().object_name().unwrap_or_default();
        // A delimiter caps the listing at depth 1; omitting it makes the
        // listing fully recursive.
        let delimiter = if recursive { None } else { Some(PATH_DELIMITER) };
        let names = self
            .store
            .list_object_names(&bucket, prefix, delimiter, None)
            .await?;
        Ok(names
            .into_iter()
            .map(|object| ResourceId::Object {
                bucket: bucket.clone(),
                object,
            })
            .collect())
    }

    /// Status of a directory's children, or of the path itself when it is a
    /// file. `auto_repair` materializes a placeholder for an implicit
    /// directory before listing it.
    #[instrument(skip(self))]
    pub async fn list_file_info(
        &self,
        path: &str,
        auto_repair: bool,
    ) -> Result<Vec<FileInfo>, GcsFsError> {
        let id = ResourceId::parse(path, true)?;
        let dir_id = paths::to_directory_path(&id);

        let base_and_dir = self.get_file_infos_raw(&[id.clone(), dir_id]).await?;
        let [base_info, mut dir_info] = <[FileInfo; 2]>::try_from(base_and_dir)
            .unwrap_or_else(|_| unreachable!("raw lookup is positional"));

        // An existing non-directory object answers the listing by itself.
        if base_info.exists() && !base_info.is_directory() {
            return Ok(vec![base_info]);
        }

        if !dir_info.exists() {
            if auto_repair {
                dir_info = self.repair_implicit_directory_info(dir_info).await?;
            } else if self.options.infer_implicit_directories {
                let inferred = self.get_inferred_item_info(dir_info.id()).await?;
                if inferred.exists() {
                    dir_info = FileInfo::from_item_info(inferred);
                }
            }
        }

        if !dir_info.exists() {
            return Err(GcsFsError::NotFound(path.to_owned()));
        }

        let mut infos = if dir_info.is_global_root() {
            FileInfo::from_item_infos(self.store.list_bucket_infos().await?)
        } else {
            let bucket = dir_info.id().bucket_name().unwrap_or_default();
            let prefix = dir_info.id().object_name().unwrap_or_default();
            FileInfo::from_item_infos(
                self.store
                    .list_object_infos(bucket, prefix, Some(PATH_DELIMITER))
                    .await?,
            )
        };
        sort_file_infos(&mut infos);
        Ok(infos)
    }

    /// Fully recursive status listing for a partial prefix. No repair and no
    /// inference: prefixes are not required to name an actual item.
    #[instrument(skip(self))]
    pub async fn list_all_file_info_for_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<FileInfo>, GcsFsError> {
        let id = ResourceId::parse(prefix, true)?;
        if id.is_root() {
            return Err(GcsFsError::InvalidArgument(
                "prefix listing requires a bucket, got the root".to_owned(),
            ));
        }
        let bucket = id.bucket_name().unwrap_or_default();
        let object_prefix = id.object_name().unwrap_or_default();
        let mut infos = FileInfo::from_item_infos(
            self.store.list_object_infos(bucket, object_prefix, None).await?,
        );
        sort_file_infos(&mut infos);
        Ok(infos)
    }

    // ── Directories ─────────────────────────────────────────────────────

    /// Create a directory and any missing ancestors, `mkdir -p` style.
    #[instrument(skip(self))]
    pub async fn mkdirs(&self, path: &str) -> Result<(), GcsFsError> {
        let id = ResourceId::parse(path, true)?;
        self.mkdirs_id(&id).await
    }

    async fn mkdirs_id(&self, id: &ResourceId) -> Result<(), GcsFsError> {
        if id.is_root() {
            // The root always exists.
            return Ok(());
        }
        let dir_id = paths::to_directory_path(id);

        // Every prefix of the target, in both directory and file form: the
        // file forms detect a file squatting on an intermediate name. A
        // bucket cannot exist as a file, so it has no file form.
        let mut lookups: Vec<ResourceId> = Vec::new();
        if let ResourceId::Object { bucket, object } = &dir_id {
            let mut prefixes = paths::sub_dirs(object);
            prefixes.push(object.clone());
            for prefix in prefixes {
                lookups.push(ResourceId::Object {
                    bucket: bucket.clone(),
                    object: prefix.trim_end_matches('/').to_owned(),
                });
                lookups.push(ResourceId::Object {
                    bucket: bucket.clone(),
                    object: prefix,
                });
            }
        }
        lookups.push(ResourceId::Bucket(
            dir_id.bucket_name().unwrap_or_default().to_owned(),
        ));

        let mut infos = self.get_file_infos_for_ids(&lookups).await?;

        // Bail before creating anything if a file occupies any prefix. The
        // check is best-effort: a racing writer can still invalidate it.
        for info in &infos {
            if info.exists() && !info.is_directory() {
                return Err(GcsFsError::InvalidArgument(format!(
                    "cannot create directories because of existing file: {}",
                    info.path()
                )));
            }
        }

        sort_file_infos(&mut infos);

        let mut dirs_to_create: Vec<ResourceId> = Vec::new();
        for info in &infos {
            if !info.is_directory() || info.exists() {
                continue;
            }
            match info.id() {
                ResourceId::Root => {
                    return Err(GcsFsError::InvalidArgument(
                        "cannot create the root directory".to_owned(),
                    ));
                }
                // Buckets are made immediately; object placeholders batch.
                ResourceId::Bucket(name) => self.store.create_bucket(name).await?,
                object_id => dirs_to_create.push(paths::to_directory_path(object_id)),
            }
        }

        match dirs_to_create.len() {
            0 => {}
            1 => {
                self.store
                    .create_empty(&dirs_to_create[0], &CreateObjectOptions::empty_object())
                    .await?;
            }
            _ => {
                self.store
                    .create_empty_many(&dirs_to_create, &CreateObjectOptions::empty_object())
                    .await?;
            }
        }

        // Freshly created directories are their own exclusion set: we made
        // them, no point stamping them again.
        self.try_update_timestamps(dirs_to_create.clone(), dirs_to_create);
        Ok(())
    }

    /// Create a single directory without touching ancestors.
    async fn mkdir(&self, id: &ResourceId) -> Result<(), GcsFsError> {
        match id {
            ResourceId::Root => Err(GcsFsError::InvalidArgument(
                "cannot create the root directory".to_owned(),
            )),
            ResourceId::Bucket(name) => {
                self.store.create_bucket(name).await?;
                Ok(())
            }
            object_id => {
                let dir_id = paths::to_directory_path(object_id);
                self.store
                    .create_empty(&dir_id, &CreateObjectOptions::empty_object())
                    .await?;
                self.try_update_timestamps(vec![dir_id], Vec::new());
                Ok(())
            }
        }
    }

    /// Materialize placeholders for the given directory paths, without
    /// parent checks or timestamp updates. Dropping markers for directories
    /// that already "existed" is repair, not creation.
    #[instrument(skip(self, exact_dir_paths))]
    pub async fn repair_dirs(&self, exact_dir_paths: &[&str]) -> Result<(), GcsFsError> {
        let mut dirs_to_create = Vec::new();
        for path in exact_dir_paths {
            let id = ResourceId::parse(path, true)?;
            if id.is_object() {
                dirs_to_create.push(paths::to_directory_path(&id));
            }
        }
        if dirs_to_create.is_empty() {
            return Ok(());
        }
        match dirs_to_create.len() {
            1 => {
                self.store
                    .create_empty(&dirs_to_create[0], &CreateObjectOptions::empty_object())
                    .await?;
            }
            _ => {
                self.store
                    .create_empty_many(&dirs_to_create, &CreateObjectOptions::empty_object())
                    .await?;
            }
        }
        warn!(count = dirs_to_create.len(), "repaired directories");
        Ok(())
    }

    /// Detect an implicit directory at `path` and materialize its
    /// placeholder. Returns whether the repair produced an existing entity.
    #[instrument(skip(self))]
    pub async fn repair_possible_implicit_directory(
        &self,
        path: &str,
    ) -> Result<bool, GcsFsError> {
        let info = self.get_file_info(path).await?;
        let info = self.repair_implicit_directory_info(info).await?;
        if info.exists() {
            debug!(path, "successfully repaired implicit directory");
            Ok(true)
        } else {
            debug!(path, "repair did not produce an existing directory");
            Ok(false)
        }
    }

    /// Repair helper: list one child under the directory form; any result
    /// proves an implicit directory, which is then materialized. Listing and
    /// materialization failures are logged, not thrown — the re-fetch
    /// decides the outcome.
    async fn repair_implicit_directory_info(
        &self,
        info: FileInfo,
    ) -> Result<FileInfo, GcsFsError> {
        if info.exists() {
            return Ok(info);
        }
        let id = info.id();
        if id.is_root()
            || id.is_bucket()
            || id.object_name().is_none_or(|n| n == PATH_DELIMITER)
        {
            // Implicit directories only apply to non-trivial object names.
            return Ok(info);
        }

        let dir_id = paths::to_directory_path(id);
        let bucket = dir_id.bucket_name().unwrap_or_default();
        let prefix = dir_id.object_name().unwrap_or_default();
        match self
            .store
            .list_object_names(bucket, prefix, Some(PATH_DELIMITER), Some(1))
            .await
        {
            Ok(children) if !children.is_empty() => {
                if let Err(err) = self
                    .store
                    .create_empty(&dir_id, &CreateObjectOptions::empty_object())
                    .await
                {
                    warn!(id = %dir_id, %err, "could not materialize implicit directory");
                }
            }
            Ok(_) => {}
            Err(err) => {
                // The listing was an optimization; the re-fetch below still
                // decides.
                warn!(id = %dir_id, %err, "implicit directory detection listing failed");
            }
        }

        let refreshed = self.store.get_info(&dir_id).await?;
        Ok(FileInfo::from_item_info(refreshed))
    }

    // ── Delete ──────────────────────────────────────────────────────────

    /// Delete a file, or a directory (recursively when asked).
    #[instrument(skip(self))]
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), GcsFsError> {
        let id = ResourceId::parse(path, true)?;
        if id.is_root() {
            return Err(GcsFsError::InvalidArgument(
                "cannot delete the root".to_owned(),
            ));
        }

        let info = self.get_file_info_for_id(&id).await?;
        if !info.exists() {
            return Err(GcsFsError::NotFound(path.to_owned()));
        }

        let mut items_to_delete: Vec<ResourceId> = Vec::new();
        let mut buckets_to_delete: Vec<String> = Vec::new();

        if info.is_directory() {
            let children = self.list_file_names(&info, recursive).await?;
            if recursive {
                items_to_delete.extend(children);
            } else if !children.is_empty() {
                return Err(GcsFsError::DirectoryNotEmpty(format!(
                    "cannot delete a non-empty directory: {path}"
                )));
            }
        }

        match info.id() {
            ResourceId::Bucket(name) => buckets_to_delete.push(name.clone()),
            other => items_to_delete.push(other.clone()),
        }

        self.delete_internal(items_to_delete, buckets_to_delete)
            .await
    }

    /// Delete the given objects, children before parents, then the buckets.
    async fn delete_internal(
        &self,
        mut items: Vec<ResourceId>,
        buckets: Vec<String>,
    ) -> Result<(), GcsFsError> {
        if !items.is_empty() {
            // Descending length order: descendants precede ancestors, so a
            // failure partway leaves no orphaned children under a deleted
            // parent.
            sort_ids(&mut items);
            items.reverse();
            self.store.delete_objects(&items).await?;
            // Update parents of everything deleted, except parents that are
            // themselves being deleted.
            self.try_update_timestamps(items.clone(), items);
        }

        if !buckets.is_empty() {
            for name in &buckets {
                self.store.wait_for_bucket_empty(name).await?;
            }
            self.store.delete_buckets(&buckets).await?;
        }
        Ok(())
    }

    // ── Rename ──────────────────────────────────────────────────────────

    /// Rename `src` to `dst`. Not atomic: directories move as an ordered
    /// sequence of copies followed by deletes of the sources.
    #[instrument(skip(self))]
    pub async fn rename(&self, src: &str, dst: &str) -> Result<(), GcsFsError> {
        let src_id = ResourceId::parse(src, true)?;
        let dst_id = ResourceId::parse(dst, true)?;
        if src_id.is_root() {
            return Err(GcsFsError::InvalidArgument(
                "the root cannot be renamed".to_owned(),
            ));
        }

        let src_leaf = paths::leaf_name(&src_id).unwrap_or_default();
        let dst_parent_id = paths::parent(&dst_id);

        let infos = self
            .get_file_infos_for_ids(&[src_id, dst_id, dst_parent_id])
            .await?;
        let [src_info, mut dst_info, dst_parent_info] = <[FileInfo; 3]>::try_from(infos)
            .unwrap_or_else(|_| unreachable!("batched lookup is positional"));

        if !src_info.exists() {
            return Err(GcsFsError::NotFound(src.to_owned()));
        }
        if !src_info.is_directory() && dst_info.id().is_root() {
            return Err(GcsFsError::InvalidArgument(
                "a file cannot be created in the root".to_owned(),
            ));
        }
        if dst_info.exists() && !dst_info.is_directory() {
            return Err(GcsFsError::AlreadyExists(format!(
                "cannot overwrite existing file: {dst}"
            )));
        }
        if !dst_parent_info.exists() {
            return Err(GcsFsError::NotFound(format!(
                "rename destination parent does not exist: {}",
                dst_parent_info.path()
            )));
        }

        // Normalization: after these rules either both sides are files or
        // both are directories, and the destination leaf does not exist.
        let mut dst_id = dst_info.id().clone();
        if src_info.is_directory() {
            if !dst_info.is_directory() {
                // Users type `mv foo bar` rather than `mv foo bar/`.
                dst_id = paths::to_directory_path(&dst_id);
                dst_info = self.get_file_info_for_id(&dst_id).await?;
            }
            if dst_info.exists() {
                dst_id = child_id(dst_info.id(), &src_leaf);
            }
        } else if dst_info.is_directory() {
            if !dst_info.exists() {
                return Err(GcsFsError::NotFound(format!(
                    "rename destination does not exist: {}",
                    dst_info.path()
                )));
            }
            dst_id = child_id(dst_info.id(), &src_leaf);
        } else {
            // Destination spelled as a file; an existing directory of that
            // name captures the source instead.
            let dst_dir_id = paths::to_directory_path(&dst_id);
            let dst_dir_info = self.get_file_info_for_id(&dst_dir_id).await?;
            if dst_dir_info.exists() {
                dst_id = child_id(&dst_dir_id, &src_leaf);
            }
        }

        self.rename_internal(&src_info, dst_id).await
    }

    /// The unvalidated rename sequence: copy metadata ancestors-first, then
    /// delete sources descendants-first. Only metadata-level copies; the
    /// store rewrites object records, never streams content through here.
    async fn rename_internal(
        &self,
        src_info: &FileInfo,
        dst_id: ResourceId,
    ) -> Result<(), GcsFsError> {
        let mut src_items: Vec<ResourceId>;
        let mut dst_items: Vec<ResourceId>;
        let mut dst_id = dst_id;

        if src_info.is_directory() {
            src_items = self.list_file_names(src_info, true).await?;
            // Ascending order puts directory placeholders before their
            // children, so the destination tree grows top-down.
            sort_ids(&mut src_items);

            dst_id = paths::to_directory_path(&dst_id);
            self.mkdir(&dst_id).await?;

            let src_prefix = src_info.id().object_name().unwrap_or_default().to_owned();
            let dst_bucket = dst_id.bucket_name().unwrap_or_default().to_owned();
            let dst_prefix = dst_id.object_name().unwrap_or_default().to_owned();

            dst_items = Vec::with_capacity(src_items.len());
            for src_item in &src_items {
                let name = src_item.object_name().unwrap_or_default();
                let relative = name.strip_prefix(src_prefix.as_str()).unwrap_or(name);
                dst_items.push(ResourceId::Object {
                    bucket: dst_bucket.clone(),
                    object: format!("{dst_prefix}{relative}"),
                });
            }
        } else {
            src_items = vec![src_info.id().clone()];
            dst_items = vec![dst_id.clone()];
        }

        if !src_items.is_empty() {
            let src_bucket = src_items[0].bucket_name().unwrap_or_default().to_owned();
            let dst_bucket = dst_items[0].bucket_name().unwrap_or_default().to_owned();
            let src_names: Vec<String> = src_items
                .iter()
                .filter_map(|id| id.object_name().map(str::to_owned))
                .collect();
            let dst_names: Vec<String> = dst_items
                .iter()
                .filter_map(|id| id.object_name().map(str::to_owned))
                .collect();

            self.store
                .copy(&src_bucket, &src_names, &dst_bucket, &dst_names)
                .await?;

            // The destination side is fully in place; stamp its parents.
            self.try_update_timestamps(dst_items.clone(), dst_items);
        }

        let mut buckets_to_delete: Vec<String> = Vec::new();
        if src_info.is_directory() {
            match src_info.id() {
                ResourceId::Bucket(name) => buckets_to_delete.push(name.clone()),
                // The recursive listing does not include the directory's own
                // placeholder; it goes last.
                other => src_items.push(other.clone()),
            }
        }

        self.delete_internal(src_items, buckets_to_delete).await
    }

    // ── Compose ─────────────────────────────────────────────────────────

    /// Server-side composition of same-bucket sources into `destination`,
    /// overwriting it. Sources compose in the order given.
    #[instrument(skip(self, sources))]
    pub async fn compose(
        &self,
        sources: &[&str],
        destination: &str,
        content_type: Option<&str>,
    ) -> Result<(), GcsFsError> {
        let dst_id = ResourceId::parse(destination, false)?;
        let dst_bucket = dst_id.bucket_name().unwrap_or_default();

        let mut source_names = Vec::with_capacity(sources.len());
        for source in sources {
            let id = ResourceId::parse(source, false)?;
            if id.bucket_name() != Some(dst_bucket) {
                return Err(GcsFsError::InvalidArgument(format!(
                    "compose sources must share the destination bucket: {source}"
                )));
            }
            source_names.push(id.object_name().unwrap_or_default().to_owned());
        }

        let destination_name = dst_id.object_name().unwrap_or_default();
        self.store
            .compose(dst_bucket, &source_names, destination_name, content_type)
            .await?;
        self.try_update_timestamps(vec![dst_id], Vec::new());
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn try_update_timestamps(&self, modified: Vec<ResourceId>, excluded: Vec<ResourceId>) {
        if modified.is_empty() {
            return;
        }
        if let Some(timestamps) = &self.timestamps {
            timestamps.enqueue(modified, excluded);
        }
    }
}

/// Child of a directory id named `leaf`.
fn child_id(dir_id: &ResourceId, leaf: &str) -> ResourceId {
    match dir_id {
        ResourceId::Root => ResourceId::Bucket(leaf.to_owned()),
        ResourceId::Bucket(bucket) => ResourceId::Object {
            bucket: bucket.clone(),
            object: leaf.to_owned(),
        },
        ResourceId::Object { bucket, object } => ResourceId::Object {
            bucket: bucket.clone(),
            object: format!("{object}{leaf}"),
        },
    }
}

/// Length-first, then lexicographic: ancestors sort before descendants.
fn sort_ids(ids: &mut [ResourceId]) {
    ids.sort_by(|a, b| paths::cmp_uris(&a.to_string(), &b.to_string()));
}

fn sort_file_infos(infos: &mut [FileInfo]) {
    infos.sort_by(|a, b| paths::cmp_uris(&a.path(), &b.path()));
}
