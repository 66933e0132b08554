//! Snapshots of store entities and their path-level view.

use std::collections::HashMap;

use tracing::debug;

use crate::paths;
use crate::resource_id::ResourceId;

/// Metadata key carrying the directory modification time, big-endian millis.
pub const MTIME_ATTRIBUTE: &str = "gcs_mtime_millis";

/// Encode a modification time for storage in a metadata map.
pub fn encode_mtime(millis: i64) -> Vec<u8> {
    millis.to_be_bytes().to_vec()
}

/// Decode a modification time attribute. `None` on malformed bytes.
pub fn decode_mtime(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

/// A point-in-time snapshot of a bucket or object as the store reported it,
/// or one of the two synthetic forms: not-found and inferred directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInfo {
    id: ResourceId,
    exists: bool,
    creation_time_millis: i64,
    size: i64,
    content_type: Option<String>,
    metadata: HashMap<String, Vec<u8>>,
    bucket_location: Option<String>,
    storage_class: Option<String>,
    generation: i64,
    meta_generation: i64,
}

impl ItemInfo {
    /// Snapshot of the global root, which always exists.
    pub fn root() -> Self {
        Self {
            id: ResourceId::Root,
            exists: true,
            creation_time_millis: 0,
            size: 0,
            content_type: None,
            metadata: HashMap::new(),
            bucket_location: None,
            storage_class: None,
            generation: 0,
            meta_generation: 0,
        }
    }

    /// Snapshot of an existing bucket.
    pub fn bucket(
        name: &str,
        creation_time_millis: i64,
        location: Option<String>,
        storage_class: Option<String>,
    ) -> Self {
        Self {
            id: ResourceId::Bucket(name.to_owned()),
            exists: true,
            creation_time_millis,
            size: 0,
            content_type: None,
            metadata: HashMap::new(),
            bucket_location: location,
            storage_class,
            generation: 0,
            meta_generation: 0,
        }
    }

    /// Snapshot of an existing object.
    #[allow(clippy::too_many_arguments)]
    pub fn object(
        id: ResourceId,
        creation_time_millis: i64,
        size: i64,
        content_type: Option<String>,
        metadata: HashMap<String, Vec<u8>>,
        generation: i64,
        meta_generation: i64,
    ) -> Self {
        debug_assert!(id.is_object(), "object info requires an object id: {id}");
        Self {
            id,
            exists: true,
            creation_time_millis,
            size,
            content_type,
            metadata,
            bucket_location: None,
            storage_class: None,
            generation,
            meta_generation,
        }
    }

    /// Synthetic snapshot marking an entity as absent.
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            exists: false,
            creation_time_millis: 0,
            size: -1,
            content_type: None,
            metadata: HashMap::new(),
            bucket_location: None,
            storage_class: None,
            generation: 0,
            meta_generation: 0,
        }
    }

    /// Synthetic snapshot for a directory whose existence is implied by child
    /// objects but which has no placeholder of its own. Always in directory
    /// form, zero-sized, existing.
    pub fn inferred_directory(id: ResourceId) -> Self {
        Self {
            id: paths::to_directory_path(&id),
            exists: true,
            creation_time_millis: 0,
            size: 0,
            content_type: None,
            metadata: HashMap::new(),
            bucket_location: None,
            storage_class: None,
            generation: 0,
            meta_generation: 0,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    pub fn is_bucket(&self) -> bool {
        self.id.is_bucket()
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.id.bucket_name()
    }

    pub fn object_name(&self) -> Option<&str> {
        self.id.object_name()
    }

    pub fn creation_time_millis(&self) -> i64 {
        self.creation_time_millis
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, Vec<u8>> {
        &self.metadata
    }

    pub fn bucket_location(&self) -> Option<&str> {
        self.bucket_location.as_deref()
    }

    pub fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }

    /// Per-object version used in mutation preconditions. Zero for synthetic
    /// infos and buckets.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn meta_generation(&self) -> i64 {
        self.meta_generation
    }
}

/// A metadata delta to merge into one item: `None` removes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatableItemInfo {
    pub id: ResourceId,
    pub attributes: HashMap<String, Option<Vec<u8>>>,
}

/// Path-level view of an [`ItemInfo`]: answers the directory question and
/// the modification-time question the way callers of a file system expect.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    info: ItemInfo,
}

impl FileInfo {
    pub fn from_item_info(info: ItemInfo) -> Self {
        Self { info }
    }

    pub fn from_item_infos(infos: Vec<ItemInfo>) -> Vec<Self> {
        infos.into_iter().map(Self::from_item_info).collect()
    }

    /// The rendered `gs://` path. Directory paths keep their trailing `/`.
    pub fn path(&self) -> String {
        self.info.id().to_string()
    }

    pub fn id(&self) -> &ResourceId {
        self.info.id()
    }

    pub fn item_info(&self) -> &ItemInfo {
        &self.info
    }

    pub fn into_item_info(self) -> ItemInfo {
        self.info
    }

    pub fn exists(&self) -> bool {
        self.info.exists()
    }

    pub fn is_global_root(&self) -> bool {
        self.info.is_root()
    }

    /// A path is a directory iff it names the root, a bucket, or an object in
    /// directory form.
    pub fn is_directory(&self) -> bool {
        paths::is_directory_path(self.info.id())
    }

    pub fn size(&self) -> i64 {
        self.info.size()
    }

    /// Modification time in millis since epoch: the stored attribute when
    /// present and well-formed, the creation time otherwise.
    pub fn modification_time_millis(&self) -> i64 {
        match self.info.metadata().get(MTIME_ATTRIBUTE) {
            Some(bytes) => decode_mtime(bytes).unwrap_or_else(|| {
                debug!(id = %self.info.id(), "malformed modification time attribute");
                self.info.creation_time_millis()
            }),
            None => self.info.creation_time_millis(),
        }
    }
}
