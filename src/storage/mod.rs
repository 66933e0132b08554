//! Typed client surface over the flat object store.
//!
//! [`ObjectStore`] is the contract the file-system facade consumes: bucket
//! and object lookups that never fail on "not found", listings, precondition-
//! guarded mutations, and scoped read/write channels. [`client::GcsClient`]
//! implements it over a [`transport::StoreTransport`]; the cache layer wraps
//! any implementation.

pub mod client;
pub mod reader;
pub mod retry;
pub mod transport;
pub mod writer;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::info::{ItemInfo, UpdatableItemInfo};
use crate::resource_id::ResourceId;
use crate::storage::transport::TransportError;

/// Failures surfaced by the store client after internal retries.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A transient failure survived the whole retry budget.
    #[error("transient failure talking to the store: {0}")]
    Transient(#[source] TransportError),

    /// A write guard (generation match, if-not-exists) did not hold.
    #[error("precondition failed for '{id}'")]
    PreconditionFailed {
        id: ResourceId,
        #[source]
        source: TransportError,
    },

    /// The entity an operation requires is gone.
    #[error("not found: {0}")]
    NotFound(ResourceId),

    /// A non-retriable service or decoding failure.
    #[error("storage failure: {0}")]
    Fatal(#[source] TransportError),

    /// Some members of a batch failed; the cause is the first failure.
    #[error("{failed} of {total} batched operations failed")]
    Partial {
        failed: usize,
        total: usize,
        failed_indices: Vec<usize>,
        #[source]
        first: Box<StorageError>,
    },

    /// A channel was used after being closed.
    #[error("channel already closed for '{0}'")]
    ChannelClosed(ResourceId),
}

impl StorageError {
    /// Classify a transport error that survived the retry layer, in the
    /// context of the given resource.
    pub(crate) fn from_transport(id: &ResourceId, err: TransportError) -> Self {
        if err.is_precondition_failure() {
            Self::PreconditionFailed {
                id: id.clone(),
                source: err,
            }
        } else if err.is_transient() {
            Self::Transient(err)
        } else {
            Self::Fatal(err)
        }
    }

    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Options for creating an object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateObjectOptions {
    /// When false, the create carries an if-not-exists guard.
    pub overwrite_existing: bool,
    pub content_type: Option<String>,
    pub attributes: HashMap<String, Vec<u8>>,
}

impl CreateObjectOptions {
    /// The options every directory placeholder is created with.
    pub fn empty_object() -> Self {
        Self::default()
    }
}

/// A scoped, seekable read channel over one object.
///
/// Closing is idempotent; a second close is a no-op.
#[async_trait]
pub trait ReadChannel: Send {
    /// Total size of the object as known at open time.
    fn size(&self) -> i64;

    /// Current logical read position.
    fn position(&self) -> u64;

    /// Move the read position. Forward seeks within the prefetch window are
    /// satisfied without a new request.
    async fn seek(&mut self, position: u64) -> Result<(), StorageError>;

    /// Read up to `max_bytes`. `Ok(None)` at end of object.
    async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>, StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

/// A scoped write channel over one object. Data becomes visible on a
/// successful close; closing is idempotent.
#[async_trait]
pub trait WriteChannel: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

impl std::fmt::Debug for dyn ReadChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn ReadChannel")
            .field("size", &self.size())
            .field("position", &self.position())
            .finish()
    }
}

impl std::fmt::Debug for dyn WriteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn WriteChannel").finish()
    }
}

pub type BoxReadChannel = Box<dyn ReadChannel>;
pub type BoxWriteChannel = Box<dyn WriteChannel>;

/// Typed operations over the flat store. Object-safe so layers can wrap each
/// other behind one handle.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Snapshot one entity. Absent entities come back as `not_found` infos,
    /// never as errors.
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StorageError>;

    /// Positional batch form of [`get_info`](Self::get_info).
    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StorageError>;

    async fn list_bucket_names(&self) -> Result<Vec<String>, StorageError>;

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StorageError>;

    /// Names of objects under `prefix`. With a delimiter, names are depth-1
    /// relative to the prefix (directory prefixes included); without, the
    /// listing is fully recursive.
    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StorageError>;

    /// Info form of [`list_object_names`](Self::list_object_names).
    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ItemInfo>, StorageError>;

    async fn create_bucket(&self, name: &str) -> Result<(), StorageError>;

    /// Idempotent creation of a zero-byte object. A rate-limited attempt is
    /// reconciled by re-fetching: if a zero-sized object with the intended
    /// metadata already exists, the call succeeds silently.
    async fn create_empty(
        &self,
        id: &ResourceId,
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError>;

    /// Batched [`create_empty`](Self::create_empty) with per-item
    /// reconciliation.
    async fn create_empty_many(
        &self,
        ids: &[ResourceId],
        options: &CreateObjectOptions,
    ) -> Result<(), StorageError>;

    async fn create_writer(
        &self,
        id: &ResourceId,
        options: CreateObjectOptions,
    ) -> Result<BoxWriteChannel, StorageError>;

    /// Open a seekable reader. Fails `NotFound` if the object is absent.
    async fn open_reader(&self, id: &ResourceId) -> Result<BoxReadChannel, StorageError>;

    /// Positional metadata-level copy. On partial failure the error reports
    /// the failed indices; retry policy is the caller's.
    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StorageError>;

    /// Delete objects, guarding each with the generation from its most
    /// recent info. Objects already gone count as deleted.
    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StorageError>;

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StorageError>;

    /// Poll until a listing of the bucket comes back empty, bounded.
    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StorageError>;

    /// Server-side composition of same-bucket sources into `destination`,
    /// overwriting it.
    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Merge metadata deltas into items, guarded by meta-generation.
    async fn update_items(&self, updates: &[UpdatableItemInfo]) -> Result<(), StorageError>;
}
