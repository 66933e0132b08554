//! Pluggable wire backend for the typed store client.
//!
//! Authentication, HTTP transport selection, and JSON encoding all live
//! behind [`StoreTransport`]; the typed client only sees one-shot RPCs and a
//! chunked read stream. Uses native `impl Future` in traits (RPITIT), so
//! implementations stay macro-free.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

/// A wire-level failure, classified for the retry layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The service answered with a non-success status.
    #[error("status {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// The connection failed or was reset before a response arrived.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// A data stream ended before the expected number of bytes arrived.
    #[error("stream ended prematurely after {delivered} bytes")]
    PrematureEof { delivered: u64 },

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// True for failures worth retrying with backoff: 5xx, 429, connection
    /// resets, timeouts, short streams, and 401s from token refresh races.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::UNAUTHORIZED
            }
            Self::Connection(_) | Self::Timeout | Self::PrematureEof { .. } => true,
            Self::Malformed(_) => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_precondition_failure(&self) -> bool {
        self.status() == Some(StatusCode::PRECONDITION_FAILED)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Request-level write guard. Every mutation carries one of these; the
/// client never issues an unconditional write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Precondition {
    /// Succeed only if the object's generation matches. Zero means "object
    /// must not exist".
    pub if_generation_match: Option<i64>,
    /// Succeed only if the object's meta-generation matches.
    pub if_meta_generation_match: Option<i64>,
}

impl Precondition {
    /// The create-new guard: fails if any live generation exists.
    pub fn if_not_exists() -> Self {
        Self {
            if_generation_match: Some(0),
            if_meta_generation_match: None,
        }
    }

    /// Guard against concurrent overwrites of a known generation.
    pub fn generation_match(generation: i64) -> Self {
        Self {
            if_generation_match: Some(generation),
            if_meta_generation_match: None,
        }
    }

    /// Guard for metadata patches of a known meta-generation.
    pub fn meta_generation_match(meta_generation: i64) -> Self {
        Self {
            if_generation_match: None,
            if_meta_generation_match: Some(meta_generation),
        }
    }

    /// No guard. Only valid for operations that overwrite by contract
    /// (compose destinations).
    pub fn none() -> Self {
        Self::default()
    }
}

/// A bucket as the wire reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketResource {
    pub name: String,
    pub creation_time_millis: i64,
    pub location: Option<String>,
    pub storage_class: Option<String>,
}

/// An object as the wire reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResource {
    pub bucket: String,
    pub name: String,
    pub size: i64,
    pub creation_time_millis: i64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metadata: HashMap<String, Vec<u8>>,
    pub generation: i64,
    pub meta_generation: i64,
}

/// One page-merged listing result: matching objects plus the depth-1
/// directory prefixes the service synthesized for the delimiter.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectResource>,
    pub prefixes: Vec<String>,
}

/// A chunked download in progress. `next_chunk` yields `None` at a clean end
/// of stream; a short stream is the transport's `PrematureEof`.
pub trait ReadStream: Send {
    fn next_chunk(
        &mut self,
    ) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Release the underlying connection. Close failures are reported but
    /// callers discard them when abandoning a broken stream.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Typed one-shot RPCs over the flat store.
///
/// Lookups return `Ok(None)` for absent entities; every other 404 is a
/// `TransportError`. Implementations handle paging internally and return
/// complete listings.
pub trait StoreTransport: Send + Sync + 'static {
    type Stream: ReadStream;

    fn get_bucket(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<BucketResource>, TransportError>> + Send;

    fn list_buckets(
        &self,
    ) -> impl Future<Output = Result<Vec<BucketResource>, TransportError>> + Send;

    fn insert_bucket(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn delete_bucket(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn get_object(
        &self,
        bucket: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ObjectResource>, TransportError>> + Send;

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> impl Future<Output = Result<ObjectListing, TransportError>> + Send;

    #[allow(clippy::too_many_arguments)]
    fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &HashMap<String, Vec<u8>>,
        precondition: Precondition,
        direct_upload: bool,
    ) -> impl Future<Output = Result<ObjectResource, TransportError>> + Send;

    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: Precondition,
    ) -> impl Future<Output = Result<ObjectResource, TransportError>> + Send;

    fn compose_object(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
        content_type: Option<&str>,
    ) -> impl Future<Output = Result<ObjectResource, TransportError>> + Send;

    fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        attributes: &HashMap<String, Option<Vec<u8>>>,
        precondition: Precondition,
    ) -> impl Future<Output = Result<ObjectResource, TransportError>> + Send;

    /// Open a ranged download starting at `offset`.
    fn open_read(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}
